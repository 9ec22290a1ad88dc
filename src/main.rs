// On the board this is the firmware entry point. On the host it is a
// dry-run tool that pushes an image through the same update pipeline
// against simulated flash.

#[cfg(target_os = "espidf")]
mod firmware {
    use anyhow::Result;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_sys as _; // Binstart
    use log::{info, warn};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use sensor_node::display::{run_status_loop, StatusDisplay};
    use sensor_node::ota::{Platform, StatusRegister, UpdateService};
    use sensor_node::platform::{self, EspPlatform};
    use sensor_node::{logging, version};

    // Generate ESP-IDF app descriptor
    #[allow(unexpected_cfgs)]
    mod app_desc {
        esp_idf_sys::esp_app_desc!();
    }

    pub fn main() -> Result<()> {
        esp_idf_svc::sys::link_patches();
        logging::init_logger(log::LevelFilter::Info)?;
        info!("{}", version::version_info());

        let nvs = EspDefaultNvsPartition::take()?;
        let config = platform::load_config(nvs);
        if !logging::set_max_level_from_str(&config.log_level) {
            warn!("Unknown log level '{}', keeping info", config.log_level);
        }

        let status = Arc::new(StatusRegister::new(config.status_read_timeout()));

        // LCD consumer: the driver owns the glass, we feed it one line
        let display = StatusDisplay::new(Arc::clone(&status));
        let interval = config.display_interval();
        thread::Builder::new()
            .name("lcd_task".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                run_status_loop(display, interval, Arc::new(AtomicBool::new(false)), |line| {
                    info!("[LCD] {}", line)
                })
            })?;

        let platform = Arc::new(EspPlatform::new());
        match platform.partition_directory() {
            Ok(directory) => info!("Running partition: {}", directory.booted_slot()),
            Err(e) => warn!("Partition table: {}", e),
        }

        let service = UpdateService::new(Arc::clone(&platform), Arc::clone(&status), config.clone());
        if config.firmware_url.is_empty() {
            info!("No firmware URL configured, OTA disabled");
        } else {
            match service.start_update(config.firmware_url.clone()) {
                Ok(handle) => match handle.join() {
                    Ok(Ok(report)) => info!("OTA finished: {}", report.phase),
                    Ok(Err(e)) => warn!("OTA failed: {}", e),
                    Err(_) => warn!("OTA task panicked"),
                },
                Err(e) => warn!("Could not start OTA: {}", e),
            }
        }

        loop {
            thread::sleep(Duration::from_secs(10));
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod dry_run {
    use anyhow::{anyhow, bail, Context, Result};
    use clap::Parser;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use sensor_node::config::{self, OtaConfig};
    use sensor_node::display::{run_status_loop, StatusDisplay};
    use sensor_node::ota::image::synthesize;
    use sensor_node::ota::transport::{FileTransport, Transport};
    use sensor_node::ota::{StatusRegister, UpdatePhase, UpdateService};
    use sensor_node::sim::{ScriptedServer, SimFlash, SimPlatform};
    use sensor_node::{logging, version};

    const SIM_URL: &str = "http://firmware.local/sensor-node.bin";

    #[derive(Parser)]
    #[command(name = "esp32-sensor-node")]
    #[command(about = "Dry-run the OTA pipeline against simulated flash", long_about = None)]
    struct Cli {
        /// Firmware image to flash (path or file:// URL)
        #[arg(short, long, conflicts_with = "synthesize", required_unless_present = "synthesize")]
        image: Option<String>,

        /// Flash a generated image of this many bytes instead
        #[arg(short, long, value_name = "BYTES")]
        synthesize: Option<usize>,

        /// Version the generated image claims to be
        #[arg(long, default_value = "0.4.0")]
        image_version: String,

        /// Version the simulated device is running
        #[arg(long, default_value = version::FIRMWARE_VERSION)]
        running_version: String,

        /// OTA config JSON (same format as the NVS blob)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the download chunk size
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Skip the update when the image version matches the running one
        #[arg(long)]
        skip_same_version: bool,

        /// Size of each simulated OTA slot
        #[arg(long, default_value_t = 0x20_0000)]
        slot_size: u32,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    }

    pub fn main() -> Result<()> {
        let cli = Cli::parse();
        let level = logging::parse_level(&cli.log_level)
            .ok_or_else(|| anyhow!("unknown log level: {}", cli.log_level))?;
        logging::init_logger(level)?;
        log::info!("{} (host dry run)", version::version_info());

        let mut config = match &cli.config {
            Some(path) => {
                let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                OtaConfig::from_json(&bytes)?
            }
            None => config::load_or_default(None),
        };
        if let Some(chunk_size) = cli.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.skip_same_version |= cli.skip_same_version;
        config.validate()?;

        let flash = SimFlash::two_slot(cli.slot_size);
        match (&cli.image, cli.synthesize) {
            (Some(image), _) => {
                let platform = SimPlatform::new(flash, FileTransport, &cli.running_version);
                run(platform, image, config)
            }
            (None, Some(len)) => {
                let body = synthesize(&cli.image_version, version::PROJECT_NAME, len);
                log::info!("Generated {} byte image claiming version {}", body.len(), cli.image_version);
                let platform = SimPlatform::new(flash, ScriptedServer::new(body), &cli.running_version);
                run(platform, SIM_URL, config)
            }
            (None, None) => bail!("either --image or --synthesize is required"),
        }
    }

    fn run<T>(platform: SimPlatform<T>, url: &str, config: OtaConfig) -> Result<()>
    where
        T: Transport + Clone + Send + Sync + 'static,
    {
        let platform = Arc::new(platform);
        let status = Arc::new(StatusRegister::new(config.status_read_timeout()));
        let stop = Arc::new(AtomicBool::new(false));

        let lcd = {
            let display = StatusDisplay::new(Arc::clone(&status));
            let stop = Arc::clone(&stop);
            // Poll faster than the board does so short runs still show progress
            let interval = config.display_interval().min(std::time::Duration::from_millis(20));
            thread::spawn(move || run_status_loop(display, interval, stop, |line| println!("[LCD] {}", line)))
        };

        let service = UpdateService::new(Arc::clone(&platform), Arc::clone(&status), config);
        let outcome = service
            .start_update(url)?
            .join()
            .map_err(|_| anyhow!("OTA task panicked"))?;

        stop.store(true, Ordering::Relaxed);
        lcd.join().map_err(|_| anyhow!("display task panicked"))?;

        let flash = platform.flash();
        let directory = flash.directory()?;
        let phase = status.get().unwrap_or(UpdatePhase::Idle);
        println!("Final status: {} ({:?})", phase.label(), phase);
        println!("Boot slot:    {}", directory.booted_slot());
        println!("Restarts:     {}", platform.restarts());

        match outcome {
            Ok(report) => {
                println!("Written:      {} bytes", report.bytes_written);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::main()
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    dry_run::main()
}
