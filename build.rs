use std::env;

fn main() -> anyhow::Result<()> {
    // Only the device build links against ESP-IDF; host builds run tests and the dry-run CLI
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    // Allow the firmware URL to be baked in at build time
    println!("cargo:rerun-if-env-changed=FIRMWARE_UPGRADE_URL");
    let url = env::var("FIRMWARE_UPGRADE_URL").unwrap_or_default();
    println!("cargo:rustc-env=FIRMWARE_UPGRADE_URL={}", url);
    if url.is_empty() {
        println!("cargo:warning=FIRMWARE_UPGRADE_URL not set; OTA must be triggered with a configured URL.");
    }

    Ok(())
}
