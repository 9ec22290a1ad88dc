// Status line for the character display. Rendering itself belongs to the
// display driver; this is the polling side of the status contract.

use core::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ota::{StatusRegister, UpdatePhase};

pub const LCD_COLUMNS: usize = 16;

pub type StatusLine = heapless::String<LCD_COLUMNS>;

/// Caches the last phase it managed to read
pub struct StatusDisplay {
    register: Arc<StatusRegister>,
    cached: UpdatePhase,
    missed_reads: u32,
}

impl StatusDisplay {
    pub fn new(register: Arc<StatusRegister>) -> Self {
        Self {
            register,
            cached: UpdatePhase::Idle,
            missed_reads: 0,
        }
    }

    /// Refresh from the register; on lock timeout keep the previous value
    pub fn poll(&mut self) -> UpdatePhase {
        match self.register.get() {
            Some(phase) => self.cached = phase,
            None => {
                self.missed_reads += 1;
                log::debug!("OTA status busy, showing cached {:?}", self.cached);
            }
        }
        self.cached
    }

    pub fn cached(&self) -> UpdatePhase {
        self.cached
    }

    pub fn missed_reads(&self) -> u32 {
        self.missed_reads
    }

    pub fn line(&self) -> StatusLine {
        fit_line(self.cached.label())
    }
}

/// Clip text to one display row
pub fn fit_line(text: &str) -> StatusLine {
    let mut line = StatusLine::new();
    for ch in text.chars() {
        if line.write_char(ch).is_err() {
            break;
        }
    }
    line
}

/// Poll the register every `interval` and hand changed lines to `render`
/// until `stop` is set
pub fn run_status_loop<F>(mut display: StatusDisplay, interval: Duration, stop: Arc<AtomicBool>, mut render: F)
where
    F: FnMut(&str),
{
    let mut shown: Option<UpdatePhase> = None;
    while !stop.load(Ordering::Relaxed) {
        let phase = display.poll();
        if shown != Some(phase) {
            render(display.line().as_str());
            shown = Some(phase);
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fit_line_clips_to_the_display_width() {
        assert_eq!(fit_line("OTA: Ready").as_str(), "OTA: Ready");
        assert_eq!(fit_line("0123456789abcdefXYZ").as_str(), "0123456789abcdef");
    }

    #[test]
    fn poll_tracks_the_register() {
        let register = Arc::new(StatusRegister::default());
        let mut display = StatusDisplay::new(Arc::clone(&register));
        assert_eq!(display.poll(), UpdatePhase::Idle);
        register.set(UpdatePhase::Validating);
        assert_eq!(display.poll(), UpdatePhase::Validating);
        assert_eq!(display.line().as_str(), "OTA: Validating");
        assert_eq!(display.missed_reads(), 0);
    }

    #[test]
    fn loop_renders_only_changes() {
        let register = Arc::new(StatusRegister::default());
        let stop = Arc::new(AtomicBool::new(false));
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));

        let worker = {
            let display = StatusDisplay::new(Arc::clone(&register));
            let stop = Arc::clone(&stop);
            let lines = Arc::clone(&lines);
            thread::spawn(move || {
                run_status_loop(display, Duration::from_millis(5), stop, |line| {
                    lines.lock().unwrap().push(line.to_string())
                })
            })
        };

        thread::sleep(Duration::from_millis(50));
        register.set(UpdatePhase::FailedRead);
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["OTA: Ready", "OTA ERR: Read"]);
    }
}
