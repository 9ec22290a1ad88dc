// Centralized version information

// Cargo package version, also stamped into the app descriptor
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PROJECT_NAME: &str = env!("CARGO_PKG_NAME");

// Version info string for logging
pub fn version_info() -> String {
    format!("{} v{}", PROJECT_NAME, FIRMWARE_VERSION)
}
