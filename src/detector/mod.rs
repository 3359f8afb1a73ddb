pub mod monitor;
pub mod wick;

pub use monitor::DetectionMonitor;
pub use wick::{WickDetector, WickRule};
