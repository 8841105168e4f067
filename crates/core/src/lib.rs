pub mod config;
pub mod error;
pub mod paths;

pub use config::{BrowserConfig, Config, ProtocolConfig, ScanConfig};
pub use error::{Error, Result};
pub use paths::Paths;
