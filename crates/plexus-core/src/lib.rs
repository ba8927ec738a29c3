pub mod config;
pub mod error;
pub mod table;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{PlexusError, Result};
pub use table::Table;
pub use types::*;
