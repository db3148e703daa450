pub mod config;
pub mod error;

pub use config::{Config, Mode};
pub use error::{Result, VoxError};
