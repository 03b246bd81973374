//! Command implementations

mod capture;
mod config;
mod inspect;

pub use capture::execute_capture;
pub use config::execute_config;
pub use inspect::execute_inspect;
