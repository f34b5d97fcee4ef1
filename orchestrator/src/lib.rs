pub mod analysis;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod request;
mod request_handler;

pub use error::OrchestratorError;
