pub mod adapters;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use error::{EngineError, ProtocolError};
pub use orchestrator::Orchestrator;
