//! Workflow orchestration module

pub mod admission;
pub mod circuit_breaker;
pub mod orchestrator;
pub mod persistence;
pub mod step_executor;
pub mod validator;

pub use admission::*;
pub use circuit_breaker::*;
pub use orchestrator::*;
pub use persistence::*;
pub use step_executor::*;
pub use validator::*;
