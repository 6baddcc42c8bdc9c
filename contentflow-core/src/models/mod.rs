//! Data models for contentflow

pub mod admission;
pub mod configuration;
pub mod workflow;

pub use admission::*;
pub use configuration::*;
pub use workflow::*;
