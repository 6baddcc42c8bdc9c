//! # Contentflow Core Library
//!
//! Orchestration engine for the content pipeline: session models, capability
//! adapters, step execution with retries and circuit breaking, admission
//! control, persistence and the HTTP API.

pub mod capability;
pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod workflow;
