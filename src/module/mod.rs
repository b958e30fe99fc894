//! Runnable modules each bundling one role of the system behind a unified configuration

pub mod options;

pub mod broker;
pub mod orchestrator;
pub mod publisher;
pub mod subscriber;
