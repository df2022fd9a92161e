pub mod cli;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod ui;
