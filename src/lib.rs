pub mod artifacts;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod exit;
pub mod gate;
pub mod installer;
pub mod platform;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod telemetry;
pub mod ui;
