pub mod audit;
pub mod catalog;
pub mod config;
pub mod database;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod prereq;
pub mod report;
pub mod rollout_config;
pub mod runner;
pub mod secrets;
pub mod ui;
