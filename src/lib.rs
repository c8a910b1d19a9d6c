pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod status;
pub mod supervisor;
