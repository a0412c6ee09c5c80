pub mod config;
pub mod registry;
pub mod discovery;
pub mod sweeper;
pub mod relay;
pub mod api;
