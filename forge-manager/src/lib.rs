pub mod bootstrap;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod decision;
pub mod error;
pub mod health;
pub mod http;
pub mod leader;
pub mod manager;
pub mod metrics;
pub mod signal;
pub mod status;
pub mod store;
pub mod testing;
pub mod types;
