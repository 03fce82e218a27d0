//! Service wiring for the allocation engine: configuration loading, the
//! HTTP prediction client, the dry-run control plane and the operational API.

pub mod api;
pub mod backends;
pub mod config;
pub mod forecast_client;
