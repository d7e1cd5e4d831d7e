//! Local gateway that fronts vendor LLM APIs with a pool of stored
//! credentials and picks one per request by adaptive weighted sampling.

pub mod auth;
pub mod config;
pub mod credential;
mod error;
pub mod models_catalog;
pub mod proxy;
pub mod sampler;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod vendor;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use sampler::TrafficMode;
pub use vendor::Vendor;
