pub mod config;
pub mod consumer;
pub mod decode;
pub mod error;
pub mod http_client;
pub mod markup;
pub mod model;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod relay;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;
