mod decoder;
mod detection;
mod error;
mod executor;
mod labels;
mod model_service;
mod ort_service;
mod registry;
mod resolver;
mod routes;
mod server;
mod shaper;
mod telemetry;

#[cfg(test)]
mod testing;

pub mod app;
pub mod config;

pub use app::start_app;
