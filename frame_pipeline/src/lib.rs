mod routes;

pub mod broker;
pub mod capture;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod display;
pub mod inference;
pub mod overlay;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod sink;
pub mod stream;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

#[cfg(feature = "kafka")]
pub mod app;
#[cfg(feature = "camera")]
pub mod camera;
#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "kafka")]
pub use app::start_app;
