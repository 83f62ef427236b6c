pub mod config;
pub mod context;
pub mod dataset;
pub mod governance;
pub mod outcomes;
pub mod policy;
pub mod store;
pub mod telemetry;
pub mod time;

pub use context::AppContext;
pub use telemetry::{TelemetryClient, TrackRequest};
