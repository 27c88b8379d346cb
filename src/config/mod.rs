//! Configuration schema and persistent store

mod schema;
mod store;

pub use schema::{
    AppConfig, AudioConfig, CoachConfig, UpstreamConfig, WebConfig, DEFAULT_INSTRUCTIONS,
    SAMPLE_RATE,
};
pub use store::{ConfigChange, ConfigStore};
