//! Configuration handlers
//!
//! Domain-separated configuration API:
//! - GET   /api/config/coach    - coaching session configuration
//! - PATCH /api/config/coach    - update coaching session configuration
//! - GET   /api/config/upstream - upstream service configuration (credential redacted)
//! - PATCH /api/config/upstream - update upstream service configuration

mod coach;
mod types;
mod upstream;

pub use coach::{get_coach_config, update_coach_config};
pub use upstream::{get_upstream_config, update_upstream_config};
