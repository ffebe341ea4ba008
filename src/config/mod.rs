//! Application configuration
//!
//! Layered as defaults, then an optional JSON file, then `TALKLINE_*`
//! environment variables. Command line flags are applied last by `main`.

mod schema;
mod store;

pub use schema::{AppConfig, RelayConfig};
pub use store::{apply_env, load, save, ENV_PREFIX};
