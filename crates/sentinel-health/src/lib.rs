//! # sentinel-health
//!
//! HTTP health-check endpoint for a sentinel node.
//!
//! `GET /health` answers with a JSON map of check name to `"HEALTHY"`,
//! `"DISABLED"` or `"ERROR: <message>"`, and status 200 only when no check
//! failed.
//!
//! ## Usage
//!
//! ```ignore
//! use sentinel_health::{HealthServer, ServerConfig};
//!
//! let server = HealthServer::new(ServerConfig::default(), source);
//! server.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checks;
mod error;
mod server;

pub use checks::{Check, CheckOutcome, CheckRegistry, HealthQuery, HealthReport, HealthSource};
pub use error::{HealthError, HealthResult};
pub use server::{HealthServer, ServerConfig, HEALTH_HEADER, HEALTH_PATH};
