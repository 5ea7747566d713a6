//! Common utilities and shared types for herald.
//!
//! This crate provides foundational components used across all herald crates:
//!
//! - **Configuration**: Delivery and transport settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based message identifiers via [`IdGenerator`]
//! - **Metrics**: Delivery outcome counters via [`DeliveryMetrics`]
//!
//! # Example
//!
//! ```no_run
//! use herald_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     config.check()?;
//!     let id_gen = IdGenerator::new();
//!     println!("Generated ID: {}", id_gen.generate());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::{Config, DeliveryConfig, TransportConfig};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{DeliveryMetrics, DeliverySnapshot, Timer};
