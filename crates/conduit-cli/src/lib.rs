//! # Conduit Gateway
//!
//! Operator surface of the Conduit storage gateway.
//!
//! This crate provides:
//! - **Configuration**: TOML file plus `CONDUIT__*` environment overrides
//! - **Graph assembly**: backends, topology and wrappers built once, in a fixed order
//! - **Commands**: health checks, object put/get/rm/ls and presigned URLs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 conduit (binary)                     │
//! ├─────────────────────────────────────────────────────┤
//! │   GatewayConfig  →  Gateway::build  →  StackBuilder  │
//! ├─────────────────────────────────────────────────────┤
//! │  egress > stream_guard > cache > compression >       │
//! │  throttle > retry > circuit_breaker                  │
//! ├─────────────────────────────────────────────────────┤
//! │        single │ fallback(a, b) │ failover(a, b)      │
//! ├─────────────────────────────────────────────────────┤
//! │          memory │ local │ s3 │ dropbox               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod state;

pub use config::{BackendConfig, GatewayConfig, SigningConfig, TenantConfig, TopologyConfig};
pub use error::{GatewayError, Result};
pub use state::Gateway;
