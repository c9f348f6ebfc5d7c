//! shmdata Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for the shmdata transport crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Timeouts, wire sizes and default paths
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use shmdata_common::consts::*;
//! use shmdata_common::config::{ConfigLoader, TransportConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
