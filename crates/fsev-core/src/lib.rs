//! Core types shared across the fsev workspace.
//!
//! This crate provides the pieces every other crate agrees on:
//!
//! - [`Config`] and [`WatchConfig`] - watch latency, stream flags, chunk limits
//! - [`EventFlags`] and [`CreateFlags`] - the native per-event and
//!   per-stream flag words
//! - [`trace`] - the process-wide diagnostic tracing switch and the
//!   [`diag!`] macro
//! - [`ConfigError`] - configuration loading and validation failures

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod flags;
pub mod trace;

pub use config::{Config, MAX_CHUNK_LIMIT, MIN_CHUNK_SIZE, Sensitivity, WatchConfig};
pub use error::ConfigError;
pub use flags::{CreateFlags, EventFlags};

#[doc(hidden)]
pub use tracing as __tracing;
