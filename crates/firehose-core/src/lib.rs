//! Core types and shared utilities for the firehose ingester.
//!
//! This crate provides:
//! - The [`Event`] record type and the line decoder ([`decode_line`])
//! - The flat [`EventRow`] projection written to batch files
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{Decoded, Event, EventRow, SkipReason, decode_line};
