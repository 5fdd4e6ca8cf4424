//! Core types and trait definitions for the Cirrus evaluation engine.
//!
//! This crate is deliberately free of database and process-management
//! dependencies. All other crates depend on it; it depends on nothing
//! proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod cmec;
pub mod config;
pub mod constraint;
pub mod dataset;
pub mod diagnostic;
pub mod error;
pub mod example;
pub mod metrics;
pub mod provider;
pub mod requirement;
pub mod store;

pub use error::{Error, Result};
