//! Shared test utilities for genq integration tests.
//!
//! This module provides:
//! - `TestHarness`: an in-memory queue with a manual clock, scripted
//!   backends and an in-memory content store
//! - Builders for harness settings and job payloads

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
