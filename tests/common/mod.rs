//! Common test utilities and helpers
//!
//! This module provides shared utilities for all tests including:
//! - A seeded in-memory backend with two or more users
//! - Engine construction with short timers
//! - Helpers that drive an engine until a condition holds
//! - Custom assertion macros

pub mod assertions;
pub mod fixtures;

// Re-export commonly used utilities
pub use fixtures::*;
