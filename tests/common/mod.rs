//! Shared test utilities for scenario and chaos tests.
//!
//! This module provides:
//! - Simulated PostgreSQL servers behind the database traits
//! - A fleet of agents sharing one in-memory substrate

#![allow(dead_code)]

pub mod fleet;
pub mod sim;

pub use fleet::*;
pub use sim::*;
