//! cleanview library crate.
//!
//! This module exposes the internal components for integration testing.

pub mod auth;
pub mod config;
pub mod frame;
pub mod session;
pub mod veo;
