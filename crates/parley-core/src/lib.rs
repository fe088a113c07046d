//! Core types, wire protocol, configuration, and errors for Parley.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
