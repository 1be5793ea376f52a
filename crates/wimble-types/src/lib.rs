//! Shared types for the Wimble peer-to-peer node.
//!
//! This crate holds the configuration surface consumed by the wire layer and
//! the `wimble` binary. It contains no networking logic.

pub mod config;
