//! lxdtest - LXD test instance driver
//!
//! The binary in `main.rs` parses arguments and sets up logging; the command
//! implementations live here so they can be driven with mock hypervisors.

pub mod commands;
