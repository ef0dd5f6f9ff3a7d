//! Configuration parsing for lxdtest
//!
//! This crate handles parsing of `lxdtest.toml`, which carries the
//! lifecycle driver options and the remote execution transport options.

mod error;
mod settings;

pub use error::*;
pub use settings::*;
