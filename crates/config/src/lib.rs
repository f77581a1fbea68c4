//! Configuration for mkv2cast.
//!
//! Handles layered TOML config loading, environment variable overrides, and
//! XDG base directory resolution.

pub mod config;
pub mod xdg;

pub use config::*;
