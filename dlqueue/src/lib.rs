//! dlqueue library crate.
//!
//! A download queue that hands each URL to one of several external media
//! tools, supervises the processes they spawn and decides retries and
//! backend fallback from each attempt's result flags.

pub mod config;
pub mod context;
pub mod control;
pub mod downloader;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metadata;
pub mod persistence;
pub mod postprocess;
pub mod process;
pub mod utils;

pub use error::{Error, Result};
