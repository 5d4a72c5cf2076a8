//! Shared browser-automation process (spec §4.C): state machine, download
//! tracking, and console capture used by the combined browser tool.

pub mod console;
pub mod download;
pub mod runtime;

pub use runtime::{BrowserError, BrowserResult, BrowserRuntime};
