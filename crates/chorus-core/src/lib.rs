//! chorus-core — domain types, wire protocol, error taxonomy, and the
//! Subscription Bus primitive shared by the rest of the workspace.

pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use bus::{Bus, Subscription};
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
