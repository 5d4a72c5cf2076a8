//! The Server Coordinator (spec §4.F) and the HTTP/SSE surface built on top
//! of it (spec §6, supplemented feature 1).

pub mod auth;
pub mod coordinator;
pub mod http;

pub use auth::ResolvedAuth;
pub use coordinator::Coordinator;
pub use http::{router, AppState};
