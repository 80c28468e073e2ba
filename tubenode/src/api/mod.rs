//! HTTP/WebSocket API surface.
//!
//! The REST CRUD glue lives outside the core; what this module carries is
//! the realtime event endpoint browser clients connect to, plus the JWT
//! verification it is gated by.

pub mod jwt;
pub mod server;

pub use jwt::JwtService;
pub use server::{ApiServer, ApiServerConfig, AppState};
