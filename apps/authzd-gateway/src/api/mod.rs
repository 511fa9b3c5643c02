//! The HTTP adapter: REST verbs in, commands out.

pub mod dto;
pub mod routes;

pub use routes::{AppState, build_router};
