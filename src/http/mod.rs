//! HTTP front end: counts every request and applies per-client admission
//! control.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{router, AppState, CounterResponse};
