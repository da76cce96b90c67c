//! HTTP surface: health probes, the property endpoints, the raw form
//! endpoint and the SSE observation stream.

pub mod handlers;
pub mod routes;

pub use routes::router;
