//! HTTP front end: client identification, admission middleware and routes.

mod middleware;
mod routes;
mod server;

pub use middleware::{client_id, rate_limit, ClientId};
pub use routes::{router, StatusResponse};
pub use server::HttpServer;
