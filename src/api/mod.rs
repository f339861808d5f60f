pub mod handlers;
pub mod routes;
pub mod server;
pub mod status;

pub use server::{router, start_server, AppState};
