pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod messaging;
pub mod routes;
pub mod sequences;

pub use routes::{api_routes, AppServices};
