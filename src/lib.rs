pub mod advisor;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fleet;
pub mod models;
pub mod notify;
pub mod schema;
pub mod state;
pub mod utils;
