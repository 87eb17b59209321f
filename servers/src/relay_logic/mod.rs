pub mod config;
pub mod feed;
pub mod logger;
pub mod routes;
pub mod state;
