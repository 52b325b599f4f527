pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod redis_client;
pub mod repository;
pub mod routes;
pub mod services;
pub mod state;
