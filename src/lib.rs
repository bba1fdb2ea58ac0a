//! auth-center: OAuth 2.1 / OpenID Connect 1.0 authorization server core.

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

pub use app::create_app;
pub use config::Config;
pub use state::AppState;
