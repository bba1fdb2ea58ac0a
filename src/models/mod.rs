pub mod audit_log;
pub mod auth_code;
pub mod client;
pub mod consent;
pub mod jwk;
pub mod rbac;
pub mod session;
pub mod token;
pub mod user;
