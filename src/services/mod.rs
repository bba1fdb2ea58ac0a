pub mod audit_log_service;
pub mod auth_code_service;
pub mod client_service;
pub mod consent_service;
pub mod key_service;
pub mod rbac_service;
pub mod session_service;
pub mod token_service;
pub mod user_service;
