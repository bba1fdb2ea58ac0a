//! OAuth parameter validation
//!
//! Validation functions for OAuth 2.1 request parameters: redirect URI
//! matching, scope narrowing, and format checks on client-supplied strings.

use crate::error::ServiceError;
use std::collections::HashSet;
use url::Url;

/// Validates a redirect URI against the client's registered redirect URIs.
///
/// Comparison is byte-exact after URL normalization of percent-encoding:
/// case-insensitive in scheme and host, case-sensitive in path and query.
/// Fragments are rejected outright. Only https is accepted, plus http on a
/// loopback host (RFC 8252 §7.3 for native loopback clients).
pub fn validate_redirect_uri(
    redirect_uri: &str,
    registered_uris: &[String],
) -> Result<(), ServiceError> {
    let url = parse_redirect_uri(redirect_uri)?;

    if !registered_uris
        .iter()
        .filter_map(|uri| parse_redirect_uri(uri).ok())
        .any(|registered| registered == url)
    {
        return Err(ServiceError::ValidationError(
            "Redirect URI not registered for this client".to_string(),
        ));
    }

    Ok(())
}

/// Parses and policy-checks a single redirect URI.
/// Url::parse 归一化 scheme/host 大小写与百分号编码，随后的比较即字节精确。
fn parse_redirect_uri(redirect_uri: &str) -> Result<Url, ServiceError> {
    let url = Url::parse(redirect_uri)
        .map_err(|e| ServiceError::ValidationError(format!("Invalid redirect URI format: {e}")))?;

    if url.fragment().is_some() {
        return Err(ServiceError::ValidationError(
            "Redirect URI must not contain fragment identifier".to_string(),
        ));
    }

    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            if is_loopback_host(url.host_str()) {
                Ok(url)
            } else {
                Err(ServiceError::ValidationError(
                    "HTTP redirect URIs are only allowed for loopback hosts".to_string(),
                ))
            }
        }
        other => Err(ServiceError::ValidationError(format!(
            "Redirect URI scheme must be https (or http on loopback), got: {other}"
        ))),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    matches!(host, Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
}

/// Validates that every requested scope is configured for the client.
pub fn validate_scope(scope: &str, allowed_scopes: &[String]) -> Result<(), ServiceError> {
    if scope.trim().is_empty() {
        return Err(ServiceError::InvalidScope(
            "Scope cannot be empty".to_string(),
        ));
    }

    for req_scope in scope.split_whitespace() {
        if !allowed_scopes.iter().any(|s| s == req_scope) {
            return Err(ServiceError::InvalidScope(format!(
                "Requested scope '{req_scope}' is not allowed for this client"
            )));
        }
    }

    Ok(())
}

/// Enforces that scopes in a token request are a subset of the scopes
/// attached to the consumed grant. `None` means "keep the original scopes".
pub fn narrow_scope(
    granted_scope: &str,
    requested_scope: Option<&str>,
) -> Result<String, ServiceError> {
    let requested = match requested_scope {
        None | Some("") => return Ok(granted_scope.to_string()),
        Some(s) => s,
    };

    let granted: HashSet<&str> = granted_scope.split_whitespace().collect();
    let requested_set: HashSet<&str> = requested.split_whitespace().collect();

    if !requested_set.is_subset(&granted) {
        let unauthorized: Vec<&str> = requested_set.difference(&granted).copied().collect();
        return Err(ServiceError::InvalidScope(format!(
            "Token request attempts to expand scope beyond the grant: {}",
            unauthorized.join(", ")
        )));
    }

    Ok(requested.to_string())
}

/// Splits a scope string into individual scope names.
pub fn parse_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(|s| s.to_string()).collect()
}

/// Validates client_id format (alphanumeric plus `-`, `_`, `.`).
pub fn validate_client_id(client_id: &str) -> Result<(), ServiceError> {
    if client_id.is_empty() {
        return Err(ServiceError::ValidationError(
            "client_id cannot be empty".to_string(),
        ));
    }

    if client_id.len() > 128 {
        return Err(ServiceError::ValidationError(
            "client_id exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !client_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ServiceError::ValidationError(
            "client_id contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Validates the state parameter (CSRF token echoed back to the client).
pub fn validate_state(state: &str) -> Result<(), ServiceError> {
    if state.is_empty() {
        return Err(ServiceError::ValidationError(
            "state cannot be empty".to_string(),
        ));
    }

    if state.len() > 500 {
        return Err(ServiceError::ValidationError(
            "state exceeds maximum length of 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validates a nonce value (OpenID Connect replay protection).
pub fn validate_nonce(nonce: &str) -> Result<(), ServiceError> {
    if nonce.is_empty() {
        return Err(ServiceError::ValidationError(
            "nonce cannot be empty".to_string(),
        ));
    }

    if nonce.len() > 256 {
        return Err(ServiceError::ValidationError(
            "nonce exceeds maximum length of 256 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validates an authorization code's wire format before touching the store.
pub fn validate_auth_code(code: &str) -> Result<(), ServiceError> {
    if code.is_empty() {
        return Err(ServiceError::ValidationError(
            "Authorization code cannot be empty".to_string(),
        ));
    }

    if code.len() > 256 {
        return Err(ServiceError::ValidationError(
            "Authorization code exceeds maximum length".to_string(),
        ));
    }

    // CSPRNG codes are base64url
    if !code
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ServiceError::ValidationError(
            "Authorization code contains invalid characters".to_string(),
        ));
    }

    Ok(())
}
