use crate::middleware::auth::AuthContext;
use crate::services::audit_log_service::{AuditEntry, AuditLogService};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 审计行写失败计数。写失败绝不让请求失败，只记 stderr 并递增。
pub static AUDIT_WRITE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Protocol endpoints that must each produce exactly one audit row.
fn audited_action(path: &str) -> Option<&'static str> {
    match path {
        "/authorize" => Some("oauth.authorize"),
        "/token" => Some("oauth.token"),
        "/introspect" => Some("oauth.introspect"),
        "/revoke" => Some("oauth.revoke"),
        "/userinfo" => Some("oauth.userinfo"),
        "/auth/login" => Some("auth.login"),
        "/auth/refresh" => Some("auth.session_refresh"),
        "/auth/check" => Some("auth.check"),
        "/auth/check-batch" => Some("auth.check_batch"),
        _ => None,
    }
}

/// Sanitizes query parameters to remove sensitive data for logging.
fn sanitize_query(query: Option<&str>) -> String {
    match query {
        None => "None".to_string(),
        Some(q) => {
            let sensitive_keys = [
                "password",
                "token",
                "access_token",
                "refresh_token",
                "id_token",
                "secret",
                "client_secret",
                "client_assertion",
                "code",
                "code_verifier",
                "code_challenge",
            ];

            let mut result = String::new();
            for (i, param) in q.split('&').enumerate() {
                if i > 0 {
                    result.push('&');
                }

                if let Some(eq_pos) = param.find('=') {
                    let param_name = &param[..eq_pos];
                    result.push_str(param_name);
                    result.push('=');

                    if sensitive_keys
                        .iter()
                        .any(|k| k.eq_ignore_ascii_case(param_name))
                    {
                        result.push_str("***REDACTED***");
                    } else {
                        result.push_str(&param[eq_pos + 1..]);
                    }
                } else {
                    result.push_str(param);
                }
            }
            result
        }
    }
}

/// Audit middleware: structured request logging plus one `audit_logs` row
/// per protocol endpoint hit.
pub async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let ip_address = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    tracing::info!(
        event = "request.start",
        method = %method,
        path = %uri.path(),
        query = %sanitize_query(uri.query()),
        remote_addr = ?ip_address,
        "Incoming HTTP request"
    );

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status().as_u16();

    // 认证中间件跑在内层，成功时会把上下文挂到响应扩展里
    let auth_context = response.extensions().get::<AuthContext>().cloned();

    match status {
        400..=499 => tracing::warn!(
            event = "request.complete",
            method = %method,
            path = %uri.path(),
            status = status,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        ),
        500..=599 => tracing::error!(
            event = "request.complete",
            method = %method,
            path = %uri.path(),
            status = status,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        ),
        _ => tracing::info!(
            event = "request.complete",
            method = %method,
            path = %uri.path(),
            status = status,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        ),
    }

    if let Some(action) = audited_action(uri.path()) {
        let entry = AuditEntry {
            user_id: auth_context.as_ref().and_then(|c| c.user_id.clone()),
            client_id: auth_context.as_ref().and_then(|c| c.client_id.clone()),
            action: action.to_string(),
            resource: uri.path().to_string(),
            ip_address,
            user_agent,
            success: status < 400,
            error_message: (status >= 400).then(|| format!("HTTP {status}")),
            metadata: Some(json!({
                "method": method.as_str(),
                "status": status,
                "duration_ms": duration.as_millis() as u64,
            })),
        };

        if let Err(e) = state.audit_log_service.record(entry).await {
            AUDIT_WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
            eprintln!("audit log write failed for {}: {e}", uri.path());
        }
    }

    response
}
