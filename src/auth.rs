//! 认证：信任前置认证代理写入的用户头，并把用户 id 交给处理器。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderName, Request};
use axum::middleware;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

use crate::error::UploadError;

#[derive(Debug)]
pub struct AuthConfig {
    pub user_header: HeaderName,
}

/// Caller identity established by the authenticating proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser(pub String);

/// 认证中间件：缺少用户头的 `/api` 请求返回 401。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, UploadError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }
    let Some(user) = user_from_headers(req.headers(), &auth.user_header) else {
        debug!(path = req.uri().path(), "request without user header");
        return Err(UploadError::Unauthorized);
    };
    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

fn is_auth_exempt_path(path: &str) -> bool {
    path == "/api/health"
}

/// 读取并清理用户头；空值或非 UTF-8 视为缺失。
pub fn user_from_headers(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
