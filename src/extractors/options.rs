//! Extract apply options for history routes from request headers.

use crate::error::AppError;
use crate::history::{ApplyOptions, Scope};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

/// `model`, `database` or `both` (default).
pub const SCOPE_HEADER: &str = "X-Sync-Scope";
/// `true` makes a bulk sync undoable.
pub const RECORD_HEADER: &str = "X-Sync-Record";

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions(pub ApplyOptions);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for SyncOptions
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let mut opts = ApplyOptions::default();
        if let Some(raw) = header(parts, SCOPE_HEADER) {
            opts.scope = match raw.to_lowercase().as_str() {
                "model" => Scope::Model,
                "database" => Scope::Database,
                "both" => Scope::Both,
                other => return Err(AppError::BadRequest(format!("invalid {}: {}", SCOPE_HEADER, other))),
            };
        }
        if let Some(raw) = header(parts, RECORD_HEADER) {
            opts.record = raw
                .parse::<bool>()
                .map_err(|_| AppError::BadRequest(format!("invalid {}: {}", RECORD_HEADER, raw)))?;
        }
        Ok(SyncOptions(opts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<SyncOptions, AppError> {
        let (mut parts, _) = req.into_parts();
        SyncOptions::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn headers_select_scope_and_record() {
        let opts = extract(Request::builder().body(()).unwrap()).await.unwrap().0;
        assert_eq!(opts, ApplyOptions::default());

        let req = Request::builder()
            .header(SCOPE_HEADER, "Model")
            .header(RECORD_HEADER, "true")
            .body(())
            .unwrap();
        let opts = extract(req).await.unwrap().0;
        assert_eq!(opts.scope, Scope::Model);
        assert!(opts.record);

        let bad = Request::builder().header(SCOPE_HEADER, "everything").body(()).unwrap();
        assert!(matches!(extract(bad).await, Err(AppError::BadRequest(_))));
    }
}
