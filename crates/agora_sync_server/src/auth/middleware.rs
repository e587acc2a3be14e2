use crate::db::{AuthRepo, SessionInfo, UserInfo};
use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use std::sync::Arc;

/// Authenticated user extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub session: SessionInfo,
    pub user: UserInfo,
}

/// Resolves session tokens into users; installed as a request extension
#[derive(Clone)]
pub struct AuthExtractor {
    pub repo: Arc<AuthRepo>,
}

/// Extractor for optional authentication
///
/// Anonymous callers get `OptionalAuth(None)`; the access resolver decides
/// what they may do.
#[derive(Debug, Clone)]
pub struct OptionalAuth(pub Option<AuthUser>);

impl AuthExtractor {
    pub fn new(repo: Arc<AuthRepo>) -> Self {
        Self { repo }
    }

    /// Extract authentication from request headers or query parameters
    pub fn extract_auth(&self, parts: &Parts) -> Option<AuthUser> {
        // Try Authorization header first
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|s| s.to_string());

        // Fall back to query parameter
        let token = token.or_else(|| extract_token_from_query(parts.uri.query()))?;

        validate_token(&self.repo, &token)
    }
}

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let extractor = parts
            .extensions
            .get::<AuthExtractor>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Auth not configured"))?;

        Ok(OptionalAuth(extractor.extract_auth(parts)))
    }
}

/// Extract the `token` query parameter
pub fn extract_token_from_query(query: Option<&str>) -> Option<String> {
    query.and_then(|q| {
        q.split('&')
            .find_map(|p| p.strip_prefix("token="))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    })
}

/// Validate a token and return the auth user
pub fn validate_token(repo: &AuthRepo, token: &str) -> Option<AuthUser> {
    let session = repo.validate_session(token).ok()??;
    let user = repo.get_user(&session.user_id).ok()??;
    Some(AuthUser { session, user })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use rusqlite::Connection;

    fn setup() -> (Arc<AuthRepo>, String) {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let repo = Arc::new(AuthRepo::new(conn));
        let user_id = repo.create_user("Ann").unwrap();
        let token = repo
            .create_session(&user_id, Utc::now() + Duration::days(1))
            .unwrap();
        (repo, token)
    }

    #[test]
    fn test_extract_token_from_query() {
        assert_eq!(
            extract_token_from_query(Some("share=x&token=abc")),
            Some("abc".to_string())
        );
        assert_eq!(extract_token_from_query(Some("token=")), None);
        assert_eq!(extract_token_from_query(Some("share=x")), None);
        assert_eq!(extract_token_from_query(None), None);
    }

    #[test]
    fn test_extract_auth_header_and_query() {
        let (repo, token) = setup();
        let extractor = AuthExtractor::new(repo);

        let (parts, _) = Request::builder()
            .uri("/api/docs/d/updates")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(extractor.extract_auth(&parts).unwrap().user.name, "Ann");

        let (parts, _) = Request::builder()
            .uri(format!("/docs/d/sync?token={}", token))
            .body(())
            .unwrap()
            .into_parts();
        assert!(extractor.extract_auth(&parts).is_some());

        let (parts, _) = Request::builder()
            .uri("/docs/d/sync?token=bogus")
            .body(())
            .unwrap()
            .into_parts();
        assert!(extractor.extract_auth(&parts).is_none());
    }
}
