mod middleware;

pub use middleware::{AuthExtractor, AuthUser, OptionalAuth, extract_token_from_query, validate_token};
