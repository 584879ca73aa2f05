/// Authentication module
///
/// Credential hashing, JWT issuance/validation, refresh token storage and
/// the auth service that orchestrates them.

mod claims;
mod jwt;
mod password;
mod refresh_token;
mod service;

pub use claims::require_role;
pub use claims::Claims;
pub use jwt::TokenIssuer;
pub use jwt::TokenPair;
pub use password::validate_password_strength;
pub use password::CredentialHasher;
pub use refresh_token::InMemoryRefreshTokenStore;
pub use refresh_token::NewRefreshToken;
pub use refresh_token::PgRefreshTokenStore;
pub use refresh_token::RefreshTokenRecord;
pub use refresh_token::RefreshTokenStore;
pub use service::AuthService;
pub use service::CheckedRefresh;
pub use service::RefreshSession;
