/// Middleware module
///
/// Request guards for access and refresh tokens.

mod jwt_middleware;
mod refresh_middleware;

pub use jwt_middleware::JwtMiddleware;
pub use refresh_middleware::RefreshTokenMiddleware;
