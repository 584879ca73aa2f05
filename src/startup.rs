use actix_web::dev::Server;
use actix_web::{middleware::Logger, web, App, HttpServer};
use sqlx::PgPool;
use std::net::TcpListener;
use std::sync::Arc;

use crate::auth::{
    AuthService, CredentialHasher, InMemoryRefreshTokenStore, PgRefreshTokenStore, TokenIssuer,
};
use crate::configuration::{CookieSettings, HashingSettings, JwtSettings};
use crate::error::AppError;
use crate::logger::LoggerMiddleware;
use crate::middleware::{JwtMiddleware, RefreshTokenMiddleware};
use crate::routes::{get_current_user, health_check, logout, refresh, sign_in, sign_up};
use crate::users::{InMemoryUserStore, PgUserStore};

/// Auth service backed by Postgres
pub fn postgres_auth_service(
    pool: PgPool,
    jwt: &JwtSettings,
    hashing: &HashingSettings,
) -> Result<AuthService, AppError> {
    Ok(AuthService::new(
        Arc::new(PgUserStore::new(pool.clone())),
        Arc::new(PgRefreshTokenStore::new(pool)),
        TokenIssuer::new(jwt)?,
        CredentialHasher::new(hashing)?,
    ))
}

/// Auth service backed by process memory; sessions do not survive restart
pub fn in_memory_auth_service(
    jwt: &JwtSettings,
    hashing: &HashingSettings,
) -> Result<AuthService, AppError> {
    Ok(AuthService::new(
        Arc::new(InMemoryUserStore::new()),
        Arc::new(InMemoryRefreshTokenStore::new()),
        TokenIssuer::new(jwt)?,
        CredentialHasher::new(hashing)?,
    ))
}

pub fn run(
    listener: TcpListener,
    auth: AuthService,
    cookies: CookieSettings,
) -> Result<Server, std::io::Error> {
    let auth_data = web::Data::new(auth.clone());
    let cookie_data = web::Data::new(cookies.clone());

    let server = HttpServer::new(move || {
        App::new()
            // Global middleware
            .wrap(Logger::default())
            .wrap(LoggerMiddleware)

            // Shared state
            .app_data(auth_data.clone())
            .app_data(cookie_data.clone())

            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/auth")
                    // Public
                    .route("/signup", web::post().to(sign_up))
                    .route("/signin", web::post().to(sign_in))
                    // Refresh cookie
                    .service(
                        web::resource("/refresh")
                            .wrap(RefreshTokenMiddleware::new(
                                auth.clone(),
                                cookies.refresh_cookie_name.clone(),
                            ))
                            .route(web::post().to(refresh)),
                    )
                    // Access token
                    .service(
                        web::resource("/logout")
                            .wrap(JwtMiddleware::new(auth.clone()))
                            .route(web::post().to(logout)),
                    )
                    .service(
                        web::resource("/me")
                            .wrap(JwtMiddleware::new(auth.clone()))
                            .route(web::get().to(get_current_user)),
                    ),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
