/// Authentication Routes
///
/// Sign-up, sign-in, logout, token refresh and current user information.
/// Token pairs are returned in the body; the refresh token is also set as an
/// http-only cookie, which is where the refresh guard reads it from.

use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthService, CheckedRefresh, Claims, TokenPair};
use crate::configuration::CookieSettings;
use crate::error::{AppError, ErrorContext};
use crate::users::Role;

/// Sign-up and sign-in request body
#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub created_at: String,
}

fn refresh_cookie(settings: &CookieSettings, token: &str, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build(settings.refresh_cookie_name.clone(), token.to_string())
        .http_only(true)
        .secure(settings.secure)
        .same_site(SameSite::Strict)
        .path("/auth")
        .max_age(CookieDuration::seconds(max_age_secs))
        .finish()
}

fn token_response(
    mut builder: actix_web::HttpResponseBuilder,
    pair: TokenPair,
    auth: &AuthService,
    cookies: &CookieSettings,
) -> HttpResponse {
    builder
        .cookie(refresh_cookie(
            cookies,
            &pair.refresh_token,
            auth.issuer().refresh_token_expiry(),
        ))
        .json(pair)
}

/// POST /auth/signup
///
/// # Errors
/// - 400: invalid email or password too short/long
/// - 403: email already registered (same body as a failed sign-in)
pub async fn sign_up(
    form: web::Json<CredentialsRequest>,
    auth: web::Data<AuthService>,
    cookies: web::Data<CookieSettings>,
) -> Result<HttpResponse, AppError> {
    let context = ErrorContext::new("sign_up");

    let pair = auth
        .sign_up(&form.email, &form.password)
        .await
        .map_err(|e| {
            context.log_error(&e);
            e
        })?;

    Ok(token_response(HttpResponse::Created(), pair, &auth, &cookies))
}

/// POST /auth/signin
///
/// # Errors
/// - 403: unknown email or wrong password, indistinguishable
pub async fn sign_in(
    form: web::Json<CredentialsRequest>,
    auth: web::Data<AuthService>,
    cookies: web::Data<CookieSettings>,
) -> Result<HttpResponse, AppError> {
    let context = ErrorContext::new("sign_in");

    let pair = auth
        .sign_in(&form.email, &form.password)
        .await
        .map_err(|e| {
            context.log_error(&e);
            e
        })?;

    Ok(token_response(HttpResponse::Ok(), pair, &auth, &cookies))
}

/// POST /auth/logout
///
/// Requires an access token. Drops every refresh session of the caller and
/// clears the refresh cookie.
pub async fn logout(
    claims: web::ReqData<Claims>,
    auth: web::Data<AuthService>,
    cookies: web::Data<CookieSettings>,
) -> Result<HttpResponse, AppError> {
    let user_id = claims.user_id()?;
    auth.logout(user_id).await?;

    Ok(HttpResponse::Ok()
        .cookie(refresh_cookie(&cookies, "", 0))
        .json(LogoutResponse { success: true }))
}

/// POST /auth/refresh
///
/// Sits behind the refresh guard, which has already checked the cookie
/// against the session store.
///
/// # Errors
/// - 401: missing or invalid refresh cookie (guard)
/// - 403: token rotated away, logged out or unknown
pub async fn refresh(
    checked: web::ReqData<CheckedRefresh>,
    auth: web::Data<AuthService>,
    cookies: web::Data<CookieSettings>,
) -> Result<HttpResponse, AppError> {
    let checked = checked.into_inner();
    let context = ErrorContext::new("token_refresh").with_user_id(checked.user.id.to_string());

    let pair = auth.rotate(&checked).await.map_err(|e| {
        context.log_error(&e);
        e
    })?;

    Ok(token_response(HttpResponse::Ok(), pair, &auth, &cookies))
}

/// GET /auth/me
///
/// Requires an access token.
pub async fn get_current_user(
    claims: web::ReqData<Claims>,
    auth: web::Data<AuthService>,
) -> Result<HttpResponse, AppError> {
    let (user, roles) = auth.current_user(claims.user_id()?).await?;

    Ok(HttpResponse::Ok().json(UserResponse {
        id: user.id.to_string(),
        email: user.email,
        roles: roles.into_iter().collect(),
        created_at: user.created_at.to_rfc3339(),
    }))
}
