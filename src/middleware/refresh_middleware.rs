/// Refresh Token Guard
///
/// Reads the refresh token cookie, verifies its signature and checks it
/// against the session store before the request reaches the handler. The
/// checked session is injected as a `CheckedRefresh`.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::{AuthService, RefreshSession};
use crate::error::{AppError, AuthError};

pub struct RefreshTokenMiddleware {
    auth: AuthService,
    cookie_name: String,
}

impl RefreshTokenMiddleware {
    pub fn new(auth: AuthService, cookie_name: impl Into<String>) -> Self {
        Self {
            auth,
            cookie_name: cookie_name.into(),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RefreshTokenMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RefreshTokenMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RefreshTokenMiddlewareService {
            service: Rc::new(service),
            auth: self.auth.clone(),
            cookie_name: self.cookie_name.clone(),
        }))
    }
}

pub struct RefreshTokenMiddlewareService<S> {
    service: Rc<S>,
    auth: AuthService,
    cookie_name: String,
}

impl<S, B> Service<ServiceRequest> for RefreshTokenMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = req
            .cookie(&self.cookie_name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty());

        let service = self.service.clone();
        let auth = self.auth.clone();

        Box::pin(async move {
            let token = token.ok_or_else(|| {
                tracing::warn!("Refresh cookie missing");
                AppError::Auth(AuthError::MissingToken)
            })?;

            let claims = auth.issuer().verify_refresh(&token)?;
            let user_id = claims.user_id()?;
            let session = RefreshSession { claims, token };

            let checked = auth.check_refresh_session(user_id, &session).await?;

            req.extensions_mut().insert(checked);
            service.call(req).await
        })
    }
}
