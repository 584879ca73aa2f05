/// Auth Service
///
/// Sign-up, sign-in, logout and refresh over the user store, the refresh
/// token store, the token issuer and the credential hasher.
///
/// Session policy:
/// - sign-in is a hard reset: every stored session of the user is dropped
///   before a new one is issued
/// - refresh rotates one specific session: the presented `jti` is claimed
///   (deleted with an affected-row check) and replaced by a new record
/// - logout drops every session of the user

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::auth::claims::Claims;
use crate::auth::jwt::{TokenIssuer, TokenPair};
use crate::auth::password::{validate_password_strength, CredentialHasher};
use crate::auth::refresh_token::{NewRefreshToken, RefreshTokenRecord, RefreshTokenStore};
use crate::error::{AppError, AuthError, DatabaseError};
use crate::users::{Role, User, UserStore};
use crate::validators::{is_valid_email, normalize_email};

/// A refresh token whose signature has already been checked, together with
/// the raw string needed for the stored-hash comparison.
#[derive(Debug, Clone)]
pub struct RefreshSession {
    pub claims: Claims,
    pub token: String,
}

/// A refresh session that passed the store check: the user exists and the
/// presented token matches a live record.
#[derive(Debug, Clone)]
pub struct CheckedRefresh {
    pub user: User,
    pub record: RefreshTokenRecord,
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    issuer: Arc<TokenIssuer>,
    hasher: Arc<CredentialHasher>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        issuer: TokenIssuer,
        hasher: CredentialHasher,
    ) -> Self {
        Self {
            users,
            refresh_tokens,
            issuer: Arc::new(issuer),
            hasher: Arc::new(hasher),
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Register a new account and open its first session
    ///
    /// # Errors
    /// - Validation error for a malformed email or short password
    /// - `DuplicateCredentials` when the email is taken
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<TokenPair, AppError> {
        let email = is_valid_email(&normalize_email(email))?;
        validate_password_strength(password)?;

        let password_hash = self.hasher.hash(password)?;

        let user = self
            .users
            .create_user(&email, &password_hash)
            .await
            .map_err(|e| match e {
                AppError::Database(DatabaseError::UniqueConstraintViolation(_)) => {
                    AppError::Auth(AuthError::DuplicateCredentials)
                }
                other => other,
            })?;

        // No rollback of the user row if a later step fails
        self.users.assign_role(user.id, Role::User).await?;

        let pair = self.issue_session(&user).await?;

        tracing::info!(user_id = %user.id, "User signed up");
        Ok(pair)
    }

    /// Authenticate with email and password and reset the user's session
    ///
    /// Unknown email and wrong password fail identically.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<TokenPair, AppError> {
        let email = normalize_email(email);

        let user = match self.users.find_by_email(&email).await? {
            Some(user) => user,
            None => {
                self.hasher.verify_absent(password);
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        if !self.hasher.verify(&user.password_hash, password)? {
            return Err(AuthError::InvalidCredentials.into());
        }

        while let Some(previous) = self.refresh_tokens.find_first_by_user(user.id).await? {
            self.refresh_tokens
                .delete_by_user_and_jti(user.id, &previous.jti)
                .await?;
            tracing::debug!(user_id = %user.id, "Previous session discarded");
        }

        let pair = self.issue_session(&user).await?;

        tracing::info!(user_id = %user.id, "User signed in");
        Ok(pair)
    }

    /// Drop every stored session for the user. Succeeds even if none exist.
    pub async fn logout(&self, user_id: Uuid) -> Result<(), AppError> {
        let removed = self.refresh_tokens.delete_all_by_user(user_id).await?;
        tracing::info!(user_id = %user_id, sessions = removed, "User logged out");
        Ok(())
    }

    /// Check a signature-verified refresh token against the store
    ///
    /// Every failure is `AccessDenied`.
    pub async fn check_refresh_session(
        &self,
        user_id: Uuid,
        session: &RefreshSession,
    ) -> Result<CheckedRefresh, AppError> {
        if session.claims.sub != user_id.to_string() {
            return Err(AuthError::AccessDenied.into());
        }

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::AccessDenied)?;

        let jti = session
            .claims
            .jti
            .as_deref()
            .ok_or(AuthError::AccessDenied)?;

        // No row means rotated away, logged out or never issued
        let record = self
            .refresh_tokens
            .find_by_user_and_jti(user_id, jti)
            .await?
            .ok_or(AuthError::AccessDenied)?;

        if record.is_expired(Utc::now()) {
            self.refresh_tokens.delete_by_user_and_jti(user_id, jti).await?;
            tracing::info!(user_id = %user_id, "Expired refresh session removed");
            return Err(AuthError::AccessDenied.into());
        }

        if !self.hasher.verify(&record.token_hash, &session.token)? {
            tracing::warn!(user_id = %user_id, "Refresh token hash mismatch");
            return Err(AuthError::AccessDenied.into());
        }

        Ok(CheckedRefresh { user, record })
    }

    /// Exchange a live refresh token for a new pair, invalidating the old one
    pub async fn refresh(
        &self,
        user_id: Uuid,
        session: &RefreshSession,
    ) -> Result<TokenPair, AppError> {
        let checked = self.check_refresh_session(user_id, session).await?;
        self.rotate(&checked).await
    }

    /// Replace an already checked session with a new one
    pub async fn rotate(&self, checked: &CheckedRefresh) -> Result<TokenPair, AppError> {
        let user_id = checked.user.id;

        // Only the caller that actually removes the row may continue, so two
        // concurrent refreshes of one token cannot both mint a new session.
        let claimed = self
            .refresh_tokens
            .delete_by_user_and_jti(user_id, &checked.record.jti)
            .await?;
        if claimed != 1 {
            tracing::warn!(user_id = %user_id, "Refresh token already rotated");
            return Err(AuthError::AccessDenied.into());
        }

        let pair = self.issue_session(&checked.user).await?;

        tracing::info!(user_id = %user_id, "Refresh token rotated");
        Ok(pair)
    }

    /// User record and role set behind an access token
    pub async fn current_user(&self, user_id: Uuid) -> Result<(User, BTreeSet<Role>), AppError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("user {}", user_id)))?;
        let roles = self.users.roles_for(user_id).await?;
        Ok((user, roles))
    }

    /// Delete every stored session past its expiry
    pub async fn purge_expired_sessions(&self) -> Result<u64, AppError> {
        let removed = self.refresh_tokens.purge_expired(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged expired refresh sessions");
        }
        Ok(removed)
    }

    /// Issue a pair for the user and persist the refresh token's hash
    async fn issue_session(&self, user: &User) -> Result<TokenPair, AppError> {
        let roles: Vec<Role> = self.users.roles_for(user.id).await?.into_iter().collect();
        let pair = self.issuer.issue_token_pair(user.id, &user.email, &roles, None)?;

        let jti = self
            .issuer
            .decode(&pair.refresh_token)
            .and_then(|claims| claims.jti)
            .ok_or_else(|| AuthError::Signing("issued refresh token has no jti".to_string()))?;

        let token_hash = self.hasher.hash(&pair.refresh_token)?;
        self.refresh_tokens
            .create(NewRefreshToken {
                user_id: user.id,
                jti,
                token_hash,
                expires_at: Utc::now() + Duration::seconds(self.issuer.refresh_token_expiry()),
            })
            .await?;

        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh_token::InMemoryRefreshTokenStore;
    use crate::configuration::{HashingSettings, JwtSettings};
    use crate::users::InMemoryUserStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Barrier;

    struct Fixture {
        service: AuthService,
        users: Arc<InMemoryUserStore>,
        tokens: Arc<InMemoryRefreshTokenStore>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(InMemoryUserStore::new());
        let tokens = Arc::new(InMemoryRefreshTokenStore::new());
        let service = build_service(users.clone(), tokens.clone());
        Fixture {
            service,
            users,
            tokens,
        }
    }

    fn build_service(
        users: Arc<InMemoryUserStore>,
        tokens: Arc<dyn RefreshTokenStore>,
    ) -> AuthService {
        let issuer = TokenIssuer::new(&JwtSettings {
            access_secret: "access-secret-for-tests".into(),
            refresh_secret: "refresh-secret-for-tests".into(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            issuer: "restroom-test".into(),
        })
        .unwrap();
        let hasher = CredentialHasher::new(&HashingSettings {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();

        AuthService::new(users, tokens, issuer, hasher)
    }

    /// Holds every caller after the lookup until `parties` callers have
    /// looked up, so concurrent refreshes all pass the store check before
    /// any of them claims the record.
    struct LockstepStore {
        inner: Arc<InMemoryRefreshTokenStore>,
        barrier: Barrier,
    }

    #[async_trait]
    impl RefreshTokenStore for LockstepStore {
        async fn create(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord, AppError> {
            self.inner.create(token).await
        }

        async fn find_by_user_and_jti(
            &self,
            user_id: Uuid,
            jti: &str,
        ) -> Result<Option<RefreshTokenRecord>, AppError> {
            let found = self.inner.find_by_user_and_jti(user_id, jti).await?;
            self.barrier.wait().await;
            Ok(found)
        }

        async fn find_first_by_user(
            &self,
            user_id: Uuid,
        ) -> Result<Option<RefreshTokenRecord>, AppError> {
            self.inner.find_first_by_user(user_id).await
        }

        async fn delete_by_user_and_jti(&self, user_id: Uuid, jti: &str) -> Result<u64, AppError> {
            self.inner.delete_by_user_and_jti(user_id, jti).await
        }

        async fn delete_all_by_user(&self, user_id: Uuid) -> Result<u64, AppError> {
            self.inner.delete_all_by_user(user_id).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
            self.inner.purge_expired(now).await
        }
    }

    fn session_for(service: &AuthService, pair: &TokenPair) -> (Uuid, RefreshSession) {
        let claims = service
            .issuer()
            .verify_refresh(&pair.refresh_token)
            .expect("refresh token verifies");
        let user_id = claims.user_id().unwrap();
        (
            user_id,
            RefreshSession {
                claims,
                token: pair.refresh_token.clone(),
            },
        )
    }

    #[tokio::test]
    async fn sign_up_returns_tokens_for_new_user() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();

        let user = fx.users.find_by_email("alice@example.com").await.unwrap().unwrap();
        let access = fx.service.issuer().verify_access(&pair.access_token).unwrap();
        assert_eq!(access.sub, user.id.to_string());
        assert_eq!(access.roles, vec![Role::User]);
        assert_eq!(fx.tokens.count_for_user(user.id), 1);

        // Stored jti matches the one inside the issued refresh token
        let jti = fx.service.issuer().decode(&pair.refresh_token).unwrap().jti.unwrap();
        let record = fx.tokens.find_by_user_and_jti(user.id, &jti).await.unwrap().unwrap();
        assert_ne!(record.token_hash, pair.refresh_token);
    }

    #[tokio::test]
    async fn sign_up_twice_is_duplicate_credentials() {
        let fx = fixture();
        fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();

        let err = fx
            .service
            .sign_up("alice@example.com", "another-password")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Auth(AuthError::DuplicateCredentials)));
    }

    #[tokio::test]
    async fn sign_up_rejects_bad_input() {
        let fx = fixture();
        assert!(matches!(
            fx.service.sign_up("not-an-email", "pw123456").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            fx.service.sign_up("bob@example.com", "short").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn sign_in_failures_are_indistinguishable() {
        let fx = fixture();
        fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let user = fx.users.find_by_email("alice@example.com").await.unwrap().unwrap();
        fx.service.logout(user.id).await.unwrap();

        let wrong_password = fx
            .service
            .sign_in("alice@example.com", "wrongpassword")
            .await
            .unwrap_err();
        let unknown_email = fx
            .service
            .sign_in("nobody@example.com", "pw123456")
            .await
            .unwrap_err();

        assert!(matches!(wrong_password, AppError::Auth(AuthError::InvalidCredentials)));
        assert!(matches!(unknown_email, AppError::Auth(AuthError::InvalidCredentials)));
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
        // Failed sign-in creates no session
        assert_eq!(fx.tokens.count_for_user(user.id), 0);
    }

    #[tokio::test]
    async fn sign_in_is_a_hard_reset() {
        let fx = fixture();
        let signup_pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let user = fx.users.find_by_email("alice@example.com").await.unwrap().unwrap();

        fx.service.sign_in("alice@example.com", "pw123456").await.unwrap();
        fx.service.sign_in("alice@example.com", "pw123456").await.unwrap();
        assert_eq!(fx.tokens.count_for_user(user.id), 1);

        // The sign-up session is gone
        let (user_id, session) = session_for(&fx.service, &signup_pair);
        let err = fx.service.refresh(user_id, &session).await.unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn sign_in_drops_every_existing_session() {
        let fx = fixture();
        fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let user = fx.users.find_by_email("alice@example.com").await.unwrap().unwrap();
        fx.tokens
            .create(NewRefreshToken {
                user_id: user.id,
                jti: "other-device".into(),
                token_hash: "x".into(),
                expires_at: Utc::now() + Duration::days(7),
            })
            .await
            .unwrap();
        assert_eq!(fx.tokens.count_for_user(user.id), 2);

        fx.service.sign_in("alice@example.com", "pw123456").await.unwrap();

        assert_eq!(fx.tokens.count_for_user(user.id), 1);
        assert!(fx
            .tokens
            .find_by_user_and_jti(user.id, "other-device")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let fx = fixture();
        let original = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, session) = session_for(&fx.service, &original);

        let rotated = fx.service.refresh(user_id, &session).await.unwrap();
        assert_ne!(rotated.refresh_token, original.refresh_token);
        assert_eq!(fx.tokens.count_for_user(user_id), 1);

        let replay = fx.service.refresh(user_id, &session).await.unwrap_err();
        assert!(replay.is_access_denied());

        // The rotated token keeps working
        let (_, next) = session_for(&fx.service, &rotated);
        assert!(fx.service.refresh(user_id, &next).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_after_logout_is_denied() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, session) = session_for(&fx.service, &pair);

        fx.service.logout(user_id).await.unwrap();
        assert_eq!(fx.tokens.count_for_user(user_id), 0);
        // Logout is idempotent
        fx.service.logout(user_id).await.unwrap();

        let err = fx.service.refresh(user_id, &session).await.unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn refresh_for_unknown_user_is_denied() {
        let fx = fixture();
        let pair = fx
            .service
            .issuer()
            .issue_token_pair(Uuid::new_v4(), "ghost@example.com", &[Role::User], None)
            .unwrap();
        let (user_id, session) = session_for(&fx.service, &pair);

        assert!(fx.service.refresh(user_id, &session).await.unwrap_err().is_access_denied());
    }

    #[tokio::test]
    async fn refresh_with_mismatched_hash_is_denied() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, mut session) = session_for(&fx.service, &pair);

        // Right jti, different token material
        let forged = fx
            .service
            .issuer()
            .issue_token_pair(user_id, "mallory@example.com", &[Role::Admin], session.claims.jti.clone())
            .unwrap();
        session.token = forged.refresh_token;

        assert!(fx.service.refresh(user_id, &session).await.unwrap_err().is_access_denied());
        // The genuine session survives the failed attempt
        assert_eq!(fx.tokens.count_for_user(user_id), 1);
    }

    #[tokio::test]
    async fn refresh_with_other_users_id_is_denied() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        fx.service.sign_up("bob@example.com", "pw123456").await.unwrap();
        let bob = fx.users.find_by_email("bob@example.com").await.unwrap().unwrap();
        let (_, session) = session_for(&fx.service, &pair);

        assert!(fx.service.refresh(bob.id, &session).await.unwrap_err().is_access_denied());
    }

    #[tokio::test]
    async fn refresh_with_expired_record_is_denied_and_removed() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, session) = session_for(&fx.service, &pair);
        let jti = session.claims.jti.clone().unwrap();

        // Replace the live record with an already expired copy
        let record = fx.tokens.find_by_user_and_jti(user_id, &jti).await.unwrap().unwrap();
        fx.tokens.delete_by_user_and_jti(user_id, &jti).await.unwrap();
        fx.tokens
            .create(NewRefreshToken {
                user_id,
                jti: jti.clone(),
                token_hash: record.token_hash,
                expires_at: Utc::now() - Duration::seconds(1),
            })
            .await
            .unwrap();

        assert!(fx.service.refresh(user_id, &session).await.unwrap_err().is_access_denied());
        assert_eq!(fx.tokens.count_for_user(user_id), 0);
    }

    #[tokio::test]
    async fn concurrent_refresh_yields_one_new_session() {
        let users = Arc::new(InMemoryUserStore::new());
        let inner = Arc::new(InMemoryRefreshTokenStore::new());
        let store = Arc::new(LockstepStore {
            inner: inner.clone(),
            barrier: Barrier::new(2),
        });
        let service = build_service(users, store);

        let pair = service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, session) = session_for(&service, &pair);

        // Both calls find the live record before either claims it
        let (first, second) = tokio::join!(
            service.refresh(user_id, &session),
            service.refresh(user_id, &session)
        );

        let (winner, loser) = match (first, second) {
            (Ok(pair), Err(e)) | (Err(e), Ok(pair)) => (pair, e),
            (first, second) => panic!(
                "expected exactly one rotation, got {:?} and {:?}",
                first.map(|_| ()),
                second.map(|_| ())
            ),
        };
        assert!(loser.is_access_denied());
        assert_eq!(inner.count_for_user(user_id), 1);

        let jti = service.issuer().decode(&winner.refresh_token).unwrap().jti.unwrap();
        assert!(inner.find_by_user_and_jti(user_id, &jti).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rotate_of_already_claimed_session_is_denied() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let (user_id, session) = session_for(&fx.service, &pair);

        let checked = fx.service.check_refresh_session(user_id, &session).await.unwrap();
        fx.tokens
            .delete_by_user_and_jti(user_id, &checked.record.jti)
            .await
            .unwrap();

        assert!(fx.service.rotate(&checked).await.unwrap_err().is_access_denied());
        assert_eq!(fx.tokens.count_for_user(user_id), 0);
    }

    #[tokio::test]
    async fn current_user_reports_roles() {
        let fx = fixture();
        let pair = fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let claims = fx.service.issuer().verify_access(&pair.access_token).unwrap();

        let (user, roles) = fx.service.current_user(claims.user_id().unwrap()).await.unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert!(roles.contains(&Role::User));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_sessions() {
        let fx = fixture();
        fx.service.sign_up("alice@example.com", "pw123456").await.unwrap();
        let ghost = Uuid::new_v4();
        fx.tokens
            .create(NewRefreshToken {
                user_id: ghost,
                jti: "stale".into(),
                token_hash: "x".into(),
                expires_at: Utc::now() - Duration::days(1),
            })
            .await
            .unwrap();

        assert_eq!(fx.service.purge_expired_sessions().await.unwrap(), 1);
        assert_eq!(fx.tokens.count_for_user(ghost), 0);
    }
}
