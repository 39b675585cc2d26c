use axum::{
    extract::{FromRef, State},
    routing::post,
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::dto::{AuthResponse, LoginRequest, PublicUser, RefreshRequest, SignupRequest};
use super::jwt::JwtKeys;
use super::password::{hash_password, verify_password};
use super::repo::User;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn token_pair(keys: &JwtKeys, user: &User) -> ApiResult<AuthResponse> {
    let access_token = keys.sign_access(user.id).map_err(ApiError::persistence)?;
    let refresh_token = keys.sign_refresh(user.id).map_err(ApiError::persistence)?;
    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: PublicUser {
            id: user.id,
            email: user.email.clone(),
        },
    })
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(mut payload): Json<SignupRequest>,
) -> ApiResult<Json<AuthResponse>> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::InvalidInput("invalid email".into()));
    }
    if payload.password.len() < 8 {
        return Err(ApiError::InvalidInput("password too short".into()));
    }

    if User::find_by_email(&state.db, &payload.email)
        .await
        .map_err(ApiError::persistence)?
        .is_some()
    {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::Conflict("email already registered".into()));
    }

    let hash = hash_password(&payload.password).map_err(ApiError::persistence)?;

    // Concurrent signups can both pass the check above; the unique index on
    // email decides the race.
    let user = User::create(&state.db, &payload.email, &hash)
        .await
        .map_err(|e| ApiError::conflict_on_unique(e, "email already registered"))?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    let keys = JwtKeys::from_ref(&state);
    Ok(Json(token_pair(&keys, &user)?))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        return Err(ApiError::InvalidInput("invalid email".into()));
    }

    // Same rejection for unknown email and bad password.
    let user = User::find_by_email(&state.db, &payload.email)
        .await
        .map_err(ApiError::persistence)?
        .ok_or_else(|| ApiError::Unauthenticated("invalid credentials".into()))?;

    let ok = verify_password(&payload.password, &user.password_hash)
        .map_err(ApiError::persistence)?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::Unauthenticated("invalid credentials".into()));
    }

    info!(user_id = %user.id, "user logged in");
    let keys = JwtKeys::from_ref(&state);
    Ok(Json(token_pair(&keys, &user)?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| ApiError::Unauthenticated(e.to_string()))?;

    let user = User::find_by_id(&state.db, claims.sub)
        .await
        .map_err(ApiError::persistence)?
        .ok_or_else(|| ApiError::Unauthenticated("user no longer exists".into()))?;

    Ok(Json(token_pair(&keys, &user)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(is_valid_email("reader@example.com"));
        assert!(is_valid_email("a.b+c@sub.domain.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("spaces in@example.com"));
        assert!(!is_valid_email("missing@tld"));
    }
}
