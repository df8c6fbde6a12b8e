//! Login and registration
//!
//! Both endpoints answer with a credential pair and the user profile, in one
//! of two shapes depending on the server version:
//!
//! - nested: `{"user": {..}, "tokens": {"access": "..", "refresh": ".."}}`
//! - flat:   `{"access": "..", "refresh": "..", "user": {..}}`
//!
//! The nested shape is tried first.

use serde::Deserialize;
use serde_json::Value;
use token_store::credentials::normalize_entry;
use token_store::{AuthEventKind, CredentialPair};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::options::RequestOptions;
use crate::pipeline::RequestPipeline;

#[derive(Debug, Deserialize)]
struct TokenPair {
    access: String,
    refresh: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AuthResponse {
    Nested {
        #[serde(default)]
        user: Value,
        tokens: TokenPair,
    },
    Flat {
        access: String,
        refresh: String,
        #[serde(default)]
        user: Value,
    },
}

/// Split a login/registration response into the pair and the user profile.
pub(crate) fn decode_auth_response(body: Value) -> Result<(CredentialPair, Value)> {
    let response: AuthResponse = serde_json::from_value(body)
        .map_err(|_| Error::Parse("authentication response carries no credential pair".into()))?;
    let (access, refresh, user) = match response {
        AuthResponse::Nested { user, tokens } => (tokens.access, tokens.refresh, user),
        AuthResponse::Flat {
            access,
            refresh,
            user,
        } => (access, refresh, user),
    };

    match (normalize_entry(&access), normalize_entry(&refresh)) {
        (Some(access), Some(refresh)) => Ok((CredentialPair::new(access, refresh), user)),
        _ => Err(Error::Parse(
            "authentication response carries an empty token".into(),
        )),
    }
}

/// POST `body` anonymously to `endpoint`, store the returned pair and emit
/// `login` with the user profile. Returns the profile.
pub(crate) async fn authenticate(
    pipeline: &RequestPipeline,
    endpoint: &str,
    body: Value,
) -> Result<Value> {
    let response = pipeline
        .request(endpoint, RequestOptions::post(body).without_credentials())
        .await?;
    let (pair, user) = decode_auth_response(response)?;

    let store = pipeline.store();
    if let Err(e) = store.save(pair).await {
        warn!(error = %e, "credentials could not be persisted, session is in-memory only");
    }
    info!(endpoint, "authenticated");
    store.events().publish(AuthEventKind::Login, user.clone());
    Ok(user)
}
