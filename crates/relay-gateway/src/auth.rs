//! Credential extraction and accountability resolution.

use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use relay_core::{Accountability, Authenticator, IdentityResolver};

use crate::error::{GatewayError, Result};
use crate::frame::HandshakeFrame;

/// Bearer token of an upgrade request.
///
/// The `access_token` query parameter wins over an `Authorization: Bearer`
/// header. Empty values count as absent.
pub fn extract_token(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.get("access_token").filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Credentials carried by a `HANDSHAKE` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Login { email: String, password: String },
}

impl Credentials {
    /// `access_token` first, then `email` + `password`. `None` when neither
    /// form is complete.
    pub fn from_handshake(frame: &HandshakeFrame) -> Option<Self> {
        if let Some(token) = frame.access_token.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::Token(token.clone()));
        }
        match (&frame.email, &frame.password) {
            (Some(email), Some(password)) => Some(Credentials::Login {
                email: email.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Resolve credentials to an accountability. Logins go through the
/// authenticator and the issued access token is then resolved.
pub async fn resolve_credentials(
    credentials: &Credentials,
    identity: &dyn IdentityResolver,
    authenticator: &dyn Authenticator,
) -> Result<Accountability> {
    let token = match credentials {
        Credentials::Token(token) => token.clone(),
        Credentials::Login { email, password } => {
            authenticator.login(email, password).await?.access_token
        }
    };
    Ok(identity.accountability_for_token(Some(&token)).await?)
}

/// Re-resolve `current` from its role, keeping the user id and origin.
///
/// Role permissions can change while a connection is open; this is run
/// before every protected operation.
pub async fn refresh_accountability(
    identity: &dyn IdentityResolver,
    current: &Accountability,
) -> Result<Accountability> {
    let mut refreshed = identity
        .accountability_for_role(current.role.as_deref(), current)
        .await
        .map_err(GatewayError::from)?;
    refreshed.user = current.user.clone();
    Ok(refreshed.with_origin(current.ip.clone(), current.user_agent.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use relay_core::mock::{MockAuthenticator, MockIdentityResolver};

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_query_token_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header"));
        assert_eq!(
            extract_token(&query(&[("access_token", "query")]), &headers).as_deref(),
            Some("query")
        );
        assert_eq!(
            extract_token(&HashMap::new(), &headers).as_deref(),
            Some("header")
        );
    }

    #[test]
    fn test_non_bearer_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&HashMap::new(), &headers), None);
        assert_eq!(
            extract_token(&query(&[("access_token", "")]), &HeaderMap::new()),
            None
        );
    }

    #[test]
    fn test_handshake_credentials() {
        let token = HandshakeFrame {
            access_token: Some("t".into()),
            email: Some("a@b".into()),
            password: Some("p".into()),
        };
        assert_eq!(
            Credentials::from_handshake(&token),
            Some(Credentials::Token("t".into()))
        );

        let login = HandshakeFrame {
            email: Some("a@b".into()),
            password: Some("p".into()),
            ..Default::default()
        };
        assert!(matches!(
            Credentials::from_handshake(&login),
            Some(Credentials::Login { .. })
        ));

        let partial = HandshakeFrame {
            email: Some("a@b".into()),
            ..Default::default()
        };
        assert_eq!(Credentials::from_handshake(&partial), None);
    }

    #[tokio::test]
    async fn test_resolve_login_credentials() {
        let identity = MockIdentityResolver::new()
            .with_role("editor", false)
            .with_token("tok-1", "user-1", Some("editor"));
        let authenticator = MockAuthenticator::new().with_user("a@b", "secret", "tok-1");

        let acc = resolve_credentials(
            &Credentials::Login {
                email: "a@b".into(),
                password: "secret".into(),
            },
            &identity,
            &authenticator,
        )
        .await
        .unwrap();
        assert_eq!(acc.user.as_deref(), Some("user-1"));
        assert_eq!(acc.role.as_deref(), Some("editor"));

        let err = resolve_credentials(
            &Credentials::Login {
                email: "a@b".into(),
                password: "wrong".into(),
            },
            &identity,
            &authenticator,
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_refresh_restores_user_and_origin() {
        let identity = MockIdentityResolver::new().with_role("editor", true);
        let current = Accountability {
            user: Some("user-1".into()),
            role: Some("editor".into()),
            admin: false,
            ip: Some("127.0.0.1".into()),
            user_agent: Some("test".into()),
        };
        let refreshed = refresh_accountability(&identity, &current).await.unwrap();
        assert_eq!(refreshed.user.as_deref(), Some("user-1"));
        assert!(refreshed.admin);
        assert_eq!(refreshed.ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(identity.role_lookups(), 1);
    }

    #[tokio::test]
    async fn test_refresh_fails_for_removed_role() {
        let identity = MockIdentityResolver::new().with_role("editor", false);
        identity.remove_role("editor");
        let current = Accountability {
            role: Some("editor".into()),
            ..Default::default()
        };
        let err = refresh_accountability(&identity, &current).await.unwrap_err();
        assert!(matches!(err, GatewayError::Collection(relay_core::Error::Forbidden(_))));
    }
}
