use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Authenticator, IdentityResolver};

use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::frame::{AuthFrame, ClientFrame, ServerFrame};
use crate::router::SocketHandler;

/// Re-authenticates an open connection from an `AUTH` frame.
///
/// An access token replaces the accountability and is answered with
/// `{type:'auth', accountability}`. A refresh token or an email/password pair
/// goes through the authenticator first, and the issued token pair follows
/// the accountability frame.
pub struct AuthHandler {
    identity: Arc<dyn IdentityResolver>,
    authenticator: Arc<dyn Authenticator>,
}

impl AuthHandler {
    pub fn new(identity: Arc<dyn IdentityResolver>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            identity,
            authenticator,
        }
    }

    async fn authenticate(&self, connection: &Connection, token: &str) -> Result<()> {
        let current = connection.accountability();
        let accountability = self
            .identity
            .accountability_for_token(Some(token))
            .await?
            .with_origin(current.ip.clone(), current.user_agent.clone());
        connection.set_accountability(accountability.clone());
        tracing::info!(
            connection_id = %connection.id(),
            user = accountability.label(),
            "Connection re-authenticated"
        );
        connection.send(&ServerFrame::Auth { accountability });
        Ok(())
    }

    async fn handle(&self, connection: &Connection, frame: &AuthFrame) -> Result<()> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(String::from);

        if let Some(token) = non_empty(&frame.access_token) {
            return self.authenticate(connection, &token).await;
        }

        let tokens = if let Some(refresh) = non_empty(&frame.refresh_token) {
            self.authenticator.refresh(&refresh).await?
        } else if let (Some(email), Some(password)) =
            (non_empty(&frame.email), non_empty(&frame.password))
        {
            self.authenticator.login(&email, &password).await?
        } else {
            return Err(GatewayError::operation("Invalid authentication payload."));
        };

        self.authenticate(connection, &tokens.access_token).await?;
        connection.send(&ServerFrame::AuthTokens(tokens));
        Ok(())
    }
}

#[async_trait]
impl SocketHandler for AuthHandler {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn on_message(&self, connection: &Arc<Connection>, frame: &ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Auth(auth) => self.handle(connection, auth).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Outbound};
    use relay_core::mock::{MockAuthenticator, MockIdentityResolver, MOCK_TOKEN_TTL_MS};
    use relay_core::Accountability;
    use serde_json::Value as JsonValue;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn handler() -> AuthHandler {
        let identity = MockIdentityResolver::new()
            .with_role("editor", false)
            .with_token("tok-1", "user-1", Some("editor"));
        let authenticator = MockAuthenticator::new().with_user("ada@example.com", "pw", "tok-1");
        AuthHandler::new(Arc::new(identity), Arc::new(authenticator))
    }

    fn open() -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::new(Accountability::anonymous(Some("10.0.0.1".into()), None));
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);
        (conn, rx)
    }

    fn frames(rx: &mut UnboundedReceiver<Outbound>) -> Vec<JsonValue> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(t)) = rx.try_recv() {
            out.push(serde_json::from_str(&t).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_access_token_replaces_accountability() {
        let (conn, mut rx) = open();
        let frame = ClientFrame::Auth(AuthFrame {
            access_token: Some("tok-1".into()),
            ..Default::default()
        });
        handler().on_message(&conn, &frame).await.unwrap();

        assert_eq!(conn.accountability().user.as_deref(), Some("user-1"));
        assert_eq!(conn.accountability().ip.as_deref(), Some("10.0.0.1"));
        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "auth");
        assert_eq!(sent[0]["accountability"]["user"], "user-1");
    }

    #[tokio::test]
    async fn test_login_sends_accountability_then_tokens() {
        let (conn, mut rx) = open();
        let frame = ClientFrame::Auth(AuthFrame {
            email: Some("ada@example.com".into()),
            password: Some("pw".into()),
            ..Default::default()
        });
        handler().on_message(&conn, &frame).await.unwrap();

        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].get("accountability").is_some());
        assert_eq!(sent[1]["access_token"], "tok-1");
        assert_eq!(sent[1]["expires"], MOCK_TOKEN_TTL_MS);
    }

    #[tokio::test]
    async fn test_refresh_token_rotation() {
        let h = handler();
        let (conn, mut rx) = open();
        h.on_message(
            &conn,
            &ClientFrame::Auth(AuthFrame {
                email: Some("ada@example.com".into()),
                password: Some("pw".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        let refresh = frames(&mut rx)[1]["refresh_token"]
            .as_str()
            .unwrap()
            .to_string();

        let frame = ClientFrame::Auth(AuthFrame {
            refresh_token: Some(refresh.clone()),
            ..Default::default()
        });
        h.on_message(&conn, &frame).await.unwrap();
        let sent = frames(&mut rx);
        assert_ne!(sent[1]["refresh_token"], refresh.as_str());

        // Spent refresh tokens are refused.
        assert!(h.on_message(&conn, &frame).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let (conn, _rx) = open();
        let err = handler()
            .on_message(&conn, &ClientFrame::Auth(AuthFrame::default()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid authentication payload.");
    }

    #[tokio::test]
    async fn test_invalid_token_keeps_accountability() {
        let (conn, _rx) = open();
        let frame = ClientFrame::Auth(AuthFrame {
            access_token: Some("bogus".into()),
            ..Default::default()
        });
        assert!(handler().on_message(&conn, &frame).await.is_err());
        assert!(conn.accountability().user.is_none());
    }
}
