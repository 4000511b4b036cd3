//! Connect parameters supplied by the owning session.

pub use secrecy::{ExposeSecret, SecretString};
use url::Url;
pub use uuid::Uuid;

use crate::Result;
use crate::error::Error;

/// Everything the manager needs to know about the session that owns it.
///
/// A session is authenticated while it carries a token. The manager never looks this up
/// through global state: the owner hands it in on construction and pushes changes through
/// [`crate::ws::SocketManager::authenticated`] and [`crate::ws::SocketManager::set_online`].
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Session {
    /// Base URL of the websocket service
    pub(crate) endpoint: Url,
    pub(crate) token: Option<SecretString>,
    /// Identifies this client instance to the server (one per tab/process)
    pub(crate) client_id: Uuid,
    /// Whether the network layer currently reports the service as reachable
    pub(crate) online: bool,
}

impl Session {
    /// Create an unauthenticated, online session for `endpoint`.
    pub fn new(endpoint: &str, client_id: Uuid) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "websocket endpoint must use ws or wss, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            token: None,
            client_id,
            online: true,
        })
    }

    #[must_use]
    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    #[must_use]
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Build `{endpoint}/?session_token=..&client-id=..&client-version=..`.
    pub(crate) fn connect_url(&self, client_version: &str) -> Result<Url> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::validation("cannot connect without a session token"))?;

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("session_token", token.expose_secret())
            .append_pair("client-id", &self.client_id.to_string())
            .append_pair("client-version", client_version);

        Ok(url)
    }
}
