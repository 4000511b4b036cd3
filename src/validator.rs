//! REST session check made before each scheduled reconnect.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::ws::{SessionValidator, Validation};

/// Calls `GET {base}/?action=validateConnectionForWebsocket&client={version}` with the session
/// token as a bearer credential.
///
/// - 2xx: [`Validation::Authorized`]
/// - 401: [`Validation::Unauthenticated`]
/// - anything else, including transport failures: [`Validation::Failed`]
#[derive(Clone, Debug)]
pub struct RestValidator {
    client: Client,
    url: Url,
}

impl RestValidator {
    pub fn new(base: &str, client_version: &str) -> Result<Self> {
        Self::with_client(Client::new(), base, client_version)
    }

    pub fn with_client(client: Client, base: &str, client_version: &str) -> Result<Self> {
        let mut url = Url::parse(base)?;
        url.query_pairs_mut()
            .append_pair("action", "validateConnectionForWebsocket")
            .append_pair("client", client_version);

        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SessionValidator for RestValidator {
    async fn validate(&self, token: SecretString) -> Validation {
        let path = self.url.path().to_owned();
        let response = match self
            .client
            .get(self.url.clone())
            .bearer_auth(token.expose_secret())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Session validation request failed");
                return Validation::Failed {
                    status: None,
                    reason: e.to_string(),
                };
            }
        };

        let status_code = response.status();
        if status_code.is_success() {
            return Validation::Authorized;
        }
        if status_code == StatusCode::UNAUTHORIZED {
            tracing::debug!(path = %path, "Session token rejected");
            return Validation::Unauthenticated;
        }

        let message = response.text().await.unwrap_or_default();
        tracing::warn!(
            status = %status_code,
            path = %path,
            message = %message,
            "Session validation failed"
        );

        Validation::Failed {
            status: Some(status_code),
            reason: format!("{status_code}: {message}"),
        }
    }
}
