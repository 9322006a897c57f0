//! Admin REST client for the identity provider.
//!
//! Every mutation is idempotent by construction: look the resource up
//! first, create it only when absent, and update only the fields that
//! drift (the realm frontend URL and the client redirect URIs on a
//! hostname change). Steps retry up to [`MAX_STEP_ATTEMPTS`] times with
//! linear backoff before surfacing [`IdpError::StepExhausted`].

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{
    DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USER, IdpError, PERMISSION_GROUPS, frontend_url,
    redirect_uris,
};
use crate::config::IdentityProviderConfig;

/// Attempts per bootstrap step.
pub const MAX_STEP_ATTEMPTS: u32 = 3;

/// Linear backoff unit between attempts.
const STEP_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of a full reconcile.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Whether the realm had to be created.
    pub realm_created: bool,
    /// Whether the client had to be created.
    pub client_created: bool,
    /// The client secret fetched from the provider. The caller persists
    /// it into the master configuration.
    pub client_secret: String,
    /// Groups that had to be created.
    pub groups_created: Vec<String>,
    /// Whether the default administrator account had to be created.
    pub admin_user_created: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ClientRepresentation {
    id: String,
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct SecretRepresentation {
    value: String,
}

#[derive(Debug, Deserialize)]
struct GroupRepresentation {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserRepresentation {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MapperRepresentation {
    name: String,
}

/// Name of the group-membership protocol mapper ensured on the client.
const GROUP_MAPPER_NAME: &str = "group-membership";

/// Async admin client bound to one provider installation.
#[derive(Debug, Clone)]
pub struct IdpAdminClient {
    base_url: String,
    realm: String,
    client_id: String,
    admin_username: String,
    admin_password: String,
    http: reqwest::Client,
}

impl IdpAdminClient {
    /// Build a client from the identity-provider section of the master
    /// configuration. Talks to the backend URL, never the proxied one.
    ///
    /// # Errors
    ///
    /// Returns [`IdpError::Transport`] when the HTTP client cannot be
    /// constructed.
    pub fn new(idp: &IdentityProviderConfig) -> Result<Self, IdpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IdpError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: idp.backend_url.trim_end_matches('/').to_string(),
            realm: idp.realm.clone(),
            client_id: idp.client_id.clone(),
            admin_username: idp.admin_username.clone(),
            admin_password: idp.admin_password.clone(),
            http,
        })
    }

    /// Whether the admin API answers at all (used to gate bootstrap until
    /// the provider process is up).
    pub async fn is_reachable(&self) -> bool {
        self.http
            .get(format!("{}/realms/master", self.base_url))
            .send()
            .await
            .is_ok()
    }

    /// Full reconcile: realm, client, secret, groups, mapper, admin user.
    ///
    /// # Errors
    ///
    /// Returns [`IdpError::StepExhausted`] naming the step that kept
    /// failing.
    pub async fn bootstrap(&self, hostname: &str) -> Result<BootstrapReport, IdpError> {
        let token = self.step("admin_token", || self.admin_token()).await?;

        let realm_created = self
            .step("ensure_realm", || self.ensure_realm(&token, hostname))
            .await?;
        let (client_uuid, client_created) = self
            .step("ensure_client", || self.ensure_client(&token, hostname))
            .await?;
        let client_secret = self
            .step("fetch_client_secret", || {
                self.fetch_client_secret(&token, &client_uuid)
            })
            .await?;
        let groups_created = self
            .step("ensure_groups", || self.ensure_groups(&token))
            .await?;
        self.step("ensure_group_mapper", || {
            self.ensure_group_mapper(&token, &client_uuid)
        })
        .await?;
        let admin_user_created = self
            .step("ensure_admin_user", || self.ensure_admin_user(&token))
            .await?;

        info!(
            realm = %self.realm,
            realm_created,
            client_created,
            admin_user_created,
            "identity provider reconciled"
        );

        Ok(BootstrapReport {
            realm_created,
            client_created,
            client_secret,
            groups_created,
            admin_user_created,
        })
    }

    /// Hostname-only reconcile: rewrite the realm frontend URL and the
    /// client redirect URIs. The client secret is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`IdpError::StepExhausted`] naming the failing step.
    pub async fn reconcile_hostname(&self, hostname: &str) -> Result<(), IdpError> {
        let token = self.step("admin_token", || self.admin_token()).await?;

        self.step("update_frontend_url", || {
            self.update_frontend_url(&token, hostname)
        })
        .await?;

        let client = self
            .step("find_client", || self.find_client(&token))
            .await?
            .ok_or_else(|| IdpError::Malformed("client missing during hostname update".into()))?;
        self.step("update_redirect_uris", || {
            self.update_redirect_uris(&token, &client.id, hostname)
        })
        .await?;

        info!(realm = %self.realm, hostname, "identity provider URLs updated");
        Ok(())
    }

    async fn step<T, F, Fut>(&self, name: &'static str, mut op: F) -> Result<T, IdpError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, IdpError>>,
    {
        let mut last = None;
        for attempt in 1..=MAX_STEP_ATTEMPTS {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(step = name, attempt, "bootstrap step failed: {e}");
                    last = Some(e);
                    if attempt < MAX_STEP_ATTEMPTS {
                        tokio::time::sleep(STEP_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(IdpError::StepExhausted {
            step: name,
            attempts: MAX_STEP_ATTEMPTS,
            source: Box::new(last.expect("at least one attempt ran")),
        })
    }

    async fn admin_token(&self) -> Result<String, IdpError> {
        let response = self
            .http
            .post(format!(
                "{}/realms/master/protocol/openid-connect/token",
                self.base_url
            ))
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", self.admin_username.as_str()),
                ("password", self.admin_password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IdpError::AuthFailed("admin credentials rejected".into()));
        }
        let response = error_for_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Ensure the realm exists with the current frontend URL. Returns
    /// whether it had to be created.
    async fn ensure_realm(&self, token: &str, hostname: &str) -> Result<bool, IdpError> {
        let url = format!("{}/admin/realms/{}", self.base_url, self.realm);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let body = json!({
                "realm": self.realm,
                "enabled": true,
                "attributes": { "frontendUrl": frontend_url(hostname) },
            });
            let response = self
                .http
                .post(format!("{}/admin/realms", self.base_url))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .map_err(|e| IdpError::Transport(e.to_string()))?;
            error_for_status(response).await?;
            return Ok(true);
        }

        error_for_status(response).await?;
        // Keep the frontend URL current even when the realm already
        // exists; this is what converges after a hostname change.
        self.update_frontend_url(token, hostname).await?;
        Ok(false)
    }

    async fn update_frontend_url(&self, token: &str, hostname: &str) -> Result<(), IdpError> {
        let body = json!({
            "realm": self.realm,
            "enabled": true,
            "attributes": { "frontendUrl": frontend_url(hostname) },
        });
        let response = self
            .http
            .put(format!("{}/admin/realms/{}", self.base_url, self.realm))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        error_for_status(response).await?;
        Ok(())
    }

    async fn find_client(&self, token: &str) -> Result<Option<ClientRepresentation>, IdpError> {
        let response = self
            .http
            .get(format!(
                "{}/admin/realms/{}/clients",
                self.base_url, self.realm
            ))
            .query(&[("clientId", self.client_id.as_str())])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;

        let clients: Vec<ClientRepresentation> = response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))?;
        Ok(clients.into_iter().find(|c| c.client_id == self.client_id))
    }

    /// Ensure the confidential client exists. Returns its internal id and
    /// whether it had to be created.
    async fn ensure_client(&self, token: &str, hostname: &str) -> Result<(String, bool), IdpError> {
        if let Some(existing) = self.find_client(token).await? {
            self.update_redirect_uris(token, &existing.id, hostname)
                .await?;
            return Ok((existing.id, false));
        }

        let body = json!({
            "clientId": self.client_id,
            "enabled": true,
            "publicClient": false,
            "standardFlowEnabled": true,
            "directAccessGrantsEnabled": false,
            "redirectUris": redirect_uris(hostname),
        });
        let response = self
            .http
            .post(format!(
                "{}/admin/realms/{}/clients",
                self.base_url, self.realm
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        error_for_status(response).await?;

        let created = self
            .find_client(token)
            .await?
            .ok_or_else(|| IdpError::Malformed("client absent after create".into()))?;
        Ok((created.id, true))
    }

    async fn update_redirect_uris(
        &self,
        token: &str,
        client_uuid: &str,
        hostname: &str,
    ) -> Result<(), IdpError> {
        let body = json!({
            "clientId": self.client_id,
            "redirectUris": redirect_uris(hostname),
        });
        let response = self
            .http
            .put(format!(
                "{}/admin/realms/{}/clients/{}",
                self.base_url, self.realm, client_uuid
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        error_for_status(response).await?;
        Ok(())
    }

    async fn fetch_client_secret(
        &self,
        token: &str,
        client_uuid: &str,
    ) -> Result<String, IdpError> {
        let response = self
            .http
            .get(format!(
                "{}/admin/realms/{}/clients/{}/client-secret",
                self.base_url, self.realm, client_uuid
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;

        let secret: SecretRepresentation = response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))?;
        Ok(secret.value)
    }

    async fn list_groups(&self, token: &str) -> Result<Vec<GroupRepresentation>, IdpError> {
        let response = self
            .http
            .get(format!(
                "{}/admin/realms/{}/groups",
                self.base_url, self.realm
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))
    }

    /// Ensure the permission groups exist. Returns the ones created.
    async fn ensure_groups(&self, token: &str) -> Result<Vec<String>, IdpError> {
        let existing: Vec<String> = self
            .list_groups(token)
            .await?
            .into_iter()
            .map(|g| g.name)
            .collect();

        let mut created = Vec::new();
        for group in PERMISSION_GROUPS {
            if existing.iter().any(|g| g == group) {
                continue;
            }
            let response = self
                .http
                .post(format!(
                    "{}/admin/realms/{}/groups",
                    self.base_url, self.realm
                ))
                .bearer_auth(token)
                .json(&json!({ "name": group }))
                .send()
                .await
                .map_err(|e| IdpError::Transport(e.to_string()))?;
            error_for_status(response).await?;
            created.push(group.to_string());
        }
        Ok(created)
    }

    /// Ensure the group-membership mapper exists on the client so tokens
    /// carry the `groups` claim.
    async fn ensure_group_mapper(&self, token: &str, client_uuid: &str) -> Result<(), IdpError> {
        let list_url = format!(
            "{}/admin/realms/{}/clients/{}/protocol-mappers/models",
            self.base_url, self.realm, client_uuid
        );
        let response = self
            .http
            .get(&list_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;
        let mappers: Vec<MapperRepresentation> = response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))?;

        if mappers.iter().any(|m| m.name == GROUP_MAPPER_NAME) {
            return Ok(());
        }

        let body = json!({
            "name": GROUP_MAPPER_NAME,
            "protocol": "openid-connect",
            "protocolMapper": "oidc-group-membership-mapper",
            "config": {
                "claim.name": "groups",
                "full.path": "false",
                "id.token.claim": "true",
                "access.token.claim": "true",
            },
        });
        let response = self
            .http
            .post(&list_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        error_for_status(response).await?;
        Ok(())
    }

    /// Ensure the default administrator exists and belongs to `admins`.
    /// Returns whether the account had to be created.
    async fn ensure_admin_user(&self, token: &str) -> Result<bool, IdpError> {
        let response = self
            .http
            .get(format!(
                "{}/admin/realms/{}/users",
                self.base_url, self.realm
            ))
            .query(&[("username", DEFAULT_ADMIN_USER), ("exact", "true")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;
        let users: Vec<UserRepresentation> = response
            .json()
            .await
            .map_err(|e| IdpError::Malformed(e.to_string()))?;

        let (user_id, created) = if let Some(user) = users.into_iter().next() {
            (user.id, false)
        } else {
            let body = json!({
                "username": DEFAULT_ADMIN_USER,
                "enabled": true,
                "credentials": [{
                    "type": "password",
                    "value": DEFAULT_ADMIN_PASSWORD,
                    "temporary": false,
                }],
            });
            let response = self
                .http
                .post(format!(
                    "{}/admin/realms/{}/users",
                    self.base_url, self.realm
                ))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .map_err(|e| IdpError::Transport(e.to_string()))?;
            error_for_status(response).await?;

            let response = self
                .http
                .get(format!(
                    "{}/admin/realms/{}/users",
                    self.base_url, self.realm
                ))
                .query(&[("username", DEFAULT_ADMIN_USER), ("exact", "true")])
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| IdpError::Transport(e.to_string()))?;
            let response = error_for_status(response).await?;
            let users: Vec<UserRepresentation> = response
                .json()
                .await
                .map_err(|e| IdpError::Malformed(e.to_string()))?;
            let user = users
                .into_iter()
                .next()
                .ok_or_else(|| IdpError::Malformed("admin user absent after create".into()))?;
            (user.id, true)
        };

        // Membership in `admins` is idempotent: the join endpoint is a
        // PUT and re-adding is a no-op on the provider side.
        let admins = self
            .list_groups(token)
            .await?
            .into_iter()
            .find(|g| g.name == "admins")
            .ok_or_else(|| IdpError::Malformed("admins group missing".into()))?;
        let response = self
            .http
            .put(format!(
                "{}/admin/realms/{}/users/{}/groups/{}",
                self.base_url, self.realm, user_id, admins.id
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        error_for_status(response).await?;

        Ok(created)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, IdpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    Err(IdpError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IdpAdminClient {
        IdpAdminClient::new(&IdentityProviderConfig::default()).unwrap()
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let idp = IdentityProviderConfig {
            backend_url: "http://localhost:8080/".to_string(),
            ..IdentityProviderConfig::default()
        };
        let client = IdpAdminClient::new(&idp).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_step_exhausts_after_retries() {
        // Zero-delay retries: the failing op runs MAX_STEP_ATTEMPTS times
        // and the final error names the step.
        tokio::time::pause();
        let client = client();
        let mut calls = 0u32;
        let result: Result<(), IdpError> = {
            let calls = &mut calls;
            let fut = client.step("always_fails", move || {
                *calls += 1;
                async { Err::<(), _>(IdpError::Transport("refused".into())) }
            });
            fut.await
        };

        match result {
            Err(IdpError::StepExhausted {
                step, attempts, ..
            }) => {
                assert_eq!(step, "always_fails");
                assert_eq!(attempts, MAX_STEP_ATTEMPTS);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls, MAX_STEP_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_step_returns_first_success() {
        let client = client();
        let mut calls = 0u32;
        let result = {
            let calls = &mut calls;
            client
                .step("flaky", move || {
                    *calls += 1;
                    let ok = *calls >= 1;
                    async move {
                        if ok {
                            Ok(42)
                        } else {
                            Err(IdpError::Transport("refused".into()))
                        }
                    }
                })
                .await
        };
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }
}
