//! GitHub OAuth relay.
//!
//! Clients never talk to GitHub directly; the coordinator exchanges
//! their authorization code for a token, fetches the profile, and
//! revokes tokens on sign-out. Each flow runs as its own task,
//! correlated back to the client by the `(socket, request id)` pair
//! captured at spawn. Every terminal send goes through the socket
//! registry, so a client that disconnected mid-flow is dropped
//! silently.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde_json::{json, Value};
use stave_core::protocol::{self, ERROR_GITHUB, ERROR_INTERNAL};
use stave_core::types::{RequestId, SocketId};
use tokio::sync::Mutex;

use crate::sockets::SocketRegistry;
use crate::state::Stats;

const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";
const APPLICATIONS_URL: &str = "https://api.github.com/applications";
const UA: &str = "stave-server";

/// OAuth application credentials.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// A sign-in flow between token exchange and profile completion.
#[derive(Debug, Clone)]
struct UserInfo {
    access_token: String,
}

pub struct IdentityRelay {
    http: reqwest::Client,
    config: IdentityConfig,
    registry: Arc<SocketRegistry>,
    stats: Arc<Stats>,
    /// Pending sign-ins keyed by JSON-RPC request id; an entry dies
    /// with the flow's terminal response.
    pending: Mutex<HashMap<RequestId, UserInfo>>,
}

impl IdentityRelay {
    pub fn new(config: IdentityConfig, registry: Arc<SocketRegistry>, stats: Arc<Stats>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            registry,
            stats,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full sign-in flow and answer `socket`.
    pub async fn sign_in(
        &self,
        socket: SocketId,
        request_id: String,
        oauth_state: String,
        code: String,
    ) {
        let id = Value::String(request_id.clone());
        let frame = match self.run_sign_in(&request_id, &oauth_state, &code).await {
            Ok(profile) => protocol::result_frame(&id, profile),
            Err((code, message)) => protocol::error_frame(&id, code, &message),
        };
        self.reply(socket, frame).await;
    }

    /// Revoke `token` and answer `socket`.
    pub async fn sign_out(&self, socket: SocketId, request_id: String, token: String) {
        let id = Value::String(request_id);
        let url = format!("{APPLICATIONS_URL}/{}/tokens/{token}", self.config.client_id);
        let outcome = self
            .http
            .delete(url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, UA)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .send()
            .await;

        let frame = match outcome {
            Ok(resp) if resp.status().is_success() => protocol::result_frame(&id, json!("OK")),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Token revocation refused");
                protocol::error_frame(&id, ERROR_GITHUB, "Could not remove authorization.")
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token revocation request failed");
                protocol::error_frame(&id, ERROR_GITHUB, "Could not remove authorization.")
            }
        };
        self.reply(socket, frame).await;
    }

    // ---- private helpers ----

    async fn run_sign_in(
        &self,
        request_id: &str,
        oauth_state: &str,
        code: &str,
    ) -> Result<Value, (i64, String)> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, UA)
            .form(&[
                ("state", oauth_state),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| (ERROR_GITHUB, format!("GitHub Authentication Error: {e}")))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| (ERROR_GITHUB, format!("Parse Error: {e}")))?;

        if body.get("error").is_some() || body.get("errors").is_some() {
            return Err((ERROR_GITHUB, "GitHub Authentication Error".to_string()));
        }
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or((ERROR_GITHUB, "GitHub Authentication Error".to_string()))?
            .to_string();

        // The same token surfacing in two overlapping flows means the
        // exchange was replayed.
        {
            let mut pending = self.pending.lock().await;
            if pending.values().any(|u| u.access_token == access_token) {
                return Err((ERROR_INTERNAL, "Invalid CSRF".to_string()));
            }
            pending.insert(
                request_id.to_string(),
                UserInfo {
                    access_token: access_token.clone(),
                },
            );
        }
        self.stats.record_sign_in();

        let result = self.fetch_profile(&access_token).await;
        self.pending.lock().await.remove(request_id);
        result
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Value, (i64, String)> {
        let resp = self
            .http
            .get(USER_URL)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, UA)
            .header(AUTHORIZATION, format!("token {access_token}"))
            .send()
            .await
            .map_err(|e| (ERROR_GITHUB, format!("GitHub Authentication Error: {e}")))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| (ERROR_GITHUB, format!("Parse Error: {e}")))?;

        if body.get("error").is_some() {
            return Err((ERROR_GITHUB, "GitHub Authentication Error".to_string()));
        }
        // `email` and `name` may be present-but-null for private
        // profiles; only a missing key is an error.
        let (Some(email), Some(login), Some(name)) =
            (body.get("email"), body.get("login"), body.get("name"))
        else {
            return Err((
                ERROR_GITHUB,
                "Email, login, and name are required.".to_string(),
            ));
        };

        let username = login.as_str().unwrap_or_default().to_string();
        let mut email = email.as_str().unwrap_or_default().to_string();
        let mut name = name.as_str().unwrap_or_default().to_string();
        if email.is_empty() {
            email = "unknown@example.com".to_string();
        }
        if name.is_empty() {
            name = username.clone();
        }

        Ok(json!({
            "accessToken": access_token,
            "email": email,
            "username": username,
            "name": name,
            "repo": format!("{username}/sheet-music"),
        }))
    }

    async fn reply(&self, socket: SocketId, frame: String) {
        if !self.registry.send_text(socket, frame).await {
            tracing::debug!(socket, "Lost socket mid-oauth; dropping reply");
        }
    }
}
