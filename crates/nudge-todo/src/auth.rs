//! Account tokens and the OAuth device-code flow.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::TodoError;

/// Scopes requested at sign-in.
pub(crate) const SCOPES: &str = "offline_access Tasks.ReadWrite User.Read";

/// A signed-in remote account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub email: String,
}

/// Instructions the user has to follow to finish signing in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCodePrompt {
    pub verification_uri: String,
    pub user_code: String,
    pub message: String,
}

/// Tokens for one account, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredToken {
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds after which the access token is stale.
    #[serde(default)]
    pub expires_at: i64,
}

impl StoredToken {
    /// True if the token expires within the next minute.
    pub fn is_stale(&self) -> bool {
        self.expires_at <= Utc::now().timestamp() + 60
    }
}

/// Per-account OAuth tokens, kept in `accounts.json`.
#[derive(Debug, Default)]
pub struct TokenStore {
    path: Option<PathBuf>,
    accounts: BTreeMap<String, StoredToken>,
}

impl TokenStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`.
    ///
    /// A missing file is an empty store. An unreadable one is logged and
    /// also starts empty, leaving its accounts signed out.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let accounts = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "discarding unreadable account tokens");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read account tokens");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), count = accounts.len(), "loaded account tokens");
        Self {
            path: Some(path),
            accounts,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Signed-in accounts as user id to e-mail.
    pub fn accounts(&self) -> BTreeMap<String, String> {
        self.accounts
            .iter()
            .map(|(user, token)| (user.clone(), token.email.clone()))
            .collect()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.accounts.contains_key(user)
    }

    /// Forget an account. Returns true if it was known.
    pub fn remove(&mut self, user: &str) -> Result<bool, TodoError> {
        let removed = self.accounts.remove(user).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub(crate) fn get(&self, user: &str) -> Option<&StoredToken> {
        self.accounts.get(user)
    }

    pub(crate) fn insert(&mut self, user: String, token: StoredToken) -> Result<(), TodoError> {
        self.accounts.insert(user, token);
        self.save()
    }

    fn save(&self) -> Result<(), TodoError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&self.accounts)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default = "default_interval")]
    interval: u64,
    expires_in: u64,
    #[serde(default)]
    message: String,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Run the device-code flow until the user approves, declines, or the code expires.
pub(crate) async fn device_code_login(
    http: &Client,
    auth_url: &str,
    client_id: &str,
    prompt: impl FnOnce(DeviceCodePrompt),
) -> Result<TokenResponse, TodoError> {
    let response = http
        .post(format!("{}/devicecode", auth_url))
        .form(&[("client_id", client_id), ("scope", SCOPES)])
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        return Err(TodoError::Auth(format!(
            "device code request failed ({}): {}",
            status, text
        )));
    }
    let code: DeviceCodeResponse = response.json().await?;

    info!(
        verification_uri = %code.verification_uri,
        user_code = %code.user_code,
        "waiting for sign-in approval"
    );
    prompt(DeviceCodePrompt {
        verification_uri: code.verification_uri.clone(),
        user_code: code.user_code.clone(),
        message: code.message.clone(),
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);
    let mut interval = Duration::from_secs(code.interval.max(1));

    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(TodoError::Auth("sign-in code expired".to_string()));
        }

        let response = http
            .post(format!("{}/token", auth_url))
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", client_id),
                ("device_code", code.device_code.as_str()),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let error: TokenErrorResponse = response.json().await?;
        match error.error.as_str() {
            "authorization_pending" => {}
            "slow_down" => interval += Duration::from_secs(5),
            _ => {
                warn!(error = %error.error, "sign-in failed");
                return Err(TodoError::Auth(format!(
                    "{}: {}",
                    error.error, error.error_description
                )));
            }
        }
    }
}

/// Exchange a refresh token for a fresh access token.
pub(crate) async fn refresh_access_token(
    http: &Client,
    auth_url: &str,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse, TodoError> {
    let response = http
        .post(format!("{}/token", auth_url))
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("refresh_token", refresh_token),
            ("scope", SCOPES),
        ])
        .send()
        .await?;

    let status = response.status();
    if status.is_server_error() {
        return Err(TodoError::Http {
            status: status.as_u16(),
            message: "token endpoint unavailable".to_string(),
        });
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(TodoError::Auth(format!(
            "refresh failed ({}): {}",
            status, text
        )));
    }

    debug!("refreshed access token");
    Ok(response.json().await?)
}
