//! Microsoft To Do client over Microsoft Graph.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::{self, StoredToken, TokenResponse};
use crate::{
    Account, LoginPrompt, RemoteList, RemoteTask, Snapshot, TaskFields, TaskPatch, TaskRemote,
    TodoError, TokenStore,
};

/// Default Graph endpoint.
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";

/// Default identity platform endpoint for personal and work accounts.
pub const DEFAULT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0";

const GRAPH_DATETIME: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Where and as whom the client talks to Graph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub graph_url: String,
    pub auth_url: String,
    pub client_id: String,
}

impl GraphConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            client_id: client_id.into(),
        }
    }
}

/// Client for Microsoft To Do lists and tasks of every signed-in account.
pub struct GraphClient {
    http: Client,
    config: GraphConfig,
    tokens: Arc<RwLock<TokenStore>>,
}

impl GraphClient {
    pub fn new(config: GraphConfig, tokens: TokenStore) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            config,
            tokens: Arc::new(RwLock::new(tokens)),
        }
    }

    /// Current access token for `user`, refreshed first if it is about to expire.
    async fn access_token(&self, user: &str) -> Result<String, TodoError> {
        let token = self
            .tokens
            .read()
            .await
            .get(user)
            .cloned()
            .ok_or_else(|| TodoError::UnknownAccount(user.to_string()))?;

        if token.is_stale() && token.refresh_token.is_some() {
            return self.refresh(user, token).await;
        }
        Ok(token.access_token)
    }

    async fn refresh(&self, user: &str, token: StoredToken) -> Result<String, TodoError> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| TodoError::Auth(format!("no refresh token for {}", user)))?;
        let response = auth::refresh_access_token(
            &self.http,
            &self.config.auth_url,
            &self.config.client_id,
            refresh_token,
        )
        .await?;
        let access_token = response.access_token.clone();
        self.store_token(user, &token.email, response, token.refresh_token)
            .await?;
        Ok(access_token)
    }

    async fn store_token(
        &self,
        user: &str,
        email: &str,
        response: TokenResponse,
        previous_refresh: Option<String>,
    ) -> Result<(), TodoError> {
        let stored = StoredToken {
            email: email.to_string(),
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at: Utc::now().timestamp() + response.expires_in,
        };
        self.tokens.write().await.insert(user.to_string(), stored)
    }

    /// Send a request as `user`, retrying once with a refreshed token on 401.
    async fn send(
        &self,
        user: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, TodoError> {
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.config.graph_url, path)
        };

        let mut token = self.access_token(user).await?;
        let mut retried = false;
        loop {
            let mut request = self.http.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !retried {
                debug!(user, "access token rejected, refreshing");
                let stored = self
                    .tokens
                    .read()
                    .await
                    .get(user)
                    .cloned()
                    .ok_or_else(|| TodoError::UnknownAccount(user.to_string()))?;
                token = self.refresh(user, stored).await?;
                retried = true;
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Err(TodoError::NotFound(path.to_string()));
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(TodoError::Http {
                    status: status.as_u16(),
                    message,
                });
            }
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            return Ok(Some(response.json().await?));
        }
    }

    /// Collect `value` items across every page of a collection.
    async fn get_paged(&self, user: &str, path: &str) -> Result<Vec<Value>, TodoError> {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());

        while let Some(page) = next.take() {
            let body = self
                .send(user, Method::GET, &page, None)
                .await?
                .ok_or_else(|| TodoError::Protocol(format!("empty page for {}", path)))?;
            match body.get("value") {
                Some(Value::Array(values)) => items.extend(values.iter().cloned()),
                _ => return Err(TodoError::Protocol(format!("no value array in {}", path))),
            }
            next = body
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(items)
    }

    async fn fetch_account(&self, user: &str) -> Result<Vec<RemoteList>, TodoError> {
        let mut lists = Vec::new();
        for value in self.get_paged(user, "/me/todo/lists").await? {
            let list: GraphList = match serde_json::from_value(value) {
                Ok(list) => list,
                Err(e) => {
                    warn!(user, error = %e, "skipping unreadable list");
                    continue;
                }
            };

            let mut tasks = Vec::new();
            let path = format!("/me/todo/lists/{}/tasks", list.id);
            for value in self.get_paged(user, &path).await? {
                match parse_task(value) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!(user, list = %list.id, error = %e, "skipping unreadable task"),
                }
            }

            lists.push(RemoteList {
                default: list.wellknown_list_name.as_deref() == Some("defaultList"),
                id: list.id,
                name: list.display_name,
                tasks,
            });
        }
        Ok(lists)
    }

    fn id_of(body: Option<Value>) -> Result<String, TodoError> {
        body.as_ref()
            .and_then(|body| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TodoError::Protocol("response has no id".to_string()))
    }
}

#[async_trait]
impl TaskRemote for GraphClient {
    async fn list_accounts(&self) -> Result<BTreeMap<String, String>, TodoError> {
        Ok(self.tokens.read().await.accounts())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_lists_and_tasks(&self) -> Result<Snapshot, TodoError> {
        let accounts = self.tokens.read().await.accounts();
        let mut snapshot = Snapshot::new();

        for user in accounts.keys() {
            match self.fetch_account(user).await {
                Ok(lists) => {
                    snapshot.insert(user.clone(), lists);
                }
                Err(TodoError::Auth(message)) => {
                    warn!(user = %user, error = %message, "skipping account that cannot authenticate");
                }
                Err(e) => return Err(e),
            }
        }

        info!(accounts = snapshot.len(), "fetched remote lists");
        Ok(snapshot)
    }

    async fn create_task(
        &self,
        user: &str,
        list: &str,
        fields: &TaskFields,
    ) -> Result<String, TodoError> {
        let path = format!("/me/todo/lists/{}/tasks", list);
        let body = self
            .send(user, Method::POST, &path, Some(&task_json(fields)))
            .await?;
        Self::id_of(body)
    }

    async fn update_task(
        &self,
        user: &str,
        list: &str,
        task: &str,
        patch: &TaskPatch,
    ) -> Result<String, TodoError> {
        let path = format!("/me/todo/lists/{}/tasks/{}", list, task);
        let body = match patch {
            TaskPatch::Full(fields) => task_json(fields),
            TaskPatch::Completed(completed) => json!({ "status": status(*completed) }),
        };
        let response = self.send(user, Method::PATCH, &path, Some(&body)).await?;
        Self::id_of(response)
    }

    async fn delete_task(&self, user: &str, list: &str, task: &str) -> Result<(), TodoError> {
        let path = format!("/me/todo/lists/{}/tasks/{}", list, task);
        self.send(user, Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn create_list(&self, user: &str, name: &str) -> Result<String, TodoError> {
        let body = json!({ "displayName": name });
        let response = self
            .send(user, Method::POST, "/me/todo/lists", Some(&body))
            .await?;
        Self::id_of(response)
    }

    async fn update_list(&self, user: &str, list: &str, name: &str) -> Result<(), TodoError> {
        let path = format!("/me/todo/lists/{}", list);
        let body = json!({ "displayName": name });
        self.send(user, Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }

    async fn delete_list(&self, user: &str, list: &str) -> Result<(), TodoError> {
        let path = format!("/me/todo/lists/{}", list);
        self.send(user, Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn login(&self, prompt: LoginPrompt) -> Result<Account, TodoError> {
        let token = auth::device_code_login(
            &self.http,
            &self.config.auth_url,
            &self.config.client_id,
            prompt,
        )
        .await?;

        let response = self
            .http
            .get(format!("{}/me", self.config.graph_url))
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TodoError::Auth(format!(
                "profile lookup failed ({})",
                response.status()
            )));
        }
        let me: GraphUser = response.json().await?;
        let email = me.mail.or(me.user_principal_name).unwrap_or_default();

        self.store_token(&me.id, &email, token, None).await?;
        info!(user = %me.id, email = %email, "signed in");
        Ok(Account {
            user_id: me.id,
            email,
        })
    }

    async fn logout(&self, user: &str) -> Result<(), TodoError> {
        if !self.tokens.write().await.remove(user)? {
            return Err(TodoError::UnknownAccount(user.to_string()));
        }
        info!(user, "signed out");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphList {
    id: String,
    display_name: String,
    wellknown_list_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphTask {
    id: String,
    #[serde(default)]
    title: String,
    body: Option<GraphBody>,
    status: Option<String>,
    importance: Option<String>,
    reminder_date_time: Option<GraphDateTime>,
    due_date_time: Option<GraphDateTime>,
    created_date_time: Option<String>,
    last_modified_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    content_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
}

fn parse_task(value: Value) -> Result<RemoteTask, TodoError> {
    let task: GraphTask =
        serde_json::from_value(value).map_err(|e| TodoError::Protocol(e.to_string()))?;

    let body = match task.body {
        Some(body) if body.content_type.eq_ignore_ascii_case("text") => body.content,
        _ => String::new(),
    };

    Ok(RemoteTask {
        reminder_at: task
            .reminder_date_time
            .map(|dt| parse_graph_datetime(&dt.date_time))
            .transpose()?
            .unwrap_or(0),
        due: task
            .due_date_time
            .map(|dt| parse_graph_datetime(&dt.date_time))
            .transpose()?
            .unwrap_or(0),
        created_at: task
            .created_date_time
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?
            .unwrap_or(0),
        updated_at: task
            .last_modified_date_time
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?
            .unwrap_or(0),
        id: task.id,
        title: task.title,
        body,
        completed: task.status.as_deref() == Some("completed"),
        important: task.importance.as_deref() == Some("high"),
    })
}

/// Graph `dateTimeTimeZone` values come back in UTC without an offset.
fn parse_graph_datetime(value: &str) -> Result<i64, TodoError> {
    NaiveDateTime::parse_from_str(value, GRAPH_DATETIME)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| TodoError::Protocol(format!("bad date-time {:?}: {}", value, e)))
}

fn parse_rfc3339(value: &str) -> Result<i64, TodoError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|e| TodoError::Protocol(format!("bad timestamp {:?}: {}", value, e)))
}

fn format_graph_datetime(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn status(completed: bool) -> &'static str {
    if completed { "completed" } else { "notStarted" }
}

fn task_json(fields: &TaskFields) -> Value {
    let due = (fields.due_date != 0).then(|| {
        json!({ "dateTime": format_graph_datetime(fields.due_date), "timeZone": "UTC" })
    });
    let reminder = (fields.timestamp != 0).then(|| {
        json!({ "dateTime": format_graph_datetime(fields.timestamp), "timeZone": "UTC" })
    });

    json!({
        "title": fields.title,
        "body": { "content": fields.description, "contentType": "text" },
        "status": status(fields.completed),
        "importance": if fields.important { "high" } else { "normal" },
        "dueDateTime": due,
        "isReminderOn": fields.timestamp != 0,
        "reminderDateTime": reminder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_task_reads_graph_fields() {
        let task = parse_task(json!({
            "id": "AAMk",
            "title": "  water plants ",
            "body": { "content": "balcony", "contentType": "text" },
            "status": "completed",
            "importance": "high",
            "reminderDateTime": { "dateTime": "2024-03-04T09:00:00.0000000", "timeZone": "UTC" },
            "createdDateTime": "2024-03-01T10:00:00.123Z",
            "lastModifiedDateTime": "2024-03-02T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(
            task,
            RemoteTask {
                id: "AAMk".to_string(),
                title: "  water plants ".to_string(),
                body: "balcony".to_string(),
                completed: true,
                important: true,
                reminder_at: 1_709_542_800,
                due: 0,
                created_at: 1_709_287_200,
                updated_at: 1_709_373_600,
            }
        );
    }

    #[test]
    fn test_parse_task_ignores_html_body() {
        let task = parse_task(json!({
            "id": "t",
            "title": "x",
            "body": { "content": "<p>hi</p>", "contentType": "html" }
        }))
        .unwrap();
        assert_eq!(task.body, "");
        assert!(!task.completed);
    }

    #[test]
    fn test_parse_task_rejects_bad_dates() {
        let result = parse_task(json!({
            "id": "t",
            "dueDateTime": { "dateTime": "tomorrow", "timeZone": "UTC" }
        }));
        assert!(matches!(result, Err(TodoError::Protocol(_))));
    }

    #[test]
    fn test_task_json_clears_unset_times() {
        let body = task_json(&TaskFields {
            title: "call".to_string(),
            ..Default::default()
        });
        assert_eq!(body["dueDateTime"], Value::Null);
        assert_eq!(body["reminderDateTime"], Value::Null);
        assert_eq!(body["isReminderOn"], json!(false));
        assert_eq!(body["status"], json!("notStarted"));
    }

    #[test]
    fn test_task_json_formats_utc_times() {
        let body = task_json(&TaskFields {
            title: "call".to_string(),
            timestamp: 1_709_542_800,
            due_date: 1_709_510_400,
            important: true,
            ..Default::default()
        });
        assert_eq!(body["reminderDateTime"]["dateTime"], json!("2024-03-04T09:00:00"));
        assert_eq!(body["dueDateTime"]["dateTime"], json!("2024-03-04T00:00:00"));
        assert_eq!(body["importance"], json!("high"));
    }
}
