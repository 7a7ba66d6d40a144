//! Graph client behaviour against a mock server.

use std::path::PathBuf;

use nudge_todo::{GraphClient, GraphConfig, TaskFields, TaskPatch, TaskRemote, TodoError, TokenStore};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{bearer_token, body_partial_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER: &str = "user-1";

/// Write an `accounts.json` holding one account with `access_token`.
fn write_accounts(dir: &TempDir, access_token: &str, expires_at: i64) -> PathBuf {
    let path = dir.path().join("accounts.json");
    std::fs::write(
        &path,
        json!({
            USER: {
                "email": "me@example.com",
                "access_token": access_token,
                "refresh_token": "refresh-1",
                "expires_at": expires_at,
            }
        })
        .to_string(),
    )
    .unwrap();
    path
}

fn client(server: &MockServer, dir: &TempDir, access_token: &str, expires_at: i64) -> GraphClient {
    let path = write_accounts(dir, access_token, expires_at);
    let config = GraphConfig {
        graph_url: server.uri(),
        auth_url: format!("{}/auth", server.uri()),
        client_id: "client".to_string(),
    };
    GraphClient::new(config, TokenStore::load(path))
}

fn fresh() -> i64 {
    chrono::Utc::now().timestamp() + 3600
}

#[tokio::test]
async fn test_fetch_follows_pages_and_skips_bad_tasks() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir, "token-1", fresh());

    Mock::given(method("GET"))
        .and(path("/me/todo/lists"))
        .and(bearer_token("token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "L1", "displayName": "Tasks", "wellknownListName": "defaultList" },
                { "id": "L2", "displayName": "Groceries", "wellknownListName": "none" }
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/todo/lists/L1/tasks"))
        .and(query_param_is_missing("page"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "T1", "title": "first", "status": "notStarted", "importance": "normal" },
                { "id": "T2", "title": "broken", "reminderDateTime": { "dateTime": "soon", "timeZone": "UTC" } }
            ],
            "@odata.nextLink": format!("{}/me/todo/lists/L1/tasks?page=2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/todo/lists/L1/tasks"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [ { "id": "T3", "title": "third", "importance": "high" } ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/todo/lists/L2/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&server)
        .await;

    let snapshot = client.fetch_lists_and_tasks().await.unwrap();
    let lists = &snapshot[USER];

    assert_eq!(lists.len(), 2);
    assert!(lists[0].default);
    assert!(!lists[1].default);
    assert_eq!(lists[1].name, "Groceries");

    let ids: Vec<_> = lists[0].tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["T1", "T3"]);
    assert!(lists[0].tasks[1].important);
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_retries() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir, "expired", fresh());

    Mock::given(method("POST"))
        .and(path("/me/todo/lists"))
        .and(bearer_token("expired"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "renewed",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/me/todo/lists"))
        .and(bearer_token("renewed"))
        .and(body_partial_json(json!({ "displayName": "Errands" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "L9" })))
        .expect(1)
        .mount(&server)
        .await;

    let id = client.create_list(USER, "Errands").await.unwrap();
    assert_eq!(id, "L9");

    // The renewed token and the kept refresh token are persisted.
    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("accounts.json")).unwrap())
            .unwrap();
    assert_eq!(stored[USER]["access_token"], json!("renewed"));
    assert_eq!(stored[USER]["refresh_token"], json!("refresh-1"));
}

#[tokio::test]
async fn test_stale_token_is_refreshed_before_use() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir, "old", 0);

    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new",
            "refresh_token": "refresh-2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/me/todo/lists/L1/tasks/T1"))
        .and(bearer_token("new"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client.delete_task(USER, "L1", "T1").await.unwrap();
}

#[tokio::test]
async fn test_task_writes_send_graph_bodies() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir, "token-1", fresh());

    Mock::given(method("POST"))
        .and(path("/me/todo/lists/L1/tasks"))
        .and(body_partial_json(json!({
            "title": "dentist",
            "importance": "high",
            "isReminderOn": true,
            "reminderDateTime": { "dateTime": "2024-03-04T09:00:00", "timeZone": "UTC" }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "T7" })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/me/todo/lists/L1/tasks/T7"))
        .and(body_partial_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "T7" })))
        .expect(1)
        .mount(&server)
        .await;

    let fields = TaskFields {
        title: "dentist".to_string(),
        important: true,
        timestamp: 1_709_542_800,
        ..Default::default()
    };
    let id = client.create_task(USER, "L1", &fields).await.unwrap();
    assert_eq!(id, "T7");

    let id = client
        .update_task(USER, "L1", "T7", &TaskPatch::Completed(true))
        .await
        .unwrap();
    assert_eq!(id, "T7");
}

#[tokio::test]
async fn test_error_classification() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(&server, &dir, "token-1", fresh());

    Mock::given(method("DELETE"))
        .and(path("/me/todo/lists/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/me/todo/lists/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/me/todo/lists/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
        .mount(&server)
        .await;

    let err = client.delete_list(USER, "gone").await.unwrap_err();
    assert!(matches!(err, TodoError::NotFound(_)));
    assert!(!err.is_connectivity());

    let err = client.delete_list(USER, "busy").await.unwrap_err();
    assert!(err.is_connectivity());

    let err = client.delete_list(USER, "bad").await.unwrap_err();
    assert!(matches!(err, TodoError::Http { status: 400, .. }));
    assert!(!err.is_connectivity());

    let err = client.delete_list("someone-else", "L1").await.unwrap_err();
    assert!(matches!(err, TodoError::UnknownAccount(_)));
}

#[tokio::test]
async fn test_unreachable_server_is_connectivity() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_accounts(&dir, "token-1", fresh());

    let config = GraphConfig {
        graph_url: "http://127.0.0.1:1".to_string(),
        auth_url: "http://127.0.0.1:1/auth".to_string(),
        client_id: "client".to_string(),
    };
    let offline = GraphClient::new(config, TokenStore::load(path));

    let err = offline.fetch_lists_and_tasks().await.unwrap_err();
    assert!(err.is_connectivity(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_device_code_login() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = GraphConfig {
        graph_url: server.uri(),
        auth_url: format!("{}/auth", server.uri()),
        client_id: "client".to_string(),
    };
    let client = GraphClient::new(config, TokenStore::load(dir.path().join("accounts.json")));

    Mock::given(method("POST"))
        .and(path("/auth/devicecode"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dev",
            "user_code": "ABCD",
            "verification_uri": "https://microsoft.com/devicelogin",
            "interval": 1,
            "expires_in": 60,
            "message": "go there"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(bearer_token("a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "new-user",
            "mail": null,
            "userPrincipalName": "new@example.com"
        })))
        .mount(&server)
        .await;

    let (tx, rx) = std::sync::mpsc::channel();
    let account = client
        .login(Box::new(move |prompt| {
            let _ = tx.send(prompt.user_code);
        }))
        .await
        .unwrap();

    assert_eq!(rx.recv().unwrap(), "ABCD");
    assert_eq!(account.user_id, "new-user");
    assert_eq!(account.email, "new@example.com");
    assert_eq!(
        client.list_accounts().await.unwrap().get("new-user"),
        Some(&"new@example.com".to_string())
    );
}
