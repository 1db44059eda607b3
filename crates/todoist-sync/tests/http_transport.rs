use serde_json::{Value, json};
use todoist_sync::{Client, CommandKind, Config, SyncError, Transport};
use todoist_sync::transport::HttpTransport;
use wiremock::matchers::{body_string_contains, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config_for(server: &MockServer) -> Config {
    Config::new("test-token").with_api_url(format!("{}/api/v1", server.uri()))
}

fn form_field(request: &Request, name: &str) -> Option<String> {
    let fields: Vec<(String, String)> = match serde_urlencoded::from_bytes(&request.body) {
        Ok(fields) => fields,
        Err(e) => panic!("request body is not form encoded: {e}"),
    };
    fields.into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_follows_cursor_and_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/tasks"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("limit", "200"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"id": "1", "content": "first", "project_id": "p1"},
                {"id": "2", "content": "second", "project_id": "p1"}
            ],
            "next_cursor": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/tasks"))
        .and(query_param("cursor", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": "3", "content": "third", "project_id": "p1", "parent_id": "1"}],
            "next_cursor": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "p1", "name": "Work", "is_favorite": true}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = match Client::new(config_for(&server)) {
        Ok(client) => client,
        Err(e) => panic!("client construction failed: {e}"),
    };
    let summary = match client.sync().await {
        Ok(summary) => summary,
        Err(e) => panic!("sync failed: {e}"),
    };

    assert_eq!(summary.tasks, 3);
    assert_eq!(summary.projects, 1);
    let children: Vec<_> = client.tasks().children("1").iter().map(|t| t.id.clone()).collect();
    assert_eq!(children, vec!["3"]);
    assert_eq!(client.tasks().by_project("p1").len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_success_status_maps_to_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/tasks"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&config_for(&server)).unwrap();
    let err = transport.get("/tasks", &[]).await.unwrap_err();

    match err {
        SyncError::Http { status, body, .. } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Unauthorized");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_payload_maps_to_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "Invalid sync token",
            "error_tag": "INVALID_SYNC_TOKEN"
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&config_for(&server)).unwrap();
    let err = transport
        .post_form("/sync", &[("sync_token", "bogus")])
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Api { tag, .. } if tag == "INVALID_SYNC_TOKEN"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&config_for(&server)).unwrap();
    let err = transport.get("/projects", &[]).await.unwrap_err();
    assert!(matches!(err, SyncError::Decode(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_sends_form_encoded_commands_and_promotes_temp_ids() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/sync"))
        .and(body_string_contains("resource_types"))
        .respond_with(|request: &Request| {
            let commands: Vec<Value> = match form_field(request, "commands") {
                Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
                None => Vec::new(),
            };
            let mut status = serde_json::Map::new();
            let mut mapping = serde_json::Map::new();
            let mut items = Vec::new();
            for (i, command) in commands.iter().enumerate() {
                status.insert(command["uuid"].as_str().unwrap_or_default().to_string(), json!("ok"));
                if let Some(temp_id) = command["temp_id"].as_str() {
                    let real = format!("9{}", i);
                    mapping.insert(temp_id.to_string(), json!(real));
                    items.push(json!({"id": real, "content": command["args"]["content"]}));
                }
            }
            ResponseTemplate::new(200).set_body_json(json!({
                "sync_token": "next-token",
                "full_sync": false,
                "items": items,
                "projects": [],
                "sync_status": status,
                "temp_id_mapping": mapping
            }))
        })
        .expect(1)
        .mount(&server)
        .await;

    let mut client = Client::new(config_for(&server).with_sync_api(true)).unwrap();
    let staged = client.create_task("Batch me", None).await.unwrap();
    let temp_id = staged.temp_id.clone().unwrap();

    let result = client.commit().await.unwrap();

    assert!(result.is_success());
    assert_eq!(client.sync_token(), "next-token");
    assert!(client.tasks().get(&temp_id).is_none());
    assert_eq!(client.tasks().get("90").unwrap().content, "Batch me");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(form_field(&requests[0], "sync_token").as_deref(), Some("*"));
    let sent: Vec<Value> = serde_json::from_str(&form_field(&requests[0], "commands").unwrap()).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], CommandKind::ItemAdd.as_str());
    assert_eq!(sent[0]["temp_id"], temp_id.as_str());
    assert!(sent[0]["args"].get("description").is_none());
}
