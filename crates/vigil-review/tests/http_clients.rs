use serde_json::json;
use vigil_batch::collaborators::SourceOfRecord;
use vigil_core::{GitLabConfig, LlmConfig, UnitState, VigilError};
use vigil_review::gitlab::GitLabClient;
use vigil_review::llm::{ChatMessage, LlmClient};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT_PATH: &str = "/api/v4/projects/group%2Fapp";

fn gitlab(server: &MockServer) -> GitLabClient {
    GitLabClient::new(&GitLabConfig {
        url: server.uri(),
        token: Some("glpat-secret".into()),
        timeout_secs: 5,
    })
    .unwrap()
}

fn merge_request(iid: u64) -> serde_json::Value {
    json!({
        "iid": iid,
        "title": format!("Change {iid}"),
        "description": "Touches the login flow",
        "author": { "username": "robin" },
        "labels": ["backend"],
        "created_at": "2024-06-01T08:00:00Z",
        "source_branch": format!("feature/{iid}"),
        "target_branch": "main"
    })
}

#[tokio::test]
async fn list_units_clamps_page_size_and_encodes_project() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests")))
        .and(query_param("per_page", "100"))
        .and(query_param("state", "merged"))
        .and(query_param("order_by", "updated_at"))
        .and(header("PRIVATE-TOKEN", "glpat-secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([merge_request(3), merge_request(2), merge_request(1)])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests")))
        .and(query_param("per_page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([merge_request(3)])))
        .expect(1)
        .mount(&server)
        .await;

    let client = gitlab(&server);
    let units = client
        .list_units("group/app", UnitState::Merged, 250)
        .await
        .unwrap();
    let ids: Vec<u64> = units.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(units[0].author, "robin");
    assert_eq!(units[0].source_branch, "feature/3");

    let none = client
        .list_units("group/app", UnitState::Opened, 0)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn server_errors_map_to_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests/8/changes")))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests/9")))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "message": "404 Not found" })),
        )
        .mount(&server)
        .await;

    let client = gitlab(&server);
    let err = client.get_change_set("group/app", 8).await.unwrap_err();
    match &err {
        VigilError::Http { status, message } => {
            assert_eq!(*status, 503);
            assert!(message.contains("upstream overloaded"), "{message}");
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
    assert!(err.is_transient());

    let err = client.get_unit("group/app", 9).await.unwrap_err();
    assert!(matches!(err, VigilError::Http { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn get_unit_and_changes_round_out_one_merge_request() {
    let server = MockServer::start().await;
    let mut mr = merge_request(42);
    mr["draft"] = json!(true);
    mr["upvotes"] = json!(2);
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests/42")))
        .respond_with(ResponseTemplate::new(200).set_body_json(mr))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/merge_requests/42/changes")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{
                "old_path": "src/auth.rs",
                "new_path": "src/auth.rs",
                "diff": "+fn login() {}\n"
            }]
        })))
        .mount(&server)
        .await;

    let client = gitlab(&server);
    let meta = client.get_unit("group/app", 42).await.unwrap();
    assert_eq!(meta.id, 42);
    assert!(meta.draft);
    assert_eq!(meta.upvotes, 2);

    let changes = client.get_change_set("group/app", 42).await.unwrap();
    assert_eq!(changes.unit_id, 42);
    assert_eq!(changes.changes[0].path(), "src/auth.rs");
}

#[tokio::test]
async fn publish_posts_note_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/merge_requests/5/notes")))
        .and(header("PRIVATE-TOKEN", "glpat-secret"))
        .and(body_json(json!({ "body": "Looks good" })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "id": 777, "body": "Looks good" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let receipt = gitlab(&server)
        .publish("group/app", 5, "Looks good")
        .await
        .unwrap();
    assert_eq!(receipt.id, 777);
}

#[tokio::test]
async fn llm_chat_sends_bearer_key_and_reads_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "## Summary\nFine." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(&LlmConfig {
        api_key: Some("sk-test".into()),
        base_url: Some(server.uri()),
        model: "gpt-4o-mini".into(),
        ..LlmConfig::default()
    })
    .unwrap();
    let reply = client
        .chat(vec![ChatMessage::system("review"), ChatMessage::user("diff")])
        .await
        .unwrap();
    assert_eq!(reply, "## Summary\nFine.");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][1]["role"], "user");
}

#[tokio::test]
async fn llm_rate_limit_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let client = LlmClient::new(&LlmConfig {
        base_url: Some(server.uri()),
        ..LlmConfig::default()
    })
    .unwrap();
    let err = client.chat(vec![ChatMessage::user("hi")]).await.unwrap_err();
    assert!(matches!(err, VigilError::Http { status: 429, .. }));
    assert!(err.is_transient());
}
