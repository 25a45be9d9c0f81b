//! Remote storage backends against fake repository servers

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use httpmock::Method::{DELETE, GET, HEAD, PUT};
use httpmock::MockServer;
use serde_json::json;

use stubvault::config::{ArtifactRepoConfig, RemoteRepoConfig};
use stubvault::network::HttpClient;
use stubvault::storage::{ArtifactRepoStorage, RemoteRepoStorage, SnapshotStorage};
use stubvault::StubvaultError;

const CONTENTS: &str = "/repos/acme/mocks/contents/snapshots";
const ARTIFACT: &str = "/repository/snaps/com/example/mock-snapshots";

fn client() -> HttpClient {
    HttpClient::new(Duration::from_secs(5))
}

fn remote_repo(server: &MockServer) -> RemoteRepoStorage {
    let config = RemoteRepoConfig {
        api_url: server.base_url(),
        repository: "acme/mocks".to_string(),
        token: "ghp_test".to_string(),
        ..RemoteRepoConfig::default()
    };
    RemoteRepoStorage::new(config, client())
}

fn artifact_repo(server: &MockServer) -> ArtifactRepoStorage {
    let config = ArtifactRepoConfig {
        url: server.base_url(),
        repository: "snaps".to_string(),
        username: Some("admin".to_string()),
        password: Some("secret".to_string()),
        ..ArtifactRepoConfig::default()
    };
    ArtifactRepoStorage::new(config, client())
}

#[tokio::test]
async fn test_remote_repo_put_new_file() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{CONTENTS}/v1.zip"))
                .query_param("ref", "main");
            then.status(404);
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(format!("{CONTENTS}/v1.zip"))
                .header("authorization", "Bearer ghp_test")
                .body_includes("\"message\":\"Add mock snapshot: v1\"")
                .body_includes(format!("\"content\":\"{}\"", BASE64.encode(b"zip-bytes")));
            then.status(201).json_body(json!({ "content": { "sha": "abc" } }));
        })
        .await;

    remote_repo(&server).put("v1", b"zip-bytes".to_vec()).await.unwrap();
    put.assert_async().await;
}

#[tokio::test]
async fn test_remote_repo_put_existing_file_sends_sha() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{CONTENTS}/v1.zip"));
            then.status(200).json_body(json!({
                "name": "v1.zip",
                "type": "file",
                "sha": "old-sha",
            }));
        })
        .await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(format!("{CONTENTS}/v1.zip"))
                .body_includes("\"sha\":\"old-sha\"")
                .body_includes("Update mock snapshot: v1");
            then.status(200).json_body(json!({}));
        })
        .await;

    remote_repo(&server).put("v1", b"zip".to_vec()).await.unwrap();
    put.assert_async().await;
}

#[tokio::test]
async fn test_remote_repo_persistent_conflict_is_unavailable() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{CONTENTS}/v1.zip"));
            then.status(200)
                .json_body(json!({ "name": "v1.zip", "type": "file", "sha": "stale" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path(format!("{CONTENTS}/v1.zip"));
            then.status(409).body("sha mismatch");
        })
        .await;

    let result = remote_repo(&server).put("v1", b"zip".to_vec()).await;
    assert!(matches!(result, Err(StubvaultError::StorageUnavailable { .. })));
}

#[tokio::test]
async fn test_remote_repo_get_decodes_wrapped_base64() {
    let server = MockServer::start_async().await;
    let data: Vec<u8> = (0..=255).collect();
    let encoded = BASE64.encode(&data);
    let wrapped = format!("{}\n{}\n", &encoded[..60], &encoded[60..]);

    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{CONTENTS}/v1.zip"));
            then.status(200).json_body(json!({
                "name": "v1.zip",
                "type": "file",
                "sha": "abc",
                "encoding": "base64",
                "content": wrapped,
            }));
        })
        .await;

    let fetched = remote_repo(&server).get("v1").await.unwrap();
    assert_eq!(fetched, data);
}

#[tokio::test]
async fn test_remote_repo_get_missing_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{CONTENTS}/nope.zip"));
            then.status(404);
        })
        .await;

    let storage = remote_repo(&server);
    assert!(matches!(
        storage.get("nope").await,
        Err(StubvaultError::NotFound(_))
    ));
    assert!(!storage.exists("nope").await.unwrap());
    assert!(!storage.delete("nope").await.unwrap());
}

#[tokio::test]
async fn test_remote_repo_list_filters_and_sorts() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(CONTENTS).query_param("ref", "main");
            then.status(200).json_body(json!([
                { "name": "v2.zip", "type": "file", "sha": "2" },
                { "name": "README.md", "type": "file", "sha": "3" },
                { "name": "archive", "type": "dir", "sha": "4" },
                { "name": "v1.zip", "type": "file", "sha": "1" },
            ]));
        })
        .await;

    let names = remote_repo(&server).list().await.unwrap();
    assert_eq!(names, vec!["v1".to_string(), "v2".to_string()]);
}

#[tokio::test]
async fn test_remote_repo_list_missing_directory_is_empty() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(CONTENTS);
            then.status(404);
        })
        .await;

    assert!(remote_repo(&server).list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_repo_delete_uses_current_sha() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{CONTENTS}/v1.zip"));
            then.status(200)
                .json_body(json!({ "name": "v1.zip", "type": "file", "sha": "cur" }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path(format!("{CONTENTS}/v1.zip"))
                .body_includes("\"sha\":\"cur\"");
            then.status(200).json_body(json!({}));
        })
        .await;

    assert!(remote_repo(&server).delete("v1").await.unwrap());
    delete.assert_async().await;
}

#[tokio::test]
async fn test_remote_repo_auth_failure_is_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(CONTENTS);
            then.status(401).body("Bad credentials");
        })
        .await;

    let error = remote_repo(&server).list().await.unwrap_err();
    assert!(matches!(error, StubvaultError::StorageUnavailable { .. }));
    assert!(error.to_string().contains("401"));
}

#[tokio::test]
async fn test_artifact_repo_put_and_get() {
    let server = MockServer::start_async().await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(format!("{ARTIFACT}/v1/mock-snapshots-v1.zip"))
                .header("authorization", "Basic YWRtaW46c2VjcmV0")
                .body("zip-bytes");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{ARTIFACT}/v1/mock-snapshots-v1.zip"));
            then.status(200).body("zip-bytes");
        })
        .await;

    let storage = artifact_repo(&server);
    storage.put("v1", b"zip-bytes".to_vec()).await.unwrap();
    put.assert_async().await;

    assert_eq!(storage.get("v1").await.unwrap(), b"zip-bytes");
}

#[tokio::test]
async fn test_artifact_repo_exists_and_delete() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path(format!("{ARTIFACT}/v1/mock-snapshots-v1.zip"));
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path(format!("{ARTIFACT}/v2/mock-snapshots-v2.zip"));
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path(format!("{ARTIFACT}/v1/mock-snapshots-v1.zip"));
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path(format!("{ARTIFACT}/v2/mock-snapshots-v2.zip"));
            then.status(404);
        })
        .await;

    let storage = artifact_repo(&server);
    assert!(storage.exists("v1").await.unwrap());
    assert!(!storage.exists("v2").await.unwrap());
    assert!(storage.delete("v1").await.unwrap());
    assert!(!storage.delete("v2").await.unwrap());
}

#[tokio::test]
async fn test_artifact_repo_get_missing_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{ARTIFACT}/gone/mock-snapshots-gone.zip"));
            then.status(404);
        })
        .await;

    assert!(matches!(
        artifact_repo(&server).get("gone").await,
        Err(StubvaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_artifact_repo_list_follows_continuation() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/rest/v1/search/assets")
                .query_param("repository", "snaps")
                .query_param("maven.groupId", "com.example")
                .query_param("maven.artifactId", "mock-snapshots")
                .query_param_missing("continuationToken");
            then.status(200).json_body(json!({
                "items": [
                    { "path": "com/example/mock-snapshots/v2/mock-snapshots-v2.zip" },
                    { "path": "com/example/mock-snapshots/v2/mock-snapshots-v2.zip.sha1" },
                ],
                "continuationToken": "page2",
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/rest/v1/search/assets")
                .query_param("continuationToken", "page2");
            then.status(200).json_body(json!({
                "items": [
                    { "path": "/com/example/mock-snapshots/v1/mock-snapshots-v1.zip" },
                    { "path": "com/example/other/v9/other-v9.zip" },
                ],
                "continuationToken": null,
            }));
        })
        .await;

    let names = artifact_repo(&server).list().await.unwrap();
    assert_eq!(names, vec!["v1".to_string(), "v2".to_string()]);
}

#[tokio::test]
async fn test_artifact_repo_list_without_search_is_empty() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/service/rest/v1/search/assets");
            then.status(405);
        })
        .await;

    assert!(artifact_repo(&server).list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_artifact_repo_server_error_is_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/service/rest/v1/search/assets");
            then.status(500).body("boom");
        })
        .await;

    assert!(matches!(
        artifact_repo(&server).list().await,
        Err(StubvaultError::StorageUnavailable { .. })
    ));
}
