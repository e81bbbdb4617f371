use orchard_core::{DriveClient, EntryKind, ErrorClass, RemoteAdapter, RemoteError};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn list_pages_through_children() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/folders/FOLDER::root/children"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "limit": 200,
            "offset": 0,
            "total": 2,
            "items": [
                {
                    "cloud_id": "DOC::a",
                    "name": "A.txt",
                    "type": "file",
                    "size": 12,
                    "etag": "e1",
                    "modified": "2024-01-01T00:00:00Z"
                },
                {
                    "cloud_id": "FOLDER::b",
                    "name": "Projects",
                    "type": "folder"
                }
            ]
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let entries = client.list("FOLDER::root").await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, EntryKind::File);
    assert_eq!(entries[0].etag.as_deref(), Some("e1"));
    assert_eq!(entries[1].kind, EntryKind::Folder);
    assert!(entries[1].size.is_none());
}

#[tokio::test]
async fn metadata_maps_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.metadata("DOC::gone").await.expect_err("expected 404");
    assert!(matches!(err, RemoteError::NotFound));
    assert!(err.classification().is_none());
}

#[tokio::test]
async fn download_range_sends_range_and_if_match() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a/content"))
        .and(header("range", "bytes=0-4"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let bytes = client
        .download_range("DOC::a", 0, 4, Some("e1"))
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hello");
}

#[tokio::test]
async fn download_range_surfaces_precondition_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a/content"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .download_range("DOC::a", 0, 4, Some("stale"))
        .await
        .expect_err("expected 412");
    assert!(matches!(err, RemoteError::PreconditionFailed));
}

#[tokio::test]
async fn download_streams_to_target() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/out.bin");
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.download("DOC::a", None, &target).await.unwrap();

    assert_eq!(std::fs::read(target).unwrap(), b"payload");
}

#[tokio::test]
async fn upload_streams_file_and_returns_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/folders/FOLDER::root/items"))
        .and(query_param("name", "note.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "cloud_id": "DOC::new",
            "etag": "e1",
            "revision": "r1"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("note.txt");
    std::fs::write(&source, b"hello").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let result = client
        .upload("FOLDER::root", "note.txt", &source, None)
        .await
        .unwrap();

    assert_eq!(result.cloud_id, "DOC::new");
    assert_eq!(result.etag, "e1");
    assert_eq!(result.revision.as_deref(), Some("r1"));
}

#[tokio::test]
async fn update_sends_if_match_header() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/items/DOC::a/content"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cloud_id": "DOC::a",
            "etag": "e2",
            "revision": "r2"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.bin");
    std::fs::write(&source, b"new bytes").unwrap();

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let result = client.update("DOC::a", &source, "e1").await.unwrap();
    assert_eq!(result.etag, "e2");
}

#[tokio::test]
async fn rename_and_move_return_fresh_stamps() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/items/DOC::a/rename"))
        .and(query_param("name", "B.txt"))
        .and(header("if-match", "e1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"etag": "e2", "revision": "r2"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/items/DOC::a/move"))
        .and(query_param("parent", "FOLDER::dst"))
        .and(header("if-match", "e2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"etag": "e3", "revision": "r3"})),
        )
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let renamed = client.rename("DOC::a", "B.txt", "e1").await.unwrap();
    assert_eq!(renamed.etag, "e2");
    let moved = client.move_item("DOC::a", "FOLDER::dst", "e2").await.unwrap();
    assert_eq!(moved.etag, "e3");
}

#[tokio::test]
async fn delete_treats_missing_as_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .delete("DOC::gone", Some("e1"))
        .await
        .expect_err("expected 404");
    assert!(matches!(err, RemoteError::NotFound));
}

#[tokio::test]
async fn classification_buckets_api_statuses() {
    let server = MockServer::start().await;

    for (status, class) in [
        (401, ErrorClass::Auth),
        (429, ErrorClass::RateLimit),
        (503, ErrorClass::Transient),
        (400, ErrorClass::Permanent),
    ] {
        Mock::given(method("GET"))
            .and(path("/v1/items/DOC::x"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
        let err = client.metadata("DOC::x").await.expect_err("expected error");
        assert_eq!(err.classification(), Some(class), "status {status}");
        server.reset().await;
    }
}
