//! REST client against a mock server
#![allow(clippy::unwrap_used, clippy::expect_used)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use edgeload_ingest::error::RemoteError;
use edgeload_ingest::remote::{
    BatchPayload, BatchState, HeaderUpdate, JobHeader, NewRecord, PartRecord, Query, PART_ENTITY,
};
use edgeload_ingest::types::{JobAction, Operation, UploadFormat};
use edgeload_ingest::{HttpRemote, JobStateTracker, RemoteService};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{bearer_token, body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn remote(server: &MockServer) -> HttpRemote {
    HttpRemote::new(&server.uri(), "token-123", "58.0", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_describe_lists_entities() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/sobjects"))
        .and(bearer_token("token-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sobjects": [{ "name": "Account" }, { "name": "InsightsExternalData" }]
        })))
        .mount(&server)
        .await;

    let names = remote(&server).await.describe_entities().await.unwrap();
    assert_eq!(names, ["Account", "InsightsExternalData"]);
}

#[tokio::test]
async fn test_create_job_header_sends_encoded_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/data/v58.0/sobjects/InsightsExternalData/"))
        .and(body_partial_json(json!({
            "Format": "Binary",
            "EdgemartAlias": "sales",
            "EdgemartContainer": "Shared",
            "Operation": "Append",
            "Action": "None",
            "MetadataJson": BASE64.encode(b"{\"objects\":[]}"),
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "06V000000000001",
            "success": true,
            "errors": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let id = remote(&server)
        .await
        .create_record(&NewRecord::JobHeader(JobHeader {
            alias: "sales".into(),
            folder: Some("Shared".into()),
            label: None,
            format: UploadFormat::Binary,
            operation: Operation::Append,
            metadata: b"{\"objects\":[]}".to_vec(),
            action: JobAction::None,
        }))
        .await
        .unwrap();
    assert_eq!(id, "06V000000000001");
}

#[tokio::test]
async fn test_rejected_create_reports_remote_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/data/v58.0/sobjects/InsightsExternalDataPart/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "errors": [{ "message": "DataFile too large" }]
        })))
        .mount(&server)
        .await;

    let err = remote(&server)
        .await
        .create_record(&NewRecord::Part(PartRecord {
            job_id: "06V1".into(),
            part_number: 1,
            data: vec![1, 2, 3],
        }))
        .await
        .unwrap_err();
    match err {
        RemoteError::Rejected(message) => assert_eq!(message, "DataFile too large"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_error_status_carries_body() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/services/data/v58.0/sobjects/InsightsExternalData/06V1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Session expired or invalid"))
        .mount(&server)
        .await;

    let err = remote(&server)
        .await
        .update_record(
            "06V1",
            &HeaderUpdate {
                action: Some(JobAction::Process),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        RemoteError::Status { status, message } => {
            assert_eq!(status, 401);
            assert!(message.contains("Session expired"));
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_update_sends_only_set_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/services/data/v58.0/sobjects/InsightsExternalData/06V1"))
        .and(body_json(json!({ "Action": "Process" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = JobStateTracker::new(Arc::new(remote(&server).await));
    tracker.finalize("06V1").await.unwrap();
}

#[tokio::test]
async fn test_uploaded_parts_follow_next_records_url() {
    let server = MockServer::start().await;
    let soql = Query::UploadedParts { job_id: "06V1".into() }.to_soql();
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query"))
        .and(query_param("q", soql.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 3,
            "done": false,
            "nextRecordsUrl": "/services/data/v58.0/query/01g-2000",
            "records": [
                { "attributes": { "type": PART_ENTITY }, "Id": "0Pa1", "PartNumber": 1.0 },
                { "attributes": { "type": PART_ENTITY }, "Id": "0Pa2", "PartNumber": 2.0 }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/data/v58.0/query/01g-2000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalSize": 3,
            "done": true,
            "records": [{ "attributes": { "type": PART_ENTITY }, "Id": "0Pa5", "PartNumber": 5 }]
        })))
        .mount(&server)
        .await;

    let tracker = JobStateTracker::new(Arc::new(remote(&server).await));
    let parts = tracker.list_uploaded_parts("06V1").await.unwrap();
    assert_eq!(parts.into_iter().collect::<Vec<_>>(), [1, 2, 5]);
}

#[tokio::test]
async fn test_async_batch_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/async/58.0/job"))
        .and(header("X-SFDC-Session", "token-123"))
        .and(body_json(json!({
            "operation": "insert",
            "object": "InsightsExternalDataPart",
            "contentType": "ZIP_CSV"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "750A" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/async/58.0/job/750A/batch"))
        .and(header("content-type", "zip/csv"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "751B", "state": "Queued" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/async/58.0/job/750A"))
        .and(body_json(json!({ "state": "Closed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "750A", "state": "Closed" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/async/58.0/job/750A/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batchInfo": [
                { "id": "751B", "state": "Completed" },
                { "id": "751C", "state": "Not Processed", "stateMessage": "job closed" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services/async/58.0/job/750A/batch/751B/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "\"Id\",\"Success\",\"Created\",\"Error\"\n\"0Pa9\",\"true\",\"true\",\"\"\n",
        ))
        .mount(&server)
        .await;

    let remote = remote(&server).await;
    let job = remote.create_async_job(PART_ENTITY).await.unwrap();
    assert_eq!(job, "750A");

    let payload = BatchPayload {
        job_id: "06V1".into(),
        part_number: 1,
        file_name: "06V1.sales.gz.1".into(),
        data: vec![0x1f, 0x8b, 0x08],
    }
    .to_zip()
    .unwrap();
    assert_eq!(remote.submit_batch(&job, payload).await.unwrap(), "751B");
    remote.close_job(&job).await.unwrap();

    let status = remote.get_batch_status(&job).await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].state, BatchState::Completed);
    assert_eq!(status[1].state, BatchState::NotProcessed);
    assert_eq!(status[1].message.as_deref(), Some("job closed"));

    let rows = remote.get_batch_result(&job, "751B").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_success());
    assert_eq!(rows[0].id.as_deref(), Some("0Pa9"));
    assert_eq!(rows[0].error, None);
}

#[tokio::test]
async fn test_failed_batch_result_is_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/async/58.0/job/750A/batch/751B/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "Id,Success,Created,Error\n,false,false,REQUIRED_FIELD_MISSING:DataFile\n",
        ))
        .mount(&server)
        .await;

    let rows = remote(&server).await.get_batch_result("750A", "751B").await.unwrap();
    assert!(!rows[0].is_success());
    assert_eq!(rows[0].id, None);
    assert_eq!(rows[0].error.as_deref(), Some("REQUIRED_FIELD_MISSING:DataFile"));
}
