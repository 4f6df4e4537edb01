//! REST client for the remote data store
//!
//! Record calls go to `/services/data/v{version}`; the async batch API lives
//! under `/services/async/{version}`. Both authenticate with the same access
//! token, sent as a bearer token and as the async API session header.

use super::{
    BatchInfo, BatchResultRow, BatchState, HeaderUpdate, NewRecord, Query, QueryPage, RemoteResult,
    RemoteService, JOB_ENTITY,
};
use crate::error::RemoteError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default timeout for remote calls in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_API_VERSION: &str = "58.0";

const SESSION_HEADER: &str = "X-SFDC-Session";

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_version: String,
    access_token: String,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        access_token: &str,
        api_version: &str,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.trim_start_matches('v').to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/services/data/v{}{}", self.base_url, self.api_version, path)
    }

    fn async_url(&self, path: &str) -> String {
        format!("{}/services/async/{}{}", self.base_url, self.api_version, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.access_token)
            .header(SESSION_HEADER, &self.access_token)
    }

    async fn read_page(&self, url: &str) -> RemoteResult<QueryPage> {
        let response = check(self.authed(self.client.get(url)).send().await?).await?;
        let page: QueryResponse = response.json().await?;
        Ok(QueryPage {
            records: page.records,
            done: page.done,
            next_cursor: page.next_records_url,
        })
    }
}

/// Turn a non-success status into [`RemoteError::Status`] with the body text.
async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JobHeaderBody<'a> {
    format: &'a str,
    edgemart_alias: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    edgemart_container: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    edgemart_label: Option<&'a str>,
    operation: &'a str,
    action: &'a str,
    metadata_json: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PartBody<'a> {
    insights_external_data_id: &'a str,
    part_number: u32,
    data_file: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_json: Option<String>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<serde_json::Value>,
    #[serde(default)]
    done: bool,
    next_records_url: Option<String>,
}

#[derive(Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    sobjects: Vec<DescribeEntry>,
}

#[derive(Deserialize)]
struct DescribeEntry {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AsyncJobRequest<'a> {
    operation: &'a str,
    object: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchInfoList {
    #[serde(default)]
    batch_info: Vec<BatchInfoBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchInfoBody {
    id: String,
    state: BatchState,
    state_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BatchResultLine {
    id: Option<String>,
    success: String,
    created: String,
    error: Option<String>,
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn record_body(record: &NewRecord) -> RemoteResult<serde_json::Value> {
    let value = match record {
        NewRecord::JobHeader(header) => serde_json::to_value(JobHeaderBody {
            format: header.format.as_str(),
            edgemart_alias: &header.alias,
            edgemart_container: header.folder.as_deref(),
            edgemart_label: header.label.as_deref(),
            operation: header.operation.as_str(),
            action: header.action.as_str(),
            metadata_json: BASE64.encode(&header.metadata),
        }),
        NewRecord::Part(part) => serde_json::to_value(PartBody {
            insights_external_data_id: &part.job_id,
            part_number: part.part_number,
            data_file: BASE64.encode(&part.data),
        }),
    };
    value.map_err(|e| RemoteError::decode(e.to_string()))
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn describe_entities(&self) -> RemoteResult<Vec<String>> {
        let url = self.data_url("/sobjects");
        let response = check(self.authed(self.client.get(&url)).send().await?).await?;
        let body: DescribeResponse = response.json().await?;
        Ok(body.sobjects.into_iter().map(|s| s.name).collect())
    }

    async fn create_record(&self, record: &NewRecord) -> RemoteResult<String> {
        let url = self.data_url(&format!("/sobjects/{}/", record.entity()));
        let body = record_body(record)?;
        debug!(entity = record.entity(), "Creating record");

        let response = check(self.authed(self.client.post(&url)).json(&body).send().await?).await?;
        let created: CreateResponse = response.json().await?;
        match created {
            CreateResponse {
                id: Some(id),
                success: true,
                ..
            } => Ok(id),
            CreateResponse { errors, .. } => {
                let message = errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(RemoteError::rejected(if message.is_empty() {
                    format!("create {} returned no id", record.entity())
                } else {
                    message
                }))
            },
        }
    }

    async fn update_record(&self, job_id: &str, update: &HeaderUpdate) -> RemoteResult<()> {
        let url = self.data_url(&format!("/sobjects/{JOB_ENTITY}/{job_id}"));
        let body = UpdateBody {
            format: update.format.as_ref().map(|f| f.as_str()),
            operation: update.operation.as_ref().map(|o| o.as_str()),
            action: update.action.as_ref().map(|a| a.as_str()),
            metadata_json: update.metadata.as_ref().map(|m| BASE64.encode(m)),
        };
        check(self.authed(self.client.patch(&url)).json(&body).send().await?).await?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> RemoteResult<QueryPage> {
        let soql = query.to_soql();
        debug!(%soql, "Running query");
        let url = reqwest::Url::parse_with_params(&self.data_url("/query"), [("q", soql.as_str())])
            .map_err(|e| RemoteError::decode(format!("bad query url: {e}")))?;
        self.read_page(url.as_str()).await
    }

    async fn query_more(&self, cursor: &str) -> RemoteResult<QueryPage> {
        let url = if cursor.starts_with("http") {
            cursor.to_string()
        } else {
            format!("{}{}", self.base_url, cursor)
        };
        self.read_page(&url).await
    }

    async fn create_async_job(&self, entity: &str) -> RemoteResult<String> {
        let url = self.async_url("/job");
        let request = AsyncJobRequest {
            operation: "insert",
            object: entity,
            content_type: "ZIP_CSV",
        };
        let response = check(self.authed(self.client.post(&url)).json(&request).send().await?).await?;
        let job: IdResponse = response.json().await?;
        Ok(job.id)
    }

    async fn submit_batch(&self, job_id: &str, payload: Vec<u8>) -> RemoteResult<String> {
        let url = self.async_url(&format!("/job/{job_id}/batch"));
        let response = check(
            self.authed(self.client.post(&url))
                .header(reqwest::header::CONTENT_TYPE, "zip/csv")
                .body(payload)
                .send()
                .await?,
        )
        .await?;
        let batch: IdResponse = response.json().await?;
        Ok(batch.id)
    }

    async fn close_job(&self, job_id: &str) -> RemoteResult<()> {
        let url = self.async_url(&format!("/job/{job_id}"));
        check(
            self.authed(self.client.post(&url))
                .json(&serde_json::json!({ "state": "Closed" }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn get_batch_status(&self, job_id: &str) -> RemoteResult<Vec<BatchInfo>> {
        let url = self.async_url(&format!("/job/{job_id}/batch"));
        let response = check(self.authed(self.client.get(&url)).send().await?).await?;
        let list: BatchInfoList = response.json().await?;
        Ok(list
            .batch_info
            .into_iter()
            .map(|b| BatchInfo {
                id: b.id,
                state: b.state,
                message: b.state_message,
            })
            .collect())
    }

    async fn get_batch_result(&self, job_id: &str, batch_id: &str) -> RemoteResult<Vec<BatchResultRow>> {
        let url = self.async_url(&format!("/job/{job_id}/batch/{batch_id}/result"));
        let response = check(self.authed(self.client.get(&url)).send().await?).await?;
        let text = response.text().await?;

        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(text.as_bytes());
        reader
            .deserialize::<BatchResultLine>()
            .map(|line| {
                let line = line.map_err(|e| RemoteError::decode(format!("batch result: {e}")))?;
                Ok(BatchResultRow {
                    id: line.id.filter(|s| !s.is_empty()),
                    success: is_true(&line.success),
                    created: is_true(&line.created),
                    error: line.error.filter(|s| !s.is_empty()),
                })
            })
            .collect()
    }
}
