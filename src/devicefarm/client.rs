use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use ureq::Agent;

use super::sigv4::{self, Scope, SigningRequest};
use super::{
    Artifact, ArtifactCategory, DeviceFarm, DevicePool, Job, RemoteRun, ScheduleRunRequest, Suite,
    Test, Upload, UploadType,
};
use crate::credentials::AwsCredentials;
use crate::error::{PerftestError, Result};

const TARGET_PREFIX: &str = "DeviceFarm_20150623";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "devicefarm";

const AUTH_CODES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "AccessDeniedException",
    "ExpiredTokenException",
    "IncompleteSignature",
    "MissingAuthenticationToken",
];

/// A stalled response fails the call instead of hanging the poll loop.
fn agent_config() -> ureq::config::Config {
    Agent::config_builder()
        .http_status_as_error(false)
        .timeout_connect(Some(Duration::from_secs(30)))
        .timeout_recv_response(Some(Duration::from_secs(60)))
        .timeout_recv_body(Some(Duration::from_secs(120)))
        .build()
}

/// Device Farm over the AWS JSON 1.1 protocol, signed with SigV4.
pub struct DeviceFarmClient {
    agent: Agent,
    endpoint: String,
    host: String,
    region: String,
    credentials: AwsCredentials,
}

impl DeviceFarmClient {
    pub fn new(region: &str, credentials: AwsCredentials) -> Self {
        let host = format!("devicefarm.{region}.amazonaws.com");
        Self::with_endpoint(&format!("https://{host}/"), region, credentials)
    }

    /// Point the client at a different endpoint, e.g. a local stub.
    pub fn with_endpoint(endpoint: &str, region: &str, credentials: AwsCredentials) -> Self {
        let host = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint)
            .trim_end_matches('/')
            .to_string();

        Self {
            agent: Agent::new_with_config(agent_config()),
            endpoint: endpoint.to_string(),
            host,
            region: region.to_string(),
            credentials,
        }
    }

    fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let now = Utc::now();
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut headers = vec![
            ("content-type", CONTENT_TYPE.to_string()),
            ("host", self.host.clone()),
            ("x-amz-date", sigv4::amz_date(now)),
            ("x-amz-target", target),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.expose().to_string()));
        }

        let authorization = sigv4::authorization(
            &SigningRequest {
                method: "POST",
                path: "/",
                query: "",
                headers: &headers,
                payload: &body,
            },
            &Scope {
                region: &self.region,
                service: SERVICE,
                time: now,
            },
            &self.credentials,
        );

        let mut builder = self.agent.post(&self.endpoint);
        for (name, value) in headers.iter().filter(|(name, _)| *name != "host") {
            builder = builder.header(*name, value.as_str());
        }
        let mut response = builder
            .header("authorization", authorization.as_str())
            .send(&body[..])
            .map_err(|err| PerftestError::remote(operation, err.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|err| PerftestError::remote(operation, err.to_string()))?;
        debug!(operation, status, bytes = text.len(), "Device Farm response");

        if !(200..300).contains(&status) {
            return Err(service_error(operation, status, &text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Follow `nextToken` until the service stops returning one.
    fn paginate<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: Value,
        field: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut page_request = request.clone();
            if let (Some(token), Some(map)) = (&token, page_request.as_object_mut()) {
                map.insert("nextToken".into(), Value::String(token.clone()));
            }
            let mut page: Value = self.call(operation, &page_request)?;
            if let Some(list) = page.get_mut(field).map(Value::take) {
                let mut batch: Vec<T> = serde_json::from_value(list)?;
                items.append(&mut batch);
            }
            token = page
                .get("nextToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if token.is_none() {
                return Ok(items);
            }
        }
    }

    fn single<T: DeserializeOwned>(&self, operation: &str, request: Value, field: &str) -> Result<T> {
        let mut response: Value = self.call(operation, &request)?;
        let item = response
            .get_mut(field)
            .map(Value::take)
            .ok_or_else(|| PerftestError::remote(operation, format!("response has no '{field}'")))?;
        Ok(serde_json::from_value(item)?)
    }
}

fn service_error(operation: &str, status: u16, body: &str) -> PerftestError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = parsed
        .get("__type")
        .and_then(Value::as_str)
        .map(|raw| raw.rsplit('#').next().unwrap_or(raw).to_string());
    let message = parsed
        .get("message")
        .or_else(|| parsed.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    if let Some(code) = &code
        && AUTH_CODES.contains(&code.as_str())
    {
        return PerftestError::Auth {
            remote: "AWS Device Farm".into(),
            message: format!("{code}: {message}"),
        };
    }

    PerftestError::Remote {
        operation: operation.to_string(),
        status: Some(status),
        code,
        message,
    }
}

impl DeviceFarm for DeviceFarmClient {
    fn list_device_pools(&self, project_arn: &str) -> Result<Vec<DevicePool>> {
        self.paginate("ListDevicePools", json!({ "arn": project_arn }), "devicePools")
    }

    #[instrument(skip(self))]
    fn create_upload(&self, project_arn: &str, name: &str, kind: UploadType) -> Result<Upload> {
        self.single(
            "CreateUpload",
            json!({ "projectArn": project_arn, "name": name, "type": kind }),
            "upload",
        )
    }

    fn upload_file(&self, upload: &Upload, path: &Path) -> Result<()> {
        let url = upload.url.as_deref().ok_or_else(|| PerftestError::Upload {
            name: upload.name.clone(),
            message: "service returned no upload URL".into(),
        })?;
        // Presigned S3 URLs need a Content-Length, so the body is sent whole.
        let content = std::fs::read(path).map_err(PerftestError::at(path))?;
        let response = self
            .agent
            .put(url)
            .header("content-type", "application/octet-stream")
            .send(&content[..])
            .map_err(|err| PerftestError::Upload {
                name: upload.name.clone(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(PerftestError::Upload {
                name: upload.name.clone(),
                message: format!("presigned PUT returned HTTP {status}"),
            });
        }
        Ok(())
    }

    fn get_upload(&self, arn: &str) -> Result<Upload> {
        self.single("GetUpload", json!({ "arn": arn }), "upload")
    }

    fn schedule_run(&self, request: &ScheduleRunRequest) -> Result<RemoteRun> {
        let value = serde_json::to_value(request)?;
        self.single("ScheduleRun", value, "run")
    }

    fn get_run(&self, arn: &str) -> Result<RemoteRun> {
        self.single("GetRun", json!({ "arn": arn }), "run")
    }

    fn list_jobs(&self, run_arn: &str) -> Result<Vec<Job>> {
        self.paginate("ListJobs", json!({ "arn": run_arn }), "jobs")
    }

    fn list_suites(&self, job_arn: &str) -> Result<Vec<Suite>> {
        self.paginate("ListSuites", json!({ "arn": job_arn }), "suites")
    }

    fn list_tests(&self, suite_arn: &str) -> Result<Vec<Test>> {
        self.paginate("ListTests", json!({ "arn": suite_arn }), "tests")
    }

    fn list_artifacts(&self, arn: &str, category: ArtifactCategory) -> Result<Vec<Artifact>> {
        self.paginate(
            "ListArtifacts",
            json!({ "arn": arn, "type": category }),
            "artifacts",
        )
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| PerftestError::remote("download", err.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(PerftestError::Remote {
                operation: "download".into(),
                status: Some(status),
                code: None,
                message: format!("GET {} failed", redact_query(url)),
            });
        }

        let mut file = File::create(dest).map_err(PerftestError::at(dest))?;
        let mut reader = response.into_body().into_reader();
        io::copy(&mut reader, &mut file).map_err(PerftestError::at(dest))
    }
}

/// Presigned URLs carry credentials in the query string.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
