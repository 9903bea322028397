//! Shared fakes for integration tests
//!
//! `ScriptedTransport` answers requests from a queue and records what was
//! sent; `RecordingSleeper` records backoff delays without sleeping.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bdt::bulk::{BulkDataClient, Sleeper};
use bdt::http::{HttpRequest, HttpResponse, HttpTransport};
use bdt::testing::{TestApi, TestRecord};
use bdt::{Error, Result, Settings};

pub const BASE_URL: &str = "https://bulk.example.org/fhir";
pub const STATUS_URL: &str = "https://bulk.example.org/fhir/status/42";

/// Build a response with an optional JSON body
pub fn response(status: u16, status_text: &str) -> HttpResponse {
    HttpResponse {
        url: String::new(),
        status,
        status_text: status_text.to_string(),
        headers: BTreeMap::new(),
        body: String::new(),
    }
}

pub fn with_header(mut response: HttpResponse, name: &str, value: &str) -> HttpResponse {
    response
        .headers
        .insert(name.to_ascii_lowercase(), value.to_string());
    response
}

pub fn with_json(response: HttpResponse, body: serde_json::Value) -> HttpResponse {
    let mut response = with_header(response, "content-type", "application/json");
    response.body = body.to_string();
    response
}

/// 202 with a status location
pub fn accepted() -> HttpResponse {
    with_header(response(202, "Accepted"), "content-location", STATUS_URL)
}

/// 200 with a manifest listing `files` output files
pub fn manifest(files: usize) -> HttpResponse {
    let output: Vec<serde_json::Value> = (0..files)
        .map(|i| {
            serde_json::json!({
                "type": "Patient",
                "url": format!("https://bulk.example.org/files/{}.ndjson", i)
            })
        })
        .collect();
    with_json(
        response(200, "OK"),
        serde_json::json!({
            "transactionTime": "2024-01-01T00:00:00Z",
            "request": format!("{}/$export", BASE_URL),
            "requiresAccessToken": true,
            "output": output,
            "error": []
        }),
    )
}

#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = HttpResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::transport(&request.url, "no scripted response left"))?;
        response.url = request.url;
        Ok(response)
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

pub fn settings() -> Settings {
    Settings {
        base_url: BASE_URL.to_string(),
        system_export_endpoint: Some("$export".to_string()),
        ..Settings::default()
    }
}

pub fn api() -> TestApi {
    TestApi::new(TestRecord::new(chrono::Utc::now()))
}

/// Client wired to fakes
pub fn client(
    settings: Settings,
    api: &TestApi,
    transport: &Arc<ScriptedTransport>,
    sleeper: &Arc<RecordingSleeper>,
) -> BulkDataClient {
    BulkDataClient::new(Arc::new(settings), api.clone(), "$export")
        .unwrap()
        .with_transport(transport.clone())
        .with_sleeper(sleeper.clone())
}
