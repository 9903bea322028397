//! Per-test execution record and the API handed to test bodies

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::http::{HttpRequest, HttpResponse};

use super::status::Status;

/// Replacement for bearer tokens in logged requests
pub const MASKED_TOKEN: &str = "✸✸✸✸✸✸";

/// Warning recorded for tests without a body
pub const NOT_IMPLEMENTED_MESSAGE: &str = "This test is not implemented";

/// Default message for [`TestApi::set_not_supported`]
pub const NOT_SUPPORTED_MESSAGE: &str =
    "This test was skipped because the server does not support this functionality";

/// Labeled output attached to a test result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decoration {
    Text {
        text: String,
    },
    Html {
        html: String,
        #[serde(rename = "className")]
        class_name: String,
    },
    Request {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Response {
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(rename = "statusMessage")]
        status_message: String,
        headers: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

/// Error recorded on a failed test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestError {
    pub message: String,
}

/// Runtime fields of an executing or finished test
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub status: Status,
    pub decorations: BTreeMap<String, Decoration>,
    pub warnings: Vec<String>,
    pub error: Option<TestError>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TestRecord {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Status::Loading,
            decorations: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
            started_at,
            ended_at: None,
        }
    }

    /// Move to `next` if the transition table allows it
    ///
    /// This is the only place a test status changes.
    pub fn transition(&mut self, next: Status) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::debug!("Ignoring status change {} -> {}", self.status, next);
            false
        }
    }

    /// Settle the final status once the body has returned
    ///
    /// `outcome` is `None` for tests without a body.
    pub fn finalize(&mut self, outcome: Option<Result<(), String>>, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
        let implemented = outcome.is_some();
        match outcome {
            Some(Err(message)) => {
                self.transition(Status::Failed);
                let message = if message.trim().is_empty() {
                    "The test failed without an error message".to_string()
                } else {
                    message
                };
                self.error = Some(TestError { message });
            }
            _ if self.status == Status::Loading => {
                let next = if !implemented {
                    Status::NotImplemented
                } else if self.warnings.is_empty() {
                    Status::Succeeded
                } else {
                    Status::Warned
                };
                self.transition(next);
            }
            _ => {}
        }
    }
}

/// The interface a test body uses to report into its own result
///
/// Cloning is cheap; all clones write to the same record.
#[derive(Clone)]
pub struct TestApi {
    record: Arc<Mutex<TestRecord>>,
}

impl TestApi {
    pub fn new(record: TestRecord) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TestRecord> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> TestRecord {
        self.lock().clone()
    }

    pub(crate) fn finalize(&self, outcome: Option<Result<(), String>>) {
        self.lock().finalize(outcome, Utc::now());
    }

    /// Set the status; returns false if the transition is not allowed
    pub fn set_status(&self, status: Status) -> bool {
        self.lock().transition(status)
    }

    /// Append a warning. Promotes a running test to `warned`.
    pub fn warn(&self, message: impl Into<String>) {
        let mut record = self.lock();
        record.warnings.push(message.into());
        if record.status == Status::Loading {
            record.transition(Status::Warned);
        }
    }

    /// Mark the test as not supported by the server
    pub fn set_not_supported(&self, message: Option<&str>) {
        self.warn(message.unwrap_or(NOT_SUPPORTED_MESSAGE));
        self.set_status(Status::NotSupported);
    }

    /// Attach a text entry. Entries with the same name replace each other.
    pub fn decorate(&self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(name.into(), Decoration::Text { text: value.into() });
    }

    /// Attach an HTML entry; `class_name` defaults to "description"
    pub fn decorate_html(&self, name: impl Into<String>, value: impl Into<String>, class_name: Option<&str>) {
        self.insert(
            name.into(),
            Decoration::Html {
                html: value.into(),
                class_name: class_name.unwrap_or("description").to_string(),
            },
        );
    }

    /// Log an outgoing request; `label` defaults to "Request"
    ///
    /// Bearer tokens in the Authorization header are masked.
    pub fn log_request(&self, request: &HttpRequest, label: Option<&str>) {
        let mut headers = request.headers.clone();
        if let Some(value) = headers.get_mut("authorization") {
            *value = mask_authorization(value);
        }
        self.insert(
            label.unwrap_or("Request").to_string(),
            Decoration::Request {
                method: request.method.to_string(),
                url: request.url.clone(),
                headers,
                body: request.body.clone(),
            },
        );
    }

    /// Log a received response; `label` defaults to "Response"
    pub fn log_response(&self, response: &HttpResponse, label: Option<&str>) {
        let body = if response.body.is_empty() {
            None
        } else {
            Some(
                response
                    .json()
                    .unwrap_or_else(|| serde_json::Value::String(response.body.clone())),
            )
        };
        self.insert(
            label.unwrap_or("Response").to_string(),
            Decoration::Response {
                status_code: response.status,
                status_message: response.status_text.clone(),
                headers: response.headers.clone(),
                body,
            },
        );
    }

    fn insert(&self, name: String, decoration: Decoration) {
        self.lock().decorations.insert(name, decoration);
    }
}

/// Replace the token of a `Bearer <token>` header value
///
/// The scheme keeps its original spelling; other schemes are left alone.
pub fn mask_authorization(value: &str) -> String {
    let trimmed = value.trim_start();
    let scheme_len = "bearer".len();
    let is_bearer = trimmed.len() > scheme_len
        && trimmed.is_char_boundary(scheme_len)
        && trimmed[..scheme_len].eq_ignore_ascii_case("bearer")
        && trimmed[scheme_len..].starts_with(char::is_whitespace);
    if is_bearer {
        format!("{} {}", &trimmed[..scheme_len], MASKED_TOKEN)
    } else {
        value.to_string()
    }
}
