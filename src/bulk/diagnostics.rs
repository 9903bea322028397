//! Failure triage for server responses
//!
//! Servers report errors as FHIR `OperationOutcome` resources. These helpers
//! turn a failed response into a one-line message and check that an error
//! body really is an OperationOutcome.

use serde_json::Value;

use crate::common::{Error, Result};
use crate::http::HttpResponse;

/// Compose a message from the request URL, the status and the body
///
/// OperationOutcome issues contribute their `details.text` (or
/// `diagnostics`); other JSON is appended verbatim; plain text is appended
/// unless it merely repeats the reason phrase.
pub fn describe_failure(response: &HttpResponse) -> String {
    let mut message = format!(
        "Requesting {} returned {} {}",
        response.url, response.status, response.status_text
    )
    .trim_end()
    .to_string();

    let content_type = response.content_type().to_ascii_lowercase();
    let content_type = if content_type.is_empty() {
        "text/plain".to_string()
    } else {
        content_type
    };

    if content_type.contains("json") {
        if let Some(json) = response.json() {
            match operation_outcome_issues(&json) {
                Some(issues) if !issues.is_empty() => {
                    message.push_str("; ");
                    message.push_str(&issues.join("; "));
                }
                Some(_) => {}
                None => {
                    message.push_str("; ");
                    message.push_str(&json.to_string());
                }
            }
        }
    } else if content_type.starts_with("text/") {
        let text = response.body.trim();
        if !text.is_empty() && text != response.status_text {
            message.push_str("; ");
            message.push_str(text);
        }
    }

    message
}

/// Issue texts of an OperationOutcome; `None` if `json` is not one
fn operation_outcome_issues(json: &Value) -> Option<Vec<String>> {
    if json.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
        return None;
    }
    let issues = json
        .get("issue")
        .and_then(Value::as_array)
        .map(|issues| {
            issues
                .iter()
                .filter_map(|issue| {
                    issue
                        .pointer("/details/text")
                        .or_else(|| issue.get("diagnostics"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    Some(issues)
}

/// Check that the response body is an OperationOutcome
///
/// `context` is prepended to the error message.
pub fn expect_operation_outcome(response: &HttpResponse, context: &str) -> Result<()> {
    let prefix = if context.is_empty() {
        String::new()
    } else {
        format!("{} ", context)
    };
    let fail = |reason: &str| Err(Error::TestAssertion(format!("{}{}", prefix, reason)));

    if response.body.trim().is_empty() {
        return fail("Expected the request to return an OperationOutcome but the response has no body.");
    }

    let content_type = response.content_type().to_ascii_lowercase();
    if content_type.starts_with("application/xml") || content_type.starts_with("application/fhir+xml") {
        let body = response.body.trim();
        if !(body.starts_with("<OperationOutcome") && body.ends_with("</OperationOutcome>")) {
            return fail("Expected the request to return an OperationOutcome");
        }
        return Ok(());
    }

    let Some(json) = response.json() else {
        return fail(
            "Expected the request to return an OperationOutcome but the response body cannot be parsed as JSON.",
        );
    };
    if operation_outcome_issues(&json).is_none() {
        return fail("Expected the request to return an OperationOutcome");
    }
    Ok(())
}
