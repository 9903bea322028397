//! Bulk data export client
//!
//! Drives one export job at a time through kick-off, status polling,
//! download and cancellation, logging every exchange into the test record.

use std::sync::Arc;

use serde::Deserialize;

use crate::common::{Error, Result, Settings};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
use crate::testing::TestApi;

use super::auth::{parse_token_response, AuthMethod};
use super::clock::{Sleeper, TokioSleeper};
use super::diagnostics::{describe_failure, expect_operation_outcome};

/// Media type requested for kick-off and downloads
pub const FHIR_JSON: &str = "application/fhir+json";

/// Per-request overrides
///
/// Headers are applied in order on top of the defaults. A header set to
/// `None` is removed from the request, including `Authorization`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub url: Option<String>,
    pub headers: Vec<(String, Option<String>)>,
    pub body: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), Some(value.into())));
        self
    }

    /// Remove a header that would otherwise be sent
    pub fn omit_header(mut self, name: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), None));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn omits(&self, name: &str) -> bool {
        self.headers
            .iter()
            .rev()
            .find(|(header, _)| header == name)
            .is_some_and(|(_, value)| value.is_none())
    }
}

/// State of the current export job
#[derive(Debug, Clone, Default)]
pub struct Job {
    pub kick_off_request: Option<HttpRequest>,
    pub kick_off_response: Option<HttpResponse>,
    pub status_request: Option<HttpRequest>,
    pub status_response: Option<HttpResponse>,
    pub cancel_request: Option<HttpRequest>,
    pub cancel_response: Option<HttpResponse>,
    /// Status requests sent so far
    pub poll_count: u32,
}

impl Job {
    /// Status URL announced by the kick-off response
    pub fn location(&self) -> Option<&str> {
        self.kick_off_response
            .as_ref()
            .and_then(|response| response.header("content-location"))
    }

    /// Whether the server accepted the kick-off and announced a status URL
    pub fn is_accepted(&self) -> bool {
        self.kick_off_response
            .as_ref()
            .is_some_and(|response| response.status == 202)
            && self.location().is_some()
    }
}

/// Completed export manifest
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub transaction_time: Option<String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub requires_access_token: Option<bool>,
    #[serde(default)]
    pub output: Vec<OutputFile>,
    #[serde(default)]
    pub error: Vec<OutputFile>,
}

/// One file listed in a manifest
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputFile {
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    pub url: String,
    #[serde(default)]
    pub count: Option<u64>,
}

/// Client for one export endpoint, bound to one test
pub struct BulkDataClient {
    settings: Arc<Settings>,
    api: TestApi,
    /// Built on first use unless injected
    transport: Option<Arc<dyn HttpTransport>>,
    sleeper: Arc<dyn Sleeper>,
    auth: AuthMethod,
    kick_off_url: String,
    access_token: Option<String>,
    job: Job,
}

impl BulkDataClient {
    /// Create a client for `endpoint`, resolved against the base URL
    pub fn new(settings: Arc<Settings>, api: TestApi, endpoint: &str) -> Result<Self> {
        let kick_off_url = settings.endpoint_url(endpoint)?;
        let auth = AuthMethod::from_settings(&settings)?;
        Ok(Self {
            access_token: settings.access_token.clone(),
            transport: None,
            sleeper: Arc::new(TokioSleeper),
            settings,
            api,
            auth,
            kick_off_url,
            job: Job::default(),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn kick_off_url(&self) -> &str {
        &self.kick_off_url
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Exchange credentials for a token and cache it
    pub async fn authenticate(&mut self, scope: Option<&str>) -> Result<String> {
        let token_endpoint = self.settings.token_endpoint.clone().ok_or_else(|| {
            Error::Config("A token_endpoint is needed to authorize".to_string())
        })?;
        let scope = scope.unwrap_or(&self.settings.scope).to_string();
        let request = self
            .auth
            .token_request(&token_endpoint, &scope, self.settings.strict_ssl)?;
        let response = self
            .exchange(request, "Authorization Request", "Authorization Response")
            .await?;
        let token = parse_token_response(&response)?;
        self.access_token = Some(token.clone());
        Ok(token)
    }

    /// The cached token, authenticating when needed or when `force` is set
    ///
    /// Without a configured auth method only a pre-issued token is returned.
    pub async fn access_token(&mut self, force: bool) -> Result<Option<String>> {
        if matches!(self.auth, AuthMethod::None) {
            return Ok(self.access_token.clone());
        }
        match &self.access_token {
            Some(token) if !force => Ok(Some(token.clone())),
            _ => self.authenticate(None).await.map(Some),
        }
    }

    /// Build a request with the bearer token and TLS policy applied
    pub async fn prepare(&mut self, options: RequestOptions) -> Result<HttpRequest> {
        let url = options
            .url
            .clone()
            .ok_or_else(|| Error::Internal("request has no URL".to_string()))?;
        let mut request = HttpRequest::new(options.method.unwrap_or(Method::Get), url);
        request.verify_tls = self.settings.strict_ssl;

        if !options.omits("authorization") {
            if let Some(token) = self.access_token(false).await? {
                request = request.with_header("Authorization", format!("Bearer {}", token));
            }
        }

        for (name, value) in options.headers {
            match value {
                Some(value) => request = request.with_header(&name, value),
                None => {
                    request.headers.remove(&name);
                }
            }
        }
        if let Some(body) = options.body {
            request = request.with_body(body);
        }
        Ok(request)
    }

    /// Send a prepared request, logging it under the given labels
    pub async fn request(
        &mut self,
        options: RequestOptions,
        request_label: &str,
        response_label: &str,
    ) -> Result<HttpResponse> {
        let request = self.prepare(options).await?;
        self.exchange(request, request_label, response_label).await
    }

    fn transport(&mut self) -> Result<Arc<dyn HttpTransport>> {
        match &self.transport {
            Some(transport) => Ok(Arc::clone(transport)),
            None => {
                let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
                self.transport = Some(Arc::clone(&transport));
                Ok(transport)
            }
        }
    }

    async fn exchange(
        &mut self,
        request: HttpRequest,
        request_label: &str,
        response_label: &str,
    ) -> Result<HttpResponse> {
        let transport = self.transport()?;
        self.api.log_request(&request, Some(request_label));
        tracing::debug!("{} {}", request.method, request.url);
        let response = transport.send(request).await?;
        tracing::debug!("{} -> {} {}", response.url, response.status, response.status_text);
        self.api.log_response(&response, Some(response_label));
        Ok(response)
    }

    /// Start a new export job, discarding any previous one
    pub async fn kick_off(&mut self, options: RequestOptions) -> Result<HttpResponse> {
        self.job = Job::default();

        let mut headers = vec![
            ("accept".to_string(), Some(FHIR_JSON.to_string())),
            ("prefer".to_string(), Some("respond-async".to_string())),
        ];
        headers.extend(options.headers);
        let options = RequestOptions {
            url: Some(options.url.unwrap_or_else(|| self.kick_off_url.clone())),
            headers,
            ..options
        };

        let request = self.prepare(options).await?;
        self.job.kick_off_request = Some(request.clone());
        let response = self
            .exchange(request, "Kick-off Request", "Kick-off Response")
            .await?;
        self.job.kick_off_response = Some(response.clone());
        Ok(response)
    }

    /// Status URL of the current job, or why there is none
    fn require_location(&self, action: &str) -> Result<String> {
        let response = self.job.kick_off_response.as_ref().ok_or_else(|| {
            Error::Protocol(format!("Trying to {} but there was no kick-off response", action))
        })?;
        response
            .header("content-location")
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Trying to {} but the kick-off response did not include a content-location header. {}",
                    action,
                    describe_failure(response)
                ))
            })
    }

    /// Send one status request
    pub async fn poll_status(&mut self) -> Result<HttpResponse> {
        let location = self.require_location("check status")?;
        self.status_once(location, "Status Request".to_string(), "Status Response".to_string())
            .await
    }

    async fn status_once(
        &mut self,
        location: String,
        request_label: String,
        response_label: String,
    ) -> Result<HttpResponse> {
        let request = self.prepare(RequestOptions::new().url(location)).await?;
        self.job.poll_count += 1;
        self.job.status_request = Some(request.clone());
        let response = self.exchange(request, &request_label, &response_label).await?;
        self.job.status_response = Some(response.clone());
        Ok(response)
    }

    /// Poll until the server stops answering 202
    ///
    /// Every attempt is logged with its ordinal. Between attempts the client
    /// sleeps for the configured backoff of the current poll count.
    pub async fn wait_for_completion(&mut self) -> Result<HttpResponse> {
        let location = self.require_location("wait for export")?;
        loop {
            let attempt = self.job.poll_count + 1;
            let response = self
                .status_once(
                    location.clone(),
                    format!("Status Request {}", attempt),
                    format!("Status Response {}", attempt),
                )
                .await?;
            if response.status != 202 {
                return Ok(response);
            }
            let delay = self.settings.polling.delay(self.job.poll_count);
            tracing::info!(
                "Export in progress, polling again in {}ms (attempt {})",
                delay.as_millis(),
                self.job.poll_count
            );
            self.sleeper.sleep(delay).await;
        }
    }

    /// Cancel the current job with a DELETE to its status URL
    pub async fn cancel(&mut self) -> Result<HttpResponse> {
        let location = self.require_location("cancel")?;
        let request = self
            .prepare(RequestOptions::new().method(Method::Delete).url(location))
            .await?;
        self.job.cancel_request = Some(request.clone());
        let response = self
            .exchange(request, "Cancellation Request", "Cancellation Response")
            .await?;
        self.job.cancel_response = Some(response.clone());
        Ok(response)
    }

    /// Cancel the current job if the server accepted one; otherwise do nothing
    pub async fn cancel_if_started(&mut self) -> Result<Option<HttpResponse>> {
        if self.job.is_accepted() {
            self.cancel().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Final status response, running a full export first if there is none
    pub async fn export_response(&mut self) -> Result<HttpResponse> {
        if let Some(response) = &self.job.status_response {
            if response.status != 202 {
                return Ok(response.clone());
            }
        }
        if self.job.kick_off_response.is_none() {
            self.kick_off(RequestOptions::new()).await?;
        }
        self.wait_for_completion().await
    }

    /// Parsed manifest of the completed job
    pub async fn manifest(&mut self) -> Result<Manifest> {
        let response = self.export_response().await?;
        if response.status != 200 {
            return Err(Error::Remote(describe_failure(&response)));
        }
        serde_json::from_str(&response.body).map_err(|e| {
            Error::Protocol(format!(
                "The status response body is not a valid manifest: {}",
                e
            ))
        })
    }

    /// Download the file listed at `output[index]` of the manifest
    pub async fn download_file_at(&mut self, index: usize, skip_auth: bool) -> Result<HttpResponse> {
        let response = self.export_response().await?;
        if !response.is_success() {
            return Err(Error::Remote(describe_failure(&response)));
        }
        let url = response
            .json()
            .and_then(|json| {
                json.get("output")?
                    .get(index)?
                    .get("url")?
                    .as_str()
                    .map(str::to_string)
            })
            .ok_or(Error::MissingOutputFile(index))?;
        self.download_file(&url, skip_auth).await
    }

    /// Download one file; `skip_auth` leaves out the Authorization header
    pub async fn download_file(&mut self, url: &str, skip_auth: bool) -> Result<HttpResponse> {
        let mut options = RequestOptions::new().url(url).header("Accept", FHIR_JSON);
        if skip_auth {
            options = options.omit_header("Authorization");
        }
        self.request(options, "Download Request", "Download Response")
            .await
    }

    fn kick_off_response(&self, action: &str) -> Result<&HttpResponse> {
        self.job.kick_off_response.as_ref().ok_or_else(|| {
            Error::Protocol(format!("Trying to {} but there was no kick-off response", action))
        })
    }

    /// Assert that the kick-off was rejected with an OperationOutcome
    pub fn expect_failed_kick_off(&self) -> Result<()> {
        let response = self.kick_off_response("verify a failed kick-off")?;
        if response.status < 400 {
            return Err(Error::TestAssertion(format!(
                "The kick-off request was expected to fail but the server replied {} {}",
                response.status, response.status_text
            )));
        }
        expect_operation_outcome(
            response,
            "In case of error the server should return an OperationOutcome.",
        )
    }

    /// Assert that the kick-off was accepted with a status URL
    pub fn expect_successful_kick_off(&self) -> Result<()> {
        let response = self.kick_off_response("verify a successful kick-off")?;
        if response.status != 202 {
            return Err(Error::TestAssertion(format!(
                "The kick-off request was expected to succeed and return a 202 status code. {}",
                describe_failure(response)
            )));
        }
        if response.header("content-location").is_none() {
            return Err(Error::TestAssertion(
                "The kick-off response must include a content-location header".to_string(),
            ));
        }
        if !response.body.trim().is_empty() {
            expect_operation_outcome(response, "")?;
        }
        Ok(())
    }
}
