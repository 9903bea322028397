//! Built-in bulk data conformance catalog
//!
//! Every test creates its own [`BulkDataClient`], so job state never leaks
//! between tests. Tests that start an export cancel it before returning.

use std::sync::Arc;

use crate::bulk::{describe_failure, BulkDataClient, RequestOptions};
use crate::common::{Error, Result, Settings};
use crate::testing::{GroupBuilder, TestApi, TestTree};

/// Export levels a server may support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportLevel {
    System,
    Patient,
    Group,
}

impl ExportLevel {
    pub const ALL: [ExportLevel; 3] = [ExportLevel::System, ExportLevel::Patient, ExportLevel::Group];

    pub fn label(self) -> &'static str {
        match self {
            ExportLevel::System => "System-level export",
            ExportLevel::Patient => "Patient-level export",
            ExportLevel::Group => "Group-level export",
        }
    }

    /// Configured kick-off endpoint, if the server supports this level
    pub fn endpoint(self, settings: &Settings) -> Option<&str> {
        match self {
            ExportLevel::System => settings.system_export_endpoint.as_deref(),
            ExportLevel::Patient => settings.patient_export_endpoint.as_deref(),
            ExportLevel::Group => settings.group_export_endpoint.as_deref(),
        }
    }
}

/// The full conformance catalog
pub fn catalog() -> TestTree {
    TestTree::build(|root| {
        for level in ExportLevel::ALL {
            root.group(level.label(), |group| kick_off_tests(group, level));
        }

        root.group("Status", |group| {
            group.test("completes with a manifest", |settings, api| async move {
                let Some(mut client) = start_fastest_export(&settings, &api).await? else {
                    return Ok(());
                };
                let outcome = check_manifest(&mut client, &api).await;
                client.cancel_if_started().await?;
                outcome
            });
        });

        root.group("Download", |group| {
            group.test("downloads the first output file", |settings, api| async move {
                let Some(mut client) = start_fastest_export(&settings, &api).await? else {
                    return Ok(());
                };
                let response = client.download_file_at(0, false).await?;
                if response.status != 200 {
                    return Err(Error::Remote(describe_failure(&response)));
                }
                if !response.content_type().starts_with("application/fhir+ndjson") {
                    api.warn(format!(
                        "The file was served as \"{}\" instead of \"application/fhir+ndjson\"",
                        response.content_type()
                    ));
                }
                Ok(())
            });
        });

        root.group("Cancellation", |group| {
            group.test("cancels an export in progress", |settings, api| async move {
                let Some(mut client) = start_fastest_export(&settings, &api).await? else {
                    return Ok(());
                };
                client.expect_successful_kick_off()?;
                let response = client.cancel().await?;
                if response.status != 202 {
                    return Err(Error::TestAssertion(format!(
                        "The cancellation request was expected to return 202. {}",
                        describe_failure(&response)
                    )));
                }
                let response = client.poll_status().await?;
                if response.status != 404 {
                    return Err(Error::TestAssertion(format!(
                        "A canceled export should no longer be found. {}",
                        describe_failure(&response)
                    )));
                }
                Ok(())
            });
            group.pending("honors the Retry-After header while polling");
        });
    })
}

fn kick_off_tests(group: &mut GroupBuilder<'_>, level: ExportLevel) {
    group.test("accepts a valid request", move |settings, api| async move {
        let Some(mut client) = client_for(&settings, &api, level)? else {
            return Ok(());
        };
        client.kick_off(RequestOptions::new()).await?;
        let outcome = client.expect_successful_kick_off();
        client.cancel_if_started().await?;
        outcome
    });

    group.test("requires the Accept header", move |settings, api| async move {
        api.decorate_html(
            "info",
            "<p>A kick-off request without <code>Accept: application/fhir+json</code> \
             should be rejected with an OperationOutcome.</p>",
            None,
        );
        let Some(mut client) = client_for(&settings, &api, level)? else {
            return Ok(());
        };
        client
            .kick_off(RequestOptions::new().omit_header("accept"))
            .await?;
        let outcome = client.expect_failed_kick_off();
        client.cancel_if_started().await?;
        outcome
    });

    group.test("requires Prefer: respond-async", move |settings, api| async move {
        let Some(mut client) = client_for(&settings, &api, level)? else {
            return Ok(());
        };
        client
            .kick_off(RequestOptions::new().omit_header("prefer"))
            .await?;
        let outcome = client.expect_failed_kick_off();
        client.cancel_if_started().await?;
        outcome
    });
}

/// Client for `level`, or `None` after marking the test not-supported
fn client_for(settings: &Arc<Settings>, api: &TestApi, level: ExportLevel) -> Result<Option<BulkDataClient>> {
    match level.endpoint(settings) {
        Some(endpoint) => BulkDataClient::new(Arc::clone(settings), api.clone(), endpoint).map(Some),
        None => {
            let message = format!("{} is not supported by this server", level.label());
            api.set_not_supported(Some(message.as_str()));
            Ok(None)
        }
    }
}

/// Client for the first supported level, already kicked off for the fastest
/// resource type
async fn start_fastest_export(settings: &Arc<Settings>, api: &TestApi) -> Result<Option<BulkDataClient>> {
    let Some(level) = ExportLevel::ALL
        .into_iter()
        .find(|level| level.endpoint(settings).is_some())
    else {
        api.set_not_supported(Some("No export endpoint is configured"));
        return Ok(None);
    };
    let Some(mut client) = client_for(settings, api, level)? else {
        return Ok(None);
    };
    let url = with_type_filter(client.kick_off_url(), &settings.fastest_resource)?;
    client.kick_off(RequestOptions::new().url(url)).await?;
    Ok(Some(client))
}

/// `kick_off_url` with a `_type` parameter appended to its query
fn with_type_filter(kick_off_url: &str, resource_type: &str) -> Result<String> {
    let mut url = url::Url::parse(kick_off_url).map_err(|e| Error::invalid_url(kick_off_url, e))?;
    url.query_pairs_mut().append_pair("_type", resource_type);
    Ok(url.into())
}

async fn check_manifest(client: &mut BulkDataClient, api: &TestApi) -> Result<()> {
    client.expect_successful_kick_off()?;
    let manifest = client.manifest().await?;
    if manifest.transaction_time.is_none() {
        return Err(Error::TestAssertion(
            "The manifest must include a transactionTime".to_string(),
        ));
    }
    if manifest.request.is_none() {
        return Err(Error::TestAssertion(
            "The manifest must include the original request URL".to_string(),
        ));
    }
    api.decorate("Output files", manifest.output.len().to_string());
    Ok(())
}
