//! Export workflow against a scripted server

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bdt::bulk::{AssertionClaims, AuthMethod, JwtSigner, RequestOptions};
use bdt::common::config::{AuthType, SigningAlgorithm};
use bdt::http::Method;
use bdt::testing::{Decoration, MASKED_TOKEN};
use bdt::{Error, Settings};

use common::{accepted, api, client, manifest, response, settings, with_json, RecordingSleeper, ScriptedTransport};

#[tokio::test]
async fn test_wait_for_completion_backs_off() {
    let transport = ScriptedTransport::new([
        accepted(),
        response(202, "Accepted"),
        response(202, "Accepted"),
        response(202, "Accepted"),
        manifest(1),
    ]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    client.kick_off(RequestOptions::new()).await.unwrap();
    let done = client.wait_for_completion().await.unwrap();

    assert_eq!(done.status, 200);
    assert_eq!(client.job().poll_count, 4);
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(4)
        ]
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 5);
    assert!(requests[1..].iter().all(|r| r.url == common::STATUS_URL));

    let record = api.snapshot();
    for label in ["Kick-off Request", "Status Request 1", "Status Response 4"] {
        assert!(record.decorations.contains_key(label), "missing {}", label);
    }
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let mut responses = vec![accepted()];
    responses.extend(std::iter::repeat_with(|| response(202, "Accepted")).take(12));
    responses.push(manifest(0));
    let transport = ScriptedTransport::new(responses);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    client.kick_off(RequestOptions::new()).await.unwrap();
    client.wait_for_completion().await.unwrap();

    let delays = sleeper.delays();
    assert_eq!(delays.len(), 12);
    assert_eq!(delays[8], Duration::from_secs(10));
    assert_eq!(delays[11], Duration::from_secs(10));
}

#[tokio::test]
async fn test_kick_off_sends_default_headers() {
    let transport = ScriptedTransport::new([accepted()]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    client.kick_off(RequestOptions::new()).await.unwrap();
    client.expect_successful_kick_off().unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.url, "https://bulk.example.org/fhir/$export");
    assert_eq!(request.header("accept"), Some("application/fhir+json"));
    assert_eq!(request.header("prefer"), Some("respond-async"));
    assert!(request.verify_tls);
}

#[tokio::test]
async fn test_omitted_headers_are_removed() {
    let transport = ScriptedTransport::new([response(400, "Bad Request")]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper).with_access_token("secret");

    client
        .kick_off(
            RequestOptions::new()
                .omit_header("Accept")
                .omit_header("Authorization"),
        )
        .await
        .unwrap();

    let request = &transport.requests()[0];
    assert!(request.header("accept").is_none());
    assert!(request.header("authorization").is_none());
    assert_eq!(request.header("prefer"), Some("respond-async"));
}

#[tokio::test]
async fn test_bearer_token_is_masked_in_log() {
    let transport = ScriptedTransport::new([accepted()]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper).with_access_token("secret");

    client.kick_off(RequestOptions::new()).await.unwrap();

    assert_eq!(
        transport.requests()[0].header("authorization"),
        Some("Bearer secret")
    );
    match api.snapshot().decorations.get("Kick-off Request") {
        Some(Decoration::Request { headers, .. }) => {
            assert_eq!(headers["authorization"], format!("Bearer {}", MASKED_TOKEN));
        }
        other => panic!("Expected a logged request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_and_cancel_require_kick_off() {
    let transport = ScriptedTransport::new(std::iter::empty());
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    let err = client.cancel().await.unwrap_err();
    assert!(err.is_protocol());
    assert!(err.to_string().contains("Trying to cancel but there was no kick-off response"));

    let err = client.poll_status().await.unwrap_err();
    assert!(err.is_protocol());

    assert!(client.cancel_if_started().await.unwrap().is_none());
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_missing_location_is_reported() {
    let rejected = with_json(
        response(400, "Bad Request"),
        serde_json::json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid", "details": {"text": "Unsupported _type"}}]
        }),
    );
    let transport = ScriptedTransport::new([rejected]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    client.kick_off(RequestOptions::new()).await.unwrap();
    client.expect_failed_kick_off().unwrap();
    assert!(client.expect_successful_kick_off().is_err());
    assert!(client.cancel_if_started().await.unwrap().is_none());

    let err = client.wait_for_completion().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("did not include a content-location header"));
    assert!(message.contains("Unsupported _type"));
}

#[tokio::test]
async fn test_cancel_sends_delete_to_status_url() {
    let transport = ScriptedTransport::new([accepted(), response(202, "Accepted")]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    client.kick_off(RequestOptions::new()).await.unwrap();
    let canceled = client.cancel_if_started().await.unwrap().unwrap();
    assert_eq!(canceled.status, 202);

    let request = &transport.requests()[1];
    assert_eq!(request.method, Method::Delete);
    assert_eq!(request.url, common::STATUS_URL);
    assert!(api.snapshot().decorations.contains_key("Cancellation Response"));
}

#[tokio::test]
async fn test_download_missing_index() {
    let transport = ScriptedTransport::new([accepted(), manifest(2)]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper);

    let err = client.download_file_at(5, false).await.unwrap_err();
    assert!(matches!(err, Error::MissingOutputFile(5)));
    assert!(err.to_string().contains("output[5]"));
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_download_file_at_reuses_completed_export() {
    let transport = ScriptedTransport::new([
        accepted(),
        manifest(2),
        common::with_header(response(200, "OK"), "content-type", "application/fhir+ndjson"),
        common::with_header(response(200, "OK"), "content-type", "application/fhir+ndjson"),
    ]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let mut client = client(settings(), &api, &transport, &sleeper).with_access_token("secret");

    let first = client.download_file_at(1, false).await.unwrap();
    assert_eq!(first.url, "https://bulk.example.org/files/1.ndjson");
    let second = client.download_file_at(0, true).await.unwrap();
    assert_eq!(second.url, "https://bulk.example.org/files/0.ndjson");

    let requests = transport.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[2].header("authorization"), Some("Bearer secret"));
    assert!(requests[3].header("authorization").is_none());

    let manifest = client.manifest().await.unwrap();
    assert_eq!(manifest.output.len(), 2);
}

#[tokio::test]
async fn test_token_is_fetched_once_and_cached() {
    let token = with_json(
        response(200, "OK"),
        serde_json::json!({"access_token": "issued", "token_type": "bearer", "expires_in": 300}),
    );
    let transport = ScriptedTransport::new([token, accepted(), response(202, "Accepted")]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let settings = Settings {
        token_endpoint: Some("https://auth.example.org/token".into()),
        ..settings()
    };
    let mut client = client(settings, &api, &transport, &sleeper).with_auth(AuthMethod::ClientSecret {
        client_id: "tester".into(),
        client_secret: "s3cret".into(),
    });

    client.kick_off(RequestOptions::new()).await.unwrap();
    client.poll_status().await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].url, "https://auth.example.org/token");
    assert_eq!(requests[0].method, Method::Post);
    assert_eq!(requests[1].header("authorization"), Some("Bearer issued"));
    assert_eq!(requests[2].header("authorization"), Some("Bearer issued"));

    let record = api.snapshot();
    assert!(record.decorations.contains_key("Authorization Request"));
    assert!(record.decorations.contains_key("Authorization Response"));
}

#[tokio::test]
async fn test_signed_assertion_grant() {
    const TOKEN_ENDPOINT: &str = "https://auth.example.org/token";
    let token = with_json(
        response(200, "OK"),
        serde_json::json!({"access_token": "signed", "token_type": "bearer", "expires_in": 300}),
    );
    let transport = ScriptedTransport::new([token, accepted(), response(202, "Accepted")]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let settings = Settings {
        token_endpoint: Some(TOKEN_ENDPOINT.into()),
        ..settings()
    };
    let signer = JwtSigner::from_pem(SigningAlgorithm::ES384, include_bytes!("fixtures/es384.pem"))
        .unwrap()
        .with_key_id("ec-1");
    let mut client = client(settings, &api, &transport, &sleeper).with_auth(AuthMethod::SignedAssertion {
        client_id: "tester".into(),
        signer: Arc::new(signer),
    });

    client.kick_off(RequestOptions::new()).await.unwrap();
    client.poll_status().await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].url, TOKEN_ENDPOINT);
    assert!(requests[0].header("authorization").is_none());

    let form: BTreeMap<String, String> =
        serde_urlencoded::from_str(requests[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(form["grant_type"], "client_credentials");
    assert_eq!(
        form["client_assertion_type"],
        "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"
    );

    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES384);
    validation.set_audience(&[TOKEN_ENDPOINT]);
    let key = jsonwebtoken::DecodingKey::from_ec_pem(include_bytes!("fixtures/es384.pub.pem")).unwrap();
    let claims = jsonwebtoken::decode::<AssertionClaims>(&form["client_assertion"], &key, &validation)
        .unwrap()
        .claims;
    assert_eq!(claims.iss, "tester");

    // The token is requested once and reused
    assert_eq!(requests[1].header("authorization"), Some("Bearer signed"));
    assert_eq!(requests[2].header("authorization"), Some("Bearer signed"));
}

#[tokio::test]
async fn test_failed_token_exchange() {
    let denied = with_json(
        response(401, "Unauthorized"),
        serde_json::json!({"error": "invalid_client"}),
    );
    let transport = ScriptedTransport::new([denied]);
    let sleeper = RecordingSleeper::new();
    let api = api();
    let settings = Settings {
        token_endpoint: Some("https://auth.example.org/token".into()),
        auth_type: AuthType::ClientCredentials,
        client_id: Some("tester".into()),
        client_secret: Some("wrong".into()),
        strict_ssl: false,
        ..settings()
    };
    let mut client = bdt::bulk::BulkDataClient::new(Arc::new(settings), api.clone(), "$export")
        .unwrap()
        .with_transport(transport.clone())
        .with_sleeper(sleeper.clone());

    let err = client.authenticate(None).await.unwrap_err();
    assert!(matches!(err, Error::Authorization(_)));
    assert!(err.to_string().starts_with("Unable to authorize."));
    assert!(!transport.requests()[0].verify_tls);
}
