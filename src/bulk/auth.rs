//! Access token acquisition
//!
//! Two grants are supported:
//! - client credentials with a pre-shared secret, sent as HTTP Basic
//! - a client assertion JWT signed with the client's private key
//!   (`client_credentials` grant with `client_assertion`), using RS384,
//!   ES384 or EdDSA

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::common::config::{AuthType, SigningAlgorithm};
use crate::common::{Error, Result, Settings};
use crate::http::{HttpRequest, HttpResponse, Method};

use super::diagnostics::describe_failure;

/// `client_assertion_type` for JWT bearer assertions
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a signed assertion
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Claims of a client assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    /// The token endpoint
    pub aud: String,
    pub exp: i64,
    pub jti: String,
}

impl AssertionClaims {
    /// Claims binding `client_id` to `token_endpoint`
    pub fn new(client_id: &str, token_endpoint: &str, now: DateTime<Utc>) -> Self {
        Self {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_endpoint.to_string(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Produces a signed assertion from claims
pub trait AssertionSigner: Send + Sync {
    /// Compact JWS serialization of the signed claims
    fn sign(&self, claims: &AssertionClaims) -> Result<String>;
}

/// Signs assertions with an Ed25519 key (`alg: EdDSA`)
pub struct Ed25519Signer {
    key: SigningKey,
    kid: Option<String>,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key, kid: None }
    }

    /// Set the `kid` header
    pub fn with_key_id(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Load a key file holding either 32 raw bytes or their base64 encoding
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_key_bytes(&bytes)
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        let invalid = || Error::Signing("private key must be 32 raw bytes or base64 of them".to_string());
        if bytes.len() == 32 {
            let key: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
            return Ok(Self::new(SigningKey::from_bytes(&key)));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| invalid())?;
        let decoded = BASE64.decode(text.trim().as_bytes()).map_err(|_| invalid())?;
        let key: [u8; 32] = decoded.as_slice().try_into().map_err(|_| invalid())?;
        Ok(Self::new(SigningKey::from_bytes(&key)))
    }
}

impl AssertionSigner for Ed25519Signer {
    fn sign(&self, claims: &AssertionClaims) -> Result<String> {
        let mut header = serde_json::json!({ "alg": "EdDSA", "typ": "JWT" });
        if let Some(kid) = &self.kid {
            header["kid"] = serde_json::Value::String(kid.clone());
        }
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Signs assertions with an RSA or EC PEM key (`alg: RS384` or `ES384`)
pub struct JwtSigner {
    key: EncodingKey,
    header: Header,
}

impl JwtSigner {
    /// Parse a PEM private key for `algorithm`
    pub fn from_pem(algorithm: SigningAlgorithm, pem: &[u8]) -> Result<Self> {
        let (algorithm, key) = match algorithm {
            SigningAlgorithm::RS384 => (Algorithm::RS384, EncodingKey::from_rsa_pem(pem)),
            SigningAlgorithm::ES384 => (Algorithm::ES384, EncodingKey::from_ec_pem(pem)),
            SigningAlgorithm::EdDSA => {
                return Err(Error::Signing(
                    "EdDSA keys are loaded with Ed25519Signer".to_string(),
                ))
            }
        };
        let key = key.map_err(|e| Error::Signing(format!("Invalid {:?} private key: {}", algorithm, e)))?;
        Ok(Self {
            key,
            header: Header::new(algorithm),
        })
    }

    /// Set the `kid` header
    pub fn with_key_id(mut self, kid: impl Into<String>) -> Self {
        self.header.kid = Some(kid.into());
        self
    }
}

impl AssertionSigner for JwtSigner {
    fn sign(&self, claims: &AssertionClaims) -> Result<String> {
        jsonwebtoken::encode(&self.header, claims, &self.key)
            .map_err(|e| Error::Signing(format!("Failed to sign the client assertion: {}", e)))
    }
}

/// Load the signer for `algorithm` from the key file at `path`
pub fn load_signer(algorithm: SigningAlgorithm, path: &Path, kid: Option<&str>) -> Result<Arc<dyn AssertionSigner>> {
    if algorithm == SigningAlgorithm::EdDSA {
        let mut signer = Ed25519Signer::load(path)?;
        if let Some(kid) = kid {
            signer = signer.with_key_id(kid);
        }
        return Ok(Arc::new(signer));
    }

    let pem = std::fs::read(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let mut signer = JwtSigner::from_pem(algorithm, &pem)?;
    if let Some(kid) = kid {
        signer = signer.with_key_id(kid);
    }
    Ok(Arc::new(signer))
}

/// How a client obtains its token
#[derive(Clone)]
pub enum AuthMethod {
    /// No token exchange
    None,
    /// HTTP Basic with a pre-shared secret
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
    /// Signed client assertion
    SignedAssertion {
        client_id: String,
        signer: Arc<dyn AssertionSigner>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::ClientSecret { client_id, .. } => {
                f.debug_struct("ClientSecret").field("client_id", client_id).finish()
            }
            AuthMethod::SignedAssertion { client_id, .. } => {
                f.debug_struct("SignedAssertion").field("client_id", client_id).finish()
            }
        }
    }
}

impl AuthMethod {
    /// Build the method described by the settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match settings.auth_type {
            AuthType::None => Ok(AuthMethod::None),
            AuthType::ClientCredentials => {
                let client_id = required(&settings.client_id, "client_id")?;
                let client_secret = settings.client_secret.clone().ok_or_else(|| {
                    Error::Config(
                        "A client_secret is needed for client-credentials authentication".to_string(),
                    )
                })?;
                Ok(AuthMethod::ClientSecret {
                    client_id,
                    client_secret,
                })
            }
            AuthType::BackendServices => {
                let client_id = required(&settings.client_id, "client_id")?;
                let key_path = settings.private_key.as_deref().ok_or_else(|| {
                    Error::Config(
                        "A private_key is needed for backend-services authentication".to_string(),
                    )
                })?;
                Ok(AuthMethod::SignedAssertion {
                    client_id,
                    signer: load_signer(settings.signing_algorithm, key_path, settings.key_id.as_deref())?,
                })
            }
        }
    }

    /// Build the token request for `scope`
    pub fn token_request(&self, token_endpoint: &str, scope: &str, verify_tls: bool) -> Result<HttpRequest> {
        let (authorization, form) = match self {
            AuthMethod::None => {
                return Err(Error::Authorization(
                    "This server does not support authentication (according to the auth_type option)."
                        .to_string(),
                ))
            }
            AuthMethod::ClientSecret {
                client_id,
                client_secret,
            } => {
                let credentials = BASE64.encode(format!("{}:{}", client_id, client_secret));
                (
                    Some(format!("Basic {}", credentials)),
                    vec![
                        ("grant_type", "client_credentials".to_string()),
                        ("scope", scope.to_string()),
                    ],
                )
            }
            AuthMethod::SignedAssertion { client_id, signer } => {
                let claims = AssertionClaims::new(client_id, token_endpoint, Utc::now());
                (
                    None,
                    vec![
                        ("scope", scope.to_string()),
                        ("grant_type", "client_credentials".to_string()),
                        ("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()),
                        ("client_assertion", signer.sign(&claims)?),
                    ],
                )
            }
        };

        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| Error::Internal(format!("Failed to encode form: {}", e)))?;
        let mut request = HttpRequest::new(Method::Post, token_endpoint)
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Accept", "application/json")
            .with_body(body);
        if let Some(authorization) = authorization {
            request = request.with_header("Authorization", authorization);
        }
        request.verify_tls = verify_tls;
        Ok(request)
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("The {} option is required for authentication", name)))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Extract the access token from a token endpoint response
pub fn parse_token_response(response: &HttpResponse) -> Result<String> {
    response
        .json()
        .and_then(|json| serde_json::from_value::<TokenResponse>(json).ok())
        .and_then(|token| token.access_token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Authorization(describe_failure(response)))
}
