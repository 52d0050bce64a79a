use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::common::error::GatewayError;

/// Resolves session identifiers issued by the identity service into user names.
pub trait IdentityService: Send + Sync {
    fn user_name<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, crate::Result<String>>;
}

pub type IdentityRef = Arc<dyn IdentityService>;

/// Resolves an optional session id, treating a missing one as a parameter error.
pub async fn resolve_user(
    identity: &dyn IdentityService,
    session_id: Option<&str>,
) -> crate::Result<String> {
    match session_id {
        Some(session_id) if !session_id.is_empty() => identity.user_name(session_id).await,
        _ => Err(GatewayError::ParameterError(
            "No sessionId was specified".to_string(),
        )),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    user_name: String,
}

#[derive(Deserialize)]
struct FaultResponse {
    code: String,
    message: String,
}

/// Client of the ICAT REST interface.
pub struct IcatClient {
    url: String,
    client: reqwest::Client,
}

impl IcatClient {
    pub fn new(url: &str, trust_store: Option<&Path>) -> crate::Result<Self> {
        let parsed = reqwest::Url::parse(url).map_err(|error| {
            GatewayError::ParameterError(format!("Invalid ICAT url {url}: {error}"))
        })?;
        if parsed.cannot_be_a_base() {
            return Err(GatewayError::ParameterError(format!(
                "Invalid ICAT url {url}"
            )));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(path) = trust_store {
            let pem = std::fs::read(path)?;
            let certificates = reqwest::Certificate::from_pem_bundle(&pem).map_err(|error| {
                GatewayError::InternalError(format!(
                    "Cannot load trust store {}: {error}",
                    path.display()
                ))
            })?;
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }
        let client = builder.build().map_err(|error| {
            GatewayError::InternalError(format!("Cannot create ICAT client: {error}"))
        })?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn fetch_user_name(&self, session_id: &str) -> crate::Result<String> {
        let session: String = form_urlencoded::byte_serialize(session_id.as_bytes()).collect();
        let url = format!("{}/icat/session/{session}", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| GatewayError::InternalError(format!("ICAT is unreachable: {error}")))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|error| {
            GatewayError::InternalError(format!("Cannot read ICAT response: {error}"))
        })?;
        if status.is_success() {
            let session: SessionResponse = serde_json::from_slice(&body)?;
            return Ok(session.user_name);
        }

        match serde_json::from_slice::<FaultResponse>(&body) {
            Ok(fault) if fault.code == "SESSION" => Err(GatewayError::SessionError(fault.message)),
            Ok(fault) => Err(GatewayError::ParameterError(fault.message)),
            Err(_) => Err(GatewayError::InternalError(format!(
                "ICAT answered with status {status}"
            ))),
        }
    }
}

impl IdentityService for IcatClient {
    fn user_name<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, crate::Result<String>> {
        Box::pin(self.fetch_user_name(session_id))
    }
}
