//! Caller side of the gate.
//!
//! [`GateClient`] signs a fresh access payload for every call and sends it to
//! `{base}/api/gate/{service}`. It is the Rust counterpart of a paid-API
//! guard: call [`GateClient::verify_access`] before serving work that costs
//! credits.
//!
//! ```no_run
//! # async fn demo(signer: std::sync::Arc<dyn ghostgate::access::AccessSigner>) -> Result<(), ghostgate_http::HttpError> {
//! use ghostgate_http::client::{GateClient, GateCall};
//!
//! let client = GateClient::from_env(signer)?;
//! let auth = client.authorize(GateCall::new("weather").with_cost(3)).await?;
//! assert!(auth.authorized);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ghostgate::access::{AccessPayload, AccessSigner, normalize_service};
use ghostgate::gate::Authorization;
use ghostgate::sync::SyncOutcome;
use ghostgate::{UnixTimestamp, WalletKey};
use http::header::{ACCEPT, HeaderMap, HeaderValue};
use rand::RngExt;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::constants::{
    ACCEPT_VALUE, BASE_URL_ENV, CREDIT_COST_HEADER, DEFAULT_BASE_URL, PAYLOAD_HEADER,
    REQUEST_ID_HEADER, SIGNATURE_HEADER,
};
use crate::error::{ErrorBody, HttpError};
use crate::types::{CreditsView, SyncRequest};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One gate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCall {
    /// Service slug.
    pub service: String,
    /// Declared cost, sent as `x-ghost-credit-cost`.
    pub cost: Option<u64>,
    /// Correlation id, sent as `x-ghost-request-id`.
    pub request_id: Option<String>,
    /// HTTP method; the gate accepts `GET` and `POST`.
    pub method: Method,
}

impl GateCall {
    /// A `GET` call for `service` without a declared cost.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cost: None,
            request_id: None,
            method: Method::GET,
        }
    }

    /// Declares the cost of this call.
    #[must_use]
    pub const fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Attaches a request id.
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Uses `method` instead of `GET`.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

/// HTTP client of a GhostGate gateway.
#[derive(Clone)]
pub struct GateClient {
    base_url: Url,
    http: reqwest::Client,
    signer: Arc<dyn AccessSigner>,
}

impl fmt::Debug for GateClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateClient")
            .field("base_url", &self.base_url.as_str())
            .field("signer", &self.signer.address())
            .finish_non_exhaustive()
    }
}

fn fresh_payload(service: &str) -> AccessPayload {
    let nonce: u128 = rand::rng().random();
    AccessPayload {
        service: normalize_service(service).to_owned(),
        timestamp: UnixTimestamp::now(),
        nonce: format!("{nonce:032x}"),
    }
}

fn header_value(value: &str, name: &'static str) -> Result<HeaderValue, HttpError> {
    HeaderValue::from_str(value).map_err(|_| HttpError::InvalidHeader(name))
}

impl GateClient {
    /// Creates a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidUrl`] for an unparsable URL and
    /// [`HttpError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, signer: Arc<dyn AccessSigner>) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            base_url: Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?,
            http,
            signer,
        })
    }

    /// Creates a client for `GHOST_GATE_BASE_URL`, or the public gateway.
    ///
    /// # Errors
    ///
    /// See [`GateClient::new`].
    pub fn from_env(signer: Arc<dyn AccessSigner>) -> Result<Self, HttpError> {
        let base = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        Self::new(&base, signer)
    }

    /// Replaces the underlying reqwest client.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// The gateway base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Address the gateway will charge.
    #[must_use]
    pub fn wallet(&self) -> WalletKey {
        WalletKey::from(self.signer.address())
    }

    /// Signs a fresh payload for `service` and returns the two access headers.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Signing`] if the signer fails.
    pub async fn access_headers(&self, service: &str) -> Result<HeaderMap, HttpError> {
        let payload = fresh_payload(service);
        let signature = self
            .signer
            .sign_access(&payload)
            .await
            .map_err(|e| HttpError::Signing(e.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, header_value(&signature, SIGNATURE_HEADER)?);
        headers.insert(
            PAYLOAD_HEADER,
            header_value(&serde_json::to_string(&payload)?, PAYLOAD_HEADER)?,
        );
        Ok(headers)
    }

    /// Asks the gateway to authorize and charge one call.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Rejected`] with the decoded body for any non-2xx
    /// answer, or a transport/signing error.
    pub async fn authorize(&self, call: GateCall) -> Result<Authorization, HttpError> {
        let service = normalize_service(&call.service);
        let mut headers = self.access_headers(service).await?;
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        if let Some(cost) = call.cost {
            headers.insert(CREDIT_COST_HEADER, HeaderValue::from(cost));
        }
        if let Some(id) = &call.request_id {
            headers.insert(REQUEST_ID_HEADER, header_value(id, REQUEST_ID_HEADER)?);
        }
        let url = self.base_url.join(&format!("api/gate/{service}"))?;
        #[cfg(feature = "telemetry")]
        tracing::debug!(%url, cost = ?call.cost, "requesting gate authorization");
        let response = self
            .http
            .request(call.method, url)
            .headers(headers)
            .send()
            .await?;
        decode(response).await
    }

    /// `true` only if the gateway granted the call.
    ///
    /// Every failure, including transport errors and `402`, reads as a
    /// denial.
    pub async fn verify_access(&self, service: &str, cost: u64) -> bool {
        match self.authorize(GateCall::new(service).with_cost(cost)).await {
            Ok(auth) => auth.authorized,
            Err(_err) => {
                #[cfg(feature = "telemetry")]
                tracing::info!(service, "gate denied access: {_err}");
                false
            }
        }
    }

    /// Triggers one sync pass for `wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Rejected`] for non-2xx answers.
    pub async fn sync(&self, wallet: &WalletKey) -> Result<SyncOutcome, HttpError> {
        let url = self.base_url.join("api/sync")?;
        let body = SyncRequest {
            wallet: wallet.clone(),
        };
        let response = self.http.post(url).json(&body).send().await?;
        decode(response).await
    }

    /// Reads the balance of `wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Rejected`] for non-2xx answers.
    pub async fn credits(&self, wallet: &WalletKey) -> Result<CreditsView, HttpError> {
        let url = self.base_url.join(&format!("api/credits/{wallet}"))?;
        let response = self.http.get(url).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, HttpError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let body = serde_json::from_slice::<ErrorBody>(&bytes).unwrap_or_else(|_| {
        ErrorBody::new(
            String::from_utf8_lossy(&bytes).into_owned(),
            status.canonical_reason().unwrap_or("HTTP_ERROR"),
        )
    });
    Err(HttpError::Rejected {
        status: status.as_u16(),
        body,
    })
}
