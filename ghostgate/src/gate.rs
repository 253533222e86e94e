//! The gate authorizer.
//!
//! A protected request moves through
//!
//! ```text
//! RECEIVED → HEADERS_PARSED → PAYLOAD_VALIDATED → SIGNATURE_VERIFIED
//!   → FRESHNESS_CHECKED → COST_RESOLVED → BALANCE_CHECKED
//!   → DEBITED_AND_NONCE_RECORDED → AUTHORIZED
//! ```
//!
//! Any failing transition is terminal. Nothing is mutated before
//! `COST_RESOLVED`; the balance check, debit, nonce record and ledger entry
//! then happen in one [`CreditStore::debit`] unit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::{
    AccessPayload, DEFAULT_REPLAY_WINDOW, FreshnessGuard, SignatureVerifier, normalize_service,
};
use crate::error::GateError;
use crate::ledger::{DebitContext, ReplayAttempt};
use crate::nonce::NonceClaim;
use crate::pricing::{CostPolicy, CostSource};
use crate::store::{CreditStore, StoreError};
use crate::timestamp::UnixTimestamp;
use crate::wallet::WalletKey;

/// Longest accepted request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// States of the authorization protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GateStage {
    /// Request accepted by the transport.
    Received,
    /// Signature and payload headers are present.
    HeadersParsed,
    /// Payload JSON is well formed and names the requested service.
    PayloadValidated,
    /// The signer has been recovered.
    SignatureVerified,
    /// The payload is inside the replay window.
    FreshnessChecked,
    /// The request cost is known.
    CostResolved,
    /// The balance covers the cost.
    BalanceChecked,
    /// Debit, nonce and ledger entry are committed.
    DebitedAndNonceRecorded,
    /// The request may proceed.
    Authorized,
}

impl GateStage {
    /// Upper-snake label used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::HeadersParsed => "HEADERS_PARSED",
            Self::PayloadValidated => "PAYLOAD_VALIDATED",
            Self::SignatureVerified => "SIGNATURE_VERIFIED",
            Self::FreshnessChecked => "FRESHNESS_CHECKED",
            Self::CostResolved => "COST_RESOLVED",
            Self::BalanceChecked => "BALANCE_CHECKED",
            Self::DebitedAndNonceRecorded => "DEBITED_AND_NONCE_RECORDED",
            Self::Authorized => "AUTHORIZED",
        }
    }
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GateError {
    /// The last stage reached before this error ended the request.
    ///
    /// `None` for storage failures, which can occur at more than one stage.
    #[must_use]
    pub const fn reached_stage(&self) -> Option<GateStage> {
        match self {
            Self::MissingHeaders(_) => Some(GateStage::Received),
            Self::MalformedPayload(_) | Self::InvalidRequestId(_) => Some(GateStage::HeadersParsed),
            Self::ServiceMismatch { .. } => Some(GateStage::HeadersParsed),
            Self::InvalidSignature(_) => Some(GateStage::PayloadValidated),
            Self::SignatureExpired(_) => Some(GateStage::SignatureVerified),
            Self::InvalidCost(_) => Some(GateStage::FreshnessChecked),
            Self::InsufficientCredits { .. } | Self::ReplayDetected { .. } => {
                Some(GateStage::CostResolved)
            }
            Self::Internal(_) => None,
        }
    }
}

/// Gate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    /// Maximum payload age in seconds.
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: u64,
    /// Cost resolution.
    #[serde(default)]
    pub cost: CostPolicy,
}

const fn default_replay_window_secs() -> u64 {
    DEFAULT_REPLAY_WINDOW.as_secs()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: default_replay_window_secs(),
            cost: CostPolicy::default(),
        }
    }
}

/// The transport-independent inputs of one protected request.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    /// Service slug from the request path.
    pub service: String,
    /// Hex signature header.
    pub signature: Option<String>,
    /// Access payload JSON header.
    pub payload: Option<String>,
    /// Client declared cost header.
    pub credit_cost: Option<String>,
    /// Client supplied request id.
    pub request_id: Option<String>,
}

/// A granted authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// Always `true`.
    pub authorized: bool,
    /// Normalized service slug.
    pub service: String,
    /// Recovered signer.
    pub signer: WalletKey,
    /// Credits charged.
    pub cost: u64,
    /// Balance after the debit.
    pub remaining_credits: u64,
    /// Whether the nonce was recorded.
    pub nonce_accepted: bool,
    /// Echo of the request id, if one was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Tier that produced the cost.
    pub cost_source: CostSource,
}

/// Composes verification, freshness, cost resolution and the atomic debit.
#[derive(Clone)]
pub struct GateAuthorizer {
    store: Arc<dyn CreditStore>,
    verifier: Arc<dyn SignatureVerifier>,
    freshness: FreshnessGuard,
    cost: CostPolicy,
}

impl fmt::Debug for GateAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateAuthorizer")
            .field("freshness", &self.freshness)
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, GateError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(GateError::MissingHeaders(name))
}

fn validate_request_id(raw: Option<&str>) -> Result<Option<String>, GateError> {
    let Some(id) = raw.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    if id.len() > MAX_REQUEST_ID_LEN {
        return Err(GateError::InvalidRequestId(format!(
            "longer than {MAX_REQUEST_ID_LEN} characters"
        )));
    }
    if !id.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(GateError::InvalidRequestId(
            "contains non-printable characters".into(),
        ));
    }
    Ok(Some(id.to_owned()))
}

#[cfg(feature = "telemetry")]
fn log_outcome(request: &GateRequest, result: &Result<Authorization, GateError>) {
    match result {
        Ok(auth) => tracing::info!(
            service = %auth.service,
            signer = %auth.signer,
            cost = auth.cost,
            remaining = auth.remaining_credits,
            "gate authorized"
        ),
        Err(GateError::Internal(detail)) => {
            tracing::error!(service = %request.service, %detail, "gate storage failure");
        }
        Err(err) => tracing::info!(
            service = %request.service,
            code = err.code(),
            stage = ?err.reached_stage(),
            "gate rejected: {err}"
        ),
    }
}

impl GateAuthorizer {
    /// Creates an authorizer.
    #[must_use]
    pub fn new(
        store: Arc<dyn CreditStore>,
        verifier: Arc<dyn SignatureVerifier>,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            freshness: FreshnessGuard::new(Duration::from_secs(config.replay_window_secs)),
            cost: config.cost,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CreditStore> {
        &self.store
    }

    /// Authorizes a request against the current clock.
    ///
    /// # Errors
    ///
    /// Returns the [`GateError`] of the first failing stage.
    pub async fn authorize(&self, request: &GateRequest) -> Result<Authorization, GateError> {
        self.authorize_at(request, UnixTimestamp::now()).await
    }

    /// Authorizes a request against an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the [`GateError`] of the first failing stage.
    pub async fn authorize_at(
        &self,
        request: &GateRequest,
        now: UnixTimestamp,
    ) -> Result<Authorization, GateError> {
        let result = self.run(request, now).await;
        #[cfg(feature = "telemetry")]
        log_outcome(request, &result);
        result
    }

    async fn run(
        &self,
        request: &GateRequest,
        now: UnixTimestamp,
    ) -> Result<Authorization, GateError> {
        let signature = required(request.signature.as_deref(), "signature")?;
        let raw_payload = required(request.payload.as_deref(), "payload")?;
        let request_id = validate_request_id(request.request_id.as_deref())?;

        let payload = AccessPayload::parse(raw_payload)?;
        let service = normalize_service(&request.service);
        if payload.normalized_service() != service {
            return Err(GateError::ServiceMismatch {
                requested: service.to_owned(),
                signed: payload.service.clone(),
            });
        }

        let signer = WalletKey::from(self.verifier.recover_signer(&payload, signature)?);
        self.freshness.check(payload.timestamp, now)?;

        let pricing = self.store.pricing(service).await?;
        let (cost, cost_source) = self
            .cost
            .resolve(request.credit_cost.as_deref(), pricing.as_ref())?;

        let claim = NonceClaim {
            signer: signer.clone(),
            service: service.to_owned(),
            nonce: payload.nonce.clone(),
            payload_timestamp: payload.timestamp,
            signature: signature.to_owned(),
        };
        let context = DebitContext {
            reason: format!("gate:{service}"),
            service: Some(service.to_owned()),
            nonce: Some(claim),
            request_id: request_id.clone(),
            metadata: serde_json::json!({ "costSource": cost_source }),
        };
        let receipt = match self.store.debit(&signer, cost, context).await {
            Ok(receipt) => receipt,
            Err(err @ StoreError::ReplayDetected { .. }) => {
                self.note_replay(&signer, service, &payload.nonce, now).await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Authorization {
            authorized: true,
            service: service.to_owned(),
            signer,
            cost,
            remaining_credits: receipt.after,
            nonce_accepted: receipt.nonce_accepted,
            request_id,
            cost_source,
        })
    }

    async fn note_replay(&self, signer: &WalletKey, service: &str, nonce: &str, now: UnixTimestamp) {
        let attempt = ReplayAttempt {
            signer: signer.clone(),
            service: service.to_owned(),
            nonce: nonce.to_owned(),
            observed_at: now,
        };
        if let Err(_err) = self.store.record_replay(attempt).await {
            #[cfg(feature = "telemetry")]
            tracing::warn!(signer = %signer, error = %_err, "failed to record replay attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::*;
    use crate::access::InvalidSignature;
    use crate::ledger::LedgerDirection;
    use crate::pricing::{ClientCostPolicy, ServicePricing};
    use crate::store::{InMemoryCreditStore, StoreOptions};

    /// Treats the signature text as the signer's address.
    struct AddressAsSignature;

    impl SignatureVerifier for AddressAsSignature {
        fn recover_signer(
            &self,
            _payload: &AccessPayload,
            signature: &str,
        ) -> Result<Address, InvalidSignature> {
            signature
                .parse()
                .map_err(|_| InvalidSignature(format!("not an address: {signature}")))
        }
    }

    const NOW: u64 = 1_700_000_000;
    const SIGNER: &str = "0x00000000000000000000000000000000000000aa";

    fn request(service: &str, nonce: &str, timestamp: u64) -> GateRequest {
        GateRequest {
            service: service.into(),
            signature: Some(SIGNER.into()),
            payload: Some(format!(
                r#"{{"service":"{service}","timestamp":{timestamp},"nonce":"{nonce}"}}"#
            )),
            credit_cost: None,
            request_id: None,
        }
    }

    async fn gate_with(config: GateConfig, credits: u64) -> (GateAuthorizer, Arc<InMemoryCreditStore>) {
        let store = Arc::new(InMemoryCreditStore::new(StoreOptions::default()));
        if credits > 0 {
            store
                .credit(&SIGNER.parse().unwrap(), credits, "grant")
                .await
                .unwrap();
        }
        let gate = GateAuthorizer::new(store.clone(), Arc::new(AddressAsSignature), config);
        (gate, store)
    }

    fn signer() -> WalletKey {
        SIGNER.parse().unwrap()
    }

    #[tokio::test]
    async fn test_authorizes_and_debits_once() {
        let (gate, store) = gate_with(GateConfig::default(), 5).await;
        let auth = gate
            .authorize_at(&request("weather", "n1", NOW), UnixTimestamp::from_secs(NOW))
            .await
            .unwrap();
        assert!(auth.authorized);
        assert_eq!(auth.cost, 1);
        assert_eq!(auth.remaining_credits, 4);
        assert!(auth.nonce_accepted);
        assert_eq!(auth.cost_source, CostSource::Fallback);
        let entries = store.ledger_entries(&signer(), None).await.unwrap();
        assert_eq!(entries.last().unwrap().direction, LedgerDirection::Debit);
        assert_eq!(entries.last().unwrap().nonce.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_replay_authorized_at_most_once() {
        let (gate, store) = gate_with(GateConfig::default(), 5).await;
        let req = request("weather", "same", NOW);
        let now = UnixTimestamp::from_secs(NOW + 5);
        gate.authorize_at(&req, now).await.unwrap();
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!(err.code(), "REPLAY_DETECTED");
        assert_eq!(store.get_balance(&signer()).await.unwrap(), 4);
        let replays = store
            .replay_attempts_since(UnixTimestamp::from_secs(0))
            .await
            .unwrap();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0].nonce, "same");
    }

    #[tokio::test]
    async fn test_stale_payload_rejected_before_mutation() {
        let (gate, store) = gate_with(GateConfig::default(), 5).await;
        let req = request("weather", "old", NOW - 61);
        let err = gate
            .authorize_at(&req, UnixTimestamp::from_secs(NOW))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_EXPIRED");
        assert_eq!(err.status(), 401);
        assert_eq!(store.get_balance(&signer()).await.unwrap(), 5);
        // The nonce is still unused.
        assert!(
            store
                .try_accept_nonce(NonceClaim {
                    signer: signer(),
                    service: "weather".into(),
                    nonce: "old".into(),
                    payload_timestamp: UnixTimestamp::from_secs(NOW - 61),
                    signature: SIGNER.into(),
                })
                .await
                .unwrap()
        );

        let future = request("weather", "ahead", NOW + 1);
        let err = gate
            .authorize_at(&future, UnixTimestamp::from_secs(NOW))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_EXPIRED");
    }

    #[tokio::test]
    async fn test_header_and_payload_errors() {
        let (gate, _) = gate_with(GateConfig::default(), 5).await;
        let now = UnixTimestamp::from_secs(NOW);

        let mut req = request("weather", "n", NOW);
        req.signature = None;
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!((err.status(), err.code()), (400, "MISSING_HEADERS"));

        let mut req = request("weather", "n", NOW);
        req.payload = Some(r#"{"service":"weather"}"#.into());
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!((err.status(), err.code()), (400, "MALFORMED_PAYLOAD"));

        let mut req = request("weather", "n", NOW);
        req.service = "maps".into();
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!((err.status(), err.code()), (401, "SERVICE_MISMATCH"));

        let mut req = request("weather", "n", NOW);
        req.signature = Some("0xzz".into());
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!((err.status(), err.code()), (401, "INVALID_SIGNATURE"));

        let mut req = request("weather", "n", NOW);
        req.request_id = Some("x".repeat(MAX_REQUEST_ID_LEN + 1));
        let err = gate.authorize_at(&req, now).await.unwrap_err();
        assert_eq!((err.status(), err.code()), (400, "INVALID_REQUEST_ID"));

        let mut req = request("weather", "n", NOW);
        req.request_id = Some("bad\nid".into());
        assert!(matches!(
            gate.authorize_at(&req, now).await,
            Err(GateError::InvalidRequestId(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_credits_reports_balance() {
        let (gate, store) = gate_with(GateConfig::default(), 0).await;
        store
            .upsert_pricing(ServicePricing {
                service: "weather".into(),
                cost: 3,
                is_active: true,
            })
            .await
            .unwrap();
        store.credit(&signer(), 2, "grant").await.unwrap();
        let err = gate
            .authorize_at(&request("weather", "n", NOW), UnixTimestamp::from_secs(NOW))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::InsufficientCredits {
                balance: 2,
                required: 3
            }
        ));
        assert_eq!(err.status(), 402);
    }

    #[tokio::test]
    async fn test_cost_header_ignored_unless_honored() {
        let config = GateConfig {
            cost: CostPolicy {
                client_cost: ClientCostPolicy::Ignore,
                default_cost: Some(1),
            },
            ..GateConfig::default()
        };
        let (gate, _) = gate_with(config, 10).await;
        let mut req = request("weather", "n1", NOW);
        req.credit_cost = Some("5".into());
        let auth = gate
            .authorize_at(&req, UnixTimestamp::from_secs(NOW))
            .await
            .unwrap();
        assert_eq!((auth.cost, auth.remaining_credits), (1, 9));
        assert_eq!(auth.cost_source, CostSource::EnvDefault);

        let config = GateConfig {
            cost: CostPolicy {
                client_cost: ClientCostPolicy::Honor,
                default_cost: Some(1),
            },
            ..GateConfig::default()
        };
        let (gate, _) = gate_with(config, 10).await;
        let auth = gate
            .authorize_at(&req, UnixTimestamp::from_secs(NOW))
            .await
            .unwrap();
        assert_eq!((auth.cost, auth.remaining_credits), (5, 5));
    }

    #[tokio::test]
    async fn test_service_path_is_normalized() {
        let (gate, _) = gate_with(GateConfig::default(), 3).await;
        let mut req = request("weather/forecast", "n1", NOW);
        req.service = "/weather/forecast/".into();
        req.request_id = Some("req-42".into());
        let auth = gate
            .authorize_at(&req, UnixTimestamp::from_secs(NOW))
            .await
            .unwrap();
        assert_eq!(auth.service, "weather/forecast");
        assert_eq!(auth.request_id.as_deref(), Some("req-42"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_authorize_floor_of_balance() {
        let (gate, store) = gate_with(GateConfig::default(), 0).await;
        store
            .upsert_pricing(ServicePricing {
                service: "weather".into(),
                cost: 3,
                is_active: true,
            })
            .await
            .unwrap();
        store.credit(&signer(), 20, "grant").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..30 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.authorize_at(
                    &request("weather", &format!("n{i}"), NOW),
                    UnixTimestamp::from_secs(NOW),
                )
                .await
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 20 / 3);
        assert_eq!(store.get_balance(&signer()).await.unwrap(), 20 % 3);
    }

    #[test]
    fn test_reached_stage_ordering() {
        assert!(
            GateError::MissingHeaders("signature").reached_stage()
                < GateError::InvalidSignature(InvalidSignature(String::new())).reached_stage()
        );
        assert_eq!(GateError::Internal("x".into()).reached_stage(), None);
    }
}
