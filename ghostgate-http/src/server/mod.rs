//! Axum routes of the credit gate.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET\|POST /api/gate/{*service}` | authorize and debit one request |
//! | `POST /api/sync` | fold new deposits of one wallet into credits |
//! | `GET /api/credits/{wallet}` | balance and sync cursor |
//! | `GET /health` | liveness |
//!
//! The gate reads the `x-ghost-*` headers; a header that is not valid
//! UTF-8 counts as absent. Every failure is rendered by [`ApiError`].

pub mod error;

use std::fmt;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use ghostgate::WalletKey;
use ghostgate::gate::{Authorization, GateAuthorizer, GateRequest};
use ghostgate::sync::{CreditSynchronizer, SyncOutcome};
use http::HeaderMap;

pub use error::ApiError;

use crate::constants::{CREDIT_COST_HEADER, PAYLOAD_HEADER, REQUEST_ID_HEADER, SIGNATURE_HEADER};
use crate::types::{CreditsView, SyncRequest};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    gate: Arc<GateAuthorizer>,
    sync: Option<Arc<CreditSynchronizer>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("gate", &self.gate)
            .field("sync_enabled", &self.sync.is_some())
            .finish()
    }
}

impl AppState {
    /// State with the gate only; `/api/sync` answers `503`.
    #[must_use]
    pub fn new(gate: GateAuthorizer) -> Self {
        Self {
            gate: Arc::new(gate),
            sync: None,
        }
    }

    /// Enables `/api/sync`.
    #[must_use]
    pub fn with_sync(mut self, sync: CreditSynchronizer) -> Self {
        self.sync = Some(Arc::new(sync));
        self
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/gate/{*service}", get(gate).post(gate))
        .route("/api/sync", post(sync))
        .route("/api/credits/{wallet}", get(credits))
        .route("/health", get(health))
        .with_state(state)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// `GET|POST /api/gate/{*service}`
///
/// # Errors
///
/// Returns the gate's [`GateError`](ghostgate::GateError) mapped to its status.
pub async fn gate(
    State(state): State<AppState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Authorization>, ApiError> {
    let request = GateRequest {
        service,
        signature: header(&headers, SIGNATURE_HEADER),
        payload: header(&headers, PAYLOAD_HEADER),
        credit_cost: header(&headers, CREDIT_COST_HEADER),
        request_id: header(&headers, REQUEST_ID_HEADER),
    };
    Ok(Json(state.gate.authorize(&request).await?))
}

/// `POST /api/sync`
///
/// # Errors
///
/// `400` for a bad body, `503` without a deposit source, otherwise the
/// [`SyncError`](ghostgate::sync::SyncError) status.
pub async fn sync(
    State(state): State<AppState>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncOutcome>, ApiError> {
    let Json(request) = body?;
    let synchronizer = state.sync.as_ref().ok_or(ApiError::SyncDisabled)?;
    Ok(Json(synchronizer.sync_wallet(&request.wallet).await?))
}

/// `GET /api/credits/{wallet}`
///
/// # Errors
///
/// `400` for a malformed wallet, `500` on storage failure.
pub async fn credits(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> Result<Json<CreditsView>, ApiError> {
    let wallet: WalletKey = wallet.parse()?;
    let view = state
        .gate
        .store()
        .balance(&wallet)
        .await?
        .map_or_else(|| CreditsView::empty(wallet), CreditsView::from);
    Ok(Json(view))
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use alloy_signer_local::PrivateKeySigner;
    use async_trait::async_trait;
    use axum::body::Body;
    use ghostgate::access::AccessSigner;
    use ghostgate::gate::GateConfig;
    use ghostgate::store::{CreditStore, InMemoryCreditStore, StoreOptions};
    use ghostgate::sync::{DepositScan, DepositSource, ScanError};
    use ghostgate_evm::{Eip712Verifier, LocalAccessSigner};
    use http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    struct OneDeposit;

    #[async_trait]
    impl DepositSource for OneDeposit {
        async fn scan(
            &self,
            _payer: &WalletKey,
            cursor: Option<u64>,
        ) -> Result<DepositScan, ScanError> {
            let from_block = cursor.map_or(100, |c| c + 1);
            Ok(DepositScan {
                from_block,
                to_block: 200,
                head_block: 200,
                matched_deposits: u64::from(from_block == 100),
                deposited_wei: if from_block == 100 {
                    U256::from(3_000_000_000_000_000u64)
                } else {
                    U256::ZERO
                },
                partial_sync: false,
                next_from_block: 201,
            })
        }
    }

    struct Fixture {
        app: Router,
        store: Arc<dyn CreditStore>,
        signer: LocalAccessSigner,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn CreditStore> = Arc::new(InMemoryCreditStore::new(StoreOptions::default()));
        let gate = GateAuthorizer::new(
            Arc::clone(&store),
            Arc::new(Eip712Verifier::default()),
            GateConfig::default(),
        );
        let sync = CreditSynchronizer::new(
            Arc::clone(&store),
            Arc::new(OneDeposit),
            U256::from(10_000_000_000_000u64),
        )
        .unwrap();
        Fixture {
            app: router(AppState::new(gate).with_sync(sync)),
            store,
            signer: LocalAccessSigner::with_default_chain(PrivateKeySigner::random()),
        }
    }

    impl Fixture {
        fn wallet(&self) -> WalletKey {
            WalletKey::from(AccessSigner::address(&self.signer))
        }

        async fn gate_request(&self, service: &str) -> Request<Body> {
            let signed = self.signer.sign_service(service).await.unwrap();
            Request::get(format!("/api/gate/{service}"))
                .header(SIGNATURE_HEADER, signed.signature)
                .header(PAYLOAD_HEADER, signed.payload)
                .body(Body::empty())
                .unwrap()
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_gate_authorizes_and_debits() {
        let fx = fixture();
        fx.store.credit(&fx.wallet(), 5, "seed").await.unwrap();

        let (status, body) = send(&fx.app, fx.gate_request("weather").await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authorized"], true);
        assert_eq!(body["service"], "weather");
        assert_eq!(body["signer"], fx.wallet().as_str());
        assert_eq!(body["remainingCredits"], 4);
        assert_eq!(body["costSource"], "fallback");
        assert_eq!(fx.store.get_balance(&fx.wallet()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_replayed_headers_conflict() {
        let fx = fixture();
        fx.store.credit(&fx.wallet(), 5, "seed").await.unwrap();
        let signed = fx.signer.sign_service("weather").await.unwrap();
        let build = || {
            Request::post("/api/gate/weather")
                .header(SIGNATURE_HEADER, signed.signature.as_str())
                .header(PAYLOAD_HEADER, signed.payload.as_str())
                .body(Body::empty())
                .unwrap()
        };

        let (first, _) = send(&fx.app, build()).await;
        let (second, body) = send(&fx.app, build()).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(body["code"], "REPLAY_DETECTED");
        assert_eq!(fx.store.get_balance(&fx.wallet()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_headers_are_400() {
        let fx = fixture();
        let request = Request::get("/api/gate/weather").body(Body::empty()).unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_HEADERS");
    }

    #[tokio::test]
    async fn test_empty_balance_is_402_with_details() {
        let fx = fixture();
        let (status, body) = send(&fx.app, fx.gate_request("weather").await).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
        assert_eq!(body["balance"], 0);
        assert_eq!(body["required"], 1);
    }

    #[tokio::test]
    async fn test_path_must_match_signed_service() {
        let fx = fixture();
        fx.store.credit(&fx.wallet(), 5, "seed").await.unwrap();
        let signed = fx.signer.sign_service("weather").await.unwrap();
        let request = Request::get("/api/gate/maps")
            .header(SIGNATURE_HEADER, signed.signature)
            .header(PAYLOAD_HEADER, signed.payload)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "SERVICE_MISMATCH");
        assert_eq!(fx.store.get_balance(&fx.wallet()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sync_then_credits() {
        let fx = fixture();
        let wallet = fx.wallet();
        let request = Request::post("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "wallet": wallet.as_str() }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["addedCredits"], 300);
        assert_eq!(body["depositedWei"], "3000000000000000");
        assert_eq!(body["lastSyncedBlock"], 200);

        let request = Request::get(format!("/api/credits/{wallet}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits"], 300);
        assert_eq!(body["residualWei"], "0");
    }

    #[tokio::test]
    async fn test_sync_rejects_bad_body_and_missing_source() {
        let fx = fixture();
        let request = Request::post("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"wallet":"nope"}"#))
            .unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_BODY");

        let gate = GateAuthorizer::new(
            Arc::clone(&fx.store),
            Arc::new(Eip712Verifier::default()),
            GateConfig::default(),
        );
        let app = router(AppState::new(gate));
        let request = Request::post("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "wallet": fx.wallet().as_str() }).to_string(),
            ))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "SYNC_DISABLED");
    }

    #[tokio::test]
    async fn test_credits_for_unknown_and_invalid_wallets() {
        let fx = fixture();
        let request = Request::get(format!("/api/credits/{}", fx.wallet()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits"], 0);
        assert!(body["lastSyncedBlock"].is_null());

        let request = Request::get("/api/credits/0x123").body(Body::empty()).unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_WALLET");
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
