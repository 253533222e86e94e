//! Header names and well-known paths of the gate protocol.

/// Hex signature over the access payload.
pub const SIGNATURE_HEADER: &str = "x-ghost-sig";

/// JSON access payload `{service, timestamp, nonce}`, exactly as signed.
pub const PAYLOAD_HEADER: &str = "x-ghost-payload";

/// Client-declared credit cost, honored only when the server allows it.
pub const CREDIT_COST_HEADER: &str = "x-ghost-credit-cost";

/// Optional caller correlation id, echoed back and stored with the debit.
pub const REQUEST_ID_HEADER: &str = "x-ghost-request-id";

/// Prefix of gate routes; the service slug follows.
pub const GATE_PATH: &str = "/api/gate";

/// Sync trigger route.
pub const SYNC_PATH: &str = "/api/sync";

/// Balance lookup prefix; the wallet follows.
pub const CREDITS_PATH: &str = "/api/credits";

/// Gateway used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://ghost-rank.vercel.app";

/// Environment variable overriding [`DEFAULT_BASE_URL`].
pub const BASE_URL_ENV: &str = "GHOST_GATE_BASE_URL";

/// `Accept` header sent by the client.
pub const ACCEPT_VALUE: &str = "application/json, text/plain;q=0.9, */*;q=0.8";
