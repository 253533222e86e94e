//! EOA signature recovery for access payloads.
//!
//! The signing hash is always rebuilt from the parsed payload fields; the
//! signature may be 65-byte `(r, s, v)` or 64-byte ERC-2098 compact form,
//! with or without a `0x` prefix.

use alloy_primitives::{Address, Signature, hex};
use ghostgate::access::{AccessPayload, InvalidSignature, SignatureVerifier};

use crate::access::{DEFAULT_CHAIN_ID, access_signing_hash};

/// Recovers access payload signers for one chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eip712Verifier {
    chain_id: u64,
}

impl Default for Eip712Verifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHAIN_ID)
    }
}

impl Eip712Verifier {
    /// Creates a verifier for `chain_id`.
    #[must_use]
    pub const fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// The chain id bound into the signing domain.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// Decodes a hex signature into its normalized form.
///
/// # Errors
///
/// Returns [`InvalidSignature`] for bad hex or an unsupported length.
pub fn parse_signature(raw: &str) -> Result<Signature, InvalidSignature> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| InvalidSignature(format!("signature is not hex: {e}")))?;
    let signature = match bytes.len() {
        65 => Signature::from_raw(&bytes)
            .map_err(|e| InvalidSignature(format!("malformed signature: {e}")))?,
        64 => Signature::from_erc2098(&bytes),
        n => {
            return Err(InvalidSignature(format!(
                "signature must be 64 or 65 bytes, got {n}"
            )));
        }
    };
    Ok(signature.normalized_s())
}

impl SignatureVerifier for Eip712Verifier {
    fn recover_signer(
        &self,
        payload: &AccessPayload,
        signature: &str,
    ) -> Result<Address, InvalidSignature> {
        let signature = parse_signature(signature)?;
        let hash = access_signing_hash(payload, self.chain_id);
        signature
            .recover_address_from_prehash(&hash)
            .map_err(|e| InvalidSignature(format!("recovery failed: {e}")))
    }
}
