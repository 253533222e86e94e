//! Client-side signing of access payloads.
//!
//! [`LocalAccessSigner`] builds a fresh payload (current time, random 128-bit
//! hex nonce), signs its EIP-712 digest, and yields the
//! `x-ghost-sig` / `x-ghost-payload` header values.

use std::sync::Arc;

use alloy_primitives::{Address, B256, Signature, hex};
use alloy_signer_local::PrivateKeySigner;
use ghostgate::UnixTimestamp;
use ghostgate::access::{AccessPayload, AccessSigner, SignFuture};
use rand::RngExt;
use rand::rng;

use crate::access::{DEFAULT_CHAIN_ID, access_signing_hash};

/// Anything that can sign a 32-byte digest.
///
/// Implemented for [`PrivateKeySigner`] and for `Arc`-wrapped signers, since
/// alloy's `Signer` is not implemented for `Arc<T>`.
pub trait SignerLike: Send + Sync {
    /// The signer's address.
    fn address(&self) -> Address;

    /// Signs `hash`.
    fn sign_hash(
        &self,
        hash: &B256,
    ) -> impl Future<Output = Result<Signature, alloy_signer::Error>> + Send;
}

impl SignerLike for PrivateKeySigner {
    fn address(&self) -> Address {
        Self::address(self)
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        alloy_signer::Signer::sign_hash(self, hash).await
    }
}

impl<T: SignerLike> SignerLike for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_hash(&self, hash: &B256) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_hash(hash).await
    }
}

/// Header values proving access to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAccess {
    /// `0x`-prefixed 65-byte signature.
    pub signature: String,
    /// Payload JSON, exactly as signed.
    pub payload: String,
}

/// Signs access payloads with a local key.
#[derive(Debug, Clone)]
pub struct LocalAccessSigner<S = PrivateKeySigner> {
    signer: S,
    chain_id: u64,
}

impl LocalAccessSigner<PrivateKeySigner> {
    /// Parses a hex private key.
    ///
    /// # Errors
    ///
    /// Returns the signer's parse error for malformed keys.
    pub fn from_private_key(
        key: &str,
        chain_id: u64,
    ) -> Result<Self, alloy_signer_local::LocalSignerError> {
        Ok(Self::new(key.trim().parse()?, chain_id))
    }
}

impl<S: SignerLike> LocalAccessSigner<S> {
    /// Wraps `signer` for `chain_id`.
    pub const fn new(signer: S, chain_id: u64) -> Self {
        Self { signer, chain_id }
    }

    /// Wraps `signer` for the default chain.
    pub const fn with_default_chain(signer: S) -> Self {
        Self::new(signer, DEFAULT_CHAIN_ID)
    }

    /// A new payload for `service` stamped now with a random nonce.
    #[must_use]
    pub fn fresh_payload(service: &str) -> AccessPayload {
        let nonce: [u8; 16] = rng().random();
        AccessPayload {
            service: ghostgate::access::normalize_service(service).to_owned(),
            timestamp: UnixTimestamp::now(),
            nonce: hex::encode(nonce),
        }
    }

    /// Signs a fresh payload for `service`.
    ///
    /// # Errors
    ///
    /// Returns the underlying signer error.
    pub async fn sign_service(&self, service: &str) -> Result<SignedAccess, alloy_signer::Error> {
        let payload = Self::fresh_payload(service);
        let signature = self.sign_payload(&payload).await?;
        let payload = serde_json::to_string(&payload)
            .map_err(|e| alloy_signer::Error::other(format!("payload encoding: {e}")))?;
        Ok(SignedAccess {
            signature: hex::encode_prefixed(signature.as_bytes()),
            payload,
        })
    }

    async fn sign_payload(&self, payload: &AccessPayload) -> Result<Signature, alloy_signer::Error> {
        self.signer
            .sign_hash(&access_signing_hash(payload, self.chain_id))
            .await
    }
}

impl<S: SignerLike> AccessSigner for LocalAccessSigner<S> {
    fn address(&self) -> Address {
        self.signer.address()
    }

    fn sign_access<'a>(&'a self, payload: &'a AccessPayload) -> SignFuture<'a> {
        Box::pin(async move {
            let signature = self.sign_payload(payload).await?;
            Ok(hex::encode_prefixed(signature.as_bytes()))
        })
    }
}
