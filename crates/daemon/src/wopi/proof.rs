// Proof signatures for outbound host requests.
//
// The host verifies that a request originated from this server by
// checking an RSA-SHA256 signature over a canonical descriptor of the
// request. Two signatures are sent on every call — one with the current
// private key, one with the previous key — so a host that is mid-rotation
// can verify with either.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// 100ns ticks between 0001-01-01 and the Unix epoch. Hosts expect proof
/// timestamps on this epoch.
const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;

/// Timestamp as 100-nanosecond ticks since 0001-01-01T00:00:00Z.
pub fn datetime_ticks(at: DateTime<Utc>) -> u64 {
    let seconds = u64::try_from(at.timestamp()).unwrap_or(0);
    let sub_ticks = u64::from(at.timestamp_subsec_nanos()) / 100;
    UNIX_EPOCH_TICKS + seconds * 10_000_000 + sub_ticks
}

/// Canonical signing buffer:
/// `len‖accessToken ‖ len‖upper(url) ‖ len‖8-byte-ticks`, all big-endian.
pub fn proof_payload(url: &str, access_token: &str, ticks: u64) -> Vec<u8> {
    let token_bytes = access_token.as_bytes();
    let url_bytes = url.to_uppercase().into_bytes();

    let mut buffer = Vec::with_capacity(4 + token_bytes.len() + 4 + url_bytes.len() + 4 + 8);
    buffer.extend_from_slice(&(token_bytes.len() as u32).to_be_bytes());
    buffer.extend_from_slice(token_bytes);
    buffer.extend_from_slice(&(url_bytes.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&url_bytes);
    buffer.extend_from_slice(&8u32.to_be_bytes());
    buffer.extend_from_slice(&ticks.to_be_bytes());
    buffer
}

/// Public key material as the discovery document advertises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryParts {
    /// SPKI DER, base64.
    pub value: String,
    /// Modulus bytes (big-endian), base64.
    pub modulus: String,
    /// Exponent bytes (big-endian), base64.
    pub exponent: String,
}

/// One signing key with its public half.
pub struct ProofKey {
    signing_key: SigningKey<Sha256>,
    public_key: RsaPublicKey,
}

impl ProofKey {
    /// Parse a private key from PEM (PKCS#8 or PKCS#1).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .context("proof private key is neither PKCS#8 nor PKCS#1 PEM")?;
        Ok(Self::from_private_key(private))
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        let public_key = private.to_public_key();
        Self { signing_key: SigningKey::new(private), public_key }
    }

    /// Base64 RSA-SHA256 signature over the canonical proof payload.
    pub fn sign(&self, url: &str, access_token: &str, ticks: u64) -> String {
        let signature = self.signing_key.sign(&proof_payload(url, access_token, ticks));
        STANDARD.encode(signature.to_bytes())
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn discovery_parts(&self) -> Result<DiscoveryParts> {
        let spki = self
            .public_key
            .to_public_key_der()
            .context("failed to encode proof public key")?;
        Ok(DiscoveryParts {
            value: STANDARD.encode(spki.as_bytes()),
            modulus: STANDARD.encode(self.public_key.n().to_bytes_be()),
            exponent: STANDARD.encode(self.public_key.e().to_bytes_be()),
        })
    }
}

/// Both proof signatures for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofPair {
    pub proof: String,
    pub proof_old: String,
}

/// The configured key pair: the active key plus the previous one, kept
/// until every host has picked up the rotation.
pub struct ProofKeys {
    pub current: ProofKey,
    pub old: ProofKey,
}

impl ProofKeys {
    pub fn from_pem(current_pem: &str, old_pem: &str) -> Result<Self> {
        Ok(Self {
            current: ProofKey::from_pem(current_pem).context("current proof key")?,
            old: ProofKey::from_pem(old_pem).context("old proof key")?,
        })
    }

    pub fn sign_pair(&self, url: &str, access_token: &str, ticks: u64) -> ProofPair {
        ProofPair {
            proof: self.current.sign(url, access_token, ticks),
            proof_old: self.old.sign(url, access_token, ticks),
        }
    }
}
