//! # Conduit SigV4
//!
//! Request signing for the S3 wire protocol spoken by the Conduit gateway.
//!
//! This crate provides:
//! - **Canonicalization**: URI, query string and header canonical forms
//! - **Signing key derivation**: the `date → region → service → aws4_request` HMAC chain
//! - **Header signatures**: `Authorization` headers for live requests
//! - **Presigned URLs**: query-encoded signatures with an explicit expiry
//!
//! The signer is stateless apart from its credentials and region, so a single
//! instance can be shared by every backend adapter and by the protocol front end.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_sigv4::{Credentials, SigV4Signer, SignableRequest};
//!
//! let signer = SigV4Signer::new(Credentials::new("AKID", "secret"), "us-east-1");
//! let mut request = SignableRequest::new("GET", url);
//! signer.sign(&mut request, conduit_sigv4::EMPTY_PAYLOAD_SHA256)?;
//! let url = signer.generate_presigned_url("GET", "photos", "a.jpg", Duration::from_secs(900))?;
//! ```

pub mod addressing;
pub mod canonical;
pub mod error;
pub mod hashing;
pub mod signer;

pub use addressing::{object_url, AddressingStyle};
pub use error::{Result, SigningError};
pub use hashing::{content_md5, hmac_sha256, sha256_hex};
pub use signer::{Credentials, SigV4Signer, SignableRequest};

/// Signature algorithm identifier
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SHA-256 of the empty payload
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash marker used by presigned URLs
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Longest expiry a presigned URL may carry (7 days)
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;
