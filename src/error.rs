// Copyright 2024 Adobe. All rights reserved.
// This file is licensed to you under the Apache License,
// Version 2.0 (http://www.apache.org/licenses/LICENSE-2.0)
// or the MIT license (http://opensource.org/licenses/MIT),
// at your option.

// Unless required by applicable law or agreed to in writing,
// this software is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR REPRESENTATIONS OF ANY KIND, either express or
// implied. See the LICENSE-MIT and LICENSE-APACHE files for the
// specific language governing permissions and limitations under
// each license.

#![deny(missing_docs)]

//! Error types for timestamp sealing and validation.

use thiserror::Error;

use crate::time_stamp::TimeStampError;

/// `Error` enumerates errors returned by most operations of this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An HTTP request to a TSA, CRL distribution point, or AIA URI failed.
    #[error("network error: {0}")]
    Network(String),

    /// The TSA answered with a PKIStatus other than granted or
    /// grantedWithMods.
    #[error("time stamp authority rejected the request: {0}")]
    TsaRejected(String),

    /// The nonce in the TSA reply does not match the nonce sent.
    #[error("nonce mismatch in time stamp reply")]
    NonceMismatch,

    /// No path from the signing certificate to a self-signed root could be
    /// assembled.
    #[error("certificate chain incomplete: {0}")]
    ChainIncomplete(String),

    /// The chain ends in a root that is not in the trust store.
    #[error("chain root is not a trust anchor")]
    UntrustedRoot,

    /// A chain certificate is revoked for a disqualifying reason.
    #[error("certificate revoked ({0})")]
    Revoked(String),

    /// A chain certificate was not valid at the relevant time.
    #[error("certificate not valid at time {0}")]
    Expired(i64),

    /// A token's message imprint disagrees with the digest recomputed from
    /// the repository.
    #[error("token digest does not match repository state")]
    DigestMismatch,

    /// A required LTV artifact is neither in the repository nor
    /// reconstructable.
    #[error("LTV artifact missing: {0}")]
    LtvMissing(String),

    /// A CRL could not be fetched or parsed.
    #[error("CRL fetch failed: {0}")]
    CrlFetch(String),

    /// The commit fixed-point loop did not converge within its iteration
    /// bound.
    #[error("timestamp fixed point did not converge")]
    FixedPointDiverged,

    /// The repository failed its integrity check.
    #[error("repository corrupt: {0}")]
    RepositoryCorrupt(String),

    /// A git invocation failed.
    #[error("git error: {0}")]
    Git(String),

    /// An error from the RFC 3161 client or token verifier.
    #[error(transparent)]
    TimeStamp(TimeStampError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TimeStampError> for Error {
    fn from(err: TimeStampError) -> Self {
        // Preserve the caller-observable kind where one exists.
        match err {
            TimeStampError::NonceMismatch => Self::NonceMismatch,
            TimeStampError::TsaRejected(status) => Self::TsaRejected(status),
            TimeStampError::HttpConnectionError(msg) => Self::Network(msg),
            TimeStampError::HttpErrorResponse(status, content_type) => Self::Network(format!(
                "service responded with HTTP {status} ({content_type})"
            )),
            other => Self::TimeStamp(other),
        }
    }
}

/// A specialized `Result` type for operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;
