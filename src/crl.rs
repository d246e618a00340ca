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

//! CRL fetching and revocation evaluation.

use x509_parser::prelude::*;

use crate::{
    crypto::x509,
    error::{Error, Result},
};

/// Revocation reasons a timestamp survives (RFC 3161 §4): the TSA key
/// was not compromised, merely retired.
const BENIGN_REASONS: [u8; 4] = [
    0, // unspecified
    3, // affiliationChanged
    4, // superseded
    5, // cessationOfOperation
];

/// What a CRL set says about one certificate at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RevocationStatus {
    /// No usable CRL from the certificate's issuer was found.
    NotCovered,

    /// Covered and not revoked at the evaluated time.
    Valid,

    /// Revoked at the evaluated time.
    Revoked {
        /// CRLReason code, when the CRL entry carries one.
        reason: Option<u8>,
        /// Revocation time, Unix seconds.
        at: i64,
    },
}

impl RevocationStatus {
    /// True for revocations a timestamp token survives per RFC 3161 §4.
    /// An entry without a reason code does not qualify.
    pub fn is_benign_revocation(&self) -> bool {
        match self {
            Self::Revoked {
                reason: Some(code), ..
            } => BENIGN_REASONS.contains(code),
            _ => false,
        }
    }
}

/// Reason code rendered for messages.
pub fn reason_name(reason: Option<u8>) -> &'static str {
    match reason {
        Some(0) => "unspecified",
        Some(1) => "keyCompromise",
        Some(2) => "cACompromise",
        Some(3) => "affiliationChanged",
        Some(4) => "superseded",
        Some(5) => "cessationOfOperation",
        Some(6) => "certificateHold",
        Some(8) => "removeFromCRL",
        Some(9) => "privilegeWithdrawn",
        Some(10) => "aACompromise",
        _ => "no reason given",
    }
}

/// Download the CRL for every non-self-signed certificate in `chain`
/// (chain order) via its first CRL Distribution Point URI, normalize to
/// PEM, and concatenate.
///
/// A missing distribution point, a download failure, or an unparsable
/// CRL all surface as [`Error::CrlFetch`]; the caller decides whether
/// that is recoverable.
pub fn download_crls(agent: &ureq::Agent, chain: &[Vec<u8>]) -> Result<String> {
    let mut bundle = String::new();

    for cert in chain {
        if x509::is_self_signed(cert) {
            continue;
        }

        let uri = x509::crl_dp_uri(cert).ok_or_else(|| {
            Error::CrlFetch(format!(
                "no CRL distribution point in {}",
                x509::subject_line(cert).unwrap_or_else(|| "<unparsable>".to_string())
            ))
        })?;

        let bytes = crate::chain::http_get(agent, &uri)
            .map_err(|e| Error::CrlFetch(format!("{uri}: {e}")))?;

        let ders = x509::der_or_pems(&bytes);
        if ders.is_empty() {
            return Err(Error::CrlFetch(format!("{uri}: empty reply")));
        }

        for der in ders {
            if CertificateRevocationList::from_der(&der).is_err() {
                return Err(Error::CrlFetch(format!("{uri}: not a CRL")));
            }
            bundle.push_str(&x509::pem("X509 CRL", &der));
        }
    }

    Ok(bundle)
}

/// Evaluate `cert_der` against a CRL set at time `at` (Unix seconds).
///
/// A CRL counts as usable when it comes from the certificate's issuer,
/// its signature verifies under `issuer_der` (when given), and it has not
/// expired relative to `at` -- a CRL issued *after* `at` still counts,
/// since it attests the revocation state up to a later point. Pass
/// `allow_expired` for best-effort checks against archived bundles when
/// no fresh CRL is reachable.
pub fn revocation_status(
    cert_der: &[u8],
    crl_ders: &[Vec<u8>],
    issuer_der: Option<&[u8]>,
    at: i64,
    allow_expired: bool,
) -> RevocationStatus {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return RevocationStatus::NotCovered;
    };

    let issuer = issuer_der.and_then(|der| X509Certificate::from_der(der).ok().map(|(_, c)| c));

    let serial = cert.raw_serial();

    for crl_der in crl_ders {
        let Ok((_, crl)) = CertificateRevocationList::from_der(crl_der) else {
            continue;
        };

        if crl.issuer() != cert.issuer() {
            continue;
        }

        if !allow_expired {
            if let Some(next_update) = crl.next_update() {
                if at > next_update.timestamp() {
                    continue;
                }
            }
        }

        if let Some(issuer) = &issuer {
            if crl.verify_signature(issuer.public_key()).is_err() {
                continue;
            }
        }

        for revoked in crl.iter_revoked_certificates() {
            if revoked.raw_serial() == serial {
                let revoked_at = revoked.revocation_date.timestamp();
                if revoked_at <= at {
                    return RevocationStatus::Revoked {
                        reason: revoked.reason_code().map(|rc| rc.1 .0),
                        at: revoked_at,
                    };
                }
                // Revoked later than the evaluated instant: clean at `at`.
            }
        }

        return RevocationStatus::Valid;
    }

    RevocationStatus::NotCovered
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn benign_reasons_follow_rfc3161() {
        for code in BENIGN_REASONS {
            let status = RevocationStatus::Revoked {
                reason: Some(code),
                at: 0,
            };
            assert!(status.is_benign_revocation(), "code {code} must be benign");
        }

        // keyCompromise, cACompromise, certificateHold are disqualifying.
        for code in [1u8, 2, 6, 9, 10] {
            let status = RevocationStatus::Revoked {
                reason: Some(code),
                at: 0,
            };
            assert!(!status.is_benign_revocation());
        }

        // Absent reason code never qualifies.
        assert!(!RevocationStatus::Revoked {
            reason: None,
            at: 0
        }
        .is_benign_revocation());
        assert!(!RevocationStatus::Valid.is_benign_revocation());
    }

    #[test]
    fn unparsable_inputs_are_not_covered() {
        let status = revocation_status(b"junk", &[vec![1, 2, 3]], None, 0, false);
        assert_eq!(status, RevocationStatus::NotCovered);
    }

    #[test]
    fn empty_chain_downloads_empty_bundle() {
        let agent = ureq::AgentBuilder::new().build();
        assert_eq!(download_crls(&agent, &[]).unwrap(), "");
    }

    #[test]
    fn reason_names_are_stable() {
        assert_eq!(reason_name(Some(1)), "keyCompromise");
        assert_eq!(reason_name(Some(4)), "superseded");
        assert_eq!(reason_name(None), "no reason given");
    }
}
