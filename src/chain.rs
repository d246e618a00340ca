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

//! Certificate chain assembly for TSA signing certificates.
//!
//! Commit tokens are requested without certificates to keep commits
//! small, so the chain builder asks the same TSA for a throwaway token
//! *with* certificates and works from the embedded set. Gaps are closed
//! from the trust store and, failing that, by following the AIA
//! `CA Issuers` pointer.

use std::io::Read;

use crate::{
    crypto::{cms, hash::HashAlg, x509},
    error::{Error, Result},
    time_stamp::request_token,
    trust::TrustStore,
};

/// TSAs may rotate signing keys; bound the search for a reply whose
/// certificate set contains the wanted signer.
const MAX_DUMMY_ATTEMPTS: usize = 10;

/// No real TSA chain is this deep.
const MAX_CHAIN_LEN: usize = 10;

/// Build and verify the chain for the signer identified by `iid_hex`
/// (hex of the ESSCertID{,v2} hash under `iid_alg`), ordering it signer
/// first, self-signed root last.
pub fn build_chain(
    agent: &ureq::Agent,
    tsa_url: &str,
    digest_alg: HashAlg,
    digest: &[u8],
    iid_alg: HashAlg,
    iid_hex: &str,
    trust: &TrustStore,
) -> Result<Vec<Vec<u8>>> {
    let chain = collect_chain(agent, tsa_url, digest_alg, digest, iid_alg, iid_hex, trust)?;

    verify_chain(&chain, trust, chrono::Utc::now().timestamp())?;

    Ok(chain)
}

/// Assemble the chain without checking it against the trust store. The
/// trust installer uses this to reach a root it is about to install.
pub fn collect_chain(
    agent: &ureq::Agent,
    tsa_url: &str,
    digest_alg: HashAlg,
    digest: &[u8],
    iid_alg: HashAlg,
    iid_hex: &str,
    trust: &TrustStore,
) -> Result<Vec<Vec<u8>>> {
    let want = hex::decode(iid_hex)
        .map_err(|_| Error::ChainIncomplete(format!("bad issuer id {iid_hex}")))?;

    for attempt in 0..MAX_DUMMY_ATTEMPTS {
        let reply = request_token(agent, tsa_url, digest_alg, digest, true)?;
        let sd = cms::signed_data_from_token(&reply.token_der)?;
        let certs = cms::certs_from_signed_data(&sd);

        if let Some(signer) = certs.iter().find(|c| iid_alg.digest(c) == want) {
            return complete_chain(agent, signer.clone(), &certs, trust);
        }

        log::debug!(
            "TSA {tsa_url} reply {n} does not contain signer {iid_hex}, retrying",
            n = attempt + 1
        );
    }

    Err(Error::ChainIncomplete(format!(
        "signer {iid_hex} not present in any of {MAX_DUMMY_ATTEMPTS} replies from {tsa_url}"
    )))
}

/// Build and verify the chain for a fresh token: identify its signer,
/// then assemble.
pub fn chain_for_token(
    agent: &ureq::Agent,
    tsa_url: &str,
    token_der: &[u8],
    trust: &TrustStore,
) -> Result<Vec<Vec<u8>>> {
    let chain = collect_chain_for_token(agent, tsa_url, token_der, trust)?;
    verify_chain(&chain, trust, chrono::Utc::now().timestamp())?;
    Ok(chain)
}

/// Like [`chain_for_token`] but without the trust-store verdict. The
/// trust installer uses this to reach a root it is about to install.
pub fn collect_chain_for_token(
    agent: &ureq::Agent,
    tsa_url: &str,
    token_der: &[u8],
    trust: &TrustStore,
) -> Result<Vec<Vec<u8>>> {
    let sd = cms::signed_data_from_token(token_der)?;
    let (iid_alg, iid) = cms::signing_cert_id(&sd)?;
    let tst = cms::tst_info_from_signed_data(&sd)?;

    let digest_alg = tst
        .message_imprint
        .hash_algorithm
        .hash_alg()
        .ok_or_else(|| Error::TimeStamp(crate::time_stamp::TimeStampError::UnsupportedAlgorithm))?;

    collect_chain(
        agent,
        tsa_url,
        digest_alg,
        tst.message_imprint.hashed_message.as_bytes(),
        iid_alg,
        &hex::encode(iid),
        trust,
    )
}

fn complete_chain(
    agent: &ureq::Agent,
    signer: Vec<u8>,
    pool: &[Vec<u8>],
    trust: &TrustStore,
) -> Result<Vec<Vec<u8>>> {
    let mut chain = vec![signer];

    loop {
        let top = chain
            .last()
            .cloned()
            .ok_or_else(|| Error::ChainIncomplete("empty chain".to_string()))?;

        if x509::is_self_signed(&top) {
            return Ok(chain);
        }

        if chain.len() >= MAX_CHAIN_LEN {
            return Err(Error::ChainIncomplete(format!(
                "no self-signed root within {MAX_CHAIN_LEN} certificates"
            )));
        }

        // Prefer certificates the TSA itself shipped.
        if let Some(next) = pool
            .iter()
            .find(|c| c.as_slice() != top.as_slice() && x509::issues(c, &top))
        {
            chain.push(next.clone());
            continue;
        }

        // Then a trust anchor that issued the top.
        if let Some(anchor) = trust.find_issuer(&top) {
            chain.push(anchor.clone());
            continue;
        }

        // Last resort: follow the AIA CA Issuers pointer.
        let Some(uri) = x509::ca_issuers_uri(&top) else {
            return Err(Error::ChainIncomplete(format!(
                "no issuer available for {}",
                x509::subject_line(&top).unwrap_or_else(|| "<unparsable>".to_string())
            )));
        };

        chain.push(fetch_issuer(agent, &uri, &top)?);
    }
}

/// Download a certificate from an AIA URI, accepting DER or PEM, and
/// return the one that issued `subject`.
fn fetch_issuer(agent: &ureq::Agent, uri: &str, subject: &[u8]) -> Result<Vec<u8>> {
    let bytes = http_get(agent, uri)?;

    x509::der_or_pems(&bytes)
        .into_iter()
        .find(|candidate| x509::issues(candidate, subject))
        .ok_or_else(|| Error::ChainIncomplete(format!("{uri} does not serve the issuer")))
}

pub(crate) fn http_get(agent: &ureq::Agent, uri: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(uri)
        .call()
        .map_err(|e| Error::Network(e.to_string()))?;

    let len = response
        .header("Content-Length")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(20000);

    let mut bytes: Vec<u8> = Vec::with_capacity(len);
    response
        .into_reader()
        .take(10000000)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::Network(e.to_string()))?;

    Ok(bytes)
}

/// Verify chain shape and anchoring: each certificate is issued by its
/// successor, the last is self-signed and bitwise present in the trust
/// store, and every certificate's validity window contains `at`.
pub fn verify_chain(chain: &[Vec<u8>], trust: &TrustStore, at: i64) -> Result<()> {
    let root = chain
        .last()
        .ok_or_else(|| Error::ChainIncomplete("empty chain".to_string()))?;

    for pair in chain.windows(2) {
        if !x509::issues(&pair[1], &pair[0]) {
            return Err(Error::ChainIncomplete(
                "chain is not ordered signer to root".to_string(),
            ));
        }
    }

    if !x509::is_self_signed(root) {
        return Err(Error::ChainIncomplete(
            "chain does not end in a self-signed root".to_string(),
        ));
    }

    if !trust.contains(root) {
        return Err(Error::UntrustedRoot);
    }

    for cert in chain {
        if !x509::valid_at(cert, at) {
            return Err(Error::Expired(at));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn empty_chain_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let trust = TrustStore::load(dir.path()).unwrap();
        assert!(matches!(
            verify_chain(&[], &trust, 0),
            Err(Error::ChainIncomplete(_))
        ));
    }

    #[test]
    fn garbage_chain_fails_shape_check() {
        let dir = tempfile::tempdir().unwrap();
        let trust = TrustStore::load(dir.path()).unwrap();

        let chain = vec![vec![1u8, 2, 3]];
        // A lone unparsable blob is not a self-signed root.
        assert!(verify_chain(&chain, &trust, 0).is_err());
    }

    #[test]
    fn bad_issuer_id_hex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trust = TrustStore::load(dir.path()).unwrap();
        let agent = ureq::AgentBuilder::new().build();

        let err = collect_chain(
            &agent,
            "https://tsa.invalid/tsr",
            HashAlg::Sha256,
            &[0u8; 32],
            HashAlg::Sha1,
            "not-hex",
            &trust,
        )
        .unwrap_err();

        assert!(matches!(err, Error::ChainIncomplete(_)));
    }

    #[test]
    fn unreachable_tsa_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let trust = TrustStore::load(dir.path()).unwrap();
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_millis(200))
            .build();

        let err = collect_chain(
            &agent,
            "http://127.0.0.1:1/tsr",
            HashAlg::Sha256,
            &[0u8; 32],
            HashAlg::Sha1,
            "00ff",
            &trust,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Network(_)));
    }
}
