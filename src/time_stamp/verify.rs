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

use der::Decode;

use crate::{
    crypto::{
        asn1::rfc3161::TstInfo,
        cms,
        hash::HashAlg,
        raw_signature::validate_signature,
        x509,
    },
    time_stamp::TimeStampError,
};

/// What a successfully verified token asserts.
#[derive(Debug)]
pub struct TokenInfo {
    /// The decoded TSTInfo statement.
    pub tst: TstInfo,

    /// DER of the certificate that signed the token.
    pub signer_cert_der: Vec<u8>,

    /// genTime as Unix seconds.
    pub gen_time: i64,

    /// Issuer id: hex of the ESSCertID{,v2} hash keying the LTV store.
    pub issuer_id: String,

    /// The hash algorithm behind the issuer id.
    pub issuer_id_alg: HashAlg,
}

/// Decode a token and verify it against `expected_digest`.
///
/// Checks, in order: the message imprint equals `expected_digest`; the
/// signed message-digest attribute covers the TSTInfo bytes; the CMS
/// signature verifies under the embedded signer certificate; and that
/// certificate's validity window contains the token's own genTime. Chain
/// and revocation checks are the caller's business -- this function only
/// establishes what the token says and that its signer said it.
pub fn verify_token(token_der: &[u8], expected_digest: &[u8]) -> Result<TokenInfo, TimeStampError> {
    let sd = cms::signed_data_from_token(token_der)?;

    let tst_der = cms::tst_info_der(&sd)?;
    let tst = TstInfo::from_der(&tst_der)
        .map_err(|e| TimeStampError::DecodeError(format!("bad TSTInfo: {e}")))?;

    // The imprint is the digest the TSA signed; it must be the one we
    // recomputed from the repository.
    if tst.message_imprint.hashed_message.as_bytes() != expected_digest {
        return Err(TimeStampError::InvalidData);
    }

    let signer_info = cms::first_signer_info(&sd)?;
    let signer_cert_der = cms::signer_cert_der(&sd)?;

    let digest_alg_oid = signer_info.digest_alg.oid.to_string();
    let digest_alg =
        HashAlg::from_oid_str(&digest_alg_oid).ok_or(TimeStampError::UnsupportedAlgorithm)?;

    // The signed message-digest attribute must cover the TSTInfo bytes.
    let signed_digest = cms::message_digest_attr(signer_info)?;
    if signed_digest != digest_alg.digest(&tst_der) {
        return Err(TimeStampError::InvalidData);
    }

    // The signature covers the signed attributes re-encoded as SET OF.
    let tbs = cms::signed_attrs_der(signer_info)?;
    let spki = x509::spki_der(&signer_cert_der)
        .ok_or_else(|| TimeStampError::DecodeError("bad signer certificate".to_string()))?;

    validate_signature(
        &signer_info.signature_algorithm.oid.to_string(),
        &digest_alg_oid,
        signer_info.signature.as_bytes(),
        &tbs,
        &spki,
    )
    .map_err(|_| TimeStampError::Untrusted)?;

    let gen_time = tst
        .gen_time_unix()
        .ok_or_else(|| TimeStampError::DecodeError("bad genTime".to_string()))?;

    // The signer certificate must have been valid when the token claims
    // to exist, not "now".
    if !x509::valid_at(&signer_cert_der, gen_time) {
        return Err(TimeStampError::ExpiredCertificate);
    }

    let (issuer_id_alg, id_hash) = cms::signing_cert_id(&sd)?;

    Ok(TokenInfo {
        tst,
        signer_cert_der,
        gen_time,
        issuer_id: hex::encode(id_hash),
        issuer_id_alg,
    })
}
