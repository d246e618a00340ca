// Copyright 2025 Adobe. All rights reserved.
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

//! Raw signature verification over DER public keys.
//!
//! TSA signing chains in the wild are RSA PKCS#1 v1.5 or ECDSA on the NIST
//! curves, so those are the validators provided here. Dispatch is keyed by
//! dotted-decimal OID strings because every ASN.1 crate in the dependency
//! tree has its own incompatible `Oid` type.

use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::Digest;
use thiserror::Error;

use crate::crypto::hash::HashAlg;

/// Describes errors that can occur when validating a raw signature.
#[derive(Debug, Eq, PartialEq, Error)]
pub enum RawSignatureValidationError {
    /// The signature does not match the provided data or public key.
    #[error("signature does not match data or public key")]
    SignatureMismatch,

    /// The public key could not be parsed.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The signature could not be parsed.
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// No validator is available for the requested algorithm combination.
    #[error("unsupported signature algorithm")]
    UnsupportedAlgorithm,
}

/// A validator checks one signature algorithm family against a DER-encoded
/// `SubjectPublicKeyInfo`.
pub trait RawSignatureValidator {
    fn validate(
        &self,
        sig: &[u8],
        data: &[u8],
        spki_der: &[u8],
    ) -> Result<(), RawSignatureValidationError>;
}

/// RSA PKCS#1 v1.5 with the digest chosen at dispatch time.
struct RsaValidator(HashAlg);

impl RawSignatureValidator for RsaValidator {
    fn validate(
        &self,
        sig: &[u8],
        data: &[u8],
        spki_der: &[u8],
    ) -> Result<(), RawSignatureValidationError> {
        use rsa::pkcs8::DecodePublicKey;

        let key = RsaPublicKey::from_public_key_der(spki_der)
            .map_err(|_| RawSignatureValidationError::InvalidPublicKey)?;

        let (scheme, hashed) = match self.0 {
            HashAlg::Sha1 => (
                Pkcs1v15Sign::new::<sha1::Sha1>(),
                sha1::Sha1::digest(data).to_vec(),
            ),
            HashAlg::Sha256 => (
                Pkcs1v15Sign::new::<sha2::Sha256>(),
                sha2::Sha256::digest(data).to_vec(),
            ),
            HashAlg::Sha384 => (
                Pkcs1v15Sign::new::<sha2::Sha384>(),
                sha2::Sha384::digest(data).to_vec(),
            ),
            HashAlg::Sha512 => (
                Pkcs1v15Sign::new::<sha2::Sha512>(),
                sha2::Sha512::digest(data).to_vec(),
            ),
        };

        key.verify(scheme, &hashed, sig)
            .map_err(|_| RawSignatureValidationError::SignatureMismatch)
    }
}

/// ECDSA over P-256 or P-384, selected by whichever curve the key parses
/// as. The digest algorithm comes from dispatch so mixed pairings
/// (P-384 key, SHA-256 digest) verify too.
struct EcdsaValidator(HashAlg);

impl RawSignatureValidator for EcdsaValidator {
    fn validate(
        &self,
        sig: &[u8],
        data: &[u8],
        spki_der: &[u8],
    ) -> Result<(), RawSignatureValidationError> {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::pkcs8::DecodePublicKey;

        let prehash = self.0.digest(data);

        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der) {
            let sig = p256::ecdsa::Signature::from_der(sig)
                .map_err(|_| RawSignatureValidationError::InvalidSignature)?;
            return key
                .verify_prehash(&prehash, &sig)
                .map_err(|_| RawSignatureValidationError::SignatureMismatch);
        }

        if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(spki_der) {
            let sig = p384::ecdsa::Signature::from_der(sig)
                .map_err(|_| RawSignatureValidationError::InvalidSignature)?;
            return key
                .verify_prehash(&prehash, &sig)
                .map_err(|_| RawSignatureValidationError::SignatureMismatch);
        }

        Err(RawSignatureValidationError::InvalidPublicKey)
    }
}

const RSA_OID: &str = "1.2.840.113549.1.1.1";
const SHA1_WITH_RSA_OID: &str = "1.2.840.113549.1.1.5";
const SHA256_WITH_RSA_OID: &str = "1.2.840.113549.1.1.11";
const SHA384_WITH_RSA_OID: &str = "1.2.840.113549.1.1.12";
const SHA512_WITH_RSA_OID: &str = "1.2.840.113549.1.1.13";
const EC_PUBLICKEY_OID: &str = "1.2.840.10045.2.1";
const ECDSA_WITH_SHA256_OID: &str = "1.2.840.10045.4.3.2";
const ECDSA_WITH_SHA384_OID: &str = "1.2.840.10045.4.3.3";
const ECDSA_WITH_SHA512_OID: &str = "1.2.840.10045.4.3.4";

/// Select a validator based on signature algorithm and digest algorithm,
/// both as dotted-decimal OID strings.
pub fn validator_for_sig_and_hash_algs(
    sig_alg: &str,
    hash_alg: &str,
) -> Option<Box<dyn RawSignatureValidator>> {
    // Signature algorithms that pin their own digest come first.
    match sig_alg {
        SHA1_WITH_RSA_OID => return Some(Box::new(RsaValidator(HashAlg::Sha1))),
        SHA256_WITH_RSA_OID => return Some(Box::new(RsaValidator(HashAlg::Sha256))),
        SHA384_WITH_RSA_OID => return Some(Box::new(RsaValidator(HashAlg::Sha384))),
        SHA512_WITH_RSA_OID => return Some(Box::new(RsaValidator(HashAlg::Sha512))),
        ECDSA_WITH_SHA256_OID => return Some(Box::new(EcdsaValidator(HashAlg::Sha256))),
        ECDSA_WITH_SHA384_OID => return Some(Box::new(EcdsaValidator(HashAlg::Sha384))),
        ECDSA_WITH_SHA512_OID => return Some(Box::new(EcdsaValidator(HashAlg::Sha512))),
        _ => {}
    }

    // Bare public-key algorithms need the digest OID from the caller.
    let hash = HashAlg::from_oid_str(hash_alg)?;
    match sig_alg {
        RSA_OID => Some(Box::new(RsaValidator(hash))),
        EC_PUBLICKEY_OID => Some(Box::new(EcdsaValidator(hash))),
        _ => None,
    }
}

/// Verify `sig` over `data` with the public key in `spki_der`, dispatching
/// on the given algorithm OIDs.
pub fn validate_signature(
    sig_alg: &str,
    hash_alg: &str,
    sig: &[u8],
    data: &[u8],
    spki_der: &[u8],
) -> Result<(), RawSignatureValidationError> {
    let validator = validator_for_sig_and_hash_algs(sig_alg, hash_alg)
        .ok_or(RawSignatureValidationError::UnsupportedAlgorithm)?;

    validator.validate(sig, data, spki_der)
}
