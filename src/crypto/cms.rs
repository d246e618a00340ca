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

//! CMS (PKCS #7) unwrapping for RFC 3161 tokens.
//!
//! A timestamp token is a `ContentInfo` carrying `SignedData` whose
//! encapsulated content is a `TSTInfo`. The helpers here pull the pieces
//! this crate needs out of that nesting: the TSTInfo bytes, the embedded
//! certificate set, the signer certificate, and the ESSCertID{,v2}
//! signer-certificate identifier that keys the LTV store.

use cms::{
    cert::CertificateChoices,
    content_info::ContentInfo,
    signed_data::{SignedData, SignerIdentifier, SignerInfo},
};
use const_oid::ObjectIdentifier;
use der::{
    asn1::{OctetString, SetOfVec},
    Any, Decode, Encode, Sequence,
};

use crate::{
    crypto::asn1::rfc3161::{AlgorithmIdentifier, TstInfo, OID_SIGNED_DATA, OID_TST_INFO},
    crypto::hash::HashAlg,
    time_stamp::TimeStampError,
};

const OID_MESSAGE_DIGEST: ObjectIdentifier = const_oid::db::rfc6268::ID_MESSAGE_DIGEST;

/// id-aa-signingCertificate (RFC 2634)
const OID_SIGNING_CERTIFICATE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.12");

/// id-aa-signingCertificateV2 (RFC 5035)
const OID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");

/// Decode a token (`ContentInfo` DER) down to its `SignedData`.
pub fn signed_data_from_token(token_der: &[u8]) -> Result<SignedData, TimeStampError> {
    let content_info = ContentInfo::from_der(token_der)
        .map_err(|e| TimeStampError::DecodeError(format!("not a CMS ContentInfo: {e}")))?;

    if content_info.content_type != OID_SIGNED_DATA {
        return Err(TimeStampError::DecodeError(
            "token content type is not SignedData".to_string(),
        ));
    }

    let signed_data_der = content_info.content.to_der()?;

    SignedData::from_der(&signed_data_der)
        .map_err(|e| TimeStampError::DecodeError(format!("invalid SignedData: {e}")))
}

/// The raw `TSTInfo` bytes (the eContent octets, which is also what the
/// CMS message-digest attribute covers).
pub fn tst_info_der(sd: &SignedData) -> Result<Vec<u8>, TimeStampError> {
    if sd.encap_content_info.econtent_type != OID_TST_INFO {
        return Err(TimeStampError::DecodeError(
            "encapsulated content type is not TSTInfo".to_string(),
        ));
    }

    let econtent = sd
        .encap_content_info
        .econtent
        .as_ref()
        .ok_or_else(|| TimeStampError::DecodeError("token has no TSTInfo content".to_string()))?;

    Ok(econtent.value().to_vec())
}

/// Parse the `TSTInfo` out of a `SignedData`.
pub fn tst_info_from_signed_data(sd: &SignedData) -> Result<TstInfo, TimeStampError> {
    let der = tst_info_der(sd)?;
    TstInfo::from_der(&der).map_err(|e| TimeStampError::DecodeError(format!("bad TSTInfo: {e}")))
}

/// Parse the `TSTInfo` out of a token (`ContentInfo` DER).
pub fn tst_info(token_der: &[u8]) -> Result<TstInfo, TimeStampError> {
    tst_info_from_signed_data(&signed_data_from_token(token_der)?)
}

/// All certificates embedded in the `SignedData`, as DER.
pub fn certs_from_signed_data(sd: &SignedData) -> Vec<Vec<u8>> {
    let mut certs = Vec::new();

    if let Some(cert_set) = &sd.certificates {
        for choice in cert_set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                if let Ok(der) = cert.to_der() {
                    certs.push(der);
                }
            }
        }
    }

    certs
}

/// The first (and in RFC 3161 practice, only) signer info.
pub fn first_signer_info(sd: &SignedData) -> Result<&SignerInfo, TimeStampError> {
    sd.signer_infos
        .0
        .get(0)
        .ok_or_else(|| TimeStampError::DecodeError("token has no signer info".to_string()))
}

/// Find the signer's certificate among the embedded certificates, matching
/// the `SignerIdentifier`, and return it as DER.
pub fn signer_cert_der(sd: &SignedData) -> Result<Vec<u8>, TimeStampError> {
    let signer_info = first_signer_info(sd)?;

    if let Some(cert_set) = &sd.certificates {
        for choice in cert_set.0.iter() {
            let CertificateChoices::Certificate(cert) = choice else {
                continue;
            };

            let matches = match &signer_info.sid {
                SignerIdentifier::IssuerAndSerialNumber(isn) => {
                    cert.tbs_certificate.issuer == isn.issuer
                        && cert.tbs_certificate.serial_number == isn.serial_number
                }
                SignerIdentifier::SubjectKeyIdentifier(ski) => {
                    cert_has_ski(cert, ski.0.as_bytes())
                }
            };

            if matches {
                return cert.to_der().map_err(TimeStampError::from);
            }
        }
    }

    Err(TimeStampError::DecodeError(
        "no embedded certificate matches the signer".to_string(),
    ))
}

fn cert_has_ski(cert: &x509_cert::Certificate, ski: &[u8]) -> bool {
    const SKI_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");

    let Some(extensions) = &cert.tbs_certificate.extensions else {
        return false;
    };

    extensions.iter().any(|ext| {
        ext.extn_id == SKI_OID
            && OctetString::from_der(ext.extn_value.as_bytes())
                .map(|inner| inner.as_bytes() == ski)
                .unwrap_or(false)
    })
}

/// The value of the signed message-digest attribute, which must cover the
/// TSTInfo bytes.
pub fn message_digest_attr(signer_info: &SignerInfo) -> Result<Vec<u8>, TimeStampError> {
    let attrs = signed_attrs(signer_info)?;

    let attr = attrs
        .iter()
        .find(|attr| attr.oid == OID_MESSAGE_DIGEST)
        .ok_or_else(|| TimeStampError::DecodeError("no message digest attribute".to_string()))?;

    // Per CMS the attribute carries exactly one value.
    if attr.values.len() != 1 {
        return Err(TimeStampError::DecodeError(format!(
            "message digest attribute has {n} values, should have one",
            n = attr.values.len()
        )));
    }

    let value = attr
        .values
        .get(0)
        .ok_or_else(|| TimeStampError::DecodeError("empty message digest".to_string()))?
        .to_der()?;

    let octets = OctetString::from_der(&value)
        .map_err(|_| TimeStampError::DecodeError("message digest is not octets".to_string()))?;

    Ok(octets.as_bytes().to_vec())
}

/// Re-encode the signed attributes for signature verification.
///
/// RFC 5652: the attributes are stored with an IMPLICIT [0] tag inside
/// `SignerInfo`, but the signature covers their encoding under the plain
/// SET OF tag.
pub fn signed_attrs_der(signer_info: &SignerInfo) -> Result<Vec<u8>, TimeStampError> {
    let attrs = signed_attrs(signer_info)?;

    let attrs_vec: Vec<x509_cert::attr::Attribute> = attrs.iter().cloned().collect();
    let generic_set = SetOfVec::try_from(attrs_vec)
        .map_err(|e| TimeStampError::DecodeError(format!("cannot rebuild attribute set: {e}")))?;

    generic_set.to_der().map_err(TimeStampError::from)
}

fn signed_attrs(signer_info: &SignerInfo) -> Result<&x509_cert::attr::Attributes, TimeStampError> {
    signer_info
        .signed_attrs
        .as_ref()
        .ok_or_else(|| TimeStampError::DecodeError("token has no signed attributes".to_string()))
}

/// ESSCertID (RFC 2634 §5.4.1): identifies the signing certificate by a
/// SHA-1 hash of its DER encoding.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EssCertId {
    cert_hash: OctetString,

    #[asn1(optional = "true")]
    issuer_serial: Option<Any>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SigningCertificate {
    certs: Vec<EssCertId>,

    #[asn1(optional = "true")]
    policies: Option<Any>,
}

/// ESSCertIDv2 (RFC 5035 §4): same idea with a declarable hash algorithm,
/// defaulting to SHA-256.
///
/// `Sequence` is implemented by hand rather than derived: `der_derive`
/// 0.7.3's `#[asn1(default = ...)]` support generates an encoder that moves
/// the field out of `&self`, which only works for `Copy` field types.
/// `AlgorithmIdentifier` cannot be `Copy` (it holds an `Option<Any>`), so
/// the derive is replicated manually here, comparing by reference instead.
#[derive(Clone, Debug, Eq, PartialEq)]
struct EssCertIdV2 {
    hash_algorithm: AlgorithmIdentifier,
    cert_hash: OctetString,
    issuer_serial: Option<Any>,
}

fn sha256_alg() -> AlgorithmIdentifier {
    HashAlg::Sha256.into()
}

impl<'a> der::DecodeValue<'a> for EssCertIdV2 {
    fn decode_value<R: der::Reader<'a>>(
        reader: &mut R,
        header: der::Header,
    ) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let hash_algorithm =
                Option::<AlgorithmIdentifier>::decode(reader)?.unwrap_or_else(sha256_alg);
            let cert_hash = OctetString::decode(reader)?;
            let issuer_serial = Option::<Any>::decode(reader)?;

            Ok(Self {
                hash_algorithm,
                cert_hash,
                issuer_serial,
            })
        })
    }
}

impl der::EncodeValue for EssCertIdV2 {
    fn value_len(&self) -> der::Result<der::Length> {
        let hash_algorithm_len = if self.hash_algorithm == sha256_alg() {
            der::Length::ZERO
        } else {
            self.hash_algorithm.encoded_len()?
        };

        [
            hash_algorithm_len,
            self.cert_hash.encoded_len()?,
            self.issuer_serial.encoded_len()?,
        ]
        .into_iter()
        .try_fold(der::Length::ZERO, |acc, len| acc + len)
    }

    fn encode_value(&self, writer: &mut impl der::Writer) -> der::Result<()> {
        if self.hash_algorithm != sha256_alg() {
            self.hash_algorithm.encode(writer)?;
        }
        self.cert_hash.encode(writer)?;
        self.issuer_serial.encode(writer)?;
        Ok(())
    }
}

impl<'a> Sequence<'a> for EssCertIdV2 {}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SigningCertificateV2 {
    certs: Vec<EssCertIdV2>,

    #[asn1(optional = "true")]
    policies: Option<Any>,
}

/// The signer-certificate identifier carried in the token's signed
/// attributes: the declared hash algorithm and the hash of the signing
/// certificate's DER.
///
/// `SigningCertificateV2` wins over the SHA-1-only `SigningCertificate`
/// when both are present. A token carrying neither is identified by the
/// SHA-256 of its signer certificate.
pub fn signing_cert_id(sd: &SignedData) -> Result<(HashAlg, Vec<u8>), TimeStampError> {
    let signer_info = first_signer_info(sd)?;
    let attrs = signed_attrs(signer_info)?;

    if let Some(attr) = attrs.iter().find(|a| a.oid == OID_SIGNING_CERTIFICATE_V2) {
        let value = attr
            .values
            .get(0)
            .ok_or_else(|| {
                TimeStampError::DecodeError("empty SigningCertificateV2 attribute".to_string())
            })?
            .to_der()?;

        let sc = SigningCertificateV2::from_der(&value)
            .map_err(|e| TimeStampError::DecodeError(format!("bad SigningCertificateV2: {e}")))?;

        let id = sc.certs.first().ok_or_else(|| {
            TimeStampError::DecodeError("SigningCertificateV2 lists no certificates".to_string())
        })?;

        let alg = id
            .hash_algorithm
            .hash_alg()
            .ok_or(TimeStampError::UnsupportedAlgorithm)?;

        return Ok((alg, id.cert_hash.as_bytes().to_vec()));
    }

    if let Some(attr) = attrs.iter().find(|a| a.oid == OID_SIGNING_CERTIFICATE) {
        let value = attr
            .values
            .get(0)
            .ok_or_else(|| {
                TimeStampError::DecodeError("empty SigningCertificate attribute".to_string())
            })?
            .to_der()?;

        let sc = SigningCertificate::from_der(&value)
            .map_err(|e| TimeStampError::DecodeError(format!("bad SigningCertificate: {e}")))?;

        let id = sc.certs.first().ok_or_else(|| {
            TimeStampError::DecodeError("SigningCertificate lists no certificates".to_string())
        })?;

        return Ok((HashAlg::Sha1, id.cert_hash.as_bytes().to_vec()));
    }

    let cert_der = signer_cert_der(sd)?;
    Ok((HashAlg::Sha256, HashAlg::Sha256.digest(&cert_der)))
}

/// The issuer id used to key LTV files: the signer-certificate hash as
/// lowercase hex.
pub fn issuer_id(sd: &SignedData) -> Result<String, TimeStampError> {
    let (_, hash) = signing_cert_id(sd)?;
    Ok(hex::encode(hash))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn attr_with(oid: ObjectIdentifier, value_der: &[u8]) -> x509_cert::attr::Attribute {
        let any = Any::from_der(value_der).unwrap();
        x509_cert::attr::Attribute {
            oid,
            values: SetOfVec::try_from(vec![any]).unwrap(),
        }
    }

    #[test]
    fn ess_cert_id_v2_default_algorithm_is_sha256() {
        let id = EssCertIdV2 {
            hash_algorithm: sha256_alg(),
            cert_hash: OctetString::new([7u8; 32].as_slice()).unwrap(),
            issuer_serial: None,
        };
        let sc = SigningCertificateV2 {
            certs: vec![id],
            policies: None,
        };

        // Because SHA-256 is the DEFAULT, the encoding omits the algorithm.
        let der = sc.to_der().unwrap();
        let decoded = SigningCertificateV2::from_der(&der).unwrap();
        assert_eq!(decoded, sc);
        assert_eq!(decoded.certs[0].hash_algorithm.hash_alg(), Some(HashAlg::Sha256));
    }

    #[test]
    fn ess_cert_id_v1_round_trips() {
        let sc = SigningCertificate {
            certs: vec![EssCertId {
                cert_hash: OctetString::new([9u8; 20].as_slice()).unwrap(),
                issuer_serial: None,
            }],
            policies: None,
        };

        let der = sc.to_der().unwrap();
        let decoded = SigningCertificate::from_der(&der).unwrap();
        assert_eq!(decoded.certs[0].cert_hash.as_bytes(), [9u8; 20]);
    }

    #[test]
    fn signing_certificate_attribute_parses() {
        let sc = SigningCertificateV2 {
            certs: vec![EssCertIdV2 {
                hash_algorithm: sha256_alg(),
                cert_hash: OctetString::new([3u8; 32].as_slice()).unwrap(),
                issuer_serial: None,
            }],
            policies: None,
        };
        let attr = attr_with(OID_SIGNING_CERTIFICATE_V2, &sc.to_der().unwrap());

        // Exercise the attribute-value decode path used by signing_cert_id.
        let value = attr.values.get(0).unwrap().to_der().unwrap();
        let decoded = SigningCertificateV2::from_der(&value).unwrap();
        assert_eq!(decoded.certs[0].cert_hash.as_bytes(), [3u8; 32]);
    }

    #[test]
    fn garbage_is_not_a_token() {
        assert!(signed_data_from_token(b"not a token at all").is_err());
    }
}
