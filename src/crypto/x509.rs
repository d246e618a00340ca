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

//! Certificate inspection helpers over raw DER.
//!
//! Everything in this module takes and returns plain byte vectors so the
//! borrow-heavy `x509-parser` types never escape into the rest of the
//! crate.

use x509_parser::{
    der_parser::{oid, Oid},
    extensions::{DistributionPointName, GeneralName, ParsedExtension},
    pem::Pem,
    prelude::*,
};

use crate::crypto::{base64, hash};

const AD_CA_ISSUERS_OID: Oid<'static> = oid!(1.3.6 .1 .5 .5 .7 .48 .2);

/// `subject=<one-line RFC 2253 name>`, as written ahead of each PEM block
/// in LTV chain files.
pub fn subject_line(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(format!("subject={}", cert.subject()))
}

/// `issuer=<one-line RFC 2253 name>`.
pub fn issuer_line(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(format!("issuer={}", cert.issuer()))
}

/// A certificate is taken as self-signed when subject and issuer names are
/// equal and its own key verifies the signature.
pub fn is_self_signed(cert_der: &[u8]) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };

    cert.subject() == cert.issuer() && cert.verify_signature(None).is_ok()
}

/// True when the subject of `issuer_der` names the issuer of `cert_der`
/// and the issuer key verifies the certificate signature.
pub fn issues(issuer_der: &[u8], cert_der: &[u8]) -> bool {
    let Ok((_, issuer)) = X509Certificate::from_der(issuer_der) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };

    issuer.subject() == cert.issuer() && verify_signed_by(cert_der, issuer_der)
}

/// Verify the signature on `cert_der` with the public key of `issuer_der`.
pub fn verify_signed_by(cert_der: &[u8], issuer_der: &[u8]) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };
    let Ok((_, issuer)) = X509Certificate::from_der(issuer_der) else {
        return false;
    };

    cert.verify_signature(Some(issuer.public_key())).is_ok()
}

/// True when the certificate's validity window contains `at` (Unix
/// seconds).
pub fn valid_at(cert_der: &[u8], at: i64) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };
    let Ok(t) = ASN1Time::from_timestamp(at) else {
        return false;
    };

    cert.validity().is_valid_at(t)
}

/// Validity window as Unix seconds.
pub fn validity_window(cert_der: &[u8]) -> Option<(i64, i64)> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some((
        cert.validity().not_before.timestamp(),
        cert.validity().not_after.timestamp(),
    ))
}

/// First `CA Issuers` URI from the Authority Information Access extension.
pub fn ca_issuers_uri(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for ad in &aia.accessdescs {
                if ad.access_method == AD_CA_ISSUERS_OID {
                    if let GeneralName::URI(uri) = ad.access_location {
                        return Some(uri.to_string());
                    }
                }
            }
        }
    }
    None
}

/// First URI from the CRL Distribution Points extension.
pub fn crl_dp_uri(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in &points.points {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            return Some(uri.to_string());
                        }
                    }
                }
            }
        }
    }
    None
}

/// DER of the certificate's `SubjectPublicKeyInfo`.
pub fn spki_der(cert_der: &[u8]) -> Option<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(cert.public_key().raw.to_vec())
}

/// OpenSSL-compatible subject hash (`openssl x509 -subject_hash`): SHA-1
/// over the canonical name encoding, first four bytes read little-endian,
/// rendered as eight lowercase hex digits. Used to key trust-store files.
pub fn subject_hash(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    name_hash(cert.subject())
}

fn name_hash(name: &X509Name) -> Option<String> {
    let canon = canonical_name(name)?;
    let digest = hash::sha1(&canon);
    let word = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Some(format!("{word:08x}"))
}

/// OpenSSL's canonical name form: every string value becomes a lowercased,
/// whitespace-collapsed UTF8String, and the outer SEQUENCE header is left
/// off (the RDN SETs are concatenated bare).
fn canonical_name(name: &X509Name) -> Option<Vec<u8>> {
    use x509_parser::der_parser::asn1_rs::ToDer;

    let mut out = Vec::new();

    for rdn in name.iter_rdn() {
        let mut set_content = Vec::new();

        for attr in rdn.iter() {
            let value_tlv = match attr.as_str() {
                Ok(s) => {
                    let folded = s
                        .trim()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .to_ascii_lowercase();
                    der_tlv(0x0c, folded.as_bytes())
                }
                // Non-string values keep their original encoding.
                Err(_) => attr.attr_value().to_der_vec().ok()?,
            };

            let mut ava_content = der_tlv(0x06, attr.attr_type().as_bytes());
            ava_content.extend_from_slice(&value_tlv);
            set_content.extend_from_slice(&der_tlv(0x30, &ava_content));
        }

        out.extend_from_slice(&der_tlv(0x31, &set_content));
    }

    Some(out)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();

    if len < 0x80 {
        out.push(len as u8);
    } else {
        let len_bytes = len.to_be_bytes();
        let skip = len_bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (len_bytes.len() - skip) as u8);
        out.extend_from_slice(&len_bytes[skip..]);
    }

    out.extend_from_slice(content);
    out
}

/// Wrap DER bytes in a PEM block.
pub fn pem(label: &str, der: &[u8]) -> String {
    let b64 = base64::encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        // base64 output is always ASCII
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// All PEM blocks in a buffer, decoded to DER, label ignored.
pub fn pems_from(data: &[u8]) -> Vec<Vec<u8>> {
    Pem::iter_from_buffer(data)
        .filter_map(|pem| pem.ok())
        .map(|pem| pem.contents)
        .collect()
}

/// Accept either a single DER object or a PEM bundle, normalizing to DER
/// blobs. Used for AIA and CRL downloads whose encoding varies by CA.
pub fn der_or_pems(data: &[u8]) -> Vec<Vec<u8>> {
    if data.starts_with(b"-----BEGIN") {
        pems_from(data)
    } else if data.is_empty() {
        Vec::new()
    } else {
        vec![data.to_vec()]
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    // SEQUENCE { SET { SEQUENCE { OID 2.5.4.3, PrintableString "Test  CA" } } }
    fn sample_name_der() -> Vec<u8> {
        let oid_tlv = der_tlv(0x06, &[0x55, 0x04, 0x03]);
        let value_tlv = der_tlv(0x13, b"Test  CA");
        let mut ava = oid_tlv;
        ava.extend_from_slice(&value_tlv);
        let seq = der_tlv(0x30, &ava);
        let set = der_tlv(0x31, &seq);
        der_tlv(0x30, &set)
    }

    #[test]
    fn canonical_name_folds_case_and_whitespace() {
        let der = sample_name_der();
        let (_, name) = X509Name::from_der(&der).unwrap();

        let canon = canonical_name(&name).unwrap();

        // Canonical form drops the outer SEQUENCE and rewrites the value
        // as lowercased UTF8String with collapsed spaces.
        let expected_value = der_tlv(0x0c, b"test ca");
        let mut expected_ava = der_tlv(0x06, &[0x55, 0x04, 0x03]);
        expected_ava.extend_from_slice(&expected_value);
        let expected_seq = der_tlv(0x30, &expected_ava);
        let expected = der_tlv(0x31, &expected_seq);

        assert_eq!(canon, expected);
    }

    #[test]
    fn name_hash_is_stable() {
        let der = sample_name_der();
        let (_, name) = X509Name::from_der(&der).unwrap();

        let h1 = name_hash(&name).unwrap();
        let h2 = name_hash(&name).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn der_tlv_long_form() {
        let content = vec![0xabu8; 300];
        let tlv = der_tlv(0x04, &content);
        assert_eq!(&tlv[..4], &[0x04, 0x82, 0x01, 0x2c]);
        assert_eq!(tlv.len(), 4 + 300);
    }

    #[test]
    fn pem_round_trip() {
        let der = vec![1u8, 2, 3, 4, 5];
        let text = pem("CERTIFICATE", &der);
        assert!(text.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(pems_from(text.as_bytes()), vec![der.clone()]);
        assert_eq!(der_or_pems(text.as_bytes()), vec![der.clone()]);
        assert_eq!(der_or_pems(&der), vec![der]);
    }
}
