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

//! ASN.1 types defined by [RFC 3161].
//!
//! Only the structures this crate actually sends and reads are defined:
//! the request side in full, the response side down to `TSTInfo`. The CMS
//! layer wrapped inside `timeStampToken` is handled in [`crate::crypto::cms`].
//!
//! [RFC 3161]: https://datatracker.ietf.org/doc/html/rfc3161

use const_oid::ObjectIdentifier;
use der::{
    asn1::{BitString, GeneralizedTime, Int, OctetString},
    Any, Decode, Encode, Sequence,
};
use rand::{thread_rng, Rng};
use x509_cert::ext::Extensions;

use crate::crypto::hash::HashAlg;

/// OID for id-ct-TSTInfo: 1.2.840.113549.1.9.16.1.4
pub const OID_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

/// OID for id-signedData: 1.2.840.113549.1.7.2
pub const OID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// Algorithm identifier with optional parameters.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct AlgorithmIdentifier {
    pub algorithm: ObjectIdentifier,

    #[asn1(optional = "true")]
    pub parameters: Option<Any>,
}

impl From<HashAlg> for AlgorithmIdentifier {
    fn from(alg: HashAlg) -> Self {
        Self {
            algorithm: ObjectIdentifier::new_unwrap(alg.oid_str()),
            parameters: None,
        }
    }
}

impl AlgorithmIdentifier {
    /// Map to a digest algorithm, if recognized.
    pub fn hash_alg(&self) -> Option<HashAlg> {
        HashAlg::from_oid_str(&self.algorithm.to_string())
    }
}

/// Message imprint: the digest handed to the TSA.
///
/// ```ASN.1
/// MessageImprint ::= SEQUENCE  {
///      hashAlgorithm                AlgorithmIdentifier,
///      hashedMessage                OCTET STRING  }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    pub hash_algorithm: AlgorithmIdentifier,
    pub hashed_message: OctetString,
}

impl MessageImprint {
    pub fn new(alg: HashAlg, digest: &[u8]) -> Result<Self, der::Error> {
        Ok(Self {
            hash_algorithm: alg.into(),
            hashed_message: OctetString::new(digest)?,
        })
    }
}

/// A time-stamp request.
///
/// ```ASN.1
/// TimeStampReq ::= SEQUENCE  {
///    version                  INTEGER  { v1(1) },
///    messageImprint           MessageImprint,
///    reqPolicy                TSAPolicyId                OPTIONAL,
///    nonce                    INTEGER                    OPTIONAL,
///    certReq                  BOOLEAN                    DEFAULT FALSE,
///    extensions               [0] IMPLICIT Extensions    OPTIONAL  }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    pub version: u8,

    pub message_imprint: MessageImprint,

    #[asn1(optional = "true")]
    pub req_policy: Option<ObjectIdentifier>,

    #[asn1(optional = "true")]
    pub nonce: Option<Int>,

    #[asn1(default = "default_false")]
    pub cert_req: bool,
    // Extensions are never sent.
}

fn default_false() -> bool {
    false
}

impl TimeStampReq {
    /// Build a v1 request for `digest` with a fresh random nonce.
    pub fn new(alg: HashAlg, digest: &[u8], cert_req: bool) -> Result<Self, der::Error> {
        Ok(Self {
            version: 1,
            message_imprint: MessageImprint::new(alg, digest)?,
            req_policy: None,
            nonce: Some(Int::new(&fresh_nonce_bytes())?),
            cert_req,
        })
    }

    pub fn to_der(&self) -> Result<Vec<u8>, der::Error> {
        Encode::to_der(self)
    }
}

/// Random 64-bit nonce encoded as a positive DER INTEGER (a leading zero
/// byte is prepended when the high bit is set).
fn fresh_nonce_bytes() -> Vec<u8> {
    let mut random = [0u8; 8];
    thread_rng().fill(&mut random);

    if random[0] & 0x80 != 0 {
        let mut padded = vec![0u8];
        padded.extend_from_slice(&random);
        padded
    } else {
        random.to_vec()
    }
}

/// PKI status values (RFC 3161 §2.4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PkiStatus {
    Granted = 0,
    GrantedWithMods = 1,
    Rejection = 2,
    Waiting = 3,
    RevocationWarning = 4,
    RevocationNotification = 5,
}

impl TryFrom<u8> for PkiStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PkiStatus::Granted),
            1 => Ok(PkiStatus::GrantedWithMods),
            2 => Ok(PkiStatus::Rejection),
            3 => Ok(PkiStatus::Waiting),
            4 => Ok(PkiStatus::RevocationWarning),
            5 => Ok(PkiStatus::RevocationNotification),
            _ => Err(()),
        }
    }
}

/// PKI status info.
///
/// ```ASN.1
/// PKIStatusInfo ::= SEQUENCE {
///     status        PKIStatus,
///     statusString  PKIFreeText     OPTIONAL,
///     failInfo      PKIFailureInfo  OPTIONAL  }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    pub status: u8,

    /// PKIFreeText: some TSAs attach attribution or license text here.
    #[asn1(optional = "true")]
    pub status_string: Option<Vec<String>>,

    #[asn1(optional = "true")]
    pub fail_info: Option<BitString>,
}

impl PkiStatusInfo {
    pub fn is_success(&self) -> bool {
        self.status == PkiStatus::Granted as u8 || self.status == PkiStatus::GrantedWithMods as u8
    }

    pub fn status_enum(&self) -> Option<PkiStatus> {
        PkiStatus::try_from(self.status).ok()
    }

    /// First line of the free text, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.status_string
            .as_ref()
            .and_then(|lines| lines.first())
            .map(|s| s.as_str())
    }
}

/// Time-stamp response.
///
/// ```ASN.1
/// TimeStampResp ::= SEQUENCE  {
///      status                  PKIStatusInfo,
///      timeStampToken          TimeStampToken     OPTIONAL  }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    pub status: PkiStatusInfo,

    /// The token is a CMS `ContentInfo`; kept opaque here and decoded by
    /// [`crate::crypto::cms`].
    #[asn1(optional = "true")]
    pub time_stamp_token: Option<Any>,
}

impl TimeStampResp {
    pub fn from_der_bytes(bytes: &[u8]) -> Result<Self, der::Error> {
        Self::from_der(bytes)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.time_stamp_token.is_some()
    }

    /// DER bytes of the embedded token (`ContentInfo`).
    pub fn token_der(&self) -> Result<Option<Vec<u8>>, der::Error> {
        self.time_stamp_token.as_ref().map(|t| t.to_der()).transpose()
    }
}

/// Accuracy of the timestamp (RFC 3161 §2.4.2).
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Accuracy {
    #[asn1(optional = "true")]
    pub seconds: Option<u64>,

    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT")]
    pub millis: Option<u16>,

    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub micros: Option<u16>,
}

/// TSTInfo: the signed timestamp statement.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TstInfo {
    pub version: u8,

    pub policy: ObjectIdentifier,

    pub message_imprint: MessageImprint,

    pub serial_number: Int,

    pub gen_time: GeneralizedTime,

    #[asn1(optional = "true")]
    pub accuracy: Option<Accuracy>,

    #[asn1(default = "default_false")]
    pub ordering: bool,

    #[asn1(optional = "true")]
    pub nonce: Option<Int>,

    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub tsa: Option<Any>,

    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub extensions: Option<Extensions>,
}

impl TstInfo {
    /// genTime as Unix seconds.
    pub fn gen_time_unix(&self) -> Option<i64> {
        let system_time = self.gen_time.to_system_time();
        let duration = system_time.duration_since(std::time::UNIX_EPOCH).ok()?;
        i64::try_from(duration.as_secs()).ok()
    }
}
