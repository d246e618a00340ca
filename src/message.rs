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

//! The timestamp-commit message format.
//!
//! A timestamp commit is recognized by its first message line. The body
//! carries header trailers (version, hash algorithm, preimage, digest)
//! followed by one `Timestamp:` trailer per token. Trailer bodies use git
//! continuation folding: every body line starts with a single space.
//! Parsers tolerate unknown trailers, and re-emitting a parsed message
//! preserves preimage, digest, and token bytes exactly.

use crate::crypto::{base64, hash::HashAlg};

/// First message line of every timestamp commit.
pub const SUBJECT_MARKER: &str = "Trusted timestamp";

const VERSION_TRAILER: &str = "Token-Version";
const HASH_ALGO_TRAILER: &str = "Hash-Algorithm";
const PREIMAGE_TRAILER: &str = "Preimage";
const DIGEST_TRAILER: &str = "Digest";
const TIMESTAMP_TRAILER: &str = "Timestamp";

const PEM_BEGIN: &str = "-----BEGIN RFC3161 TOKEN-----";
const PEM_END: &str = "-----END RFC3161 TOKEN-----";

/// One `Timestamp:` trailer: the TSA URL plus folded body lines (info
/// line, token dump, PEM-wrapped token). Body lines are stored without
/// their leading space and re-emitted verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenTrailer {
    pub tsa_url: String,
    pub body: Vec<String>,
}

impl TokenTrailer {
    /// Assemble a trailer from its parts, wrapping the token DER in PEM.
    pub fn assemble(tsa_url: &str, info: &str, dump: &str, token_der: &[u8]) -> Self {
        let mut body = vec![info.to_string(), dump.to_string(), PEM_BEGIN.to_string()];

        let b64 = base64::encode(token_der);
        for chunk in b64.as_bytes().chunks(64) {
            body.push(String::from_utf8_lossy(chunk).to_string());
        }
        body.push(PEM_END.to_string());

        Self {
            tsa_url: tsa_url.to_string(),
            body,
        }
    }

    /// Decode the PEM block back to token DER. `None` when no complete
    /// block is present or the base64 does not decode.
    pub fn token_der(&self) -> Option<Vec<u8>> {
        let begin = self.body.iter().position(|l| l.trim() == PEM_BEGIN)?;
        let end = self.body.iter().position(|l| l.trim() == PEM_END)?;
        if end <= begin {
            return None;
        }

        let b64: String = self.body[begin + 1..end]
            .iter()
            .map(|l| l.trim())
            .collect();

        base64::decode(&b64).ok()
    }
}

/// An unrecognized trailer, kept so re-emitting a parsed message loses
/// nothing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawTrailer {
    pub key: String,
    pub value: String,
    pub body: Vec<String>,
}

/// Parsed form of a timestamp-commit message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimestampMessage {
    /// Protocol version. 0 for historical commits whose digest is the
    /// parent commit id; 1 for preimage-bound digests.
    pub version: u32,

    pub hash_alg: Option<HashAlg>,

    pub preimage: Option<String>,

    pub digest_hex: Option<String>,

    pub tokens: Vec<TokenTrailer>,

    pub extra: Vec<RawTrailer>,
}

impl TimestampMessage {
    /// A fresh version-1 message with no tokens yet.
    pub fn new(hash_alg: HashAlg, preimage: String, digest_hex: String) -> Self {
        Self {
            version: 1,
            hash_alg: Some(hash_alg),
            preimage: Some(preimage),
            digest_hex: Some(digest_hex),
            tokens: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Whether a commit message is a timestamp commit's.
    pub fn matches_subject(message: &str) -> bool {
        message
            .lines()
            .next()
            .map(|line| line.starts_with(SUBJECT_MARKER))
            .unwrap_or(false)
    }

    /// Parse a commit message. `None` when the subject marker is absent.
    /// Unknown trailers are preserved, not rejected.
    pub fn parse(message: &str) -> Option<Self> {
        if !Self::matches_subject(message) {
            return None;
        }

        let mut parsed = Self {
            version: 0,
            hash_alg: None,
            preimage: None,
            digest_hex: None,
            tokens: Vec::new(),
            extra: Vec::new(),
        };

        enum Current {
            None,
            Token,
            Extra,
        }
        let mut current = Current::None;

        for line in message.lines().skip(1) {
            if let Some(folded) = line.strip_prefix(' ') {
                match current {
                    Current::Token => {
                        if let Some(t) = parsed.tokens.last_mut() {
                            t.body.push(folded.to_string());
                        }
                    }
                    Current::Extra => {
                        if let Some(t) = parsed.extra.last_mut() {
                            t.body.push(folded.to_string());
                        }
                    }
                    Current::None => {}
                }
                continue;
            }

            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                // Free-form body line; not a trailer.
                current = Current::None;
                continue;
            };
            let value = value.trim_start();

            match key {
                VERSION_TRAILER => {
                    parsed.version = value.parse().unwrap_or(0);
                    current = Current::None;
                }
                HASH_ALGO_TRAILER => {
                    parsed.hash_alg = value.parse().ok();
                    current = Current::None;
                }
                PREIMAGE_TRAILER => {
                    parsed.preimage = Some(value.to_string());
                    current = Current::None;
                }
                DIGEST_TRAILER => {
                    parsed.digest_hex = Some(value.to_string());
                    current = Current::None;
                }
                TIMESTAMP_TRAILER => {
                    parsed.tokens.push(TokenTrailer {
                        tsa_url: value.to_string(),
                        body: Vec::new(),
                    });
                    current = Current::Token;
                }
                _ => {
                    parsed.extra.push(RawTrailer {
                        key: key.to_string(),
                        value: value.to_string(),
                        body: Vec::new(),
                    });
                    current = Current::Extra;
                }
            }
        }

        Some(parsed)
    }

    /// Render back to a commit message.
    pub fn emit(&self) -> String {
        let mut out = format!("{SUBJECT_MARKER}\n\n");

        out.push_str(&format!("{VERSION_TRAILER}: {}\n", self.version));
        if let Some(alg) = &self.hash_alg {
            out.push_str(&format!("{HASH_ALGO_TRAILER}: {alg}\n"));
        }
        if let Some(preimage) = &self.preimage {
            out.push_str(&format!("{PREIMAGE_TRAILER}: {preimage}\n"));
        }
        if let Some(digest) = &self.digest_hex {
            out.push_str(&format!("{DIGEST_TRAILER}: {digest}\n"));
        }

        for token in &self.tokens {
            out.push_str(&format!("{TIMESTAMP_TRAILER}: {}\n", token.tsa_url));
            for line in &token.body {
                out.push_str(&format!(" {line}\n"));
            }
        }

        for extra in &self.extra {
            out.push_str(&format!("{}: {}\n", extra.key, extra.value));
            for line in &extra.body {
                out.push_str(&format!(" {line}\n"));
            }
        }

        out
    }
}
