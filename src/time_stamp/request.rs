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

use std::io::Read;

use crate::{
    crypto::{
        asn1::rfc3161::{TimeStampReq, TimeStampResp},
        cms,
        hash::HashAlg,
    },
    time_stamp::TimeStampError,
};

const HTTP_CONTENT_TYPE_REQUEST: &str = "application/timestamp-query";
const HTTP_CONTENT_TYPE_RESPONSE: &str = "application/timestamp-reply";

/// A granted TSA reply: the token itself plus the free-text line some
/// services attach to their status (often attribution their terms ask to
/// be preserved alongside the token).
#[derive(Debug)]
pub struct TokenReply {
    /// DER bytes of the `TimeStampToken` (a CMS `ContentInfo`).
    pub token_der: Vec<u8>,

    /// First line of the reply's PKIFreeText, if any.
    pub status_text: Option<String>,
}

/// Request an [RFC 3161] time stamp over `digest` from the TSA at `url`.
///
/// The request carries a fresh random nonce which is checked against the
/// reply. Responds with the embedded `TimeStampToken`, not the whole
/// `TimeStampResp`.
///
/// [RFC 3161]: https://datatracker.ietf.org/doc/html/rfc3161
pub fn request_token(
    agent: &ureq::Agent,
    url: &str,
    alg: HashAlg,
    digest: &[u8],
    cert_req: bool,
) -> Result<TokenReply, TimeStampError> {
    let request = TimeStampReq::new(alg, digest, cert_req)?;
    let body = request.to_der()?;

    let response = agent
        .post(url)
        .set("Content-Type", HTTP_CONTENT_TYPE_REQUEST)
        .set("Accept", HTTP_CONTENT_TYPE_RESPONSE)
        .send_bytes(&body)?;

    if response.status() != 200 || response.content_type() != HTTP_CONTENT_TYPE_RESPONSE {
        return Err(TimeStampError::HttpErrorResponse(
            response.status(),
            response.content_type().to_string(),
        ));
    }

    let len = response
        .header("Content-Length")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(20000);

    let mut response_bytes: Vec<u8> = Vec::with_capacity(len);

    response
        .into_reader()
        .take(1000000)
        .read_to_end(&mut response_bytes)?;

    let resp = TimeStampResp::from_der_bytes(&response_bytes)
        .map_err(|e| TimeStampError::DecodeError(e.to_string()))?;

    if !resp.status.is_success() {
        let mut status = match resp.status.status_enum() {
            Some(s) => format!("{s:?}"),
            None => format!("PKIStatus {}", resp.status.status),
        };
        if let Some(text) = resp.status.first_text() {
            status.push_str(": ");
            status.push_str(text);
        }
        return Err(TimeStampError::TsaRejected(status));
    }

    let token = resp
        .token_der()?
        .ok_or_else(|| TimeStampError::DecodeError("reply carries no token".to_string()))?;

    // Verify the nonce was reflected.
    let tst_info = cms::tst_info(&token)?;
    if tst_info.nonce != request.nonce {
        return Err(TimeStampError::NonceMismatch);
    }

    Ok(TokenReply {
        token_der: token,
        status_text: resp.status.first_text().map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use httpmock::MockServer;

    use super::*;

    fn agent() -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(5))
            .build()
    }

    #[test]
    fn http_error_is_reported() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST);
            then.status(500);
        });

        let digest = HashAlg::Sha256.digest(b"data");
        let err =
            request_token(&agent(), &server.url("/tsr"), HashAlg::Sha256, &digest, false)
                .unwrap_err();

        // ureq maps HTTP >= 400 to a transport-level error.
        assert!(matches!(
            err,
            TimeStampError::HttpConnectionError(_) | TimeStampError::HttpErrorResponse(..)
        ));
        mock.assert();
    }

    #[test]
    fn wrong_content_type_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST);
            then.status(200)
                .header("Content-Type", "text/html")
                .body("<html>hello</html>");
        });

        let digest = HashAlg::Sha256.digest(b"data");
        let err =
            request_token(&agent(), &server.url("/tsr"), HashAlg::Sha256, &digest, false)
                .unwrap_err();

        assert!(matches!(err, TimeStampError::HttpErrorResponse(200, _)));
    }

    #[test]
    fn garbage_reply_is_a_decode_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST);
            then.status(200)
                .header("Content-Type", HTTP_CONTENT_TYPE_RESPONSE)
                .body([0xff, 0x00, 0x12]);
        });

        let digest = HashAlg::Sha256.digest(b"data");
        let err =
            request_token(&agent(), &server.url("/tsr"), HashAlg::Sha256, &digest, false)
                .unwrap_err();

        assert!(matches!(err, TimeStampError::DecodeError(_)));
    }

    #[test]
    fn rejection_status_is_surfaced() {
        use crate::crypto::asn1::rfc3161::{PkiStatus, PkiStatusInfo};
        use der::Encode;

        let resp = TimeStampResp {
            status: PkiStatusInfo {
                status: PkiStatus::Rejection as u8,
                status_string: Some(vec!["try later".to_string()]),
                fail_info: None,
            },
            time_stamp_token: None,
        };

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::POST);
            then.status(200)
                .header("Content-Type", HTTP_CONTENT_TYPE_RESPONSE)
                .body(resp.to_der().unwrap());
        });

        let digest = HashAlg::Sha256.digest(b"data");
        let err =
            request_token(&agent(), &server.url("/tsr"), HashAlg::Sha256, &digest, false)
                .unwrap_err();

        match err {
            TimeStampError::TsaRejected(status) => {
                assert!(status.contains("Rejection"));
                assert!(status.contains("try later"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
