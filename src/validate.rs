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

//! Token validation and the history walker.
//!
//! Two consumers share this module. The post-commit path calls
//! [`verify_token_with_ltv`] on freshly issued tokens, which also makes
//! sure chain and CRL files land in the LTV store. The `validate` command
//! walks the ancestry DAG and judges every timestamp commit it finds,
//! using *historic* CRLs out of that commit's own tree and *current* CRLs
//! from the network (or the newest archived bundle when offline).

use std::collections::HashSet;

use crate::{
    binding,
    chain::{self, verify_chain},
    config::Settings,
    crl::{self, RevocationStatus},
    crypto::{cms, hash::HashAlg, x509},
    error::{Error, Result},
    ltv::{cert_path, crl_path, LtvStore},
    message::{TimestampMessage, TokenTrailer},
    repo::{CommitInfo, Repo},
    time_stamp::{verify_token, TokenInfo},
    trust::TrustStore,
};

/// Shared state of one sealing or validation run.
pub struct SealContext<'a> {
    pub repo: &'a Repo,
    pub ltv: &'a LtvStore,
    pub trust: &'a TrustStore,
    pub agent: &'a ureq::Agent,

    /// Issuer ids whose CRLs were already refreshed during this run.
    /// Refetching within one invocation would only destabilize the
    /// fixed point.
    pub fetched_iids: HashSet<String>,
}

/// Verify a fresh token and make sure its LTV artifacts are on disk and
/// staged: `certs/<iid>.cer` with the full chain, `crls/<iid>.crl` with
/// CRLs covering every non-root certificate.
pub fn verify_token_with_ltv(
    ctx: &mut SealContext<'_>,
    token_der: &[u8],
    expected_digest: &[u8],
    tsa_url: &str,
) -> Result<TokenInfo> {
    let info = verify_token(token_der, expected_digest)?;
    let iid = info.issuer_id.clone();

    // Chain: prefer the work tree, else rebuild from the TSA.
    let mut chain = ctx.ltv.read_chain(&iid);

    if let Some(existing) = &chain {
        if existing.first().map(|c| c.as_slice()) != Some(info.signer_cert_der.as_slice()) {
            // Stale file under a colliding iid; rebuild below.
            chain = None;
        }
    }

    let chain = match chain {
        Some(chain) => chain,
        None => {
            let built = chain::chain_for_token(ctx.agent, tsa_url, token_der, ctx.trust)?;
            ctx.ltv.write_chain(ctx.repo, &iid, &built)?;
            built
        }
    };

    // CRLs: refresh once per issuer id per invocation.
    if !ctx.fetched_iids.contains(&iid) {
        let bundle = crl::download_crls(ctx.agent, &chain)?;
        ctx.ltv.write_crls(ctx.repo, &iid, &bundle)?;
        ctx.fetched_iids.insert(iid.clone());
    }

    // The signer chain must be valid at the time the token claims to
    // exist, not "now".
    verify_chain(&chain, ctx.trust, info.gen_time)?;

    let crls = ctx
        .ltv
        .read_crls(&iid)
        .ok_or_else(|| Error::CrlFetch(format!("no CRL bundle for {iid}")))?;

    check_chain_revocation_strict(&chain, &crls, info.gen_time)?;

    Ok(info)
}

/// At creation time every non-root certificate must be covered and
/// unrevoked, whatever the reason.
fn check_chain_revocation_strict(chain: &[Vec<u8>], crls: &[Vec<u8>], at: i64) -> Result<()> {
    for (i, cert) in chain.iter().enumerate() {
        if i + 1 >= chain.len() {
            break; // root
        }

        match crl::revocation_status(cert, crls, Some(&chain[i + 1]), at, false) {
            RevocationStatus::Valid => {}
            RevocationStatus::NotCovered => {
                return Err(Error::CrlFetch(format!(
                    "no CRL covers {}",
                    x509::subject_line(cert).unwrap_or_else(|| "<unparsable>".to_string())
                )));
            }
            RevocationStatus::Revoked { reason, .. } => {
                return Err(Error::Revoked(crl::reason_name(reason).to_string()));
            }
        }
    }
    Ok(())
}

/// Outcome for one token in a timestamp commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenVerdict {
    /// Token verified through all three phases.
    Valid {
        /// genTime, Unix seconds.
        gen_time: i64,
    },

    /// Not a token at all (a decoy or foreign trailer); not counted as
    /// invalid.
    Skipped(String),

    /// A real token that failed verification.
    Invalid(String),
}

/// Outcome for one timestamp commit.
#[derive(Clone, Debug)]
pub struct CommitVerdict {
    pub commit_id: String,
    pub parent_id: Option<String>,
    pub verdicts: Vec<TokenVerdict>,

    /// Earliest genTime among valid tokens: the commit's effective
    /// timestamp.
    pub effective_time: Option<i64>,
}

impl CommitVerdict {
    /// A commit stands when at least one token is valid.
    pub fn ok(&self) -> bool {
        self.valid_count() >= 1
    }

    pub fn valid_count(&self) -> usize {
        self.verdicts
            .iter()
            .filter(|v| matches!(v, TokenVerdict::Valid { .. }))
            .count()
    }
}

/// Walk the ancestry of `reference` and judge every timestamp commit.
///
/// Machine-readable verdict lines go to stdout; per-token warnings go to
/// the log. Returns `true` iff every timestamp commit reached has at
/// least one valid token.
pub fn validate_ref(repo: &Repo, reference: &str) -> Result<bool> {
    let verdicts = collect_verdicts(repo, reference)?;
    let mut all_ok = true;

    for verdict in &verdicts {
        let when = verdict
            .effective_time
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "<no valid time>".to_string());

        println!(
            "Commit {}, which timestamps commit {} at {}, contains {} valid timestamp tokens.",
            verdict.commit_id,
            verdict.parent_id.as_deref().unwrap_or("<none>"),
            when,
            verdict.valid_count()
        );

        all_ok &= verdict.ok();
    }

    Ok(all_ok)
}

/// The walker behind [`validate_ref`], returning structured verdicts.
pub fn collect_verdicts(repo: &Repo, reference: &str) -> Result<Vec<CommitVerdict>> {
    repo.fsck()?;

    let settings = Settings::from_repo(repo)?;
    let agent = settings.http_agent();
    let trust = TrustStore::load(&TrustStore::default_dir(repo.git_dir()))?;
    let ltv = LtvStore::new(repo.work_dir());
    let alg = repo.object_format()?;

    let start = repo.rev_parse(reference)?;
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![start];
    let mut verdicts = Vec::new();

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }

        let commit = repo.read_commit(&id)?;

        if let Some(msg) = TimestampMessage::parse(&commit.message) {
            let verdict = validate_commit(repo, &ltv, &trust, &agent, alg, &commit, &msg);

            for token in &verdict.verdicts {
                match token {
                    TokenVerdict::Invalid(why) => {
                        log::warn!("commit {id}: invalid token: {why}");
                    }
                    TokenVerdict::Skipped(why) => {
                        log::warn!("commit {id}: skipped trailer: {why}");
                    }
                    TokenVerdict::Valid { .. } => {}
                }
            }

            verdicts.push(verdict);
        }

        stack.extend(commit.parents.iter().cloned());
    }

    Ok(verdicts)
}

/// Judge one timestamp commit.
pub fn validate_commit(
    repo: &Repo,
    ltv: &LtvStore,
    trust: &TrustStore,
    agent: &ureq::Agent,
    repo_alg: HashAlg,
    commit: &CommitInfo,
    msg: &TimestampMessage,
) -> CommitVerdict {
    let parent_id = commit.parents.first().cloned();

    let mut verdict = CommitVerdict {
        commit_id: commit.id.clone(),
        parent_id: parent_id.clone(),
        verdicts: Vec::new(),
        effective_time: None,
    };

    let Some(parent_id) = parent_id else {
        verdict
            .verdicts
            .push(TokenVerdict::Invalid("timestamp commit has no parent".to_string()));
        return verdict;
    };

    let expected_digest = match expected_digest(repo_alg, commit, msg, &parent_id) {
        Ok(digest) => digest,
        Err(why) => {
            verdict.verdicts.push(TokenVerdict::Invalid(why));
            return verdict;
        }
    };

    for trailer in &msg.tokens {
        let token_verdict =
            validate_token(repo, ltv, trust, agent, commit, trailer, &expected_digest);

        if let TokenVerdict::Valid { gen_time } = &token_verdict {
            verdict.effective_time = Some(match verdict.effective_time {
                Some(t) => t.min(*gen_time),
                None => *gen_time,
            });
        }

        verdict.verdicts.push(token_verdict);
    }

    verdict
}

/// The digest every token in this commit must have stamped.
///
/// Version 0 signed the raw parent commit id. Version 1 signs the hash
/// of the canonical preimage over the commit's own tree and parent.
fn expected_digest(
    repo_alg: HashAlg,
    commit: &CommitInfo,
    msg: &TimestampMessage,
    parent_id: &str,
) -> std::result::Result<Vec<u8>, String> {
    if msg.version == 0 {
        return hex::decode(parent_id).map_err(|_| "unparsable parent id".to_string());
    }

    let alg = msg.hash_alg.unwrap_or(repo_alg);
    let preimage = binding::preimage(&commit.tree, parent_id);
    let digest = binding::digest(alg, &commit.tree, parent_id);

    // The recorded trailers must agree with what we recompute; a
    // mismatch means the history around this commit was rewritten.
    if let Some(recorded) = &msg.preimage {
        if *recorded != preimage {
            return Err(format!(
                "digest mismatch: recorded preimage {recorded:?} differs from recomputed {preimage:?}"
            ));
        }
    }
    if let Some(recorded) = &msg.digest_hex {
        if *recorded != hex::encode(&digest) {
            return Err("digest mismatch: recorded digest differs from recomputed".to_string());
        }
    }

    Ok(digest)
}

fn validate_token(
    repo: &Repo,
    ltv: &LtvStore,
    trust: &TrustStore,
    agent: &ureq::Agent,
    commit: &CommitInfo,
    trailer: &TokenTrailer,
    expected_digest: &[u8],
) -> TokenVerdict {
    let Some(token_der) = trailer.token_der() else {
        return TokenVerdict::Skipped("trailer has no decodable token block".to_string());
    };

    // A trailer whose base64 decodes but is not CMS at all is a decoy,
    // not an invalid timestamp.
    let sd = match cms::signed_data_from_token(&token_der) {
        Ok(sd) => sd,
        Err(e) => return TokenVerdict::Skipped(format!("not an RFC 3161 token: {e}")),
    };

    // Phase 0: the imprint must equal the digest recomputed from the
    // repository before anything else is worth checking.
    match cms::tst_info_from_signed_data(&sd) {
        Ok(tst) => {
            if tst.message_imprint.hashed_message.as_bytes() != expected_digest {
                return TokenVerdict::Invalid(
                    "digest mismatch: token imprint differs from repository state".to_string(),
                );
            }
        }
        Err(e) => return TokenVerdict::Skipped(format!("token has no TSTInfo: {e}")),
    }

    // Phase 1: token signature, message-digest attribute, signer cert
    // validity window at genTime.
    let info = match verify_token(&token_der, expected_digest) {
        Ok(info) => info,
        Err(e) => return TokenVerdict::Invalid(e.to_string()),
    };

    let iid = &info.issuer_id;

    let chain = match resolve_chain(repo, ltv, trust, agent, commit, trailer, &info) {
        Ok(chain) => chain,
        Err(e) => return TokenVerdict::Invalid(e.to_string()),
    };

    // Phase 1 continued: the chain itself, judged at token time.
    if let Err(e) = verify_chain(&chain, trust, info.gen_time) {
        return TokenVerdict::Invalid(e.to_string());
    }

    // Phase 2: historic CRLs checked out from this very commit. Their
    // absence is fatal to the token; they are its archived proof.
    let historic = match repo.show_blob(&commit.id, &crl_path(iid)) {
        Ok(Some(bytes)) => x509::pems_from(&bytes),
        Ok(None) | Err(_) => Vec::new(),
    };
    if historic.is_empty() {
        return TokenVerdict::Invalid(format!("historic CRL {} missing", crl_path(iid)));
    }

    for (i, cert) in chain.iter().enumerate() {
        if i + 1 >= chain.len() {
            break;
        }
        match crl::revocation_status(cert, &historic, Some(&chain[i + 1]), info.gen_time, false) {
            RevocationStatus::Valid => {}
            RevocationStatus::NotCovered => {
                return TokenVerdict::Invalid(format!(
                    "historic CRL does not cover {}",
                    x509::subject_line(cert).unwrap_or_else(|| "<unparsable>".to_string())
                ));
            }
            RevocationStatus::Revoked { reason, .. } => {
                return TokenVerdict::Invalid(format!(
                    "certificate revoked at token time ({})",
                    crl::reason_name(reason)
                ));
            }
        }
    }

    // Phase 3: the chain judged now. Fresh CRLs when the network allows,
    // else the newest archived bundle.
    let now = chrono::Utc::now().timestamp();
    let (current, allow_expired) = match crl::download_crls(agent, &chain) {
        Ok(bundle) => (x509::pems_from(bundle.as_bytes()), false),
        Err(e) => {
            log::warn!("falling back to archived CRLs for {iid}: {e}");
            let head_bundle = repo
                .show_blob("HEAD", &crl_path(iid))
                .ok()
                .flatten()
                .map(|bytes| x509::pems_from(&bytes))
                .unwrap_or_default();
            (head_bundle, true)
        }
    };
    if current.is_empty() {
        return TokenVerdict::Invalid("no current CRL available for present-time check".to_string());
    }

    for (i, cert) in chain.iter().enumerate() {
        if i + 1 >= chain.len() {
            break;
        }
        match crl::revocation_status(cert, &current, Some(&chain[i + 1]), now, allow_expired) {
            RevocationStatus::Valid => {}
            RevocationStatus::NotCovered => {
                return TokenVerdict::Invalid(format!(
                    "no current CRL covers {}",
                    x509::subject_line(cert).unwrap_or_else(|| "<unparsable>".to_string())
                ));
            }
            status @ RevocationStatus::Revoked { reason, .. } => {
                // A retired-but-uncompromised TSA key keeps old tokens
                // alive (RFC 3161 §4).
                if status.is_benign_revocation() {
                    log::warn!(
                        "commit {}: chain certificate since revoked ({}), token accepted",
                        commit.id,
                        crl::reason_name(reason)
                    );
                } else {
                    return TokenVerdict::Invalid(format!(
                        "certificate revoked ({})",
                        crl::reason_name(reason)
                    ));
                }
            }
        }
    }

    TokenVerdict::Valid {
        gen_time: info.gen_time,
    }
}

/// Chain resolution order: live work tree, then this commit's own tree,
/// then a rebuild against the TSA.
fn resolve_chain(
    repo: &Repo,
    ltv: &LtvStore,
    trust: &TrustStore,
    agent: &ureq::Agent,
    commit: &CommitInfo,
    trailer: &TokenTrailer,
    info: &TokenInfo,
) -> Result<Vec<Vec<u8>>> {
    let iid = &info.issuer_id;

    let candidates = [
        ltv.read_chain(iid),
        repo.show_blob(&commit.id, &cert_path(iid))
            .ok()
            .flatten()
            .map(|bytes| x509::pems_from(&bytes))
            .filter(|chain| !chain.is_empty()),
    ];

    for chain in candidates.into_iter().flatten() {
        if chain.first().map(|c| c.as_slice()) == Some(info.signer_cert_der.as_slice()) {
            return Ok(chain);
        }
    }

    let Some(token_der) = trailer.token_der() else {
        return Err(Error::LtvMissing(format!("no chain for {iid}")));
    };

    chain::chain_for_token(agent, &trailer.tsa_url, &token_der, trust)
        .map_err(|e| Error::LtvMissing(format!("chain for {iid} not reconstructable: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::repo::tests::scratch_repo;

    fn bare_context(repo: &Repo) -> (LtvStore, TrustStore, ureq::Agent) {
        let ltv = LtvStore::new(repo.work_dir());
        let trust = TrustStore::load(&TrustStore::default_dir(repo.git_dir())).unwrap();
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_millis(200))
            .build();
        (ltv, trust, agent)
    }

    #[test]
    fn non_timestamp_history_is_vacuously_valid() {
        let (_dir, repo) = scratch_repo();
        let verdicts = collect_verdicts(&repo, "HEAD").unwrap();
        assert!(verdicts.is_empty());
        assert!(validate_ref(&repo, "HEAD").unwrap());
    }

    #[test]
    fn decoy_trailer_is_skipped_not_invalid() {
        let (_dir, repo) = scratch_repo();
        let parent = repo.head().unwrap();
        let parent_info = repo.read_commit(&parent).unwrap();

        // Craft a timestamp commit with a decoy: valid base64, not a token.
        let alg = repo.object_format().unwrap();
        let preimage = binding::preimage(&parent_info.tree, &parent);
        let digest = binding::digest(alg, &parent_info.tree, &parent);
        let mut msg = TimestampMessage::new(alg, preimage, hex::encode(&digest));
        msg.tokens.push(TokenTrailer::assemble(
            "https://tsa.example/tsr",
            "info line",
            "dump line",
            b"decoy bytes, valid base64 only",
        ));
        let commit_id = repo.commit(&msg.emit()).unwrap();

        let (ltv, trust, agent) = bare_context(&repo);
        let commit = repo.read_commit(&commit_id).unwrap();
        let parsed = TimestampMessage::parse(&commit.message).unwrap();

        let verdict = validate_commit(&repo, &ltv, &trust, &agent, alg, &commit, &parsed);

        assert_eq!(verdict.verdicts.len(), 1);
        assert!(matches!(verdict.verdicts[0], TokenVerdict::Skipped(_)));
        assert!(!verdict.ok());
    }

    #[test]
    fn rewritten_parent_is_a_digest_mismatch() {
        let (_dir, repo) = scratch_repo();
        let parent = repo.head().unwrap();
        let parent_info = repo.read_commit(&parent).unwrap();
        let alg = repo.object_format().unwrap();

        // The message references a digest for a *different* parent, as
        // it would after the parent was amended away.
        let wrong_parent = "0123456789abcdef0123456789abcdef01234567";
        let preimage = binding::preimage(&parent_info.tree, wrong_parent);
        let digest = binding::digest(alg, &parent_info.tree, wrong_parent);
        let msg = TimestampMessage::new(alg, preimage, hex::encode(&digest));
        let commit_id = repo.commit(&msg.emit()).unwrap();

        let (ltv, trust, agent) = bare_context(&repo);
        let commit = repo.read_commit(&commit_id).unwrap();
        let parsed = TimestampMessage::parse(&commit.message).unwrap();

        let verdict = validate_commit(&repo, &ltv, &trust, &agent, alg, &commit, &parsed);

        assert!(!verdict.ok());
        assert!(matches!(
            &verdict.verdicts[0],
            TokenVerdict::Invalid(why) if why.contains("digest mismatch")
        ));
    }

    #[test]
    fn walker_finds_timestamp_commits_behind_content_commits() {
        let (dir, repo) = scratch_repo();
        let parent = repo.head().unwrap();
        let parent_info = repo.read_commit(&parent).unwrap();
        let alg = repo.object_format().unwrap();

        let preimage = binding::preimage(&parent_info.tree, &parent);
        let digest = binding::digest(alg, &parent_info.tree, &parent);
        let msg = TimestampMessage::new(alg, preimage, hex::encode(&digest));
        let ts_commit = repo.commit(&msg.emit()).unwrap();

        // One more ordinary commit on top.
        std::fs::write(dir.path().join("b.txt"), "more\n").unwrap();
        repo.add(&["b.txt".to_string()]).unwrap();
        let top = repo.commit("second change").unwrap();
        assert_ne!(top, ts_commit);

        let verdicts = collect_verdicts(&repo, "HEAD").unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].commit_id, ts_commit);
        assert_eq!(verdicts[0].parent_id.as_deref(), Some(parent.as_str()));

        // No tokens at all: the commit cannot stand.
        assert!(!verdicts[0].ok());
        assert!(!validate_ref(&repo, "HEAD").unwrap());
    }

    #[test]
    fn version_zero_expects_parent_digest() {
        let (_dir, repo) = scratch_repo();
        let parent = repo.head().unwrap();
        let commit = CommitInfo {
            id: "f".repeat(40),
            tree: "e".repeat(40),
            parents: vec![parent.clone()],
            message: String::new(),
        };

        let msg = TimestampMessage {
            version: 0,
            hash_alg: None,
            preimage: None,
            digest_hex: None,
            tokens: Vec::new(),
            extra: Vec::new(),
        };

        let digest = expected_digest(HashAlg::Sha1, &commit, &msg, &parent).unwrap();
        assert_eq!(digest, hex::decode(&parent).unwrap());
    }
}
