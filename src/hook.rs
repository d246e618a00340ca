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

//! The post-commit orchestrator.
//!
//! Invoked right after an ordinary commit `P` is recorded. First the
//! nearest ancestor timestamp commit on every branch gets its CRLs
//! refreshed into the LTV store, so the new tree re-seals the old
//! timestamps. Then the fixed-point loop runs: stage LTV, write the
//! tree, digest it, request tokens; validating fresh tokens can add new
//! LTV files, which moves the tree digest and forces another round. When
//! the digest stops moving, a timestamp commit is finalized on top of
//! `P`. Any fatal error soft-rewinds the branch so `P` is discarded and
//! the working copy is logically unchanged.

use std::collections::HashSet;

use crate::{
    binding,
    chain,
    config::{Settings, TsaConfig},
    crl,
    crypto::{cms, hash::HashAlg, x509},
    error::{Error, Result},
    ltv::{cert_path, LtvStore},
    message::{TimestampMessage, TokenTrailer},
    repo::{CommitInfo, Repo},
    time_stamp::request_token,
    trust::TrustStore,
    validate::{verify_token_with_ltv, SealContext},
};

/// Normal operation converges in two rounds (one that introduces new LTV
/// for a never-seen issuer, one that sees a stable tree). Anything beyond
/// a few rounds means the TSA answers non-deterministically.
const MAX_FIXED_POINT_ITERATIONS: usize = 4;

/// What the hook did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HookOutcome {
    /// No TSA configured; the commit was left untouched.
    NotConfigured,

    /// HEAD already is a timestamp commit; nothing to do.
    AlreadyTimestamped,

    /// A timestamp commit was appended.
    Sealed {
        commit_id: String,
        token_count: usize,
    },
}

/// Run the post-commit hook against the repository's HEAD.
///
/// On a fatal error after `P` exists, the branch tip is rewound by one
/// commit before the error is returned, so the repository is left as it
/// was before the inner commit.
pub fn run(repo: &Repo) -> Result<HookOutcome> {
    let head = repo.head()?;
    let commit = repo.read_commit(&head)?;

    // Recursion guard: the commit this hook creates triggers the hook
    // again.
    if TimestampMessage::matches_subject(&commit.message) {
        return Ok(HookOutcome::AlreadyTimestamped);
    }

    let settings = Settings::from_repo(repo)?;
    if settings.is_unconfigured() {
        return Ok(HookOutcome::NotConfigured);
    }

    match seal(repo, &settings, &commit) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            log::error!("timestamping failed, discarding commit {head}: {e}");
            if let Err(rewind) = repo.soft_rewind() {
                log::error!("soft rewind also failed: {rewind}");
            }
            Err(e)
        }
    }
}

fn seal(repo: &Repo, settings: &Settings, parent: &CommitInfo) -> Result<HookOutcome> {
    let alg = repo.object_format()?;
    let agent = settings.http_agent();
    let trust = TrustStore::load(&TrustStore::default_dir(repo.git_dir()))?;
    let ltv = LtvStore::new(repo.work_dir());

    let mut ctx = SealContext {
        repo,
        ltv: &ltv,
        trust: &trust,
        agent: &agent,
        fetched_iids: HashSet::new(),
    };

    seal_nearest_ancestors(repo, &mut ctx, parent);

    let mut prev_digest: Option<Vec<u8>> = None;
    let mut trailers: Vec<TokenTrailer> = Vec::new();

    for iteration in 0..=MAX_FIXED_POINT_ITERATIONS {
        let tree = repo.write_tree()?;
        let digest = binding::digest(alg, &tree, &parent.id);

        if prev_digest.as_deref() == Some(digest.as_slice()) {
            // Converged: the tokens collected last round are bound to
            // exactly this tree and parent.
            return finalize(repo, alg, &tree, &parent.id, &digest, trailers);
        }

        if iteration == MAX_FIXED_POINT_ITERATIONS {
            return Err(Error::FixedPointDiverged);
        }

        log::debug!(
            "fixed-point round {round}: tree {tree}, digest {d}",
            round = iteration + 1,
            d = hex::encode(&digest)
        );

        trailers.clear();
        for tsa in &settings.tsas {
            match obtain_token(&mut ctx, tsa, alg, &digest) {
                Ok(trailer) => trailers.push(trailer),
                Err(e) if tsa.optional => {
                    log::warn!("optional TSA {} failed, continuing without it: {e}", tsa.url);
                }
                Err(e) => return Err(e),
            }
        }

        if trailers.is_empty() {
            return Err(Error::Config(
                "every configured TSA failed; nothing to timestamp with".to_string(),
            ));
        }

        prev_digest = Some(digest);
    }

    Err(Error::FixedPointDiverged)
}

/// Request a token for `digest` from one TSA, verify it, and render its
/// commit trailer. Verification stages any LTV files still missing.
fn obtain_token(
    ctx: &mut SealContext<'_>,
    tsa: &TsaConfig,
    alg: HashAlg,
    digest: &[u8],
) -> Result<TokenTrailer> {
    // Commit tokens travel without certificates; the chain builder
    // fetches its own certificate-bearing token when needed.
    let reply = request_token(ctx.agent, &tsa.url, alg, digest, false)?;

    let info = verify_token_with_ltv(ctx, &reply.token_der, digest, &tsa.url)?;

    let info_line = reply
        .status_text
        .unwrap_or_else(|| format!("issued by {}", tsa.url));

    let when = chrono::DateTime::from_timestamp(info.gen_time, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| info.gen_time.to_string());
    let dump = format!(
        "serial={} time={} policy={}",
        hex::encode(info.tst.serial_number.as_bytes()),
        when,
        info.tst.policy
    );

    Ok(TokenTrailer::assemble(
        &tsa.url,
        &info_line,
        &dump,
        &reply.token_der,
    ))
}

fn finalize(
    repo: &Repo,
    alg: HashAlg,
    tree: &str,
    parent_id: &str,
    digest: &[u8],
    trailers: Vec<TokenTrailer>,
) -> Result<HookOutcome> {
    if trailers.is_empty() {
        return Err(Error::Config(
            "refusing to finalize a timestamp commit without tokens".to_string(),
        ));
    }

    let mut msg = TimestampMessage::new(
        alg,
        binding::preimage(tree, parent_id),
        hex::encode(digest),
    );
    let token_count = trailers.len();
    msg.tokens = trailers;

    let commit_id = repo.commit(&msg.emit())?;
    log::info!("timestamp commit {commit_id} seals {parent_id} with {token_count} tokens");

    Ok(HookOutcome::Sealed {
        commit_id,
        token_count,
    })
}

/// Walk from `P` back to the first timestamp commit on every branch and
/// refresh the CRLs of each of their tokens into the LTV store. The new
/// timestamp commit's tree will contain the refreshed files, extending
/// the life of the older timestamps.
///
/// Per-token failures only warn: an unreachable CA must not block the
/// commit, the archived CRLs simply stay as they are.
fn seal_nearest_ancestors(repo: &Repo, ctx: &mut SealContext<'_>, parent: &CommitInfo) {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = parent.parents.clone();

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }

        let commit = match repo.read_commit(&id) {
            Ok(commit) => commit,
            Err(e) => {
                log::warn!("cannot read ancestor {id}: {e}");
                continue;
            }
        };

        match TimestampMessage::parse(&commit.message) {
            Some(msg) => {
                // Nearest timestamp commit on this branch; refresh and
                // stop descending.
                for trailer in &msg.tokens {
                    if let Err(e) = refresh_ancestor_token(repo, ctx, &commit, trailer) {
                        log::warn!(
                            "could not refresh CRLs for timestamp commit {}: {e}",
                            commit.id
                        );
                    }
                }
            }
            None => stack.extend(commit.parents.iter().cloned()),
        }
    }
}

fn refresh_ancestor_token(
    repo: &Repo,
    ctx: &mut SealContext<'_>,
    ts_commit: &CommitInfo,
    trailer: &TokenTrailer,
) -> Result<()> {
    let token_der = trailer
        .token_der()
        .ok_or_else(|| Error::LtvMissing("trailer has no decodable token".to_string()))?;

    let sd = cms::signed_data_from_token(&token_der)?;
    let (_, iid_hash) = cms::signing_cert_id(&sd)?;
    let iid = hex::encode(iid_hash);

    // Chain recovery: work tree, then the ancestor commit's own tree,
    // then a rebuild against the TSA.
    let chain = match ctx.ltv.read_chain(&iid) {
        Some(chain) => chain,
        None => {
            let from_commit = repo
                .show_blob(&ts_commit.id, &cert_path(&iid))?
                .map(|bytes| x509::pems_from(&bytes))
                .filter(|chain| !chain.is_empty());

            let chain = match from_commit {
                Some(chain) => chain,
                None => chain::chain_for_token(ctx.agent, &trailer.tsa_url, &token_der, ctx.trust)?,
            };

            // Restore the file so the chain stays part of future trees.
            ctx.ltv.write_chain(repo, &iid, &chain)?;
            chain
        }
    };

    if ctx.fetched_iids.insert(iid.clone()) {
        let bundle = crl::download_crls(ctx.agent, &chain)?;
        ctx.ltv.write_crls(repo, &iid, &bundle)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::repo::tests::scratch_repo;

    #[test]
    fn unconfigured_repository_is_a_no_op() {
        let (_dir, repo) = scratch_repo();
        let before = repo.head().unwrap();

        assert_eq!(run(&repo).unwrap(), HookOutcome::NotConfigured);
        assert_eq!(repo.head().unwrap(), before);
    }

    #[test]
    fn rerunning_on_a_timestamp_commit_is_a_no_op() {
        let (_dir, repo) = scratch_repo();

        let ts = repo
            .commit("Trusted timestamp\n\nToken-Version: 1\n")
            .unwrap();
        assert_eq!(run(&repo).unwrap(), HookOutcome::AlreadyTimestamped);
        assert_eq!(repo.head().unwrap(), ts);
    }

    #[test]
    fn mandatory_tsa_failure_rewinds_the_inner_commit() {
        let (dir, repo) = scratch_repo();
        let first = repo.head().unwrap();

        // Unreachable mandatory TSA.
        let sh = xshell::Shell::new().unwrap();
        sh.change_dir(repo.work_dir());
        xshell::cmd!(
            sh,
            "git config timestamping.tsa0.url http://127.0.0.1:1/tsr"
        )
        .read()
        .unwrap();
        xshell::cmd!(sh, "git config timestamping.timeout 1")
            .read()
            .unwrap();

        // The commit the hook is supposed to seal.
        std::fs::write(dir.path().join("c.txt"), "change\n").unwrap();
        repo.add(&["c.txt".to_string()]).unwrap();
        let inner = repo.commit("a change worth sealing").unwrap();
        assert_ne!(inner, first);

        let err = run(&repo).unwrap_err();
        assert!(matches!(err, Error::Network(_)));

        // Soft rewind: the inner commit is gone, its changes remain
        // staged.
        assert_eq!(repo.head().unwrap(), first);
        assert!(dir.path().join("c.txt").exists());
    }

    #[test]
    fn all_optional_tsas_failing_also_aborts() {
        let (dir, repo) = scratch_repo();
        let first = repo.head().unwrap();

        let sh = xshell::Shell::new().unwrap();
        sh.change_dir(repo.work_dir());
        xshell::cmd!(
            sh,
            "git config timestamping.tsa0.url http://127.0.0.1:1/tsr"
        )
        .read()
        .unwrap();
        xshell::cmd!(sh, "git config timestamping.tsa0.optional true")
            .read()
            .unwrap();
        xshell::cmd!(sh, "git config timestamping.timeout 1")
            .read()
            .unwrap();

        std::fs::write(dir.path().join("d.txt"), "x\n").unwrap();
        repo.add(&["d.txt".to_string()]).unwrap();
        repo.commit("another change").unwrap();

        let err = run(&repo).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(repo.head().unwrap(), first);
    }
}
