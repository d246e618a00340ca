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

//! End-to-end exercises against a real git repository: crafting
//! timestamp commits, walking them back out, and the hook's guard
//! behavior. TSA-dependent paths are covered by unit tests against mock
//! servers; everything here runs offline.

#![allow(clippy::unwrap_used)]

use git_timeseal::{
    binding,
    hook::{self, HookOutcome},
    message::{TimestampMessage, TokenTrailer},
    repo::Repo,
    validate,
};
use xshell::{cmd, Shell};

fn scratch_repo() -> (tempfile::TempDir, Repo) {
    let dir = tempfile::tempdir().unwrap();
    let sh = Shell::new().unwrap();
    sh.change_dir(dir.path());

    cmd!(sh, "git init --quiet").read().unwrap();
    cmd!(sh, "git config user.name tester").read().unwrap();
    cmd!(sh, "git config user.email tester@example.com")
        .read()
        .unwrap();
    cmd!(sh, "git config commit.gpgsign false").read().unwrap();

    sh.write_file("a.txt", "hello\n").unwrap();
    cmd!(sh, "git add a.txt").read().unwrap();
    cmd!(sh, "git commit --quiet -m init").read().unwrap();

    let repo = Repo::open(dir.path()).unwrap();
    (dir, repo)
}

/// Append a hand-crafted timestamp commit over the current HEAD and
/// return its id. The token is a decoy (valid base64, not CMS).
fn append_timestamp_commit(repo: &Repo) -> String {
    let parent = repo.head().unwrap();
    let parent_info = repo.read_commit(&parent).unwrap();
    let alg = repo.object_format().unwrap();

    let preimage = binding::preimage(&parent_info.tree, &parent);
    let digest = binding::digest(alg, &parent_info.tree, &parent);

    let mut msg = TimestampMessage::new(alg, preimage, hex::encode(&digest));
    msg.tokens.push(TokenTrailer::assemble(
        "https://tsa.example/tsr",
        "issued by https://tsa.example/tsr",
        "serial=0042 time=2024-06-01T12:00:00+00:00 policy=1.2.3.4",
        b"decoy, not an actual token",
    ));

    repo.commit(&msg.emit()).unwrap()
}

#[test]
fn message_survives_git_round_trip() {
    let (_dir, repo) = scratch_repo();
    let ts_commit = append_timestamp_commit(&repo);

    let commit = repo.read_commit(&ts_commit).unwrap();
    let parsed = TimestampMessage::parse(&commit.message).unwrap();

    assert_eq!(parsed.version, 1);
    assert_eq!(parsed.tokens.len(), 1);
    assert_eq!(parsed.tokens[0].tsa_url, "https://tsa.example/tsr");
    assert_eq!(
        parsed.tokens[0].token_der().unwrap(),
        b"decoy, not an actual token"
    );

    // The preimage recorded in the commit rebinds to the commit's own
    // tree and parent.
    let parent = commit.parents.first().unwrap();
    assert_eq!(
        parsed.preimage.as_deref().unwrap(),
        binding::preimage(&commit.tree, parent)
    );
}

#[test]
fn walker_judges_each_timestamp_commit_once_across_history() {
    let (dir, repo) = scratch_repo();

    let first_ts = append_timestamp_commit(&repo);

    // Two more content commits, then another timestamp commit.
    std::fs::write(dir.path().join("b.txt"), "b\n").unwrap();
    repo.add(&["b.txt".to_string()]).unwrap();
    repo.commit("add b").unwrap();

    std::fs::write(dir.path().join("c.txt"), "c\n").unwrap();
    repo.add(&["c.txt".to_string()]).unwrap();
    repo.commit("add c").unwrap();

    let second_ts = append_timestamp_commit(&repo);

    let verdicts = validate::collect_verdicts(&repo, "HEAD").unwrap();
    let mut seen: Vec<&str> = verdicts.iter().map(|v| v.commit_id.as_str()).collect();
    seen.sort_unstable();

    let mut expected = [first_ts.as_str(), second_ts.as_str()];
    expected.sort_unstable();
    assert_eq!(seen, expected);

    // Decoy-only commits never stand.
    assert!(verdicts.iter().all(|v| !v.ok()));
    assert!(!validate::validate_ref(&repo, "HEAD").unwrap());
}

#[test]
fn hook_is_inert_without_configuration_and_on_its_own_commits() {
    let (_dir, repo) = scratch_repo();

    assert_eq!(hook::run(&repo).unwrap(), HookOutcome::NotConfigured);

    let ts_commit = append_timestamp_commit(&repo);
    assert_eq!(hook::run(&repo).unwrap(), HookOutcome::AlreadyTimestamped);
    assert_eq!(repo.head().unwrap(), ts_commit);
}

#[test]
fn validate_accepts_plain_histories() {
    let (_dir, repo) = scratch_repo();
    assert!(validate::validate_ref(&repo, "HEAD").unwrap());

    let verdicts = validate::collect_verdicts(&repo, "HEAD").unwrap();
    assert!(verdicts.is_empty());
}
