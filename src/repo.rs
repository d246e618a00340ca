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

//! Thin wrapper over git plumbing.
//!
//! All repository access goes through the `git` binary; this crate never
//! re-implements object hashing or tree writing. Commands run with the
//! repository work tree as their working directory.

use std::path::{Path, PathBuf};

use xshell::{cmd, Shell};

use crate::{
    crypto::hash::HashAlg,
    error::{Error, Result},
};

/// Header and message of one commit object.
#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub id: String,
    pub tree: String,
    pub parents: Vec<String>,
    pub message: String,
}

impl CommitInfo {
    /// First message line.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// A git repository addressed through plumbing commands.
pub struct Repo {
    sh: Shell,
    git_dir: PathBuf,
    work_dir: PathBuf,
}

impl Repo {
    /// Open the repository containing `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let sh = Shell::new().map_err(|e| Error::Git(e.to_string()))?;
        sh.change_dir(dir);

        let git_dir = cmd!(sh, "git rev-parse --absolute-git-dir")
            .read()
            .map_err(|e| Error::Config(format!("not inside a git repository: {e}")))?;
        let work_dir = cmd!(sh, "git rev-parse --show-toplevel")
            .read()
            .map_err(|e| Error::Config(format!("repository has no work tree: {e}")))?;

        let work_dir = PathBuf::from(work_dir.trim());
        sh.change_dir(&work_dir);

        Ok(Self {
            sh,
            git_dir: PathBuf::from(git_dir.trim()),
            work_dir,
        })
    }

    /// Open the repository containing the current directory.
    pub fn discover() -> Result<Self> {
        Self::open(Path::new("."))
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn read(&self, cmd: xshell::Cmd<'_>) -> Result<String> {
        cmd.read().map_err(|e| Error::Git(e.to_string()))
    }

    /// The repository's object hash algorithm.
    pub fn object_format(&self) -> Result<HashAlg> {
        let sh = &self.sh;
        let format = self.read(cmd!(sh, "git rev-parse --show-object-format"))?;
        HashAlg::from_git_format(format.trim())
            .ok_or_else(|| Error::Git(format!("unsupported object format {format}")))
    }

    /// Resolve a ref to a commit id.
    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        let sh = &self.sh;
        let spec = format!("{reference}^{{commit}}");
        Ok(self
            .read(cmd!(sh, "git rev-parse --verify {spec}"))?
            .trim()
            .to_string())
    }

    /// Commit id at HEAD.
    pub fn head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Read and parse one commit object.
    pub fn read_commit(&self, id: &str) -> Result<CommitInfo> {
        let sh = &self.sh;
        let raw = self.read(cmd!(sh, "git cat-file commit {id}"))?;

        let (headers, message) = raw
            .split_once("\n\n")
            .ok_or_else(|| Error::Git(format!("malformed commit object {id}")))?;

        let mut tree = None;
        let mut parents = Vec::new();

        for line in headers.lines() {
            if let Some(t) = line.strip_prefix("tree ") {
                tree = Some(t.to_string());
            } else if let Some(p) = line.strip_prefix("parent ") {
                parents.push(p.to_string());
            }
        }

        Ok(CommitInfo {
            id: id.to_string(),
            tree: tree.ok_or_else(|| Error::Git(format!("commit {id} has no tree")))?,
            parents,
            message: message.to_string(),
        })
    }

    /// Read one git config value; `None` when the key is unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let sh = &self.sh;
        let out = cmd!(sh, "git config --get {key}")
            .ignore_status()
            .output()
            .map_err(|e| Error::Git(e.to_string()))?;

        if out.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&out.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Stage the given paths (relative to the work tree).
    pub fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let sh = &self.sh;
        self.read(cmd!(sh, "git add -- {paths...}"))?;
        Ok(())
    }

    /// Write the index out as a tree and return its id.
    pub fn write_tree(&self) -> Result<String> {
        let sh = &self.sh;
        Ok(self.read(cmd!(sh, "git write-tree"))?.trim().to_string())
    }

    /// Create a commit from the index with the given message, allowing an
    /// empty diff, and return the new commit id.
    pub fn commit(&self, message: &str) -> Result<String> {
        let sh = &self.sh;
        let file = self.git_dir.join("TIMESTAMP_COMMIT_MSG");
        std::fs::write(&file, message)?;

        let result = self.read(cmd!(sh, "git commit --quiet --allow-empty -F {file}"));
        let _ = std::fs::remove_file(&file);
        result?;

        self.head()
    }

    /// Read a blob at `<commit>:<path>`; `None` when it does not exist in
    /// that tree.
    pub fn show_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let sh = &self.sh;
        let spec = format!("{commit}:{path}");
        let out = cmd!(sh, "git show {spec}")
            .ignore_status()
            .output()
            .map_err(|e| Error::Git(e.to_string()))?;

        if out.status.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    /// Move the branch tip back one commit, leaving index and work tree
    /// as they are.
    pub fn soft_rewind(&self) -> Result<()> {
        let sh = &self.sh;
        self.read(cmd!(sh, "git reset --quiet --soft HEAD^"))?;
        Ok(())
    }

    /// Repository integrity check.
    pub fn fsck(&self) -> Result<()> {
        let sh = &self.sh;
        let out = cmd!(sh, "git fsck --no-progress")
            .ignore_status()
            .output()
            .map_err(|e| Error::Git(e.to_string()))?;

        if out.status.success() {
            Ok(())
        } else {
            Err(Error::RepositoryCorrupt(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Create a scratch repository with one initial commit.
    pub(crate) fn scratch_repo() -> (tempfile::TempDir, Repo) {
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

    #[test]
    fn reads_head_commit() {
        let (_dir, repo) = scratch_repo();

        let head = repo.head().unwrap();
        let commit = repo.read_commit(&head).unwrap();

        assert_eq!(commit.id, head);
        assert!(commit.parents.is_empty());
        assert_eq!(commit.subject(), "init");
        assert!(!commit.tree.is_empty());
    }

    #[test]
    fn object_format_is_known() {
        let (_dir, repo) = scratch_repo();
        let alg = repo.object_format().unwrap();
        assert!(matches!(alg, HashAlg::Sha1 | HashAlg::Sha256));
    }

    #[test]
    fn config_get_distinguishes_unset() {
        let (_dir, repo) = scratch_repo();
        assert_eq!(repo.config_get("timestamping.tsa0.url").unwrap(), None);

        let sh = Shell::new().unwrap();
        sh.change_dir(repo.work_dir());
        cmd!(sh, "git config timestamping.tsa0.url https://tsa.example")
            .read()
            .unwrap();

        assert_eq!(
            repo.config_get("timestamping.tsa0.url").unwrap().as_deref(),
            Some("https://tsa.example")
        );
    }

    #[test]
    fn commit_and_rewind_round_trip() {
        let (_dir, repo) = scratch_repo();
        let first = repo.head().unwrap();

        let second = repo.commit("Trusted timestamp\n\nToken-Version: 1\n").unwrap();
        assert_ne!(first, second);

        let commit = repo.read_commit(&second).unwrap();
        assert_eq!(commit.parents, vec![first.clone()]);

        repo.soft_rewind().unwrap();
        assert_eq!(repo.head().unwrap(), first);
    }

    #[test]
    fn staged_file_enters_tree_and_blob_is_readable() {
        let (dir, repo) = scratch_repo();

        std::fs::create_dir_all(dir.path().join(".timestampltv/certs")).unwrap();
        std::fs::write(dir.path().join(".timestampltv/certs/abcd.cer"), b"PEMDATA").unwrap();
        repo.add(&[".timestampltv/certs/abcd.cer".to_string()])
            .unwrap();

        let tree_before = repo.write_tree().unwrap();
        let commit = repo.commit("Trusted timestamp\n\nToken-Version: 1\n").unwrap();
        let info = repo.read_commit(&commit).unwrap();
        assert_eq!(info.tree, tree_before);

        let blob = repo
            .show_blob(&commit, ".timestampltv/certs/abcd.cer")
            .unwrap()
            .unwrap();
        assert_eq!(blob, b"PEMDATA");

        assert_eq!(repo.show_blob(&commit, "missing/file").unwrap(), None);
    }

    #[test]
    fn fsck_passes_on_fresh_repo() {
        let (_dir, repo) = scratch_repo();
        repo.fsck().unwrap();
    }
}
