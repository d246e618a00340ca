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

//! The timestamp trust store.
//!
//! A directory of PEM-encoded self-signed roots named
//! `<subject_hash>.0` (the per-user CA-path convention), conventionally
//! `<git_dir>/hooks/trustanchors/`. Trust granted here is scoped to
//! timestamp validation only; it is fully isolated from any host trust
//! store.

use std::path::{Path, PathBuf};

use crate::{
    crypto::x509,
    error::{Error, Result},
};

/// A loaded set of trust anchors.
pub struct TrustStore {
    dir: PathBuf,
    anchors: Vec<Vec<u8>>,
}

impl TrustStore {
    /// The conventional store location for a repository.
    pub fn default_dir(git_dir: &Path) -> PathBuf {
        git_dir.join("hooks").join("trustanchors")
    }

    /// Load every PEM certificate under `dir`. A missing directory is an
    /// empty store, not an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut anchors = Vec::new();

        if dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect();
            entries.sort();

            for path in entries {
                if !path.is_file() {
                    continue;
                }
                let Ok(data) = std::fs::read(&path) else {
                    continue;
                };
                // Non-PEM files are skipped silently.
                anchors.extend(x509::pems_from(&data));
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            anchors,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn anchors(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.anchors.iter()
    }

    /// Bitwise membership test.
    pub fn contains(&self, cert_der: &[u8]) -> bool {
        self.anchors.iter().any(|anchor| anchor == cert_der)
    }

    /// Find an anchor that issued `cert_der` (subject matches the cert's
    /// issuer and the signature verifies).
    pub fn find_issuer(&self, cert_der: &[u8]) -> Option<&Vec<u8>> {
        self.anchors
            .iter()
            .find(|anchor| x509::issues(anchor, cert_der))
    }

    /// Install a self-signed root as `<subject_hash>.0`, creating the
    /// store directory as needed. Returns the file path written.
    pub fn install(&mut self, root_der: &[u8]) -> Result<PathBuf> {
        if !x509::is_self_signed(root_der) {
            return Err(Error::ChainIncomplete(
                "refusing to install a non-self-signed certificate as trust anchor".to_string(),
            ));
        }

        let hash = x509::subject_hash(root_der).ok_or_else(|| {
            Error::ChainIncomplete("cannot compute subject hash of root".to_string())
        })?;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{hash}.0"));
        std::fs::write(&path, x509::pem("CERTIFICATE", root_der))?;

        if !self.contains(root_der) {
            self.anchors.push(root_der.to_vec());
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::crypto::x509::pem;

    #[test]
    fn missing_directory_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::load(&dir.path().join("nonexistent")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn non_pem_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), "not a certificate").unwrap();
        std::fs::write(dir.path().join("junk.0"), [0u8, 1, 2, 3]).unwrap();

        let store = TrustStore::load(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn pem_blocks_are_loaded_and_matched_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let fake_der = vec![0x30u8, 0x03, 0x02, 0x01, 0x00];
        std::fs::write(dir.path().join("0a1b2c3d.0"), pem("CERTIFICATE", &fake_der)).unwrap();

        let store = TrustStore::load(dir.path()).unwrap();
        assert!(!store.is_empty());
        assert!(store.contains(&fake_der));
        assert!(!store.contains(&[0x30, 0x00]));
    }

    #[test]
    fn install_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TrustStore::load(dir.path()).unwrap();
        assert!(store.install(b"not a certificate").is_err());
    }
}
