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

//! The versioned Long-Term-Validation store.
//!
//! Certificate chains and CRL bundles live as ordinary files under
//! `.timestampltv/` in the work tree, keyed by issuer id, so they enter
//! the very tree whose digest gets timestamped:
//!
//! - `.timestampltv/certs/<iid>.cer`: full chain, signer first, self-signed
//!   root last, each block preceded by `subject=` / `issuer=` lines;
//! - `.timestampltv/crls/<iid>.crl`: concatenated CRL PEMs covering every
//!   non-root certificate in the matching chain, in chain order.

use std::path::{Path, PathBuf};

use crate::{
    crypto::x509,
    error::{Error, Result},
    repo::Repo,
};

/// Reserved directory below the repository root.
pub const LTV_DIR: &str = ".timestampltv";

/// Repository-relative path of the chain file for an issuer id.
pub fn cert_path(iid: &str) -> String {
    format!("{LTV_DIR}/certs/{iid}.cer")
}

/// Repository-relative path of the CRL bundle for an issuer id.
pub fn crl_path(iid: &str) -> String {
    format!("{LTV_DIR}/crls/{iid}.crl")
}

/// The LTV file store of one work tree.
pub struct LtvStore {
    root: PathBuf,
}

impl LtvStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            root: work_dir.to_path_buf(),
        }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Serialize a chain (signer first, root last) to the chain file and
    /// stage it. Each certificate gets a human-readable `subject=` /
    /// `issuer=` preamble ahead of its PEM block.
    pub fn write_chain(&self, repo: &Repo, iid: &str, chain: &[Vec<u8>]) -> Result<String> {
        let mut out = String::new();

        for cert in chain {
            if let Some(line) = x509::subject_line(cert) {
                out.push_str(&line);
                out.push('\n');
            }
            if let Some(line) = x509::issuer_line(cert) {
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str(&x509::pem("CERTIFICATE", cert));
        }

        let rel = cert_path(iid);
        self.write_and_stage(repo, &rel, out.as_bytes())?;
        Ok(rel)
    }

    /// Write a CRL PEM bundle and stage it.
    pub fn write_crls(&self, repo: &Repo, iid: &str, pem_bundle: &str) -> Result<String> {
        let rel = crl_path(iid);
        self.write_and_stage(repo, &rel, pem_bundle.as_bytes())?;
        Ok(rel)
    }

    /// Write raw bytes to an LTV-relative path and stage the file.
    pub fn write_and_stage(&self, repo: &Repo, rel: &str, data: &[u8]) -> Result<()> {
        let path = self.abs(rel);
        let parent = path
            .parent()
            .ok_or_else(|| Error::Git(format!("bad LTV path {rel}")))?;
        std::fs::create_dir_all(parent)?;
        std::fs::write(&path, data)?;
        repo.add(&[rel.to_string()])?;
        Ok(())
    }

    /// Read the chain file for an issuer id back to DER blobs, signer
    /// first. `None` when the file is not in the work tree.
    pub fn read_chain(&self, iid: &str) -> Option<Vec<Vec<u8>>> {
        let data = std::fs::read(self.abs(&cert_path(iid))).ok()?;
        let chain = x509::pems_from(&data);
        if chain.is_empty() {
            None
        } else {
            Some(chain)
        }
    }

    /// Read the CRL bundle for an issuer id as DER blobs.
    pub fn read_crls(&self, iid: &str) -> Option<Vec<Vec<u8>>> {
        let data = std::fs::read(self.abs(&crl_path(iid))).ok()?;
        let crls = x509::pems_from(&data);
        if crls.is_empty() {
            None
        } else {
            Some(crls)
        }
    }
}
