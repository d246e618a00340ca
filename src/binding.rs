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

//! The digest handed to TSAs, and the preimage it is computed from.
//!
//! The preimage is a byte-exact UTF-8 string naming the timestamp commit's
//! own tree and its parent. Nothing else -- no clock, no configuration, no
//! randomness -- enters it, so any future holder of the repository can
//! recompute the digest from a checkout alone.

use crate::crypto::hash::HashAlg;

/// The canonical preimage text: `parent:<parent-hex>,tree:<tree-hex>`,
/// lowercase hex throughout.
pub fn preimage(tree: &str, parent: &str) -> String {
    format!("parent:{parent},tree:{tree}")
}

/// The digest sent to TSAs: the repository hash algorithm applied to the
/// preimage bytes.
pub fn digest(alg: HashAlg, tree: &str, parent: &str) -> Vec<u8> {
    alg.digest(preimage(tree, parent).as_bytes())
}
