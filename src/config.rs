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

//! Settings read from git local config.
//!
//! | Key | Meaning |
//! |---|---|
//! | `timestamping.tsaN.url` | URL of TSA N; scanning stops at the first missing N |
//! | `timestamping.tsaN.optional` | when true, a failure of TSA N is a warning |
//! | `timestamping.timeout` | per-HTTP-request timeout in seconds (default 30) |

use std::time::Duration;

use crate::{
    error::{Error, Result},
    repo::Repo,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One configured Time Stamping Authority.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TsaConfig {
    pub index: u32,
    pub url: String,
    pub optional: bool,
}

/// All timestamping settings of one repository.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    pub tsas: Vec<TsaConfig>,
    pub timeout: Duration,
}

impl Settings {
    /// Read settings from the repository's git config.
    ///
    /// An absent `timestamping.tsa0.url` yields an empty TSA list; the
    /// post-commit hook treats that as "not configured" and does nothing.
    pub fn from_repo(repo: &Repo) -> Result<Self> {
        Self::from_lookup(|key| repo.config_get(key))
    }

    /// Settings from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let mut tsas = Vec::new();

        // TSA indices must be contiguous from zero.
        for index in 0.. {
            let Some(url) = lookup(&format!("timestamping.tsa{index}.url"))? else {
                break;
            };

            if url.is_empty() {
                return Err(Error::Config(format!(
                    "timestamping.tsa{index}.url is empty"
                )));
            }

            let optional = match lookup(&format!("timestamping.tsa{index}.optional"))? {
                Some(value) => parse_bool(&value).ok_or_else(|| {
                    Error::Config(format!(
                        "timestamping.tsa{index}.optional is not a boolean: {value}"
                    ))
                })?,
                None => false,
            };

            tsas.push(TsaConfig {
                index,
                url,
                optional,
            });
        }

        let timeout = match lookup("timestamping.timeout")? {
            Some(value) => {
                let secs: u64 = value.parse().map_err(|_| {
                    Error::Config(format!("timestamping.timeout is not a number: {value}"))
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self { tsas, timeout })
    }

    /// True when no TSA is configured at all.
    pub fn is_unconfigured(&self) -> bool {
        self.tsas.is_empty()
    }

    /// A blocking HTTP agent honoring the configured timeout.
    pub fn http_agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new().timeout(self.timeout).build()
    }
}

// git-style booleans
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;

    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| Ok(map.get(key).cloned()))
    }

    #[test]
    fn empty_config_is_unconfigured() {
        let settings = settings_from(&[]).unwrap();
        assert!(settings.is_unconfigured());
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }

    #[test]
    fn scanning_stops_at_first_gap() {
        let settings = settings_from(&[
            ("timestamping.tsa0.url", "https://a.example/tsr"),
            ("timestamping.tsa1.url", "https://b.example/tsr"),
            ("timestamping.tsa1.optional", "true"),
            // tsa2 missing; tsa3 must be ignored
            ("timestamping.tsa3.url", "https://ghost.example/tsr"),
        ])
        .unwrap();

        assert_eq!(settings.tsas.len(), 2);
        assert!(!settings.tsas[0].optional);
        assert!(settings.tsas[1].optional);
        assert_eq!(settings.tsas[1].url, "https://b.example/tsr");
    }

    #[test]
    fn timeout_is_configurable() {
        let settings = settings_from(&[
            ("timestamping.tsa0.url", "https://a.example/tsr"),
            ("timestamping.timeout", "5"),
        ])
        .unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        assert!(matches!(
            settings_from(&[
                ("timestamping.tsa0.url", "https://a.example/tsr"),
                ("timestamping.tsa0.optional", "maybe"),
            ]),
            Err(Error::Config(_))
        ));

        assert!(matches!(
            settings_from(&[
                ("timestamping.tsa0.url", "https://a.example/tsr"),
                ("timestamping.timeout", "soon"),
            ]),
            Err(Error::Config(_))
        ));
    }
}
