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

use std::io::{BufRead, Write};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use git_timeseal::{
    chain,
    config::Settings,
    crypto::x509,
    hook::{self, HookOutcome},
    repo::Repo,
    time_stamp::request_token,
    trust::TrustStore,
    validate,
};

#[derive(Parser)]
#[command(
    name = "git-timeseal",
    version,
    about = "RFC 3161 trusted-timestamp sealing for git histories"
)]
struct CliArgs {
    /// Increase log verbosity (-v, -vv, ...).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the post-commit hook: append a timestamp commit to HEAD.
    PostCommit,

    /// Walk the ancestry of a ref and check every timestamp commit.
    Validate {
        /// Commit-ish to start from.
        #[arg(default_value = "HEAD")]
        reference: String,
    },

    /// Fetch a TSA's chain and install its root into the trust store.
    Trust {
        /// URL of the time stamping authority.
        tsa_url: String,

        /// Install without asking.
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            3.. => LevelFilter::Trace,
        })
        .init();

    match args.command {
        Commands::PostCommit => post_commit(),
        Commands::Validate { reference } => validate_cmd(&reference),
        Commands::Trust { tsa_url, yes } => trust_cmd(&tsa_url, yes),
    }
}

fn post_commit() -> Result<()> {
    let repo = Repo::discover()?;

    match hook::run(&repo)? {
        HookOutcome::NotConfigured => {
            log::debug!("no timestamping.tsa0.url configured; commit left untouched");
        }
        HookOutcome::AlreadyTimestamped => {
            log::debug!("HEAD is already a timestamp commit");
        }
        HookOutcome::Sealed {
            commit_id,
            token_count,
        } => {
            eprintln!("Appended timestamp commit {commit_id} with {token_count} token(s).");
        }
    }

    Ok(())
}

fn validate_cmd(reference: &str) -> Result<()> {
    let repo = Repo::discover()?;

    if validate::validate_ref(&repo, reference)? {
        Ok(())
    } else {
        // Per-commit diagnostics already went to stdout/stderr.
        process::exit(1);
    }
}

fn trust_cmd(tsa_url: &str, yes: bool) -> Result<()> {
    let repo = Repo::discover()?;
    let settings = Settings::from_repo(&repo)?;
    let agent = settings.http_agent();

    let store_dir = TrustStore::default_dir(repo.git_dir());
    let mut store = TrustStore::load(&store_dir)?;

    // Any digest works for the probe token; it is never recorded.
    let alg = repo.object_format()?;
    let digest = alg.digest(b"trust anchor probe");

    let reply = request_token(&agent, tsa_url, alg, &digest, true)
        .with_context(|| format!("requesting a probe token from {tsa_url}"))?;

    let chain = chain::collect_chain_for_token(&agent, tsa_url, &reply.token_der, &store)?;
    let root = chain.last().context("TSA produced an empty chain")?;

    println!("Root certificate of {tsa_url}:");
    println!(
        "  {}",
        x509::subject_line(root).unwrap_or_else(|| "<unparsable subject>".to_string())
    );
    if let Some((not_before, not_after)) = x509::validity_window(root) {
        println!("  valid {} .. {}", fmt_time(not_before), fmt_time(not_after));
    }
    println!(
        "  SHA-256 fingerprint: {}",
        hex::encode(git_timeseal::crypto::hash::sha256(root))
    );

    if store.contains(root) {
        println!("Already installed in {}.", store_dir.display());
        return Ok(());
    }

    if !yes && !confirm("Trust this root for timestamp validation? [y/N] ")? {
        bail!("aborted; nothing installed");
    }

    let path = store.install(root)?;
    println!("Installed {}.", path.display());

    Ok(())
}

fn fmt_time(t: i64) -> String {
    chrono::DateTime::from_timestamp(t, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| t.to_string())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
