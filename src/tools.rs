/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    artifacts::ArtifactStore,
    config::PipelineConfig,
    process_control::{self, CommandLine, Redirect},
};
use anyhow::{anyhow, bail, Context};
use colored::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// An external tool the pipeline depends on, and whether this run had to (re)build it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolBuildResult {
    pub name: String,
    pub binary: PathBuf,
    pub rebuilt: bool,
}

/// Derives the checkout directory from a repository URL. Forks share a project name, so the owner
/// is prepended when the URL has one, e.g. `https://github.com/mongodb/mongo-tools.git` becomes
/// `mongodb-mongo-tools`.
pub fn checkout_dir_name(url: &str) -> anyhow::Result<String> {
    let trimmed = url.trim().trim_end_matches('/');

    // scp-like urls (git@github.com:owner/repo.git) have no scheme
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
        None => match trimmed.split_once(':') {
            Some((host, path)) if !host.contains('/') => path,
            _ => trimmed,
        },
    };

    let segments = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect::<Vec<_>>();

    let repo = segments
        .last()
        .map(|s| s.trim_end_matches(".git"))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Unable to derive a directory name from {}", url))?;

    match segments.len() {
        0 | 1 => Ok(repo.to_string()),
        n => Ok(format!("{}-{}", segments[n - 2], repo)),
    }
}

/// True if any of the labels git reported for HEAD names the requested revision.
pub fn revision_matches(labels: &[String], requested: &str) -> bool {
    labels.iter().any(|label| {
        let label = label.trim();
        let short = ["heads/", "tags/", "remotes/origin/", "remotes/"]
            .iter()
            .find_map(|prefix| label.strip_prefix(prefix))
            .unwrap_or(label);

        let is_commit = requested.len() >= 7 && requested.chars().all(|c| c.is_ascii_hexdigit());
        short == requested || (is_commit && label.starts_with(requested))
    })
}

pub fn replay_tool_dir(config: &PipelineConfig, store: &ArtifactStore) -> anyhow::Result<PathBuf> {
    Ok(store.root().join(checkout_dir_name(&config.repository)?))
}

pub fn replay_tool_binary(
    config: &PipelineConfig,
    store: &ArtifactStore,
) -> anyhow::Result<PathBuf> {
    Ok(replay_tool_dir(config, store)?.join(&config.settings.replay_tool.binary))
}

pub fn load_generator_binary(config: &PipelineConfig, store: &ArtifactStore) -> PathBuf {
    store.root().join(&config.settings.load_generator.binary)
}

fn git(config: &PipelineConfig, dir: &Path) -> anyhow::Result<CommandLine> {
    Ok(CommandLine::from_prefix(&config.settings.tools.git)?
        .arg("-C")
        .path_arg(dir))
}

async fn current_revision_labels(
    config: &PipelineConfig,
    dir: &Path,
) -> anyhow::Result<Vec<String>> {
    let describe = git(config, dir)?.args(["describe", "--all", "--exact-match", "HEAD"]);
    let rev_parse = git(config, dir)?.args(["rev-parse", "HEAD"]);

    let mut labels = vec![];
    for cmd in [describe, rev_parse] {
        if let Some(label) = process_control::output(&cmd).await? {
            labels.push(label);
        }
    }
    Ok(labels)
}

/// Ensures the record/replay tool is checked out at the configured revision and built.
pub async fn ensure_replay_tool(
    config: &PipelineConfig,
    store: &ArtifactStore,
) -> anyhow::Result<ToolBuildResult> {
    let dir = replay_tool_dir(config, store)?;
    let binary = replay_tool_binary(config, store)?;
    let log = Redirect::File(store.build_log("replay-tool"));
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "replay-tool".to_string());

    if config.force || !dir.exists() {
        if dir.exists() {
            fs::remove_dir_all(&dir).context(format!("Unable to remove {}", dir.display()))?;
        }

        println!("> cloning {}", config.repository.green());
        let clone = CommandLine::from_prefix(&config.settings.tools.git)?
            .arg("clone")
            .arg(config.repository.clone())
            .path_arg(&dir);
        process_control::run(
            &clone,
            &log,
            &format!("Unable to clone {}", config.repository),
        )
        .await?;
    }

    let labels = current_revision_labels(config, &dir).await?;
    if revision_matches(&labels, &config.revision) && binary.exists() {
        info!(
            "{} is already built at {}, skipping build",
            name, config.revision
        );
        return Ok(ToolBuildResult {
            name,
            binary,
            rebuilt: false,
        });
    }

    println!(
        "> building {} at {}",
        name.green(),
        config.revision.green()
    );
    let steps = [
        (
            git(config, &dir)?.args(["clean", "-fdx"]),
            format!("Unable to clean {}", dir.display()),
        ),
        (
            git(config, &dir)?.args(["reset", "--hard", "HEAD"]),
            format!("Unable to reset {}", dir.display()),
        ),
        (
            git(config, &dir)?.arg("checkout").arg(config.revision.clone()),
            format!("Unable to checkout {}", config.revision),
        ),
        (
            CommandLine::from_prefix(&config.settings.replay_tool.build)?.current_dir(&dir),
            format!("Unable to build {}", name),
        ),
    ];
    for (cmd, failure_message) in steps.iter() {
        process_control::run(cmd, &log, failure_message).await?;
    }

    if !binary.exists() {
        bail!(
            "Build of {} finished but {} was not produced",
            name,
            binary.display()
        );
    }

    Ok(ToolBuildResult {
        name,
        binary,
        rebuilt: true,
    })
}

/// Ensures the load generator exists. It is not pinned to a revision, so it is only rebuilt when
/// forced or when its binary is missing.
pub async fn ensure_load_generator(
    config: &PipelineConfig,
    store: &ArtifactStore,
) -> anyhow::Result<ToolBuildResult> {
    let binary = load_generator_binary(config, store);
    let name = "load-generator".to_string();

    if !config.force && binary.exists() {
        info!("{} already exists, skipping build", binary.display());
        return Ok(ToolBuildResult {
            name,
            binary,
            rebuilt: false,
        });
    }

    if let Some(parent) = binary.parent() {
        fs::create_dir_all(parent)?;
    }

    println!("> building {}", name.green());
    let binary_str = binary.to_string_lossy().to_string();
    let build = CommandLine::from_template(
        &config.settings.load_generator.build,
        &[("{binary}", binary_str.as_str())],
    )?
    .current_dir(store.root());
    process_control::run(
        &build,
        &Redirect::File(store.build_log(&name)),
        "Unable to build the load generator",
    )
    .await?;

    if !binary.exists() {
        bail!(
            "Build of {} finished but {} was not produced",
            name,
            binary.display()
        );
    }

    Ok(ToolBuildResult {
        name,
        binary,
        rebuilt: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_dir_is_prefixed_with_the_owner() -> anyhow::Result<()> {
        assert_eq!(
            checkout_dir_name("https://github.com/mongodb/mongo-tools")?,
            "mongodb-mongo-tools"
        );
        assert_eq!(
            checkout_dir_name("https://github.com/someone/mongo-tools.git/")?,
            "someone-mongo-tools"
        );
        assert_eq!(
            checkout_dir_name("git@github.com:someone/mongo-tools.git")?,
            "someone-mongo-tools"
        );
        Ok(())
    }

    #[test]
    fn checkout_dir_without_owner_is_the_repo_name() -> anyhow::Result<()> {
        assert_eq!(checkout_dir_name("mongo-tools")?, "mongo-tools");
        assert_eq!(checkout_dir_name("https://example.com/mongo-tools.git")?, "mongo-tools");
        Ok(())
    }

    #[test]
    fn checkout_dir_needs_a_repo_segment() {
        assert!(checkout_dir_name("").is_err());
        assert!(checkout_dir_name("https://github.com/").is_err());
    }

    #[test]
    fn revisions_match_branch_and_tag_labels() {
        let labels = vec!["heads/master".to_string()];
        assert!(revision_matches(&labels, "master"));
        assert!(!revision_matches(&labels, "r3.6.0"));

        let labels = vec!["tags/r3.6.0".to_string()];
        assert!(revision_matches(&labels, "r3.6.0"));
    }

    #[test]
    fn revisions_match_commit_prefixes() {
        let labels = vec!["0123456789abcdef0123456789abcdef01234567".to_string()];
        assert!(revision_matches(&labels, "0123456789ab"));
        assert!(!revision_matches(&labels, "fedcba9"));
        // too short to be treated as a commit
        assert!(!revision_matches(&labels, "0123"));
    }

    #[test]
    fn unknown_revision_never_matches() {
        assert!(!revision_matches(&[], "master"));
    }
}
