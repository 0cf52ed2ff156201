/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    artifacts::{should_skip, ArtifactStore, ReplayRecord},
    config::PipelineConfig,
    process_control::{self, CommandLine, Redirect},
    supervisor::{self, BackgroundProcess},
};
use anyhow::bail;
use colored::*;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Seed,
    Generate,
    Record,
    Replay,
}
impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Seed, Stage::Generate, Stage::Record, Stage::Replay];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Seed => "seed",
            Stage::Generate => "generate",
            Stage::Record => "record",
            Stage::Replay => "replay",
        }
    }
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
    FullSpeed,
    Paced,
}
impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayMode::FullSpeed => write!(f, "full speed"),
            ReplayMode::Paced => write!(f, "paced"),
        }
    }
}

/// Operation mix handed to the load generator as insert/update/read ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mix {
    InsertOnly,
    UpdateOnly,
    QueryOnly,
}
impl Mix {
    fn ratios(&self) -> (u8, u8, u8) {
        match self {
            Mix::InsertOnly => (1, 0, 0),
            Mix::UpdateOnly => (0, 1, 0),
            Mix::QueryOnly => (0, 0, 1),
        }
    }
}

/// Everything the workload stages share during one run.
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub store: &'a ArtifactStore,
    pub replay_tool: &'a Path,
    pub load_generator: &'a Path,
    pub rebuilt: bool,
}
impl<'a> StageContext<'a> {
    fn skip(&self, artifact_current: bool) -> bool {
        should_skip(self.config.force, self.rebuilt, artifact_current)
    }

    fn log(&self, stage: Stage, connections: u32) -> Redirect {
        Redirect::File(self.store.log(stage.label(), connections))
    }

    fn invoke(template: &str, binary: &Path) -> anyhow::Result<CommandLine> {
        let binary = binary.to_string_lossy().to_string();
        CommandLine::from_template(template, &[("{binary}", binary.as_str())])
    }

    pub fn load_generator_command(
        &self,
        mix: Mix,
        connections: u32,
        duration_secs: u64,
    ) -> anyhow::Result<CommandLine> {
        let (insert, update, read) = mix.ratios();
        let workload = &self.config.settings.workload;
        Ok(
            Self::invoke(&self.config.settings.load_generator.invoke, self.load_generator)?
                .args(["--uri".to_string(), self.config.database_uri()])
                .args(["--insert".to_string(), insert.to_string()])
                .args(["--update".to_string(), update.to_string()])
                .args(["--read".to_string(), read.to_string()])
                .args(["--concurrency".to_string(), connections.to_string()])
                .args(["--duration".to_string(), format!("{}s", duration_secs)])
                .args(["--jobs".to_string(), workload.jobs.to_string()]),
        )
    }

    pub fn reset_database_command(&self) -> anyhow::Result<CommandLine> {
        let eval = format!(
            "db.getSiblingDB('{}').dropDatabase()",
            self.config.settings.workload.database
        );
        Ok(
            CommandLine::from_prefix(&self.config.settings.tools.database_shell)?
                .args(["--host".to_string(), self.config.host.clone()])
                .args(["--port".to_string(), self.config.port.to_string()])
                .arg("--quiet")
                .args(["--eval".to_string(), eval]),
        )
    }

    pub fn capture_command(&self, connections: u32) -> anyhow::Result<CommandLine> {
        Ok(CommandLine::from_prefix(&self.config.settings.tools.capture)?
            .args(["-i".to_string(), self.config.interface.clone()])
            .arg("-w")
            .path_arg(&self.store.partial_capture(connections))
            .args(["port".to_string(), self.config.port.to_string()]))
    }

    pub fn record_command(&self, connections: u32) -> anyhow::Result<CommandLine> {
        Ok(
            Self::invoke(&self.config.settings.replay_tool.invoke, self.replay_tool)?
                .arg("record")
                .arg("-f")
                .path_arg(&self.store.capture(connections))
                .arg("-p")
                .path_arg(&self.store.partial_trace(connections)),
        )
    }

    pub fn play_command(&self, connections: u32, mode: ReplayMode) -> anyhow::Result<CommandLine> {
        let mut cmd = Self::invoke(&self.config.settings.replay_tool.invoke, self.replay_tool)?
            .arg("play")
            .arg("-p")
            .path_arg(&self.store.trace(connections))
            .args(["--host".to_string(), self.config.host_uri()]);
        if mode == ReplayMode::FullSpeed {
            cmd = cmd.arg("--fullSpeed");
        }
        if self.config.profile {
            cmd = cmd
                .args(["--collect", "json", "--report"])
                .path_arg(&self.store.profile(connections));
        }
        Ok(cmd)
    }
}

fn announce(stage: Stage, connections: u32) {
    println!(
        "> {} {} connections",
        stage.label().green(),
        connections.to_string().green()
    );
}

/// Drops the target database and seeds it with an insert-only workload for `connections`.
pub async fn seed(ctx: &StageContext<'_>, connections: u32) -> anyhow::Result<StageOutcome> {
    if ctx.skip(ctx.store.is_seeded(connections)?) {
        info!("Database already seeded for {} connections, skipping", connections);
        return Ok(StageOutcome::Skipped);
    }
    announce(Stage::Seed, connections);
    let log = ctx.log(Stage::Seed, connections);

    process_control::run(
        &ctx.reset_database_command()?,
        &log,
        "Unable to drop the target database",
    )
    .await?;

    // the database is shared by every connection count, so every marker is now stale
    let epoch = ctx.store.advance_epoch()?;
    let pruned = ctx.store.prune_stale_seed_markers()?;
    if !pruned.is_empty() {
        info!("Database reset invalidated seed markers for {:?}", pruned);
    }

    let seed_secs = ctx.config.settings.workload.seed_secs;
    process_control::run(
        &ctx.load_generator_command(Mix::InsertOnly, connections, seed_secs)?,
        &log,
        &format!("Unable to seed the database for {} connections", connections),
    )
    .await?;

    ctx.store.write_seed_marker(connections, epoch)?;
    Ok(StageOutcome::Ran)
}

/// Captures the traffic of a query + update workload for `connections`.
pub async fn generate(ctx: &StageContext<'_>, connections: u32) -> anyhow::Result<StageOutcome> {
    let current = ctx.store.has_capture(connections) || ctx.store.has_trace(connections);
    if ctx.skip(current) {
        info!("Traffic already captured for {} connections, skipping", connections);
        return Ok(StageOutcome::Skipped);
    }
    announce(Stage::Generate, connections);

    let partial = ctx.store.partial_capture(connections);
    ctx.store.remove(&partial)?;
    ctx.store.remove(&ctx.store.capture(connections))?;

    // the capture only takes its final name once it is complete
    if let Err(err) = capture_traffic(ctx, connections, &partial).await {
        ctx.store.remove(&partial)?;
        return Err(err);
    }
    ctx.store.promote(&partial, &ctx.store.capture(connections))?;

    Ok(StageOutcome::Ran)
}

async fn capture_traffic(
    ctx: &StageContext<'_>,
    connections: u32,
    capture_path: &Path,
) -> anyhow::Result<()> {
    let timing = &ctx.config.settings.timing;
    let workload = &ctx.config.settings.workload;
    let log = ctx.log(Stage::Generate, connections);

    let mut capture = BackgroundProcess::launch(
        "capture",
        &ctx.capture_command(connections)?,
        &Redirect::File(ctx.store.log("capture", connections)),
    )?;
    supervisor::wait_for_output(&mut capture, capture_path, timing.settle_timeout()).await?;

    let mut queries = BackgroundProcess::launch(
        "query workload",
        &ctx.load_generator_command(Mix::QueryOnly, connections, workload.generate_secs)?,
        &log,
    )?;
    process_control::run(
        &ctx.load_generator_command(Mix::UpdateOnly, connections, workload.generate_secs)?,
        &log,
        &format!("Unable to run the update workload for {} connections", connections),
    )
    .await?;

    // give the driver a moment to flush the last operations onto the wire
    tokio::time::sleep(timing.driver_flush()).await;

    let query_status = queries.wait_for_exit(timing.terminate_timeout()).await?;
    match query_status {
        Some(status) if !status.success() => {
            bail!(
                "Query workload for {} connections exited with {:?}",
                connections,
                status
            )
        }
        Some(_) => {}
        None => {
            warn!("Query workload outlived the update workload, stopping it");
            queries.terminate(timing.terminate_timeout()).await?;
        }
    }

    capture.terminate(timing.terminate_timeout()).await?;
    let size = supervisor::wait_for_stable_file(
        capture_path,
        timing.settle_interval(),
        timing.settle_timeout(),
    )
    .await?;
    info!("Captured {} bytes for {} connections", size, connections);
    Ok(())
}

/// Converts the capture for `connections` into a replayable trace and discards the capture.
pub async fn record(ctx: &StageContext<'_>, connections: u32) -> anyhow::Result<StageOutcome> {
    if ctx.skip(ctx.store.has_trace(connections)) {
        info!("Trace already recorded for {} connections, skipping", connections);
        return Ok(StageOutcome::Skipped);
    }
    announce(Stage::Record, connections);

    let partial = ctx.store.partial_trace(connections);
    ctx.store.remove(&partial)?;
    ctx.store.remove(&ctx.store.trace(connections))?;
    let recorded = process_control::run(
        &ctx.record_command(connections)?,
        &ctx.log(Stage::Record, connections),
        &format!("Unable to record the trace for {} connections", connections),
    )
    .await;
    if let Err(err) = recorded {
        ctx.store.remove(&partial)?;
        return Err(err);
    }
    ctx.store.promote(&partial, &ctx.store.trace(connections))?;
    ctx.store.remove(&ctx.store.capture(connections))?;

    Ok(StageOutcome::Ran)
}

/// The stored replay result for `connections`, if nothing forces it to be measured again and it
/// was measured against the same target with the same profiling setting.
pub fn replay_current(
    ctx: &StageContext<'_>,
    connections: u32,
) -> anyhow::Result<Option<ReplayRecord>> {
    if ctx.skip(true) {
        ctx.store
            .current_replay_result(connections, &ctx.config.host_uri(), ctx.config.profile)
    } else {
        Ok(None)
    }
}

/// Replays the trace for `connections` against the target and records how long it took. Full
/// speed is tried first; any failure falls back to the tool's default pacing.
pub async fn replay(
    ctx: &StageContext<'_>,
    connections: u32,
) -> anyhow::Result<(StageOutcome, ReplayRecord)> {
    if let Some(record) = replay_current(ctx, connections)? {
        info!("Replay already timed for {} connections, skipping", connections);
        return Ok((StageOutcome::Skipped, record));
    }
    announce(Stage::Replay, connections);
    let log = ctx.log(Stage::Replay, connections);

    let full_speed = process_control::run(
        &ctx.play_command(connections, ReplayMode::FullSpeed)?,
        &log,
        "Full speed replay failed",
    )
    .await;

    let (duration, mode) = match full_speed {
        Ok(duration) => (duration, ReplayMode::FullSpeed),
        Err(err) => {
            warn!("{:#}, falling back to paced replay", err);
            let duration = process_control::run(
                &ctx.play_command(connections, ReplayMode::Paced)?,
                &log,
                &format!("Unable to replay the trace for {} connections", connections),
            )
            .await?;
            (duration, ReplayMode::Paced)
        }
    };

    let record = ReplayRecord::new(
        connections,
        duration,
        mode,
        &ctx.config.host_uri(),
        ctx.config.profile,
    );
    ctx.store.write_replay_result(&record)?;
    Ok((StageOutcome::Ran, record))
}
