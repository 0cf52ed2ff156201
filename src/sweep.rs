/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    artifacts::{ArtifactStore, ReplayRecord},
    config::PipelineConfig,
    stages::{self, ReplayMode, Stage, StageContext, StageOutcome},
    tools::{self, ToolBuildResult},
};
use colored::*;
use nanoid::nanoid;
use std::time::Duration;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tracing::info;

/// Result of the full stage sequence for one connection count.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepEntry {
    pub connections: u32,
    pub duration: Duration,
    pub mode: ReplayMode,
    pub stages: Vec<(Stage, StageOutcome)>,
}
impl SweepEntry {
    fn cached(record: ReplayRecord) -> Self {
        Self {
            connections: record.connections,
            duration: record.duration(),
            mode: record.mode,
            stages: Stage::ALL
                .iter()
                .map(|stage| (*stage, StageOutcome::Skipped))
                .collect(),
        }
    }

    pub fn outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| *outcome)
    }

    /// True if the replay was timed during this run rather than read back from a previous one.
    pub fn measured(&self) -> bool {
        self.outcome(Stage::Replay) == Some(StageOutcome::Ran)
    }

    pub fn executions(&self) -> usize {
        self.stages
            .iter()
            .filter(|(_, outcome)| *outcome == StageOutcome::Ran)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub run_id: String,
    pub tools: Vec<ToolBuildResult>,
    pub entries: Vec<SweepEntry>,
}
impl SweepResult {
    /// (connections, replay seconds) in the order the connection counts were configured.
    pub fn timings(&self) -> Vec<(u32, f64)> {
        self.entries
            .iter()
            .map(|entry| (entry.connections, entry.duration.as_secs_f64()))
            .collect()
    }

    pub fn rebuilt(&self) -> bool {
        self.tools.iter().any(|tool| tool.rebuilt)
    }

    pub fn stage_executions(&self) -> usize {
        self.entries.iter().map(SweepEntry::executions).sum()
    }

    pub fn render_summary(&self) -> String {
        let mut rows = rows![row![
            TableCell::builder("Connections".bold()).build(),
            TableCell::builder("Replay (s)".bold()).build(),
            TableCell::builder("Mode".bold()).build(),
            TableCell::builder("Measured".bold()).build()
        ]];

        for entry in self.entries.iter() {
            let measured = match entry.measured() {
                true => "this run".green(),
                false => "previous run".bright_black(),
            };
            rows.push(row![
                TableCell::new(entry.connections),
                TableCell::new(format!("{:.3}s", entry.duration.as_secs_f64())),
                TableCell::new(entry.mode),
                TableCell::new(measured)
            ]);
        }

        Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build()
            .render()
    }
}

/// Runs seed, generate, record and replay for one connection count.
pub async fn sweep_connections(
    ctx: &StageContext<'_>,
    connections: u32,
) -> anyhow::Result<SweepEntry> {
    // nothing downstream of the replay consumes the other artifacts
    if let Some(record) = stages::replay_current(ctx, connections)? {
        info!(
            "Replay result for {} connections is current, skipping every stage",
            connections
        );
        return Ok(SweepEntry::cached(record));
    }

    let seed = stages::seed(ctx, connections).await?;
    let generate = stages::generate(ctx, connections).await?;
    let record = stages::record(ctx, connections).await?;
    let (replay, replay_record) = stages::replay(ctx, connections).await?;

    // the trace is the durable artifact
    ctx.store.remove(&ctx.store.capture(connections))?;

    Ok(SweepEntry {
        connections,
        duration: replay_record.duration(),
        mode: replay_record.mode,
        stages: vec![
            (Stage::Seed, seed),
            (Stage::Generate, generate),
            (Stage::Record, record),
            (Stage::Replay, replay),
        ],
    })
}

/// Builds both tools, then sweeps every configured connection count in order.
pub async fn run_pipeline(config: &PipelineConfig) -> anyhow::Result<SweepResult> {
    config.validate()?;

    let run_id = nanoid!(5, &nanoid::alphabet::SAFE);
    let store = ArtifactStore::new(&config.work_dir)?;
    info!(
        "Starting run {} in {} for connections {:?}",
        run_id,
        store.root().display(),
        config.connections
    );

    let replay_tool = tools::ensure_replay_tool(config, &store).await?;
    let load_generator = tools::ensure_load_generator(config, &store).await?;
    let rebuilt = replay_tool.rebuilt || load_generator.rebuilt;
    if rebuilt {
        info!("Tools were rebuilt, every stage will run");
    }

    let ctx = StageContext {
        config,
        store: &store,
        replay_tool: &replay_tool.binary,
        load_generator: &load_generator.binary,
        rebuilt,
    };

    let mut entries = vec![];
    for connections in config.connections.iter().copied() {
        let entry = sweep_connections(&ctx, connections).await?;
        let suffix = match entry.measured() {
            true => format!("({})", entry.mode),
            false => "(previous run)".to_string(),
        };
        println!(
            "> {} connections replayed in {} {}",
            connections.to_string().green(),
            format!("{:.3}s", entry.duration.as_secs_f64()).green(),
            suffix.bright_black()
        );
        entries.push(entry);
    }

    Ok(SweepResult {
        run_id,
        tools: vec![replay_tool, load_generator],
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(connections: u32, secs: f64, replay: StageOutcome) -> SweepEntry {
        SweepEntry {
            connections,
            duration: Duration::from_secs_f64(secs),
            mode: ReplayMode::FullSpeed,
            stages: vec![
                (Stage::Seed, StageOutcome::Skipped),
                (Stage::Generate, StageOutcome::Ran),
                (Stage::Record, StageOutcome::Ran),
                (Stage::Replay, replay),
            ],
        }
    }

    #[test]
    fn timings_keep_input_order() {
        let result = SweepResult {
            run_id: "abcde".to_string(),
            tools: vec![],
            entries: vec![
                entry(50, 2.5, StageOutcome::Ran),
                entry(10, 1.0, StageOutcome::Ran),
            ],
        };
        assert_eq!(result.timings(), vec![(50, 2.5), (10, 1.0)]);
        assert_eq!(result.stage_executions(), 6);
        assert!(!result.rebuilt());
    }

    #[test]
    fn cached_entries_ran_nothing() {
        let record = ReplayRecord::new(
            20,
            Duration::from_secs(3),
            ReplayMode::Paced,
            "mongodb://localhost:27017",
            false,
        );
        let entry = SweepEntry::cached(record);
        assert_eq!(entry.connections, 20);
        assert_eq!(entry.executions(), 0);
        assert!(!entry.measured());
        assert_eq!(entry.outcome(Stage::Seed), Some(StageOutcome::Skipped));
    }

    #[test]
    fn summary_lists_every_connection_count() {
        let result = SweepResult {
            run_id: "abcde".to_string(),
            tools: vec![],
            entries: vec![
                entry(10, 1.0, StageOutcome::Ran),
                entry(20, 2.0, StageOutcome::Skipped),
            ],
        };
        let summary = result.render_summary();
        assert!(summary.contains("Connections"));
        assert!(summary.contains("1.000s"));
        assert!(summary.contains("2.000s"));
    }
}
