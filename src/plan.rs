/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    artifacts::{should_skip, ArtifactStore},
    config::PipelineConfig,
    stages::Stage,
    tools,
};
use colored::*;
use term_table::{row::Row, table_cell::*, Table, TableStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Skip,
}
impl Action {
    fn decide(force: bool, rebuilt: bool, artifact_current: bool) -> Self {
        match should_skip(force, rebuilt, artifact_current) {
            true => Action::Skip,
            false => Action::Run,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub connections: u32,
    pub actions: Vec<(Stage, Action)>,
}
impl PlannedEntry {
    pub fn action(&self, stage: Stage) -> Option<Action> {
        self.actions
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, action)| *action)
    }
}

/// Whether a run would rebuild either tool. The checked out revision can't be inspected without
/// running git, so only missing binaries and `--force` are taken into account.
pub fn assume_rebuilt(config: &PipelineConfig, store: &ArtifactStore) -> anyhow::Result<bool> {
    Ok(config.force
        || !tools::replay_tool_binary(config, store)?.exists()
        || !tools::load_generator_binary(config, store).exists())
}

/// Works out which stages a sweep would run, without running anything. The first planned seed
/// resets the database, so every seed after it is planned too.
pub fn plan_sweep(
    config: &PipelineConfig,
    store: &ArtifactStore,
    rebuilt: bool,
) -> anyhow::Result<Vec<PlannedEntry>> {
    let force = config.force;
    let mut database_reset = false;
    let mut entries = vec![];

    for connections in config.connections.iter().copied() {
        let replay_current = store
            .current_replay_result(connections, &config.host_uri(), config.profile)?
            .is_some();
        if should_skip(force, rebuilt, replay_current) {
            entries.push(PlannedEntry {
                connections,
                actions: Stage::ALL.iter().map(|s| (*s, Action::Skip)).collect(),
            });
            continue;
        }

        let seeded = !database_reset && store.is_seeded(connections)?;
        let seed = Action::decide(force, rebuilt, seeded);
        database_reset |= seed == Action::Run;

        let captured = store.has_capture(connections) || store.has_trace(connections);
        entries.push(PlannedEntry {
            connections,
            actions: vec![
                (Stage::Seed, seed),
                (Stage::Generate, Action::decide(force, rebuilt, captured)),
                (
                    Stage::Record,
                    Action::decide(force, rebuilt, store.has_trace(connections)),
                ),
                (Stage::Replay, Action::Run),
            ],
        });
    }

    Ok(entries)
}

pub fn render_plan(entries: &[PlannedEntry]) -> String {
    let mut header = vec![TableCell::builder("Connections".bold()).build()];
    header.extend(
        Stage::ALL
            .iter()
            .map(|stage| TableCell::builder(stage.label().bold()).build()),
    );

    let mut rows = vec![Row::new(header)];
    for entry in entries {
        let mut cells = vec![TableCell::new(entry.connections)];
        cells.extend(entry.actions.iter().map(|(_, action)| match action {
            Action::Run => TableCell::new("run".green()),
            Action::Skip => TableCell::new("skip".bright_black()),
        }));
        rows.push(Row::new(cells));
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}
