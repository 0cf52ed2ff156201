/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! On-disk record of which stages have completed for which connection count.
//!
//! The seed markers do not just record *that* the database was seeded, they record under which
//! database epoch it happened. Every destructive reset of the target database advances the epoch,
//! which makes every marker written before it stale.

use crate::stages::ReplayMode;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

const SEED_MARKER_PREFIX: &str = ".seeded-";
const EPOCH_FILE: &str = ".db-epoch";

/// Shared skip rule for every stage.
pub fn should_skip(force: bool, rebuilt: bool, artifact_current: bool) -> bool {
    !force && !rebuilt && artifact_current
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Serialize)]
struct DatabaseEpoch {
    epoch: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
pub struct SeedMarker {
    pub epoch: u64,
    pub seeded_at: DateTime<Utc>,
}

/// Timing of one replay, kept so a later run can report it without replaying.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
pub struct ReplayRecord {
    pub connections: u32,
    pub duration_secs: f64,
    pub mode: ReplayMode,
    #[serde(default)]
    pub host_uri: String,
    #[serde(default)]
    pub profile: bool,
    pub replayed_at: DateTime<Utc>,
}
impl ReplayRecord {
    pub fn new(
        connections: u32,
        duration: Duration,
        mode: ReplayMode,
        host_uri: &str,
        profile: bool,
    ) -> Self {
        Self {
            connections,
            duration_secs: duration.as_secs_f64(),
            mode,
            host_uri: host_uri.to_string(),
            profile,
            replayed_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}
impl ArtifactStore {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .context(format!("Unable to create work directory {}", root.display()))?;
        let root = fs::canonicalize(root)?;
        Ok(Self { root })
    }

    /// Opens the store without creating anything, for read-only use such as planning.
    pub fn open(root: &Path) -> Self {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seed_marker(&self, connections: u32) -> PathBuf {
        self.root.join(format!("{SEED_MARKER_PREFIX}{connections}"))
    }

    pub fn capture(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.pcap"))
    }

    pub fn trace(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.playback"))
    }

    /// Where the capture tool writes until the Generate stage has succeeded.
    pub fn partial_capture(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.pcap.partial"))
    }

    /// Where the record tool writes until the Record stage has succeeded.
    pub fn partial_trace(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.playback.partial"))
    }

    pub fn replay_result(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.result"))
    }

    pub fn profile(&self, connections: u32) -> PathBuf {
        self.root.join(format!("traffic-{connections}.profile.json"))
    }

    pub fn log(&self, stage: &str, connections: u32) -> PathBuf {
        self.root.join("logs").join(format!("{stage}-{connections}.log"))
    }

    pub fn build_log(&self, tool: &str) -> PathBuf {
        self.root.join("logs").join(format!("build-{tool}.log"))
    }

    pub fn has_capture(&self, connections: u32) -> bool {
        self.capture(connections).exists()
    }

    pub fn has_trace(&self, connections: u32) -> bool {
        self.trace(connections).exists()
    }

    /// Removes the artifact at `path`. Returns whether there was anything to remove.
    pub fn remove(&self, path: &Path) -> anyhow::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("Unable to remove {}", path.display())),
        }
    }

    /// Moves a finished artifact into its final place.
    pub fn promote(&self, partial: &Path, path: &Path) -> anyhow::Result<()> {
        fs::rename(partial, path).context(format!(
            "Unable to move {} to {}",
            partial.display(),
            path.display()
        ))
    }

    pub fn current_epoch(&self) -> anyhow::Result<u64> {
        Ok(read_json::<DatabaseEpoch>(&self.root.join(EPOCH_FILE))?
            .map(|e| e.epoch)
            .unwrap_or(0))
    }

    /// Records a destructive reset of the target database.
    pub fn advance_epoch(&self) -> anyhow::Result<u64> {
        let epoch = self.current_epoch()? + 1;
        write_json(&self.root.join(EPOCH_FILE), &DatabaseEpoch { epoch })?;
        Ok(epoch)
    }

    pub fn write_seed_marker(&self, connections: u32, epoch: u64) -> anyhow::Result<()> {
        let marker = SeedMarker {
            epoch,
            seeded_at: Utc::now(),
        };
        write_json(&self.seed_marker(connections), &marker)
    }

    pub fn read_seed_marker(&self, connections: u32) -> anyhow::Result<Option<SeedMarker>> {
        let path = self.seed_marker(connections);
        match read_json::<SeedMarker>(&path) {
            Ok(marker) => Ok(marker),
            // markers from older runs were empty sentinels, those can't be trusted
            Err(err) => {
                warn!("Ignoring unreadable seed marker {}: {:#}", path.display(), err);
                Ok(None)
            }
        }
    }

    /// True if the database was seeded for `connections` and hasn't been reset since.
    pub fn is_seeded(&self, connections: u32) -> anyhow::Result<bool> {
        let epoch = self.current_epoch()?;
        Ok(self
            .read_seed_marker(connections)?
            .is_some_and(|marker| marker.epoch == epoch))
    }

    /// Deletes every seed marker written under an older epoch, returning their connection counts.
    pub fn prune_stale_seed_markers(&self) -> anyhow::Result<Vec<u32>> {
        let epoch = self.current_epoch()?;
        let mut pruned = vec![];

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(connections) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix(SEED_MARKER_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let current = self
                .read_seed_marker(connections)?
                .is_some_and(|marker| marker.epoch == epoch);
            if !current {
                self.remove(&entry.path())?;
                pruned.push(connections);
            }
        }

        pruned.sort_unstable();
        Ok(pruned)
    }

    pub fn write_replay_result(&self, record: &ReplayRecord) -> anyhow::Result<()> {
        write_json(&self.replay_result(record.connections), record)
    }

    pub fn read_replay_result(&self, connections: u32) -> anyhow::Result<Option<ReplayRecord>> {
        let path = self.replay_result(connections);
        match read_json::<ReplayRecord>(&path) {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!("Ignoring unreadable replay result {}: {:#}", path.display(), err);
                Ok(None)
            }
        }
    }

    /// The replay result for `connections`, if it was measured against `host_uri` with the same
    /// profiling setting and any requested profile report is still there.
    pub fn current_replay_result(
        &self,
        connections: u32,
        host_uri: &str,
        profile: bool,
    ) -> anyhow::Result<Option<ReplayRecord>> {
        Ok(self.read_replay_result(connections)?.filter(|record| {
            record.host_uri == host_uri
                && record.profile == profile
                && (!profile || self.profile(connections).exists())
        }))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .context(format!("Unable to parse {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("Unable to read {}", path.display())),
    }
}

/// Writes through a sibling temporary file so a crash never leaves a truncated file behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).context(format!("Unable to write {}", tmp.display()))?;
    fs::rename(&tmp, path).context(format!("Unable to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> anyhow::Result<(tempfile::TempDir, ArtifactStore)> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;
        Ok((dir, store))
    }

    #[test]
    fn skip_only_when_nothing_forces_a_rerun() {
        assert!(should_skip(false, false, true));
        assert!(!should_skip(false, false, false));
        assert!(!should_skip(true, false, true));
        assert!(!should_skip(false, true, true));
    }

    #[test]
    fn artifact_names_are_keyed_by_connection_count() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        let name = |p: PathBuf| p.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name(store.seed_marker(10)), ".seeded-10");
        assert_eq!(name(store.capture(10)), "traffic-10.pcap");
        assert_eq!(name(store.trace(10)), "traffic-10.playback");
        assert_eq!(name(store.log("generate", 10)), "generate-10.log");
        Ok(())
    }

    #[test]
    fn epoch_starts_at_zero_and_advances() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert_eq!(store.current_epoch()?, 0);
        assert_eq!(store.advance_epoch()?, 1);
        assert_eq!(store.advance_epoch()?, 2);
        assert_eq!(store.current_epoch()?, 2);
        Ok(())
    }

    #[test]
    fn seed_marker_goes_stale_when_epoch_advances() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        let epoch = store.advance_epoch()?;
        store.write_seed_marker(10, epoch)?;
        assert!(store.is_seeded(10)?);
        assert!(!store.is_seeded(20)?);

        store.advance_epoch()?;
        assert!(!store.is_seeded(10)?);
        Ok(())
    }

    #[test]
    fn prune_removes_only_stale_markers() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        let epoch = store.advance_epoch()?;
        store.write_seed_marker(10, epoch)?;
        store.write_seed_marker(20, epoch)?;

        let epoch = store.advance_epoch()?;
        store.write_seed_marker(50, epoch)?;
        // a zero-content sentinel can't say which epoch it belongs to
        fs::write(store.seed_marker(100), "")?;

        assert_eq!(store.prune_stale_seed_markers()?, vec![10, 20, 100]);
        assert!(!store.seed_marker(10).exists());
        assert!(!store.seed_marker(20).exists());
        assert!(!store.seed_marker(100).exists());
        assert!(store.is_seeded(50)?);
        Ok(())
    }

    #[test]
    fn replay_results_are_persisted() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert!(store.read_replay_result(10)?.is_none());

        let record = ReplayRecord::new(
            10,
            Duration::from_millis(1500),
            ReplayMode::Paced,
            "mongodb://localhost:27017",
            false,
        );
        store.write_replay_result(&record)?;

        let read = store.read_replay_result(10)?.expect("result should exist");
        assert_eq!(read, record);
        assert_eq!(read.duration(), Duration::from_millis(1500));
        assert!(!store.replay_result(10).with_extension("result.tmp").exists());
        Ok(())
    }

    #[test]
    fn replay_result_is_only_current_for_the_same_target_and_profile() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        let uri = "mongodb://localhost:27017";
        store.write_replay_result(&ReplayRecord::new(
            10,
            Duration::from_secs(1),
            ReplayMode::FullSpeed,
            uri,
            false,
        ))?;

        assert!(store.current_replay_result(10, uri, false)?.is_some());
        assert!(store
            .current_replay_result(10, "mongodb://localhost:27018", false)?
            .is_none());
        assert!(store.current_replay_result(10, uri, true)?.is_none());

        store.write_replay_result(&ReplayRecord::new(
            10,
            Duration::from_secs(1),
            ReplayMode::FullSpeed,
            uri,
            true,
        ))?;
        // the report was asked for but has gone missing
        assert!(store.current_replay_result(10, uri, true)?.is_none());
        fs::write(store.profile(10), "{}")?;
        assert!(store.current_replay_result(10, uri, true)?.is_some());
        Ok(())
    }

    #[test]
    fn truncated_replay_result_is_ignored() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        fs::write(store.replay_result(10), "{\"connections\": 10, \"dura")?;
        assert!(store.read_replay_result(10)?.is_none());
        Ok(())
    }

    #[test]
    fn opening_a_store_creates_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("work");
        let store = ArtifactStore::open(&root);

        assert_eq!(store.current_epoch()?, 0);
        assert!(!store.is_seeded(10)?);
        assert!(store.read_replay_result(10)?.is_none());
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn promoted_artifacts_replace_their_partial_file() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        fs::write(store.partial_capture(10), "pcap")?;
        assert!(!store.has_capture(10));

        store.promote(&store.partial_capture(10), &store.capture(10))?;
        assert!(store.has_capture(10));
        assert!(!store.partial_capture(10).exists());
        Ok(())
    }

    #[test]
    fn removing_a_missing_artifact_is_not_an_error() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert!(!store.remove(&store.capture(10))?);

        fs::write(store.capture(10), "pcap")?;
        assert!(store.has_capture(10));
        assert!(store.remove(&store.capture(10))?);
        assert!(!store.has_capture(10));
        Ok(())
    }
}
