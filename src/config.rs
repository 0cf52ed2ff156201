/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/replaybench.toml");

pub const DEFAULT_CONFIG_PATH: &str = "./replaybench.toml";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Default, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub tools: Tools,
    pub replay_tool: ReplayTool,
    pub load_generator: LoadGenerator,
    pub workload: Workload,
    pub timing: Timing,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create config file {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .context(format!("Unable to read config file {}", path.display()))?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Loads the config at an explicit path, or the default path if there is one. An explicit path
    /// must exist, the default path is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(path) => Config::try_from_path(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Config::try_from_path(default_path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }
}

/// Command prefixes for the external collaborators.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Tools {
    pub git: String,
    pub capture: String,
    pub database_shell: String,
}
impl Default for Tools {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            capture: "tcpdump".to_string(),
            database_shell: "mongo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ReplayTool {
    pub build: String,
    pub binary: String,
    pub invoke: String,
}
impl Default for ReplayTool {
    fn default() -> Self {
        Self {
            build: "./build.sh".to_string(),
            binary: "bin/mongoreplay".to_string(),
            invoke: "{binary}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LoadGenerator {
    pub build: String,
    pub binary: String,
    pub invoke: String,
}
impl Default for LoadGenerator {
    fn default() -> Self {
        Self {
            build: "go build -o {binary} ./loadgen".to_string(),
            binary: "bin/loadgen".to_string(),
            invoke: "{binary}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Workload {
    pub database: String,
    pub seed_secs: u64,
    pub generate_secs: u64,
    pub jobs: u32,
}
impl Default for Workload {
    fn default() -> Self {
        Self {
            database: "bench".to_string(),
            seed_secs: 60,
            generate_secs: 60,
            jobs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Timing {
    pub driver_flush_ms: u64,
    pub settle_interval_ms: u64,
    pub settle_timeout_secs: u64,
    pub terminate_timeout_secs: u64,
}
impl Default for Timing {
    fn default() -> Self {
        Self {
            driver_flush_ms: 2000,
            settle_interval_ms: 1000,
            settle_timeout_secs: 60,
            terminate_timeout_secs: 10,
        }
    }
}
impl Timing {
    pub fn driver_flush(&self) -> Duration {
        Duration::from_millis(self.driver_flush_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Everything a pipeline run needs, resolved once from the command line and the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub repository: String,
    pub revision: String,
    pub host: String,
    pub port: u16,
    pub connections: Vec<u32>,
    pub interface: String,
    pub profile: bool,
    pub force: bool,
    pub dry_run: bool,
    pub work_dir: PathBuf,
    pub settings: Config,
}
impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connections.is_empty() {
            bail!("At least one connection count is required");
        }
        if self.connections.contains(&0) {
            bail!("Connection counts must be positive");
        }
        if self.repository.trim().is_empty() {
            bail!("Repository URL must not be empty");
        }
        Ok(())
    }

    /// URI handed to the replay tool.
    pub fn host_uri(&self) -> String {
        format!("mongodb://{}:{}", self.host, self.port)
    }

    /// URI handed to the load generator, including the benchmark database.
    pub fn database_uri(&self) -> String {
        format!(
            "mongodb://{}:{}/{}",
            self.host, self.port, self.settings.workload.database
        )
    }
}
