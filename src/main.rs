/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use colored::*;
use replaybench::{
    artifacts::ArtifactStore,
    clap_args::{self, Commands},
    config::{Config, DEFAULT_CONFIG_PATH},
    plan, run_pipeline,
};
use std::path::Path;
use tracing::{subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = clap_args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(level.to_string()));

    if let Err(err) = run(args.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            Config::write_example_to_file(Path::new(DEFAULT_CONFIG_PATH))?;
            println!("{}", "replaybench.toml created!".green());
        }

        Commands::Run(run_args) => {
            let config = run_args.into_pipeline_config()?;

            if config.dry_run {
                let store = ArtifactStore::open(&config.work_dir);
                let rebuilt = plan::assume_rebuilt(&config, &store)?;
                let entries = plan::plan_sweep(&config, &store, rebuilt)?;
                if rebuilt {
                    println!("{}", "> tools would be rebuilt".yellow());
                }
                println!("{}", plan::render_plan(&entries));
                return Ok(());
            }

            let result = run_pipeline(&config).await?;

            println!("\n{}", " Summary ".reversed().green());
            println!("{}", result.render_summary());
        }
    }

    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    if let Err(err) = set_global_default(subscriber) {
        eprintln!("Unable to install the tracing subscriber: {}", err);
    }
}
