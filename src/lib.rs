/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod artifacts;
pub mod clap_args;
pub mod config;
pub mod plan;
pub mod process_control;
pub mod stages;
pub mod supervisor;
pub mod sweep;
pub mod tools;

pub use sweep::{run_pipeline, SweepEntry, SweepResult};
