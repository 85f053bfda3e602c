// SPDX-License-Identifier: Apache-2.0

//! Command line driver for the action-tree HLS flow.
//!
//! Commands are given like:
//!
//! ```text
//! actsynth-driver <command> <json-path> <command-options>
//! ```
//!
//! Commands are:
//!
//! - convert-ir: converts an action-tree JSON file to IR text.
//! - round-trip: parses an action-tree JSON file and dumps it back as JSON.
//! - schedule: converts and schedules the action, printing the per-cycle
//!   node listing.
//! - sequential: converts the action, wraps it in a counted loop, and emits
//!   the sequential (resource-shared) Verilog module.
//!
//! Exit codes: 0 on success, 1 for invalid input or missing files, 2 when
//! scheduling is infeasible, 3 for unimplemented features, 4 for internal
//! errors.

mod commands;

use clap::{Arg, ArgAction, Command};

use actsynth_common::status::Status;

trait AppExt {
    fn add_input_arg(self) -> Self;
    fn add_scheduling_args(self) -> Self;
}

impl AppExt for Command {
    fn add_input_arg(self) -> Self {
        self.arg(
            Arg::new("input")
                .value_name("JSON_PATH")
                .help("Path to the action-tree JSON file")
                .required(true)
                .action(ArgAction::Set),
        )
    }

    fn add_scheduling_args(self) -> Self {
        self.arg(
            Arg::new("delay_model")
                .long("delay_model")
                .value_name("DELAY_MODEL")
                .default_value("standard")
                .help("The delay model to use"),
        )
        .arg(
            Arg::new("pipeline_stages")
                .long("pipeline_stages")
                .value_name("N")
                .value_parser(clap::value_parser!(i64))
                .help("Number of pipeline stages"),
        )
        .arg(
            Arg::new("clock_period_ps")
                .long("clock_period_ps")
                .value_name("PS")
                .value_parser(clap::value_parser!(i64))
                .help("Target clock period in picoseconds"),
        )
        .arg(
            Arg::new("clock_margin_percent")
                .long("clock_margin_percent")
                .value_name("PERCENT")
                .value_parser(clap::value_parser!(i64))
                .help("Percentage margin subtracted from the clock period"),
        )
        .arg(
            Arg::new("period_relaxation_percent")
                .long("period_relaxation_percent")
                .value_name("PERCENT")
                .value_parser(clap::value_parser!(i64))
                .help("Percentage added to the discovered minimum clock period"),
        )
        .arg(
            Arg::new("strategy")
                .long("strategy")
                .value_name("STRATEGY")
                .default_value("mincut")
                .help("Scheduling strategy: mincut, sdc, or asap"),
        )
    }
}

fn main() {
    let _ = env_logger::builder().init();

    let matches = Command::new("actsynth-driver")
        .about("HLS driver for packet-processing action trees")
        .subcommand_required(true)
        .subcommand(
            Command::new("convert-ir")
                .about("Converts an action-tree JSON file to IR text")
                .add_input_arg()
                .arg(
                    Arg::new("top")
                        .long("top")
                        .value_name("NAME")
                        .help("Name for the generated top function"),
                )
                .arg(
                    Arg::new("opt_level")
                        .long("opt_level")
                        .value_name("LEVEL")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("1")
                        .help("Optimization level: 0 none, 1 dce, 2+ cse+dce"),
                )
                .arg(
                    Arg::new("ir_dump_path")
                        .long("ir_dump_path")
                        .value_name("PATH")
                        .help("Also write the IR text to this path"),
                ),
        )
        .subcommand(
            Command::new("round-trip")
                .about("Parses an action-tree JSON file and dumps it back")
                .add_input_arg(),
        )
        .subcommand(
            Command::new("schedule")
                .about("Converts and schedules the action")
                .add_input_arg()
                .add_scheduling_args(),
        )
        .subcommand(
            Command::new("sequential")
                .about("Emits a sequential (resource-shared) module for the action")
                .add_input_arg()
                .add_scheduling_args()
                .arg(
                    Arg::new("stride")
                        .long("stride")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1")
                        .help("Loop stride"),
                )
                .arg(
                    Arg::new("trip_count")
                        .long("trip_count")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .required(true)
                        .help("Loop trip count"),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("convert-ir", sub)) => commands::handle_convert_ir(sub),
        Some(("round-trip", sub)) => commands::handle_round_trip(sub),
        Some(("schedule", sub)) => commands::handle_schedule(sub),
        Some(("sequential", sub)) => commands::handle_sequential(sub),
        _ => unreachable!("subcommand is required"),
    };

    if let Err(status) = result {
        report_error_and_exit(&status);
    }
}

fn report_error_and_exit(status: &Status) -> ! {
    eprintln!("error: {}", status);
    std::process::exit(status.exit_code());
}
