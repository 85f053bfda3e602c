// SPDX-License-Identifier: Apache-2.0

//! Subcommand implementations for the driver.

use std::collections::HashMap;
use std::path::Path;

use clap::ArgMatches;

use actsynth_codegen::module_signature::ResetProto;
use actsynth_codegen::sequential_generator::{to_sequential_module_text, SequentialOptions};
use actsynth_common::status::{Status, StatusResult};
use actsynth_frontend::ir_convert::convert_module_to_package;
use actsynth_frontend::json_ast_parser::parse_module_from_json;
use actsynth_ir::cse::run_cse;
use actsynth_ir::dce::run_dce;
use actsynth_ir::ir::Package;
use actsynth_ir::ir_builder::FunctionBuilder;
use actsynth_sched::delay_model::get_delay_estimator;
use actsynth_sched::pipeline_schedule::{
    PipelineSchedule, SchedulingOptions, SchedulingStrategy,
};

fn read_json(path: &str) -> StatusResult<serde_json::Value> {
    if !Path::new(path).exists() {
        return Err(Status::NotFound(format!("file does not exist: {}", path)));
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| Status::NotFound(format!("cannot read {}: {}", path, e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Status::InvalidArgument(format!("{} is not valid JSON: {}", path, e)))
}

/// Parses, lowers, converts, and optionally optimizes the action.
fn load_package(path: &str, opt_level: u32) -> StatusResult<Package> {
    let json = read_json(path)?;
    let mut module = parse_module_from_json(&json, None)?;
    let mut package = convert_module_to_package(&mut module, None)?;
    if opt_level >= 2 {
        let f = package
            .get_top_fn_mut()
            .ok_or_else(|| Status::Internal("package has no top function".to_string()))?;
        run_cse(f, None, &HashMap::new());
    }
    if opt_level >= 1 {
        let f = package
            .get_top_fn_mut()
            .ok_or_else(|| Status::Internal("package has no top function".to_string()))?;
        let _ = run_dce(f, /* dry_run= */ false);
    }
    Ok(package)
}

fn scheduling_options(matches: &ArgMatches) -> StatusResult<SchedulingOptions> {
    let strategy = match matches
        .get_one::<String>("strategy")
        .map(|s| s.as_str())
        .unwrap_or("mincut")
    {
        "mincut" => SchedulingStrategy::MinimizeRegisters,
        "sdc" => SchedulingStrategy::MinimizeRegistersSdc,
        "asap" => SchedulingStrategy::Asap,
        other => {
            return Err(Status::InvalidArgument(format!(
                "unknown scheduling strategy '{}'",
                other
            )))
        }
    };
    let mut options = SchedulingOptions::new(strategy);
    options.clock_period_ps = matches.get_one::<i64>("clock_period_ps").copied();
    options.pipeline_stages = matches.get_one::<i64>("pipeline_stages").copied();
    options.clock_margin_percent = matches.get_one::<i64>("clock_margin_percent").copied();
    options.period_relaxation_percent = matches
        .get_one::<i64>("period_relaxation_percent")
        .copied();
    if options.clock_period_ps.is_none() && options.pipeline_stages.is_none() {
        return Err(Status::InvalidArgument(
            "either --clock_period_ps or --pipeline_stages is required".to_string(),
        ));
    }
    Ok(options)
}

pub fn handle_convert_ir(matches: &ArgMatches) -> StatusResult<()> {
    let input = matches.get_one::<String>("input").expect("required arg");
    let opt_level = *matches.get_one::<u32>("opt_level").expect("has default");
    let mut package = load_package(input, opt_level)?;
    if let Some(top) = matches.get_one::<String>("top") {
        if let Some(f) = package.get_top_fn_mut() {
            f.name = top.clone();
        }
        package.top = Some(top.clone());
    }
    let text = package.to_string();
    if let Some(dump_path) = matches.get_one::<String>("ir_dump_path") {
        std::fs::write(dump_path, &text)
            .map_err(|e| Status::Internal(format!("cannot write {}: {}", dump_path, e)))?;
    }
    print!("{}", text);
    Ok(())
}

pub fn handle_round_trip(matches: &ArgMatches) -> StatusResult<()> {
    let input = matches.get_one::<String>("input").expect("required arg");
    let json = read_json(input)?;
    let module = parse_module_from_json(&json, None)?;
    let body = module
        .body
        .ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    let dumped = module.to_json(body);
    println!(
        "{}",
        serde_json::to_string_pretty(&dumped)
            .map_err(|e| Status::Internal(format!("cannot serialize JSON: {}", e)))?
    );
    Ok(())
}

pub fn handle_schedule(matches: &ArgMatches) -> StatusResult<()> {
    let input = matches.get_one::<String>("input").expect("required arg");
    let package = load_package(input, /* opt_level= */ 1)?;
    let f = package
        .get_top_fn()
        .ok_or_else(|| Status::Internal("package has no top function".to_string()))?;

    let delay_model = matches
        .get_one::<String>("delay_model")
        .expect("has default");
    let estimator = get_delay_estimator(delay_model)?;
    let options = scheduling_options(matches)?;
    let schedule = PipelineSchedule::run(f, estimator.as_ref(), &options)?;
    print!("{}", schedule.to_string_with(f));
    println!(
        "interior pipeline register bits: {}",
        schedule.count_final_interior_pipeline_registers(f)
    );
    Ok(())
}

/// Wraps the converted action as the body of a counted loop and emits the
/// sequential module. The action's first parameter is the induction
/// variable, the second the loop carry, and the rest are invariants.
pub fn handle_sequential(matches: &ArgMatches) -> StatusResult<()> {
    let input = matches.get_one::<String>("input").expect("required arg");
    let stride = *matches.get_one::<usize>("stride").expect("has default");
    let trip_count = *matches.get_one::<usize>("trip_count").expect("required arg");
    let mut package = load_package(input, /* opt_level= */ 1)?;

    let body = package
        .get_top_fn()
        .ok_or_else(|| Status::Internal("package has no top function".to_string()))?
        .clone();
    if body.params.len() < 2 {
        return Err(Status::Unimplemented(
            "sequential generation requires a body with an induction variable and a loop carry"
                .to_string(),
        ));
    }
    // The loop carries the accumulator type; the body must return it (the
    // converter wraps single results in a one-element tuple).
    let carry_ty = body.params[1].ty.clone();
    let ret_matches = body.ret_ty == carry_ty
        || body.ret_ty == actsynth_ir::ir::Type::Tuple(vec![carry_ty.clone()]);
    if !ret_matches {
        return Err(Status::Unimplemented(format!(
            "loop body must return its carry type {}, got {}",
            carry_ty, body.ret_ty
        )));
    }

    let mut fb = FunctionBuilder::new("seq_top");
    let init = fb.param("init", carry_ty.bit_count());
    let invariants: Vec<_> = body
        .params
        .iter()
        .skip(2)
        .map(|p| fb.param_typed(&p.name, p.ty.clone()))
        .collect();
    let body_name = body.name.clone();
    let result = fb.counted_for(
        init,
        trip_count,
        stride,
        &body_name,
        &invariants,
        Some("loop"),
    );
    let loop_node = result.node_ref();
    let wrapper = fb
        .build_with_return_value(result)
        .map_err(Status::Internal)?;
    package.members.push(wrapper);
    package.set_top_fn("seq_top").map_err(Status::Internal)?;

    let delay_model = matches
        .get_one::<String>("delay_model")
        .expect("has default");
    let estimator = get_delay_estimator(delay_model)?;
    let options = SequentialOptions {
        module_name: None,
        reset: Some(ResetProto {
            name: "rst_n".to_string(),
            asynchronous: true,
            active_low: true,
        }),
        delay_estimator: estimator.as_ref(),
        pipeline_scheduling_options: scheduling_options(matches)?,
    };
    let result = to_sequential_module_text(&options, &package, "seq_top", loop_node)?;
    print!("{}", result.verilog_text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The subcommand plumbing is exercised end to end; here we cover the
    // pure pieces.

    #[test]
    fn unknown_strategy_is_invalid_argument() {
        let cmd = clap::Command::new("t")
            .arg(clap::Arg::new("strategy").long("strategy"))
            .arg(
                clap::Arg::new("clock_period_ps")
                    .long("clock_period_ps")
                    .value_parser(clap::value_parser!(i64)),
            )
            .arg(
                clap::Arg::new("pipeline_stages")
                    .long("pipeline_stages")
                    .value_parser(clap::value_parser!(i64)),
            )
            .arg(
                clap::Arg::new("clock_margin_percent")
                    .long("clock_margin_percent")
                    .value_parser(clap::value_parser!(i64)),
            )
            .arg(
                clap::Arg::new("period_relaxation_percent")
                    .long("period_relaxation_percent")
                    .value_parser(clap::value_parser!(i64)),
            );
        let matches = cmd
            .try_get_matches_from(["t", "--strategy", "magic", "--clock_period_ps", "5"])
            .unwrap();
        let err = scheduling_options(&matches).unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read_json("/nonexistent/actsynth.json").unwrap_err();
        assert!(matches!(err, Status::NotFound(_)));
    }
}
