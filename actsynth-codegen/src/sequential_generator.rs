// SPDX-License-Identifier: Apache-2.0

//! Sequential (resource-shared) module generation.
//!
//! Wraps a single-iteration pipelined loop body inside a four-state FSM and a
//! strided index counter so one datapath executes a bounded loop under a
//! ready/valid handshake:
//!
//! - `Null`: unreachable after reset; pins outputs to their defaults across
//!   the reset edge.
//! - `Ready`: asserts `ready_in`; a `valid_in` handshake captures inputs and
//!   enters `Running`.
//! - `Running`: runs the body pipeline; completion = index counter at its
//!   maximum and the pipeline in its last cycle.
//! - `Done`: asserts `valid_out`; a `ready_out` handshake returns to `Ready`.

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::bits::Bits;
use actsynth_ir::ir::{NodePayload, NodeRef, Package};
use actsynth_sched::delay_model::DelayEstimator;
use actsynth_sched::pipeline_schedule::{PipelineSchedule, SchedulingOptions};

use crate::fsm::FsmBuilder;
use crate::module_builder::{ModuleBuilder, Register};
use crate::module_signature::{
    ModuleSignature, ModuleSignatureBuilder, ResetProto,
};
use crate::pipeline_generator::{
    to_pipeline_module_text, ModuleGeneratorResult, PipelineOptions,
};

pub struct SequentialOptions<'a> {
    pub module_name: Option<String>,
    pub reset: Option<ResetProto>,
    pub delay_estimator: &'a dyn DelayEstimator,
    pub pipeline_scheduling_options: SchedulingOptions,
}

/// References to the signals of a generated strided counter.
struct StridedCounterReferences {
    value: String,
    holds_max_inclusive_value: String,
}

struct SequentialModuleBuilder<'a, 'o> {
    options: &'o SequentialOptions<'a>,
    package: &'o Package,
    loop_fn_name: String,
    loop_node: NodeRef,

    module_builder: Option<ModuleBuilder>,
    module_signature: Option<ModuleSignature>,
    loop_body_pipeline_result: Option<ModuleGeneratorResult>,

    // Port reference names.
    ready_in: String,
    valid_in: String,
    ready_out: String,
    valid_out: String,
    data_in: Vec<String>,
    data_out: String,
}

impl<'a, 'o> SequentialModuleBuilder<'a, 'o> {
    fn new(
        options: &'o SequentialOptions<'a>,
        package: &'o Package,
        loop_fn_name: &str,
        loop_node: NodeRef,
    ) -> Self {
        SequentialModuleBuilder {
            options,
            package,
            loop_fn_name: loop_fn_name.to_string(),
            loop_node,
            module_builder: None,
            module_signature: None,
            loop_body_pipeline_result: None,
            ready_in: String::new(),
            valid_in: String::new(),
            ready_out: String::new(),
            valid_out: String::new(),
            data_in: Vec::new(),
            data_out: String::new(),
        }
    }

    fn loop_payload(&self) -> StatusResult<(NodeRef, usize, usize, String, Vec<NodeRef>)> {
        let f = self.package.get_fn(&self.loop_fn_name).ok_or_else(|| {
            Status::NotFound(format!("function '{}' not found", self.loop_fn_name))
        })?;
        match &f.get_node(self.loop_node).payload {
            NodePayload::CountedFor {
                init,
                trip_count,
                stride,
                body,
                invariant_args,
            } => Ok((
                *init,
                *trip_count,
                *stride,
                body.clone(),
                invariant_args.clone(),
            )),
            other => Err(Status::Unimplemented(format!(
                "sequential generation requires a counted_for loop, got '{}'",
                other.get_operator()
            ))),
        }
    }

    /// Schedules and emits the loop body as a non-flopped pipeline module.
    fn generate_loop_body_pipeline(&mut self) -> StatusResult<()> {
        let (_, _, _, body_name, _) = self.loop_payload()?;
        let body_fn = self.package.get_fn(&body_name).ok_or_else(|| {
            Status::NotFound(format!("loop body function '{}' not found", body_name))
        })?;
        let schedule = PipelineSchedule::run(
            body_fn,
            self.options.delay_estimator,
            &self.options.pipeline_scheduling_options,
        )?;
        let mut pipeline_options = PipelineOptions::new()
            .flop_inputs(false)
            .flop_outputs(false);
        if let Some(reset) = &self.options.reset {
            pipeline_options = pipeline_options.reset(reset.clone());
        }
        let result = to_pipeline_module_text(&schedule, body_fn, &pipeline_options)?;
        let pipeline = result
            .signature
            .pipeline
            .as_ref()
            .ok_or_else(|| Status::Internal("body pipeline has no pipeline proto".to_string()))?;
        if pipeline.initiation_interval != 1 {
            return Err(Status::Unimplemented(
                "sequential generation requires an initiation interval of one".to_string(),
            ));
        }
        self.loop_body_pipeline_result = Some(result);
        Ok(())
    }

    /// Signature of the wrapper: one data input per loop operand (widened to
    /// the body's parameter widths), one data output, the handshake, clock
    /// and reset.
    fn generate_module_signature(&mut self) -> StatusResult<()> {
        let f = self
            .package
            .get_fn(&self.loop_fn_name)
            .expect("checked in loop_payload");
        let (init, _, _, body_name, invariant_args) = self.loop_payload()?;
        let body_fn = self.package.get_fn(&body_name).ok_or_else(|| {
            Status::NotFound(format!("loop body function '{}' not found", body_name))
        })?;
        let loop_name = actsynth_ir::ir::node_textual_id(f, self.loop_node);
        let module_name = self
            .options
            .module_name
            .clone()
            .unwrap_or_else(|| format!("{}_sequential_module", loop_name));

        let mut sig_builder = ModuleSignatureBuilder::new(&module_name).with_clock("clk");
        // Input widths follow the body's parameter widths: body(i, acc,
        // inv0..) with the induction variable driven internally.
        let mut operands = vec![init];
        operands.extend(invariant_args.iter().copied());
        for (ordinal, operand) in operands.iter().enumerate() {
            let width = body_fn
                .params
                .get(ordinal + 1)
                .map(|p| p.ty.bit_count())
                .unwrap_or_else(|| f.get_node(*operand).ty.bit_count());
            let name = format!(
                "{}_in",
                actsynth_ir::ir::node_textual_id(f, *operand)
            );
            sig_builder = sig_builder.add_data_input(&name, width);
        }
        sig_builder =
            sig_builder.add_data_output(&format!("{}_out", loop_name), f.get_node(self.loop_node).ty.bit_count());

        let reset = self.options.reset.as_ref().ok_or_else(|| {
            Status::InvalidArgument(
                "tried to create an FSM without specifying reset in SequentialOptions"
                    .to_string(),
            )
        })?;
        if !reset.asynchronous || !reset.active_low {
            return Err(Status::Unimplemented(
                "sequential generation requires an asynchronous active-low reset".to_string(),
            ));
        }
        sig_builder = sig_builder
            .with_reset(&reset.name, reset.asynchronous, reset.active_low)
            .with_ready_valid_interface("ready_in", "valid_in", "ready_out", "valid_out");

        self.module_signature = Some(sig_builder.build()?);
        Ok(())
    }

    fn initialize_module_builder(&mut self) -> StatusResult<()> {
        let signature = self.module_signature.as_ref().expect("signature built");
        let mut mb = ModuleBuilder::new(
            &signature.module_name,
            Some("clk"),
            signature.reset.clone(),
        );
        let rv = signature
            .ready_valid
            .as_ref()
            .expect("signature has a handshake");
        self.ready_in = mb.add_output_port(&rv.input_ready, 1);
        self.valid_in = mb.add_input_port(&rv.input_valid, 1);
        self.ready_out = mb.add_input_port(&rv.output_ready, 1);
        self.valid_out = mb.add_output_port(&rv.output_valid, 1);
        for port in signature.data_inputs.iter() {
            self.data_in.push(mb.add_input_port(&port.name, port.width));
        }
        let out = &signature.data_outputs[0];
        self.data_out = mb.add_output_port(&out.name, out.width);
        self.module_builder = Some(mb);
        Ok(())
    }

    /// A strided up-counter: cleared by `set_zero`, stepped by `increment`,
    /// with a comparator flag at its maximum in-range value.
    fn add_static_strided_counter(
        &mut self,
        name: &str,
        stride: usize,
        value_limit_exclusive: usize,
        set_zero: &str,
        increment: &str,
    ) -> StatusResult<StridedCounterReferences> {
        if value_limit_exclusive == 0 {
            return Err(Status::Unimplemented(
                "tried to generate a static strided counter with a non-positive limit"
                    .to_string(),
            ));
        }
        if stride == 0 {
            return Err(Status::Unimplemented(
                "tried to generate a static strided counter with a non-positive stride"
                    .to_string(),
            ));
        }
        let mb = self.module_builder.as_mut().expect("module builder ready");
        mb.add_blank_declaration_line();
        mb.add_declaration_comment(&format!("Declarations for counter {}", name));
        mb.add_blank_assignment_line();
        mb.add_assignment_comment(&format!("Assignments for counter {}", name));

        let value_limit_exclusive_minus = value_limit_exclusive - 1;
        let max_inclusive_value =
            value_limit_exclusive_minus - (value_limit_exclusive_minus % stride);
        let num_counter_bits = Bits::min_bit_count_unsigned(max_inclusive_value as u64).max(1);

        let counter_wire = mb.declare_variable(&format!("{}_wire", name), num_counter_bits);
        let counter_next = format!(
            "{} ? {}'d0 : {} + {}'d{}",
            set_zero, num_counter_bits, counter_wire, num_counter_bits, stride
        );
        let counter_register = mb.declare_register(name, num_counter_bits, &counter_next);
        mb.add_continuous_assignment(&counter_wire, &counter_register.name);
        let load_enable = format!("{} | {}", increment, set_zero);
        mb.assign_registers(&[counter_register.clone()], Some(&load_enable));

        let holds_max = mb.declare_variable_and_assign(
            &format!("{}_holds_max_inclusive_value", name),
            &format!(
                "{} == {}'d{}",
                counter_register.name, num_counter_bits, max_inclusive_value
            ),
            1,
        );

        Ok(StridedCounterReferences {
            value: counter_register.name,
            holds_max_inclusive_value: holds_max,
        })
    }

    /// The four-state handshake FSM plus the pipeline-latency down counter.
    fn add_fsm(
        &mut self,
        pipeline_latency: i64,
        index_holds_max_inclusive_value: &str,
        last_pipeline_cycle_wire: &str,
    ) -> StatusResult<()> {
        let reset = self
            .options
            .reset
            .clone()
            .expect("reset checked during signature generation");
        let mut fsm = FsmBuilder::new("sequential_fsm", "clk", reset);
        // The null state forces a state transition out of reset so outputs
        // settle at their Ready values on the first active edge.
        let _null = fsm.add_state("Null");
        let ready_state = fsm.add_state("Ready");
        fsm.set_reset_state(ready_state);
        let running_state = fsm.add_state("Running");
        let done_state = fsm.add_state("Done");

        let fsm_ready_in = fsm.add_output1("fsm_ready_in", 0);
        let fsm_valid_out = fsm.add_output1("fsm_valid_out", 0);
        let fsm_last_pipeline_cycle = fsm.add_output1("fsm_last_pipeline_cycle", 0);

        fsm.set_output(ready_state, fsm_ready_in, 1);
        fsm.add_transition(ready_state, &self.valid_in, running_state);
        fsm.add_transition(
            running_state,
            &format!(
                "{} & fsm_last_pipeline_cycle",
                index_holds_max_inclusive_value
            ),
            done_state,
        );
        fsm.set_output(done_state, fsm_valid_out, 1);
        fsm.add_transition(done_state, &self.ready_out, ready_state);

        if pipeline_latency == 0 {
            fsm.set_output(running_state, fsm_last_pipeline_cycle, 1);
        } else {
            let counter = fsm.add_down_counter(
                "pipeline_counter",
                Bits::min_bit_count_unsigned(pipeline_latency as u64).max(1),
            );
            fsm.set_counter(ready_state, counter, pipeline_latency as u64);
            let zero = fsm.counter_is_zero(counter);
            fsm.set_output_guarded(running_state, &zero, fsm_last_pipeline_cycle, 1);
            fsm.set_counter_guarded(running_state, &zero, counter, pipeline_latency as u64);
        }

        let fsm_text = fsm.build()?;
        let mb = self.module_builder.as_mut().expect("module builder ready");
        mb.add_trailing_block(&fsm_text);
        // Assignments whose rhs is an FSM output are postponed until after
        // the FSM block so uses never precede the declarations.
        mb.add_trailing_block(&format!(
            "// FSM driven wires.\nassign {} = fsm_ready_in;\nassign {} = fsm_valid_out;\nassign {} = fsm_last_pipeline_cycle;",
            self.ready_in, self.valid_out, last_pipeline_cycle_wire
        ));
        Ok(())
    }

    /// Wires the index counter, accumulator and invariant registers, the FSM,
    /// and the single body instantiation together.
    fn add_sequential_logic(&mut self) -> StatusResult<()> {
        let (_, trip_count, stride, _, _) = self.loop_payload()?;
        let out_width = self.module_signature.as_ref().unwrap().data_outputs[0].width;

        let last_pipeline_cycle = {
            let mb = self.module_builder.as_mut().expect("module builder ready");
            let last = mb.declare_variable("last_pipeline_cycle", 1);
            mb.declare_variable("pipeline_output", out_width);
            last
        };

        let index_references = self.add_static_strided_counter(
            "index_counter",
            stride,
            stride * trip_count,
            &self.ready_in.clone(),
            &last_pipeline_cycle,
        )?;

        let pipeline_latency = self
            .loop_body_pipeline_result
            .as_ref()
            .expect("body pipeline generated")
            .signature
            .pipeline
            .as_ref()
            .expect("body pipeline proto present")
            .latency;
        self.add_fsm(
            pipeline_latency,
            &index_references.holds_max_inclusive_value,
            &last_pipeline_cycle,
        )?;

        // Accumulator: loads the first data input on handshake, the body
        // output while running.
        let signature = self.module_signature.as_ref().unwrap().clone();
        let mb = self.module_builder.as_mut().expect("module builder ready");
        let accumulator_next = format!(
            "{} ? {} : pipeline_output",
            self.ready_in, self.data_in[0]
        );
        let accumulator_register = mb.declare_register(
            &format!("{}_register", signature.data_outputs[0].name),
            out_width,
            &accumulator_next,
        );
        let accumulator_enable = format!("{} | {}", self.ready_in, last_pipeline_cycle);
        mb.assign_registers(&[accumulator_register.clone()], Some(&accumulator_enable));

        // Invariant registers capture the remaining inputs on handshake.
        let mut invariant_registers: Vec<Register> = Vec::new();
        for input_idx in 1..signature.data_inputs.len() {
            let port = &signature.data_inputs[input_idx];
            invariant_registers.push(mb.declare_register(
                &format!("{}_register", port.name),
                port.width,
                &self.data_in[input_idx],
            ));
        }
        let ready_in = self.ready_in.clone();
        mb.assign_registers(&invariant_registers, Some(&ready_in));

        self.instantiate_loop_body(
            &index_references.value,
            &accumulator_register,
            &invariant_registers,
            "pipeline_output",
        )?;

        // Drive the data output from the accumulator.
        let mb = self.module_builder.as_mut().expect("module builder ready");
        mb.add_continuous_assignment(&self.data_out.clone(), &accumulator_register.name);
        Ok(())
    }

    fn instantiate_loop_body(
        &mut self,
        index_value: &str,
        accumulator_reg: &Register,
        invariant_registers: &[Register],
        pipeline_output: &str,
    ) -> StatusResult<()> {
        let body_result = self
            .loop_body_pipeline_result
            .as_ref()
            .expect("body pipeline generated");
        let body_signature = body_result.signature.clone();

        let loop_in_names: Vec<String> = body_signature
            .data_inputs
            .iter()
            .map(|p| p.name.clone())
            .collect();
        if loop_in_names.len() < 2 {
            return Err(Status::Unimplemented(
                "loop body must take an induction variable and a loop carry".to_string(),
            ));
        }

        let mut connections: Vec<(String, String)> = Vec::new();
        connections.push((loop_in_names[0].clone(), index_value.to_string()));
        connections.push((loop_in_names[1].clone(), accumulator_reg.name.clone()));
        for (input_idx, name) in loop_in_names.iter().enumerate().skip(2) {
            let register = invariant_registers.get(input_idx - 2).ok_or_else(|| {
                Status::Internal(format!(
                    "no invariant register for body input '{}'",
                    name
                ))
            })?;
            connections.push((name.clone(), register.name.clone()));
        }
        if let Some(reset) = &body_signature.reset {
            connections.push((reset.name.clone(), reset.name.clone()));
        }
        connections.push((
            body_signature
                .clock_name
                .clone()
                .unwrap_or_else(|| "clk".to_string()),
            "clk".to_string(),
        ));
        connections.push((
            body_signature.data_outputs[0].name.clone(),
            pipeline_output.to_string(),
        ));

        let mb = self.module_builder.as_mut().expect("module builder ready");
        mb.add_blank_assignment_line();
        mb.add_instantiation(&body_signature.module_name, "loop_body", &connections);
        Ok(())
    }

    fn build(mut self) -> StatusResult<ModuleGeneratorResult> {
        self.generate_loop_body_pipeline()?;
        self.generate_module_signature()?;
        self.initialize_module_builder()?;
        self.add_sequential_logic()?;

        let signature = self.module_signature.take().expect("signature built");
        let mut verilog_text = String::new();
        verilog_text.push_str(
            &self
                .loop_body_pipeline_result
                .as_ref()
                .expect("body pipeline generated")
                .verilog_text,
        );
        verilog_text.push('\n');
        verilog_text.push_str(&self.module_builder.take().expect("builder ready").emit());

        Ok(ModuleGeneratorResult {
            signature,
            verilog_text,
        })
    }
}

/// Emits the given counted-for node of `fn_name` as a Verilog module which
/// reuses the same hardware over time to execute the loop's iterations.
pub fn to_sequential_module_text(
    options: &SequentialOptions,
    package: &Package,
    fn_name: &str,
    loop_node: NodeRef,
) -> StatusResult<ModuleGeneratorResult> {
    let builder = SequentialModuleBuilder::new(options, package, fn_name, loop_node);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsynth_ir::ir_builder::FunctionBuilder;
    use actsynth_sched::delay_model::StandardDelayEstimator;
    use actsynth_sched::pipeline_schedule::SchedulingStrategy;

    fn reset_proto() -> ResetProto {
        ResetProto {
            name: "rst_n".to_string(),
            asynchronous: true,
            active_low: true,
        }
    }

    /// Accumulating body: acc' = acc + i (both 8 bits).
    fn build_package() -> (Package, NodeRef) {
        let mut fb = FunctionBuilder::new("body");
        let i = fb.param("i", 8);
        let acc = fb.param("acc", 8);
        let sum = fb.add(i, acc, Some("sum")).unwrap();
        let body = fb.build_with_return_value(sum).unwrap();

        let mut fb = FunctionBuilder::new("main");
        let init = fb.param("init", 8);
        let result = fb.counted_for(init, 4, 1, "body", &[], Some("loop"));
        let main = fb.build_with_return_value(result).unwrap();
        let loop_node = result.node_ref();

        let mut pkg = Package::new("seq_test");
        pkg.members.push(body);
        pkg.members.push(main);
        pkg.set_top_fn("main").unwrap();
        (pkg, loop_node)
    }

    fn generate() -> ModuleGeneratorResult {
        let (pkg, loop_node) = build_package();
        let options = SequentialOptions {
            module_name: None,
            reset: Some(reset_proto()),
            delay_estimator: &StandardDelayEstimator,
            pipeline_scheduling_options: SchedulingOptions::new(
                SchedulingStrategy::MinimizeRegisters,
            )
            .clock_period_ps(10),
        };
        to_sequential_module_text(&options, &pkg, "main", loop_node).unwrap()
    }

    #[test]
    fn wrapper_has_handshake_and_fsm() {
        let result = generate();
        let text = &result.verilog_text;
        assert!(text.contains("module loop_sequential_module ("));
        assert!(text.contains("output wire ready_in"));
        assert!(text.contains("input wire valid_in"));
        assert!(text.contains("input wire ready_out"));
        assert!(text.contains("output wire valid_out"));
        assert!(text.contains("localparam [1:0] StateNull = 0;"));
        assert!(text.contains("localparam [1:0] StateReady = 1;"));
        assert!(text.contains("localparam [1:0] StateRunning = 2;"));
        assert!(text.contains("localparam [1:0] StateDone = 3;"));
        assert!(text.contains("assign ready_in = fsm_ready_in;"));
        assert!(text.contains("assign valid_out = fsm_valid_out;"));
    }

    #[test]
    fn zero_latency_body_has_constant_last_cycle() {
        let result = generate();
        let text = &result.verilog_text;
        // Latency-0 body: Running asserts the last-cycle signal outright and
        // no pipeline down-counter exists.
        assert!(text.contains("fsm_last_pipeline_cycle = 1;"));
        assert!(!text.contains("pipeline_counter"));
    }

    #[test]
    fn index_counter_is_two_bits_for_four_iterations() {
        let result = generate();
        let text = &result.verilog_text;
        // trip_count=4, stride=1: max inclusive value 3, two counter bits.
        assert!(text.contains("reg [1:0] index_counter;"));
        assert!(text.contains("index_counter == 2'd3"));
        assert!(text.contains("index_counter_holds_max_inclusive_value"));
    }

    #[test]
    fn body_is_instantiated_with_named_connections() {
        let result = generate();
        let text = &result.verilog_text;
        assert!(text.contains("body_pipeline loop_body ("));
        assert!(text.contains(".i(index_counter)"));
        assert!(text.contains(".acc(loop_out_register)"));
        assert!(text.contains(".body_out(pipeline_output)"));
        // The accumulator drives the module output.
        assert!(text.contains("assign loop_out = loop_out_register;"));
    }

    #[test]
    fn fsm_block_comes_after_datapath() {
        let result = generate();
        let text = &result.verilog_text;
        let inst = text.find("body_pipeline loop_body (").unwrap();
        let fsm = text.find("// FSM: sequential_fsm").unwrap();
        assert!(inst < fsm);
    }

    #[test]
    fn missing_reset_is_invalid_argument() {
        let (pkg, loop_node) = build_package();
        let options = SequentialOptions {
            module_name: None,
            reset: None,
            delay_estimator: &StandardDelayEstimator,
            pipeline_scheduling_options: SchedulingOptions::new(
                SchedulingStrategy::MinimizeRegisters,
            )
            .clock_period_ps(10),
        };
        let err = to_sequential_module_text(&options, &pkg, "main", loop_node).unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
    }

    #[test]
    fn non_counted_for_is_unimplemented() {
        let (pkg, _) = build_package();
        let main = pkg.get_fn("main").unwrap();
        let init_node = actsynth_ir::ir_utils::param_node_ref_by_index(main, 0).unwrap();
        let options = SequentialOptions {
            module_name: None,
            reset: Some(reset_proto()),
            delay_estimator: &StandardDelayEstimator,
            pipeline_scheduling_options: SchedulingOptions::new(
                SchedulingStrategy::MinimizeRegisters,
            )
            .clock_period_ps(10),
        };
        let err = to_sequential_module_text(&options, &pkg, "main", init_node).unwrap_err();
        assert!(matches!(err, Status::Unimplemented(_)));
    }
}
