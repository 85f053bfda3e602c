// SPDX-License-Identifier: Apache-2.0

//! Emits a scheduled IR function as a pipelined Verilog module: one
//! combinational region per stage, `p<k>_` registers for every value live
//! across the k-th boundary.

use std::collections::{HashMap, HashSet};

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::bits::Bits;
use actsynth_ir::ir::{Binop, Fn, NaryOp, NodePayload, NodeRef, Type, Unop};
use actsynth_ir::ir_utils::sanitize_identifier;
use actsynth_sched::pipeline_schedule::PipelineSchedule;

use crate::module_builder::{ModuleBuilder, Register};
use crate::module_signature::{
    ModuleSignature, ModuleSignatureBuilder, ResetProto,
};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub module_name: Option<String>,
    pub reset: Option<ResetProto>,
    pub flop_inputs: bool,
    pub flop_outputs: bool,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flop_inputs(mut self, value: bool) -> Self {
        self.flop_inputs = value;
        self
    }

    pub fn flop_outputs(mut self, value: bool) -> Self {
        self.flop_outputs = value;
        self
    }

    pub fn reset(mut self, reset: ResetProto) -> Self {
        self.reset = Some(reset);
        self
    }
}

/// Emitted module text plus its port-level contract.
#[derive(Debug, Clone)]
pub struct ModuleGeneratorResult {
    pub signature: ModuleSignature,
    pub verilog_text: String,
}

fn verilog_literal(bits: &Bits) -> String {
    let width = bits.width().max(1);
    match bits.to_u64() {
        Some(v) => format!("{}'d{}", width, v),
        None => {
            // Hex nibbles, most significant first.
            let mut digits = String::new();
            let nibbles = width.div_ceil(4);
            for i in (0..nibbles).rev() {
                let mut nibble = 0u8;
                for b in 0..4 {
                    let bit = i * 4 + b;
                    if bit < bits.width() && bits.get_bit(bit) {
                        nibble |= 1 << b;
                    }
                }
                digits.push(char::from_digit(nibble as u32, 16).unwrap());
            }
            format!("{}'h{}", width, digits)
        }
    }
}

/// Zero-extends a textual operand of width `from` to width `to`.
fn zext_expr(operand: &str, from: usize, to: usize) -> String {
    if to == from {
        operand.to_string()
    } else {
        format!("{{{{{}{{1'b0}}}}, {}}}", to - from, operand)
    }
}

struct PipelineEmitter<'a> {
    f: &'a Fn,
    schedule: &'a PipelineSchedule,
    /// Signal name for each node, valid in the stage currently being
    /// emitted.
    names: HashMap<NodeRef, String>,
    /// Stable per-node base identifiers.
    base: HashMap<NodeRef, String>,
}

impl<'a> PipelineEmitter<'a> {
    fn new(f: &'a Fn, schedule: &'a PipelineSchedule) -> Self {
        let mut base: HashMap<NodeRef, String> = HashMap::new();
        let mut used: HashSet<String> = HashSet::new();
        for node in f.node_refs() {
            if matches!(f.get_node(node).payload, NodePayload::Nil) {
                continue;
            }
            let mut name = sanitize_identifier(&actsynth_ir::ir::node_textual_id(f, node));
            if !used.insert(name.clone()) {
                name = format!("{}_{}", name, f.get_node(node).text_id);
                used.insert(name.clone());
            }
            base.insert(node, name);
        }
        PipelineEmitter {
            f,
            schedule,
            names: HashMap::new(),
            base,
        }
    }

    fn operand_name(&self, nr: NodeRef) -> StatusResult<String> {
        self.names.get(&nr).cloned().ok_or_else(|| {
            Status::Internal(format!(
                "operand '{}' has no signal in the current stage",
                actsynth_ir::ir::node_textual_id(self.f, nr)
            ))
        })
    }

    fn width_of(&self, nr: NodeRef) -> usize {
        self.f.get_node(nr).ty.bit_count()
    }

    /// Combinational expression computing `node` from its operands' signals.
    fn node_expr(&self, node: NodeRef) -> StatusResult<String> {
        let n = self.f.get_node(node);
        let expr = match &n.payload {
            NodePayload::Literal(bits) => verilog_literal(bits),
            NodePayload::Binop(op, a, b) => {
                let a = self.operand_name(*a)?;
                let b = self.operand_name(*b)?;
                let symbol = match op {
                    Binop::Add => "+",
                    Binop::Sub => "-",
                    Binop::Umul => "*",
                    Binop::Udiv => "/",
                    Binop::Eq => "==",
                    Binop::Ne => "!=",
                    Binop::Ult => "<",
                    Binop::Ule => "<=",
                    Binop::Ugt => ">",
                    Binop::Uge => ">=",
                    Binop::Shll => "<<",
                    Binop::Shrl => ">>",
                };
                format!("{} {} {}", a, symbol, b)
            }
            NodePayload::Unop(Unop::Not, a) => format!("~{}", self.operand_name(*a)?),
            NodePayload::Nary(op, elems) => {
                let mut parts = Vec::with_capacity(elems.len());
                for e in elems {
                    parts.push(self.operand_name(*e)?);
                }
                match op {
                    NaryOp::And => parts.join(" & "),
                    NaryOp::Or => parts.join(" | "),
                    NaryOp::Concat => format!("{{{}}}", parts.join(", ")),
                }
            }
            NodePayload::BitSlice { arg, start, width } => {
                let a = self.operand_name(*arg)?;
                format!("{}[{}:{}]", a, start + width - 1, start)
            }
            NodePayload::BitSliceUpdate {
                arg,
                start,
                update_value,
            } => {
                let a = self.operand_name(*arg)?;
                let s = self.operand_name(*start)?;
                let u = self.operand_name(*update_value)?;
                let arg_width = self.width_of(*arg);
                let upd_width = self.width_of(*update_value);
                let ones = format!("{{{}{{1'b1}}}}", upd_width);
                let mask = zext_expr(&ones, upd_width, arg_width);
                let update = zext_expr(&u, upd_width, arg_width);
                format!(
                    "({} & ~({} << {})) | (({} & {}) << {})",
                    a, mask, s, update, mask, s
                )
            }
            NodePayload::ZeroExt { arg, new_bit_count } => {
                let a = self.operand_name(*arg)?;
                zext_expr(&a, self.width_of(*arg), *new_bit_count)
            }
            NodePayload::SignExt { arg, new_bit_count } => {
                let a = self.operand_name(*arg)?;
                let old = self.width_of(*arg);
                if *new_bit_count == old {
                    a
                } else {
                    format!(
                        "{{{{{}{{{}[{}]}}}}, {}}}",
                        new_bit_count - old,
                        a,
                        old - 1,
                        a
                    )
                }
            }
            NodePayload::Sel {
                selector,
                cases,
                default,
            } => {
                let sel = self.operand_name(*selector)?;
                if cases.len() == 2 && default.is_none() {
                    let c0 = self.operand_name(cases[0])?;
                    let c1 = self.operand_name(cases[1])?;
                    format!("{} ? {} : {}", sel, c1, c0)
                } else {
                    let mut expr = match default {
                        Some(d) => self.operand_name(*d)?,
                        None => self.operand_name(*cases.last().unwrap())?,
                    };
                    let chain_cases = if default.is_some() {
                        cases.as_slice()
                    } else {
                        &cases[..cases.len() - 1]
                    };
                    for (i, case) in chain_cases.iter().enumerate().rev() {
                        let c = self.operand_name(*case)?;
                        expr = format!("({} == {}) ? {} : ({})", sel, i, c, expr);
                    }
                    expr
                }
            }
            NodePayload::OneHot { arg, lsb_prio } => {
                let a = self.operand_name(*arg)?;
                let w = self.width_of(*arg);
                let out_w = w + 1;
                // Priority chain ending in the all-zeros bit.
                let mut expr = format!("{}'d{}", out_w, 1u128 << w);
                let order: Vec<usize> = if *lsb_prio {
                    (0..w).rev().collect()
                } else {
                    (0..w).collect()
                };
                for bit in order {
                    expr = format!(
                        "{}[{}] ? {}'d{} : ({})",
                        a,
                        bit,
                        out_w,
                        1u128 << bit,
                        expr
                    );
                }
                expr
            }
            NodePayload::OneHotSel { selector, cases } => {
                let sel = self.operand_name(*selector)?;
                let width = self.width_of(node);
                let mut parts = Vec::with_capacity(cases.len());
                for (i, case) in cases.iter().enumerate() {
                    let c = self.operand_name(*case)?;
                    parts.push(format!("({{{}{{{}[{}]}}}} & {})", width, sel, i, c));
                }
                parts.join(" | ")
            }
            NodePayload::Tuple(elems) => {
                let mut parts = Vec::with_capacity(elems.len());
                for e in elems {
                    parts.push(self.operand_name(*e)?);
                }
                format!("{{{}}}", parts.join(", "))
            }
            NodePayload::TupleIndex { tuple, index } => {
                let t = self.operand_name(*tuple)?;
                let Type::Tuple(types) = &self.f.get_node(*tuple).ty else {
                    return Err(Status::Internal(
                        "tuple_index on non-tuple operand".to_string(),
                    ));
                };
                let elem_width = types[*index].bit_count();
                let bits_after: usize = types[*index + 1..].iter().map(|t| t.bit_count()).sum();
                format!("{}[{}:{}]", t, bits_after + elem_width - 1, bits_after)
            }
            other => {
                return Err(Status::Unimplemented(format!(
                    "operation '{}' has no pipeline datapath emission",
                    other.get_operator()
                )))
            }
        };
        Ok(expr)
    }
}

/// Emits `f`, scheduled by `schedule`, as a pipelined module.
pub fn to_pipeline_module_text(
    schedule: &PipelineSchedule,
    f: &Fn,
    options: &PipelineOptions,
) -> StatusResult<ModuleGeneratorResult> {
    let module_name = options
        .module_name
        .clone()
        .unwrap_or_else(|| format!("{}_pipeline", f.name));
    let ret = f
        .ret_node_ref
        .ok_or_else(|| Status::Internal("function has no return value".to_string()))?;
    let out_width = f.get_node(ret).ty.bit_count();
    if out_width == 0 {
        return Err(Status::Unimplemented(
            "zero-width module outputs are not supported".to_string(),
        ));
    }

    let mut sig_builder = ModuleSignatureBuilder::new(&module_name).with_clock("clk");
    if let Some(reset) = &options.reset {
        sig_builder = sig_builder.with_reset(&reset.name, reset.asynchronous, reset.active_low);
    }
    for param in f.params.iter() {
        sig_builder = sig_builder.add_data_input(&param.name, param.ty.bit_count());
    }
    let out_port_name = format!("{}_out", f.name);
    sig_builder = sig_builder.add_data_output(&out_port_name, out_width);
    let latency = schedule.length() - 1 + if options.flop_outputs { 1 } else { 0 };
    let signature = sig_builder.with_pipeline_interface(latency, 1).build()?;

    let mut mb = ModuleBuilder::new(
        &signature.module_name,
        Some("clk"),
        signature.reset.clone(),
    );
    for port in signature.data_inputs.iter() {
        mb.add_input_port(&port.name, port.width);
    }
    let out_port = mb.add_output_port(
        &signature.data_outputs[0].name,
        signature.data_outputs[0].width,
    );

    let mut emitter = PipelineEmitter::new(f, schedule);

    // Parameters enter through ports, optionally through a p0_ input flop.
    let mut input_regs: Vec<Register> = Vec::new();
    for (i, param) in f.params.iter().enumerate() {
        let node = actsynth_ir::ir_utils::param_node_ref_by_index(f, i)
            .ok_or_else(|| Status::Internal(format!("param '{}' has no node", param.name)))?;
        let port = signature.data_inputs[i].name.clone();
        if options.flop_inputs {
            let reg_name = format!("p0_{}", port);
            input_regs.push(mb.declare_register(&reg_name, param.ty.bit_count(), &port));
            emitter.names.insert(node, reg_name);
        } else {
            emitter.names.insert(node, port);
        }
    }
    if !input_regs.is_empty() {
        mb.assign_registers(&input_regs, None);
    }

    for cycle in 0..schedule.length() {
        mb.add_assignment_comment(&format!("===== Stage {}", cycle));
        for node in schedule.nodes_in_cycle(cycle) {
            let payload = &f.get_node(*node).payload;
            if matches!(payload, NodePayload::Nil | NodePayload::GetParam(_)) {
                continue;
            }
            let width = f.get_node(*node).ty.bit_count();
            if width == 0 {
                return Err(Status::Unimplemented(format!(
                    "zero-width value '{}' has no datapath emission",
                    actsynth_ir::ir::node_textual_id(f, *node)
                )));
            }
            let expr = emitter.node_expr(*node)?;
            let name = emitter.base[node].clone();
            mb.declare_variable(&name, width);
            mb.add_continuous_assignment(&name, &expr);
            emitter.names.insert(*node, name);
        }

        if cycle < schedule.length() - 1 {
            let mut stage_regs: Vec<Register> = Vec::new();
            for node in schedule.get_live_out_of_cycle(f, cycle) {
                let current = emitter.operand_name(node)?;
                let reg_name = format!("p{}_{}", cycle + 1, emitter.base[&node]);
                stage_regs.push(mb.declare_register(
                    &reg_name,
                    f.get_node(node).ty.bit_count(),
                    &current,
                ));
                emitter.names.insert(node, reg_name);
            }
            mb.assign_registers(&stage_regs, None);
        }
    }

    let final_value = emitter.operand_name(ret)?;
    if options.flop_outputs {
        let reg = mb.declare_register(&format!("{}_reg", out_port), out_width, &final_value);
        mb.assign_registers(&[reg.clone()], None);
        mb.add_continuous_assignment(&out_port, &reg.name);
    } else {
        mb.add_continuous_assignment(&out_port, &final_value);
    }

    Ok(ModuleGeneratorResult {
        signature,
        verilog_text: mb.emit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsynth_ir::ir_builder::FunctionBuilder;
    use actsynth_sched::delay_model::StandardDelayEstimator;
    use actsynth_sched::pipeline_schedule::{
        PipelineSchedule, SchedulingOptions, SchedulingStrategy,
    };

    fn schedule_for(f: &Fn, period: i64, stages: i64) -> PipelineSchedule {
        let options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(period)
            .pipeline_stages(stages);
        PipelineSchedule::run(f, &StandardDelayEstimator, &options).unwrap()
    }

    #[test]
    fn single_stage_module_is_combinational() {
        let mut fb = FunctionBuilder::new("adder");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, Some("sum")).unwrap();
        let f = fb.build_with_return_value(sum).unwrap();
        let schedule = schedule_for(&f, 10, 1);

        let result =
            to_pipeline_module_text(&schedule, &f, &PipelineOptions::new()).unwrap();
        assert!(result.verilog_text.contains("module adder_pipeline ("));
        assert!(result.verilog_text.contains("assign sum = a + b;"));
        assert!(result.verilog_text.contains("assign adder_out = sum;"));
        assert_eq!(result.signature.pipeline.as_ref().unwrap().latency, 0);
        // No stage registers in a single-stage pipeline.
        assert!(!result.verilog_text.contains("p1_"));
    }

    #[test]
    fn cross_stage_values_get_boundary_registers() {
        let mut fb = FunctionBuilder::new("deep");
        let a = fb.param("a", 8);
        let n1 = fb.not(a, Some("n1")).unwrap();
        let n2 = fb.not(n1, Some("n2")).unwrap();
        let f = fb.build_with_return_value(n2).unwrap();
        let schedule = schedule_for(&f, 1, 2);

        let result =
            to_pipeline_module_text(&schedule, &f, &PipelineOptions::new()).unwrap();
        assert!(result.verilog_text.contains("reg [7:0] p1_n1;"));
        assert!(result.verilog_text.contains("p1_n1 <= n1;"));
        assert!(result.verilog_text.contains("assign n2 = ~p1_n1;"));
        assert_eq!(result.signature.pipeline.as_ref().unwrap().latency, 1);
    }

    #[test]
    fn literals_and_slices_emit() {
        let mut fb = FunctionBuilder::new("slicer");
        let a = fb.param("a", 16);
        let k = fb.literal_u64(5, 16);
        let masked = fb.and(&[a, k], Some("masked")).unwrap();
        let nib = fb.bit_slice(masked, 4, 4, Some("nib")).unwrap();
        let f = fb.build_with_return_value(nib).unwrap();
        let schedule = schedule_for(&f, 10, 1);

        let result =
            to_pipeline_module_text(&schedule, &f, &PipelineOptions::new()).unwrap();
        assert!(result.verilog_text.contains("assign const_5 = 16'd5;"));
        assert!(result.verilog_text.contains("assign nib = masked[7:4];"));
    }

    #[test]
    fn tuple_return_concatenates() {
        let mut fb = FunctionBuilder::new("pairer");
        let a = fb.param("a", 4);
        let b = fb.param("b", 4);
        let t = fb.tuple(&[a, b], Some("pair"));
        let f = fb.build_with_return_value(t).unwrap();
        let schedule = schedule_for(&f, 10, 1);

        let result =
            to_pipeline_module_text(&schedule, &f, &PipelineOptions::new()).unwrap();
        assert!(result.verilog_text.contains("assign pair = {a, b};"));
        assert!(result.verilog_text.contains("output wire [7:0] pairer_out"));
    }

    #[test]
    fn flop_inputs_adds_p0_registers() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let n = fb.not(a, Some("n")).unwrap();
        let f = fb.build_with_return_value(n).unwrap();
        let schedule = schedule_for(&f, 10, 1);

        let options = PipelineOptions::new().flop_inputs(true);
        let result = to_pipeline_module_text(&schedule, &f, &options).unwrap();
        assert!(result.verilog_text.contains("reg [7:0] p0_a;"));
        assert!(result.verilog_text.contains("assign n = ~p0_a;"));
    }
}
