// SPDX-License-Identifier: Apache-2.0

//! Section-ordered Verilog text assembly.
//!
//! Emission order is fixed: module header with ports, declarations,
//! assignments (continuous assigns, instantiations, register always-blocks),
//! then any trailing blocks (the FSM), then `endmodule`.

use crate::module_signature::ResetProto;

/// A declared register together with the expression computing its next value.
#[derive(Debug, Clone)]
pub struct Register {
    pub name: String,
    pub width: usize,
    pub next: String,
}

pub struct ModuleBuilder {
    module_name: String,
    clk_name: Option<String>,
    reset: Option<ResetProto>,
    input_ports: Vec<(String, usize)>,
    output_ports: Vec<(String, usize)>,
    declarations: Vec<String>,
    assignments: Vec<String>,
    trailing: Vec<String>,
}

fn width_spec(width: usize) -> String {
    if width <= 1 {
        String::new()
    } else {
        format!("[{}:0] ", width - 1)
    }
}

impl ModuleBuilder {
    pub fn new(module_name: &str, clk_name: Option<&str>, reset: Option<ResetProto>) -> Self {
        ModuleBuilder {
            module_name: module_name.to_string(),
            clk_name: clk_name.map(|s| s.to_string()),
            reset,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            declarations: Vec::new(),
            assignments: Vec::new(),
            trailing: Vec::new(),
        }
    }

    pub fn clock(&self) -> Option<&str> {
        self.clk_name.as_deref()
    }

    pub fn reset(&self) -> Option<&ResetProto> {
        self.reset.as_ref()
    }

    /// Adds an input port and returns its reference name.
    pub fn add_input_port(&mut self, name: &str, width: usize) -> String {
        self.input_ports.push((name.to_string(), width));
        name.to_string()
    }

    /// Adds an output port and returns its reference name.
    pub fn add_output_port(&mut self, name: &str, width: usize) -> String {
        self.output_ports.push((name.to_string(), width));
        name.to_string()
    }

    /// Declares a wire and returns its reference name.
    pub fn declare_variable(&mut self, name: &str, width: usize) -> String {
        self.declarations
            .push(format!("wire {}{};", width_spec(width), name));
        name.to_string()
    }

    pub fn declare_variable_and_assign(&mut self, name: &str, expr: &str, width: usize) -> String {
        let reference = self.declare_variable(name, width);
        self.add_continuous_assignment(&reference, expr);
        reference
    }

    /// Declares a register driven by `next`; the caller groups registers into
    /// always-blocks via `assign_registers`.
    pub fn declare_register(&mut self, name: &str, width: usize, next: &str) -> Register {
        self.declarations
            .push(format!("reg {}{};", width_spec(width), name));
        Register {
            name: name.to_string(),
            width,
            next: next.to_string(),
        }
    }

    pub fn add_continuous_assignment(&mut self, lhs: &str, rhs: &str) {
        self.assignments.push(format!("assign {} = {};", lhs, rhs));
    }

    pub fn add_declaration_comment(&mut self, text: &str) {
        self.declarations.push(format!("// {}", text));
    }

    pub fn add_assignment_comment(&mut self, text: &str) {
        self.assignments.push(format!("// {}", text));
    }

    pub fn add_blank_declaration_line(&mut self) {
        self.declarations.push(String::new());
    }

    pub fn add_blank_assignment_line(&mut self) {
        self.assignments.push(String::new());
    }

    /// Emits one always-block updating `registers` on the clock edge, gated
    /// by `load_enable` when provided, with the configured reset clearing
    /// every register to zero.
    pub fn assign_registers(&mut self, registers: &[Register], load_enable: Option<&str>) {
        if registers.is_empty() {
            return;
        }
        let clk = self
            .clk_name
            .clone()
            .expect("assign_registers requires a clock");
        let mut block = String::new();
        match &self.reset {
            Some(reset) => {
                let edge = if reset.active_low { "negedge" } else { "posedge" };
                let sensitivity = if reset.asynchronous {
                    format!("posedge {} or {} {}", clk, edge, reset.name)
                } else {
                    format!("posedge {}", clk)
                };
                let reset_test = if reset.active_low {
                    format!("!{}", reset.name)
                } else {
                    reset.name.clone()
                };
                block.push_str(&format!("always @ ({}) begin\n", sensitivity));
                block.push_str(&format!("  if ({}) begin\n", reset_test));
                for r in registers {
                    block.push_str(&format!("    {} <= {}'d0;\n", r.name, r.width.max(1)));
                }
                block.push_str("  end else ");
            }
            None => {
                block.push_str(&format!("always @ (posedge {}) begin\n", clk));
                block.push_str("  ");
            }
        }
        match load_enable {
            Some(enable) => block.push_str(&format!("if ({}) begin\n", enable)),
            None => block.push_str("begin\n"),
        }
        for r in registers {
            block.push_str(&format!("    {} <= {};\n", r.name, r.next));
        }
        block.push_str("  end\nend");
        self.assignments.push(block);
    }

    /// Instantiates a submodule with named port connections.
    pub fn add_instantiation(
        &mut self,
        module_name: &str,
        instance_name: &str,
        connections: &[(String, String)],
    ) {
        let mut text = format!("{} {} (\n", module_name, instance_name);
        for (i, (port, signal)) in connections.iter().enumerate() {
            text.push_str(&format!("  .{}({})", port, signal));
            if i + 1 < connections.len() {
                text.push(',');
            }
            text.push('\n');
        }
        text.push_str(");");
        self.assignments.push(text);
    }

    /// Appends a block after the assignments section; the FSM goes here so it
    /// is emitted last.
    pub fn add_trailing_block(&mut self, text: &str) {
        self.trailing.push(text.to_string());
    }

    pub fn emit(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("module {} (\n", self.module_name));
        let mut port_lines: Vec<String> = Vec::new();
        if let Some(clk) = &self.clk_name {
            port_lines.push(format!("  input wire {}", clk));
        }
        if let Some(reset) = &self.reset {
            port_lines.push(format!("  input wire {}", reset.name));
        }
        for (name, width) in self.input_ports.iter() {
            port_lines.push(format!("  input wire {}{}", width_spec(*width), name));
        }
        for (name, width) in self.output_ports.iter() {
            port_lines.push(format!("  output wire {}{}", width_spec(*width), name));
        }
        out.push_str(&port_lines.join(",\n"));
        out.push_str("\n);\n");

        for line in self.declarations.iter() {
            if line.is_empty() {
                out.push('\n');
            } else {
                out.push_str(&format!("  {}\n", line));
            }
        }
        if !self.declarations.is_empty() {
            out.push('\n');
        }
        for block in self.assignments.iter() {
            if block.is_empty() {
                out.push('\n');
                continue;
            }
            for line in block.lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
        for block in self.trailing.iter() {
            out.push('\n');
            for line in block.lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
        out.push_str("endmodule\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_proto() -> ResetProto {
        ResetProto {
            name: "rst_n".to_string(),
            asynchronous: true,
            active_low: true,
        }
    }

    #[test]
    fn emits_sections_in_order() {
        let mut mb = ModuleBuilder::new("m", Some("clk"), Some(reset_proto()));
        mb.add_input_port("a", 8);
        mb.add_output_port("out", 8);
        mb.declare_variable("tmp", 8);
        mb.add_continuous_assignment("tmp", "a + 8'd1");
        mb.add_continuous_assignment("out", "tmp");
        mb.add_trailing_block("// fsm goes here");
        let text = mb.emit();

        let decl_pos = text.find("wire [7:0] tmp;").unwrap();
        let assign_pos = text.find("assign tmp = a + 8'd1;").unwrap();
        let fsm_pos = text.find("// fsm goes here").unwrap();
        let end_pos = text.find("endmodule").unwrap();
        assert!(decl_pos < assign_pos);
        assert!(assign_pos < fsm_pos);
        assert!(fsm_pos < end_pos);
        assert!(text.starts_with("module m (\n  input wire clk,\n  input wire rst_n,"));
    }

    #[test]
    fn register_block_carries_reset_and_enable() {
        let mut mb = ModuleBuilder::new("m", Some("clk"), Some(reset_proto()));
        mb.add_input_port("d", 4);
        let r = mb.declare_register("r", 4, "d");
        mb.assign_registers(&[r], Some("en"));
        let text = mb.emit();
        assert!(text.contains("always @ (posedge clk or negedge rst_n) begin"));
        assert!(text.contains("if (!rst_n) begin"));
        assert!(text.contains("r <= 4'd0;"));
        assert!(text.contains("if (en) begin"));
        assert!(text.contains("r <= d;"));
    }

    #[test]
    fn single_bit_ports_have_no_range() {
        let mut mb = ModuleBuilder::new("m", Some("clk"), None);
        mb.add_input_port("valid_in", 1);
        let text = mb.emit();
        assert!(text.contains("input wire valid_in"));
        assert!(!text.contains("[0:0]"));
    }
}
