// SPDX-License-Identifier: Apache-2.0

//! Finite-state-machine builder.
//!
//! Builds the textual FSM block emitted at the end of a module: state
//! localparams, the state register with reset, down counters, combinational
//! output logic with per-state (optionally guarded) assignments, and the
//! next-state logic.

use actsynth_common::status::{Status, StatusResult};

use crate::module_signature::ResetProto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterId(usize);

struct FsmState {
    name: String,
    // (guard, output, value)
    output_assignments: Vec<(Option<String>, OutputId, u64)>,
    // (guard, counter, value)
    counter_sets: Vec<(Option<String>, CounterId, u64)>,
    // (condition, next state)
    transitions: Vec<(String, StateId)>,
}

struct FsmOutput {
    name: String,
    default_value: u64,
}

struct FsmCounter {
    name: String,
    width: usize,
}

pub struct FsmBuilder {
    name: String,
    clk: String,
    reset: ResetProto,
    states: Vec<FsmState>,
    outputs: Vec<FsmOutput>,
    counters: Vec<FsmCounter>,
    reset_state: Option<StateId>,
}

impl FsmBuilder {
    pub fn new(name: &str, clk: &str, reset: ResetProto) -> Self {
        FsmBuilder {
            name: name.to_string(),
            clk: clk.to_string(),
            reset,
            states: Vec::new(),
            outputs: Vec::new(),
            counters: Vec::new(),
            reset_state: None,
        }
    }

    pub fn add_state(&mut self, name: &str) -> StateId {
        self.states.push(FsmState {
            name: name.to_string(),
            output_assignments: Vec::new(),
            counter_sets: Vec::new(),
            transitions: Vec::new(),
        });
        StateId(self.states.len() - 1)
    }

    pub fn set_reset_state(&mut self, state: StateId) {
        self.reset_state = Some(state);
    }

    /// Adds a 1-bit output with the given default value.
    pub fn add_output1(&mut self, name: &str, default_value: u64) -> OutputId {
        self.outputs.push(FsmOutput {
            name: name.to_string(),
            default_value,
        });
        OutputId(self.outputs.len() - 1)
    }

    /// Adds a down counter that decrements every cycle unless a state loads
    /// it.
    pub fn add_down_counter(&mut self, name: &str, width: usize) -> CounterId {
        self.counters.push(FsmCounter {
            name: name.to_string(),
            width,
        });
        CounterId(self.counters.len() - 1)
    }

    pub fn counter_is_zero(&self, counter: CounterId) -> String {
        format!("({} == 0)", self.counters[counter.0].name)
    }

    pub fn set_output(&mut self, state: StateId, output: OutputId, value: u64) {
        self.states[state.0]
            .output_assignments
            .push((None, output, value));
    }

    pub fn set_output_guarded(&mut self, state: StateId, guard: &str, output: OutputId, value: u64) {
        self.states[state.0]
            .output_assignments
            .push((Some(guard.to_string()), output, value));
    }

    pub fn set_counter(&mut self, state: StateId, counter: CounterId, value: u64) {
        self.states[state.0].counter_sets.push((None, counter, value));
    }

    pub fn set_counter_guarded(&mut self, state: StateId, guard: &str, counter: CounterId, value: u64) {
        self.states[state.0]
            .counter_sets
            .push((Some(guard.to_string()), counter, value));
    }

    pub fn add_transition(&mut self, from: StateId, condition: &str, to: StateId) {
        self.states[from.0]
            .transitions
            .push((condition.to_string(), to));
    }

    fn state_param(&self, state: &FsmState) -> String {
        format!("State{}", state.name)
    }

    /// Emits the FSM block text.
    pub fn build(&self) -> StatusResult<String> {
        let reset_state = self.reset_state.ok_or_else(|| {
            Status::InvalidArgument(format!("fsm '{}' has no reset state", self.name))
        })?;
        let state_bits = usize::BITS as usize
            - (self.states.len().saturating_sub(1)).leading_zeros() as usize;
        let state_bits = state_bits.max(1);

        let mut out = String::new();
        out.push_str(&format!("// FSM: {}\n", self.name));
        let param_spec = if state_bits > 1 {
            format!("[{}:0] ", state_bits - 1)
        } else {
            String::new()
        };
        for (i, state) in self.states.iter().enumerate() {
            out.push_str(&format!(
                "localparam {}{} = {};\n",
                param_spec,
                self.state_param(state),
                i
            ));
        }
        let state_spec = if state_bits > 1 {
            format!("[{}:0] ", state_bits - 1)
        } else {
            String::new()
        };
        out.push_str(&format!("reg {}state;\n", state_spec));
        out.push_str(&format!("reg {}state_next;\n", state_spec));
        for counter in self.counters.iter() {
            out.push_str(&format!(
                "reg {}{};\n",
                if counter.width > 1 {
                    format!("[{}:0] ", counter.width - 1)
                } else {
                    String::new()
                },
                counter.name
            ));
        }
        for output in self.outputs.iter() {
            out.push_str(&format!("reg {};\n", output.name));
        }

        // Next-state logic.
        out.push_str("\nalways @ (*) begin\n  state_next = state;\n  case (state)\n");
        for state in self.states.iter() {
            out.push_str(&format!("    {}: begin\n", self.state_param(state)));
            for (condition, next) in state.transitions.iter() {
                out.push_str(&format!(
                    "      if ({}) begin\n        state_next = {};\n      end\n",
                    condition,
                    self.state_param(&self.states[next.0])
                ));
            }
            out.push_str("    end\n");
        }
        out.push_str("    default: begin end\n  endcase\nend\n");

        // Output logic: defaults first, then per-state overrides.
        out.push_str("\nalways @ (*) begin\n");
        for output in self.outputs.iter() {
            out.push_str(&format!("  {} = {};\n", output.name, output.default_value));
        }
        out.push_str("  case (state)\n");
        for state in self.states.iter() {
            out.push_str(&format!("    {}: begin\n", self.state_param(state)));
            for (guard, output, value) in state.output_assignments.iter() {
                let assignment =
                    format!("{} = {};", self.outputs[output.0].name, value);
                match guard {
                    Some(g) => out.push_str(&format!(
                        "      if ({}) begin\n        {}\n      end\n",
                        g, assignment
                    )),
                    None => out.push_str(&format!("      {}\n", assignment)),
                }
            }
            out.push_str("    end\n");
        }
        out.push_str("    default: begin end\n  endcase\nend\n");

        // State register with reset.
        let edge = if self.reset.active_low { "negedge" } else { "posedge" };
        let sensitivity = if self.reset.asynchronous {
            format!("posedge {} or {} {}", self.clk, edge, self.reset.name)
        } else {
            format!("posedge {}", self.clk)
        };
        let reset_test = if self.reset.active_low {
            format!("!{}", self.reset.name)
        } else {
            self.reset.name.clone()
        };
        out.push_str(&format!("\nalways @ ({}) begin\n", sensitivity));
        out.push_str(&format!(
            "  if ({}) begin\n    state <= {};\n",
            reset_test,
            self.state_param(&self.states[reset_state.0])
        ));
        for counter in self.counters.iter() {
            out.push_str(&format!("    {} <= 0;\n", counter.name));
        }
        out.push_str("  end else begin\n    state <= state_next;\n");
        // Counters decrement unless a state (re)loads them.
        for (ci, counter) in self.counters.iter().enumerate() {
            out.push_str(&format!(
                "    if ({} != 0) begin\n      {} <= {} - 1;\n    end\n",
                counter.name, counter.name, counter.name
            ));
            for state in self.states.iter() {
                for (guard, counter_id, value) in state.counter_sets.iter() {
                    if counter_id.0 != ci {
                        continue;
                    }
                    let condition = match guard {
                        Some(g) => format!("state == {} && {}", self.state_param(state), g),
                        None => format!("state == {}", self.state_param(state)),
                    };
                    out.push_str(&format!(
                        "    if ({}) begin\n      {} <= {};\n    end\n",
                        condition, counter.name, value
                    ));
                }
            }
        }
        out.push_str("  end\nend\n");

        Ok(out)
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

    fn build_handshake_fsm() -> String {
        let mut fsm = FsmBuilder::new("test_fsm", "clk", reset_proto());
        let _null = fsm.add_state("Null");
        let ready = fsm.add_state("Ready");
        fsm.set_reset_state(ready);
        let running = fsm.add_state("Running");
        let done = fsm.add_state("Done");

        let ready_in = fsm.add_output1("fsm_ready_in", 0);
        let valid_out = fsm.add_output1("fsm_valid_out", 0);
        fsm.set_output(ready, ready_in, 1);
        fsm.add_transition(ready, "valid_in", running);
        fsm.add_transition(running, "work_done", done);
        fsm.set_output(done, valid_out, 1);
        fsm.add_transition(done, "ready_out", ready);
        fsm.build().unwrap()
    }

    #[test]
    fn four_states_get_two_bit_encoding() {
        let text = build_handshake_fsm();
        assert!(text.contains("localparam [1:0] StateNull = 0;"));
        assert!(text.contains("localparam [1:0] StateDone = 3;"));
        assert!(text.contains("reg [1:0] state;"));
    }

    #[test]
    fn reset_lands_in_ready_state() {
        let text = build_handshake_fsm();
        assert!(text.contains("if (!rst_n) begin\n    state <= StateReady;"));
        assert!(text.contains("posedge clk or negedge rst_n"));
    }

    #[test]
    fn outputs_default_then_override() {
        let text = build_handshake_fsm();
        assert!(text.contains("fsm_ready_in = 0;"));
        assert!(text.contains("fsm_ready_in = 1;"));
        assert!(text.contains("fsm_valid_out = 1;"));
    }

    #[test]
    fn down_counter_reloads_on_guard() {
        let mut fsm = FsmBuilder::new("f", "clk", reset_proto());
        let ready = fsm.add_state("Ready");
        fsm.set_reset_state(ready);
        let running = fsm.add_state("Running");
        fsm.add_transition(ready, "go", running);
        let counter = fsm.add_down_counter("pipeline_counter", 3);
        fsm.set_counter(ready, counter, 5);
        let zero = fsm.counter_is_zero(counter);
        fsm.set_counter_guarded(running, &zero, counter, 5);
        let text = fsm.build().unwrap();
        assert!(text.contains("reg [2:0] pipeline_counter;"));
        assert!(text.contains("pipeline_counter <= pipeline_counter - 1;"));
        assert!(text.contains("state == StateRunning && (pipeline_counter == 0)"));
    }

    #[test]
    fn missing_reset_state_is_invalid() {
        let mut fsm = FsmBuilder::new("f", "clk", reset_proto());
        fsm.add_state("Only");
        assert!(fsm.build().is_err());
    }
}
