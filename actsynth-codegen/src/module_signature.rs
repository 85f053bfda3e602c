// SPDX-License-Identifier: Apache-2.0

//! Module signatures: the port-level contract of an emitted module.

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir_utils::sanitize_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProto {
    pub name: String,
    pub width: usize,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetProto {
    pub name: String,
    pub asynchronous: bool,
    pub active_low: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyValidInterface {
    pub input_ready: String,
    pub input_valid: String,
    pub output_ready: String,
    pub output_valid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProto {
    pub latency: i64,
    pub initiation_interval: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSignature {
    pub module_name: String,
    pub clock_name: Option<String>,
    pub reset: Option<ResetProto>,
    pub data_inputs: Vec<PortProto>,
    pub data_outputs: Vec<PortProto>,
    pub ready_valid: Option<ReadyValidInterface>,
    pub pipeline: Option<PipelineProto>,
}

/// Builds a `ModuleSignature`, recording port direction and width and
/// sanitizing every identifier.
pub struct ModuleSignatureBuilder {
    signature: ModuleSignature,
}

impl ModuleSignatureBuilder {
    pub fn new(module_name: &str) -> Self {
        ModuleSignatureBuilder {
            signature: ModuleSignature {
                module_name: sanitize_identifier(module_name),
                clock_name: None,
                reset: None,
                data_inputs: Vec::new(),
                data_outputs: Vec::new(),
                ready_valid: None,
                pipeline: None,
            },
        }
    }

    pub fn with_clock(mut self, name: &str) -> Self {
        self.signature.clock_name = Some(sanitize_identifier(name));
        self
    }

    pub fn with_reset(mut self, name: &str, asynchronous: bool, active_low: bool) -> Self {
        self.signature.reset = Some(ResetProto {
            name: sanitize_identifier(name),
            asynchronous,
            active_low,
        });
        self
    }

    pub fn add_data_input(mut self, name: &str, width: usize) -> Self {
        self.signature.data_inputs.push(PortProto {
            name: sanitize_identifier(name),
            width,
            direction: Direction::Input,
        });
        self
    }

    pub fn add_data_output(mut self, name: &str, width: usize) -> Self {
        self.signature.data_outputs.push(PortProto {
            name: sanitize_identifier(name),
            width,
            direction: Direction::Output,
        });
        self
    }

    pub fn with_ready_valid_interface(
        mut self,
        input_ready: &str,
        input_valid: &str,
        output_ready: &str,
        output_valid: &str,
    ) -> Self {
        self.signature.ready_valid = Some(ReadyValidInterface {
            input_ready: sanitize_identifier(input_ready),
            input_valid: sanitize_identifier(input_valid),
            output_ready: sanitize_identifier(output_ready),
            output_valid: sanitize_identifier(output_valid),
        });
        self
    }

    pub fn with_pipeline_interface(mut self, latency: i64, initiation_interval: i64) -> Self {
        self.signature.pipeline = Some(PipelineProto {
            latency,
            initiation_interval,
        });
        self
    }

    pub fn build(self) -> StatusResult<ModuleSignature> {
        let sig = self.signature;
        if sig.module_name.is_empty() {
            return Err(Status::InvalidArgument(
                "module signature requires a module name".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for port in sig.data_inputs.iter().chain(sig.data_outputs.iter()) {
            if !seen.insert(port.name.clone()) {
                return Err(Status::InvalidArgument(format!(
                    "duplicate port name '{}' in module signature",
                    port.name
                )));
            }
        }
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sanitizes_identifiers() {
        let sig = ModuleSignatureBuilder::new("my-module.v2")
            .with_clock("clk")
            .with_reset("rst_n", true, true)
            .add_data_input("pkt.hdr", 32)
            .add_data_output("result", 8)
            .with_ready_valid_interface("ready_in", "valid_in", "ready_out", "valid_out")
            .build()
            .unwrap();
        assert_eq!(sig.module_name, "my_module_v2");
        assert_eq!(sig.data_inputs[0].name, "pkt_hdr");
        assert_eq!(sig.data_inputs[0].width, 32);
        assert_eq!(sig.data_inputs[0].direction, Direction::Input);
        assert!(sig.reset.as_ref().unwrap().active_low);
    }

    #[test]
    fn duplicate_ports_rejected() {
        let result = ModuleSignatureBuilder::new("m")
            .add_data_input("a.b", 1)
            .add_data_input("a_b", 1)
            .build();
        assert!(matches!(result, Err(Status::InvalidArgument(_))));
    }
}
