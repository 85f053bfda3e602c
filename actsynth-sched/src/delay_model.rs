// SPDX-License-Identifier: Apache-2.0

//! Per-operation delay estimation.

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir::{Binop, Fn, NodePayload, NodeRef};

/// Estimates the propagation delay of a single IR operation in picoseconds.
pub trait DelayEstimator {
    fn name(&self) -> &str;
    fn operation_delay_ps(&self, f: &Fn, node: NodeRef) -> StatusResult<i64>;
}

/// Table-driven estimator: wiring-only operations are free, multiplies and
/// divides are multi-unit, everything else costs one unit.
pub struct StandardDelayEstimator;

impl DelayEstimator for StandardDelayEstimator {
    fn name(&self) -> &str {
        "standard"
    }

    fn operation_delay_ps(&self, f: &Fn, node: NodeRef) -> StatusResult<i64> {
        let delay = match &f.get_node(node).payload {
            NodePayload::Nil
            | NodePayload::GetParam(_)
            | NodePayload::Literal(_)
            | NodePayload::BitSlice { .. }
            | NodePayload::ZeroExt { .. }
            | NodePayload::SignExt { .. }
            | NodePayload::Tuple(_)
            | NodePayload::TupleIndex { .. }
            | NodePayload::Receive { .. }
            | NodePayload::Send { .. }
            | NodePayload::AfterAll(_) => 0,
            NodePayload::Nary(op, _) if *op == actsynth_ir::ir::NaryOp::Concat => 0,
            NodePayload::Binop(Binop::Udiv, _, _) => 3,
            NodePayload::Binop(Binop::Umul, _, _) => 2,
            _ => 1,
        };
        Ok(delay)
    }
}

/// Every operation costs one unit except parameters and literals.
pub struct UnitDelayEstimator;

impl DelayEstimator for UnitDelayEstimator {
    fn name(&self) -> &str {
        "unit"
    }

    fn operation_delay_ps(&self, f: &Fn, node: NodeRef) -> StatusResult<i64> {
        let delay = match &f.get_node(node).payload {
            NodePayload::Nil | NodePayload::GetParam(_) | NodePayload::Literal(_) => 0,
            _ => 1,
        };
        Ok(delay)
    }
}

/// Wraps a base estimator, adding a fixed input delay to receive operations.
pub struct DelayEstimatorWithInputDelay<'a> {
    base: &'a dyn DelayEstimator,
    input_delay: i64,
    name: String,
}

impl<'a> DelayEstimatorWithInputDelay<'a> {
    pub fn new(base: &'a dyn DelayEstimator, input_delay: i64) -> Self {
        let name = format!("{}_with_input_delay", base.name());
        DelayEstimatorWithInputDelay {
            base,
            input_delay,
            name,
        }
    }
}

impl DelayEstimator for DelayEstimatorWithInputDelay<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation_delay_ps(&self, f: &Fn, node: NodeRef) -> StatusResult<i64> {
        let base_delay = self.base.operation_delay_ps(f, node)?;
        if matches!(f.get_node(node).payload, NodePayload::Receive { .. }) {
            Ok(base_delay + self.input_delay)
        } else {
            Ok(base_delay)
        }
    }
}

/// Looks up a delay model by CLI name.
pub fn get_delay_estimator(name: &str) -> StatusResult<Box<dyn DelayEstimator>> {
    match name {
        "standard" => Ok(Box::new(StandardDelayEstimator)),
        "unit" => Ok(Box::new(UnitDelayEstimator)),
        other => Err(Status::NotFound(format!(
            "no delay model named '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsynth_ir::ir_builder::FunctionBuilder;

    #[test]
    fn standard_table() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let mul = fb.umul(a, b, None).unwrap();
        let div = fb.udiv(a, b, None).unwrap();
        let slice = fb.bit_slice(a, 0, 4, None).unwrap();
        let t = fb.tuple(&[mul, div, slice], None);
        let f = fb.build_with_return_value(t).unwrap();

        let est = StandardDelayEstimator;
        assert_eq!(est.operation_delay_ps(&f, a.node_ref()).unwrap(), 0);
        assert_eq!(est.operation_delay_ps(&f, mul.node_ref()).unwrap(), 2);
        assert_eq!(est.operation_delay_ps(&f, div.node_ref()).unwrap(), 3);
        assert_eq!(est.operation_delay_ps(&f, slice.node_ref()).unwrap(), 0);
        assert_eq!(est.operation_delay_ps(&f, t.node_ref()).unwrap(), 0);
    }

    #[test]
    fn input_delay_applies_to_receives_only() {
        let mut fb = FunctionBuilder::new("f");
        let rx = fb.receive("in_ch", 8, Some("rx"));
        let one = fb.literal_u64(1, 8);
        let sum = fb.add(rx, one, None).unwrap();
        let f = fb.build_with_return_value(sum).unwrap();

        let base = StandardDelayEstimator;
        let est = DelayEstimatorWithInputDelay::new(&base, 5);
        assert_eq!(est.operation_delay_ps(&f, rx.node_ref()).unwrap(), 5);
        assert_eq!(est.operation_delay_ps(&f, sum.node_ref()).unwrap(), 1);
    }

    #[test]
    fn registry_lookup() {
        assert!(get_delay_estimator("standard").is_ok());
        assert!(get_delay_estimator("unit").is_ok());
        assert!(get_delay_estimator("bogus").is_err());
    }
}
