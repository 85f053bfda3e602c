// SPDX-License-Identifier: Apache-2.0

//! Builder for IR functions: adds typed nodes one at a time and hands back
//! lightweight `BValue` handles.
//!
//! Basic usage:
//! ```
//! use actsynth_ir::ir_builder::FunctionBuilder;
//!
//! let mut fb = FunctionBuilder::new("add1");
//! let x = fb.param("x", 8);
//! let one = fb.literal_u64(1, 8);
//! let sum = fb.add(x, one, Some("sum")).unwrap();
//! let f = fb.build_with_return_value(sum).unwrap();
//! assert_eq!(f.params.len(), 1);
//! ```

use crate::bits::Bits;
use crate::ir::{
    Binop, Fn, NaryOp, Node, NodePayload, NodeRef, Param, ParamId, Type, Unop,
};
use crate::ir_verify;

/// Handle to a value under construction; resolves widths through the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BValue(NodeRef);

impl BValue {
    pub fn node_ref(&self) -> NodeRef {
        self.0
    }
}

pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    nodes: Vec<Node>,
    next_text_id: usize,
    should_verify: bool,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            params: Vec::new(),
            // Reserve index 0 as the Nil node so no real value has index 0.
            nodes: vec![Node {
                text_id: 0,
                name: None,
                ty: Type::nil(),
                payload: NodePayload::Nil,
            }],
            next_text_id: 1,
            should_verify: true,
        }
    }

    pub fn set_should_verify(&mut self, should_verify: bool) {
        self.should_verify = should_verify;
    }

    fn take_text_id(&mut self) -> usize {
        let id = self.next_text_id;
        self.next_text_id += 1;
        id
    }

    fn add_node(&mut self, ty: Type, payload: NodePayload, name: Option<&str>) -> BValue {
        let text_id = self.take_text_id();
        self.nodes.push(Node {
            text_id,
            name: name.filter(|s| !s.is_empty()).map(|s| s.to_string()),
            ty,
            payload,
        });
        BValue(NodeRef {
            index: self.nodes.len() - 1,
        })
    }

    pub fn get_type(&self, value: BValue) -> &Type {
        &self.nodes[value.node_ref().index].ty
    }

    /// Width of a bits-typed value; errors on tuples/tokens.
    pub fn bit_count(&self, value: BValue) -> Result<usize, String> {
        self.get_type(value).as_bits_width().ok_or_else(|| {
            format!(
                "expected bits-typed value, got {}",
                self.get_type(value)
            )
        })
    }

    pub fn param(&mut self, name: &str, width: usize) -> BValue {
        self.param_typed(name, Type::Bits(width))
    }

    pub fn param_typed(&mut self, name: &str, ty: Type) -> BValue {
        let id = ParamId::new(self.take_text_id());
        self.params.push(Param {
            name: name.to_string(),
            ty: ty.clone(),
            id,
        });
        self.nodes.push(Node {
            text_id: id.get_wrapped_id(),
            name: Some(name.to_string()),
            ty,
            payload: NodePayload::GetParam(id),
        });
        BValue(NodeRef {
            index: self.nodes.len() - 1,
        })
    }

    pub fn literal(&mut self, value: Bits, name: Option<&str>) -> BValue {
        let ty = Type::Bits(value.width());
        self.add_node(ty, NodePayload::Literal(value), name)
    }

    pub fn literal_u64(&mut self, value: u64, width: usize) -> BValue {
        let name = format!("const_{}", value);
        self.literal(Bits::from_u64(value, width), Some(&name))
    }

    fn binop_same_width(
        &mut self,
        op: Binop,
        lhs: BValue,
        rhs: BValue,
        result_width: Option<usize>,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let lw = self.bit_count(lhs)?;
        let rw = self.bit_count(rhs)?;
        if lw != rw {
            return Err(format!(
                "{} requires equal operand widths, got bits[{}] and bits[{}]",
                crate::ir::binop_to_operator(op),
                lw,
                rw
            ));
        }
        let ty = Type::Bits(result_width.unwrap_or(lw));
        Ok(self.add_node(ty, NodePayload::Binop(op, lhs.node_ref(), rhs.node_ref()), name))
    }

    pub fn add(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Add, lhs, rhs, None, name)
    }

    pub fn sub(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Sub, lhs, rhs, None, name)
    }

    pub fn umul(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Umul, lhs, rhs, None, name)
    }

    pub fn udiv(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Udiv, lhs, rhs, None, name)
    }

    pub fn eq(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Eq, lhs, rhs, Some(1), name)
    }

    pub fn ne(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Ne, lhs, rhs, Some(1), name)
    }

    pub fn ult(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Ult, lhs, rhs, Some(1), name)
    }

    pub fn ule(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Ule, lhs, rhs, Some(1), name)
    }

    pub fn ugt(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Ugt, lhs, rhs, Some(1), name)
    }

    pub fn uge(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        self.binop_same_width(Binop::Uge, lhs, rhs, Some(1), name)
    }

    /// Shift amount may have any width; the result keeps the LHS width.
    pub fn shll(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        let lw = self.bit_count(lhs)?;
        self.bit_count(rhs)?;
        Ok(self.add_node(
            Type::Bits(lw),
            NodePayload::Binop(Binop::Shll, lhs.node_ref(), rhs.node_ref()),
            name,
        ))
    }

    pub fn shrl(&mut self, lhs: BValue, rhs: BValue, name: Option<&str>) -> Result<BValue, String> {
        let lw = self.bit_count(lhs)?;
        self.bit_count(rhs)?;
        Ok(self.add_node(
            Type::Bits(lw),
            NodePayload::Binop(Binop::Shrl, lhs.node_ref(), rhs.node_ref()),
            name,
        ))
    }

    fn nary_same_width(
        &mut self,
        op: NaryOp,
        elems: &[BValue],
        name: Option<&str>,
    ) -> Result<BValue, String> {
        if elems.is_empty() {
            return Err(format!(
                "{} requires at least one operand",
                crate::ir::nary_op_to_operator(op)
            ));
        }
        let width = self.bit_count(elems[0])?;
        for e in elems.iter().skip(1) {
            let w = self.bit_count(*e)?;
            if w != width {
                return Err(format!(
                    "{} requires equal operand widths, got bits[{}] and bits[{}]",
                    crate::ir::nary_op_to_operator(op),
                    width,
                    w
                ));
            }
        }
        let refs = elems.iter().map(|e| e.node_ref()).collect();
        Ok(self.add_node(Type::Bits(width), NodePayload::Nary(op, refs), name))
    }

    pub fn and(&mut self, elems: &[BValue], name: Option<&str>) -> Result<BValue, String> {
        self.nary_same_width(NaryOp::And, elems, name)
    }

    pub fn or(&mut self, elems: &[BValue], name: Option<&str>) -> Result<BValue, String> {
        self.nary_same_width(NaryOp::Or, elems, name)
    }

    pub fn not(&mut self, arg: BValue, name: Option<&str>) -> Result<BValue, String> {
        let w = self.bit_count(arg)?;
        Ok(self.add_node(Type::Bits(w), NodePayload::Unop(Unop::Not, arg.node_ref()), name))
    }

    /// Concatenation; the first element becomes the most significant bits.
    pub fn concat(&mut self, elems: &[BValue], name: Option<&str>) -> Result<BValue, String> {
        let mut width = 0usize;
        for e in elems.iter() {
            width += self.bit_count(*e)?;
        }
        let refs = elems.iter().map(|e| e.node_ref()).collect();
        Ok(self.add_node(Type::Bits(width), NodePayload::Nary(NaryOp::Concat, refs), name))
    }

    pub fn bit_slice(
        &mut self,
        arg: BValue,
        start: usize,
        width: usize,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let arg_width = self.bit_count(arg)?;
        if start + width > arg_width {
            return Err(format!(
                "bit_slice [{}, {}) out of range for bits[{}]",
                start,
                start + width,
                arg_width
            ));
        }
        Ok(self.add_node(
            Type::Bits(width),
            NodePayload::BitSlice {
                arg: arg.node_ref(),
                start,
                width,
            },
            name,
        ))
    }

    pub fn bit_slice_update(
        &mut self,
        arg: BValue,
        start: BValue,
        update_value: BValue,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let arg_width = self.bit_count(arg)?;
        self.bit_count(start)?;
        self.bit_count(update_value)?;
        Ok(self.add_node(
            Type::Bits(arg_width),
            NodePayload::BitSliceUpdate {
                arg: arg.node_ref(),
                start: start.node_ref(),
                update_value: update_value.node_ref(),
            },
            name,
        ))
    }

    pub fn zero_extend(
        &mut self,
        arg: BValue,
        new_bit_count: usize,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let w = self.bit_count(arg)?;
        if new_bit_count < w {
            return Err(format!(
                "zero_ext to {} narrows bits[{}]",
                new_bit_count, w
            ));
        }
        Ok(self.add_node(
            Type::Bits(new_bit_count),
            NodePayload::ZeroExt {
                arg: arg.node_ref(),
                new_bit_count,
            },
            name,
        ))
    }

    pub fn sign_extend(
        &mut self,
        arg: BValue,
        new_bit_count: usize,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let w = self.bit_count(arg)?;
        if new_bit_count < w {
            return Err(format!(
                "sign_ext to {} narrows bits[{}]",
                new_bit_count, w
            ));
        }
        Ok(self.add_node(
            Type::Bits(new_bit_count),
            NodePayload::SignExt {
                arg: arg.node_ref(),
                new_bit_count,
            },
            name,
        ))
    }

    /// Two-way select: `selector == 1` picks `on_true`.
    pub fn select(
        &mut self,
        selector: BValue,
        on_true: BValue,
        on_false: BValue,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        if self.bit_count(selector)? != 1 {
            return Err("sel selector must be bits[1]".to_string());
        }
        let true_ty = self.get_type(on_true).clone();
        let false_ty = self.get_type(on_false).clone();
        if true_ty != false_ty {
            return Err(format!(
                "sel arms must agree on type, got {} and {}",
                true_ty, false_ty
            ));
        }
        Ok(self.add_node(
            true_ty,
            NodePayload::Sel {
                selector: selector.node_ref(),
                cases: vec![on_false.node_ref(), on_true.node_ref()],
                default: None,
            },
            name,
        ))
    }

    /// One-hot encodes `arg`. The result has one extra bit; the final bit
    /// asserts when the input is all zeros.
    pub fn one_hot(
        &mut self,
        arg: BValue,
        lsb_prio: bool,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let w = self.bit_count(arg)?;
        Ok(self.add_node(
            Type::Bits(w + 1),
            NodePayload::OneHot {
                arg: arg.node_ref(),
                lsb_prio,
            },
            name,
        ))
    }

    /// Case `i` corresponds to selector bit `i` (LSB first).
    pub fn one_hot_select(
        &mut self,
        selector: BValue,
        cases: &[BValue],
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let sel_width = self.bit_count(selector)?;
        if sel_width != cases.len() {
            return Err(format!(
                "one_hot_sel selector width {} does not match case count {}",
                sel_width,
                cases.len()
            ));
        }
        if cases.is_empty() {
            return Err("one_hot_sel requires at least one case".to_string());
        }
        let case_ty = self.get_type(cases[0]).clone();
        for c in cases.iter() {
            if self.get_type(*c) != &case_ty {
                return Err("one_hot_sel cases must all have the same type".to_string());
            }
        }
        let refs = cases.iter().map(|c| c.node_ref()).collect();
        Ok(self.add_node(
            case_ty,
            NodePayload::OneHotSel {
                selector: selector.node_ref(),
                cases: refs,
            },
            name,
        ))
    }

    pub fn tuple(&mut self, elems: &[BValue], name: Option<&str>) -> BValue {
        let ty = Type::Tuple(elems.iter().map(|e| self.get_type(*e).clone()).collect());
        let refs = elems.iter().map(|e| e.node_ref()).collect();
        self.add_node(ty, NodePayload::Tuple(refs), name)
    }

    pub fn tuple_index(
        &mut self,
        tuple: BValue,
        index: usize,
        name: Option<&str>,
    ) -> Result<BValue, String> {
        let elem_ty = match self.get_type(tuple) {
            Type::Tuple(types) => types
                .get(index)
                .cloned()
                .ok_or_else(|| format!("tuple_index {} out of range", index))?,
            other => return Err(format!("tuple_index on non-tuple type {}", other)),
        };
        Ok(self.add_node(
            elem_ty,
            NodePayload::TupleIndex {
                tuple: tuple.node_ref(),
                index,
            },
            name,
        ))
    }

    pub fn invoke(
        &mut self,
        to_apply: &str,
        operands: &[BValue],
        ret_ty: Type,
        name: Option<&str>,
    ) -> BValue {
        let refs = operands.iter().map(|o| o.node_ref()).collect();
        self.add_node(
            ret_ty,
            NodePayload::Invoke {
                to_apply: to_apply.to_string(),
                operands: refs,
            },
            name,
        )
    }

    /// The loop carries `init`'s type through every iteration.
    pub fn counted_for(
        &mut self,
        init: BValue,
        trip_count: usize,
        stride: usize,
        body: &str,
        invariant_args: &[BValue],
        name: Option<&str>,
    ) -> BValue {
        let ty = self.get_type(init).clone();
        let refs = invariant_args.iter().map(|a| a.node_ref()).collect();
        self.add_node(
            ty,
            NodePayload::CountedFor {
                init: init.node_ref(),
                trip_count,
                stride,
                body: body.to_string(),
                invariant_args: refs,
            },
            name,
        )
    }

    pub fn receive(&mut self, channel: &str, width: usize, name: Option<&str>) -> BValue {
        self.add_node(
            Type::Bits(width),
            NodePayload::Receive {
                channel: channel.to_string(),
            },
            name,
        )
    }

    pub fn send(&mut self, channel: &str, data: BValue, name: Option<&str>) -> BValue {
        self.add_node(
            Type::Token,
            NodePayload::Send {
                channel: channel.to_string(),
                data: data.node_ref(),
            },
            name,
        )
    }

    pub fn cover(&mut self, predicate: BValue, label: &str, name: Option<&str>) -> BValue {
        self.add_node(
            Type::Token,
            NodePayload::Cover {
                predicate: predicate.node_ref(),
                label: label.to_string(),
            },
            name,
        )
    }

    pub fn build_with_return_value(self, ret: BValue) -> Result<Fn, String> {
        let f = Fn {
            name: self.name,
            params: self.params,
            ret_ty: self.nodes[ret.node_ref().index].ty.clone(),
            nodes: self.nodes,
            ret_node_ref: Some(ret.node_ref()),
        };
        if self.should_verify {
            ir_verify::verify_fn(&f)?;
        }
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_assigns_dense_ids() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, None).unwrap();
        let f = fb.build_with_return_value(sum).unwrap();
        assert_eq!(f.params.len(), 2);
        // Reserved nil node + 2 params + add.
        assert_eq!(f.nodes.len(), 4);
        assert!(matches!(f.nodes[0].payload, NodePayload::Nil));
        assert_eq!(f.nodes[3].text_id, 3);
        assert_eq!(f.ret_ty, Type::Bits(8));
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 4);
        assert!(fb.add(a, b, None).is_err());
        assert!(fb.eq(a, b, None).is_err());
    }

    #[test]
    fn select_requires_one_bit_selector() {
        let mut fb = FunctionBuilder::new("f");
        let c = fb.param("c", 2);
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        assert!(fb.select(c, a, b, None).is_err());
    }

    #[test]
    fn one_hot_sel_widths() {
        let mut fb = FunctionBuilder::new("f");
        let sel = fb.param("sel", 3);
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let c = fb.param("c", 8);
        let picked = fb.one_hot_select(sel, &[a, b, c], None).unwrap();
        assert_eq!(*fb.get_type(picked), Type::Bits(8));
        assert!(fb.one_hot_select(sel, &[a, b], None).is_err());
    }

    #[test]
    fn slice_out_of_range_rejected() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        assert!(fb.bit_slice(a, 4, 5, None).is_err());
        let ok = fb.bit_slice(a, 4, 4, None).unwrap();
        assert_eq!(*fb.get_type(ok), Type::Bits(4));
    }

    #[test]
    fn tuple_and_index() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 3);
        let b = fb.param("b", 5);
        let t = fb.tuple(&[a, b], Some("pair"));
        assert_eq!(
            *fb.get_type(t),
            Type::Tuple(vec![Type::Bits(3), Type::Bits(5)])
        );
        let second = fb.tuple_index(t, 1, None).unwrap();
        assert_eq!(*fb.get_type(second), Type::Bits(5));
        assert!(fb.tuple_index(t, 2, None).is_err());
    }

    #[test]
    fn one_hot_adds_all_zero_bit() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 4);
        let oh = fb.one_hot(a, false, None).unwrap();
        assert_eq!(*fb.get_type(oh), Type::Bits(5));
    }
}
