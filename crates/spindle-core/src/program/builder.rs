//! Incremental construction of programs with eager shape checking.

use super::{BinaryOp, Instruction, Op, Program, UnaryOp, ValueId, infer_shape};
use crate::literal::Literal;
use crate::types::{ElementType, Shape};
use crate::{Error, Result};

/// Builds a [`Program`] one instruction at a time.
///
/// Every method infers the result shape from its operands and fails early
/// on a mismatch, so a successful [`ProgramBuilder::build`] yields a valid
/// program.
///
/// # Example
/// ```
/// use spindle_core::{ElementType, ProgramBuilder, Shape, UnaryOp};
///
/// let mut builder = ProgramBuilder::new("softplus_ish");
/// let x = builder.parameter(Shape::array(ElementType::F32, vec![8]));
/// let e = builder.unary(UnaryOp::Exp, x)?;
/// let y = builder.add(e, x)?;
/// let program = builder.build(y)?;
/// assert_eq!(program.instructions.len(), 3);
/// # Ok::<(), spindle_core::Error>(())
/// ```
#[derive(Debug)]
pub struct ProgramBuilder {
    name: String,
    instructions: Vec<Instruction>,
    next_parameter: usize,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            next_parameter: 0,
        }
    }

    /// Add the next positional parameter.
    pub fn parameter(&mut self, shape: Shape) -> ValueId {
        let n = self.next_parameter;
        self.next_parameter += 1;
        self.push_unchecked(shape, Op::Parameter(n))
    }

    /// Embed a constant; the literal is normalized to row-major first.
    pub fn constant(&mut self, literal: Literal) -> Result<ValueId> {
        let literal = literal.to_row_major()?;
        let shape = Shape::Array(literal.shape().clone());
        Ok(self.push_unchecked(shape, Op::Constant(literal)))
    }

    pub fn unary(&mut self, op: UnaryOp, x: ValueId) -> Result<ValueId> {
        let shape = self.shape_of(x)?.without_layout();
        self.push(shape, Op::Unary(op, x))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let shape = self.shape_of(lhs)?.without_layout();
        self.push(shape, Op::Binary(op, lhs, rhs))
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn convert(&mut self, x: ValueId, element_type: ElementType) -> Result<ValueId> {
        let dims = self.shape_of(x)?.expect_array("convert operand")?.dims.clone();
        self.push(Shape::array(element_type, dims), Op::Convert(x))
    }

    pub fn reshape(&mut self, x: ValueId, dims: Vec<usize>) -> Result<ValueId> {
        let element_type = self.shape_of(x)?.expect_array("reshape operand")?.element_type;
        self.push(Shape::array(element_type, dims), Op::Reshape(x))
    }

    pub fn tuple(&mut self, elements: Vec<ValueId>) -> Result<ValueId> {
        let shapes = elements
            .iter()
            .map(|id| self.shape_of(*id).cloned())
            .collect::<Result<Vec<_>>>()?;
        self.push(Shape::Tuple(shapes), Op::Tuple(elements))
    }

    pub fn get_tuple_element(&mut self, x: ValueId, index: usize) -> Result<ValueId> {
        let shape = match self.shape_of(x)? {
            Shape::Tuple(elements) => elements.get(index).cloned(),
            Shape::Array(_) => None,
        }
        .ok_or_else(|| Error::Shape(format!("{x} has no tuple element {index}")))?;
        self.push(shape, Op::GetTupleElement(x, index))
    }

    /// Dequeue a value of `shape` from the device infeed.
    pub fn infeed(&mut self, shape: Shape) -> ValueId {
        self.push_unchecked(shape, Op::Infeed)
    }

    /// Enqueue `x` on the device outfeed.
    pub fn outfeed(&mut self, x: ValueId) -> Result<ValueId> {
        self.push(Shape::Tuple(Vec::new()), Op::Outfeed(x))
    }

    /// Shape of an already-defined value.
    pub fn shape_of(&self, id: ValueId) -> Result<&Shape> {
        self.instructions
            .get(id.0)
            .map(|inst| &inst.shape)
            .ok_or_else(|| Error::Shape(format!("{id} is not defined")))
    }

    /// Finish the program with `root` as its result.
    ///
    /// # Errors
    /// Returns an error if the finished program fails validation.
    pub fn build(self, root: ValueId) -> Result<Program> {
        let program = Program {
            name: self.name,
            instructions: self.instructions,
            root,
        };
        program.validate()?;
        Ok(program)
    }

    fn push(&mut self, shape: Shape, op: Op) -> Result<ValueId> {
        let defined: Vec<&Shape> = self.instructions.iter().map(|inst| &inst.shape).collect();
        let inferred = infer_shape(&op, &shape, &defined)?;
        Ok(self.push_unchecked(inferred, op))
    }

    fn push_unchecked(&mut self, shape: Shape, op: Op) -> ValueId {
        let id = ValueId(self.instructions.len());
        self.instructions.push(Instruction { id, shape, op });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_mismatched_binary() {
        let mut builder = ProgramBuilder::new("bad");
        let a = builder.parameter(Shape::array(ElementType::F32, vec![4]));
        let b = builder.parameter(Shape::array(ElementType::S32, vec![4]));
        assert!(builder.add(a, b).is_err());
    }

    #[test]
    fn test_builder_tuple_roundtrip() {
        let mut builder = ProgramBuilder::new("pair");
        let a = builder.parameter(Shape::array(ElementType::F32, vec![2]));
        let b = builder.convert(a, ElementType::S32).unwrap();
        let t = builder.tuple(vec![a, b]).unwrap();
        let second = builder.get_tuple_element(t, 1).unwrap();
        assert_eq!(
            builder.shape_of(second).unwrap(),
            &Shape::array(ElementType::S32, vec![2])
        );
        assert!(builder.get_tuple_element(t, 2).is_err());
        let program = builder.build(t).unwrap();
        assert!(program.result_shape().unwrap().is_tuple());
    }

    #[test]
    fn test_builder_reshape_checks_count() {
        let mut builder = ProgramBuilder::new("reshape");
        let a = builder.parameter(Shape::array(ElementType::F32, vec![2, 3]));
        assert!(builder.reshape(a, vec![6]).is_ok());
        assert!(builder.reshape(a, vec![4]).is_err());
    }

    #[test]
    fn test_builder_feeds() {
        let mut builder = ProgramBuilder::new("echo");
        let x = builder.infeed(Shape::array(ElementType::F32, vec![3]));
        let token = builder.outfeed(x).unwrap();
        let program = builder.build(token).unwrap();
        assert!(program.uses_feeds());
        assert_eq!(program.result_shape().unwrap(), &Shape::Tuple(vec![]));
    }
}
