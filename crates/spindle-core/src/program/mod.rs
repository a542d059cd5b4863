//! Program IR consumed by backends.
//!
//! A [`Program`] is a straight-line list of instructions in SSA form. Each
//! instruction carries its result shape, so backends can allocate outputs
//! without re-running inference. Programs are built with [`ProgramBuilder`]
//! or parsed from their textual form (see [`Program::parse`]) and must pass
//! [`Program::validate`] before compilation.

mod builder;
mod text;

pub use builder::ProgramBuilder;

use crate::literal::Literal;
use crate::types::{ElementType, Shape};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of an instruction's result within one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Tanh,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 6] = [
        UnaryOp::Neg,
        UnaryOp::Abs,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
        UnaryOp::Tanh,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Tanh => "tanh",
        }
    }

    /// Operations only defined for floating-point elements.
    pub fn requires_float(&self) -> bool {
        matches!(self, UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sqrt | UnaryOp::Tanh)
    }

    fn accepts(&self, element_type: ElementType) -> bool {
        if self.requires_float() {
            element_type.is_float()
        } else {
            element_type.is_signed()
        }
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 6] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Max,
        BinaryOp::Min,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }

    /// Predicates only support `max` (or) and `min` (and).
    fn accepts(&self, element_type: ElementType) -> bool {
        element_type != ElementType::Pred || matches!(self, BinaryOp::Max | BinaryOp::Min)
    }
}

/// The operation an instruction performs.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Positional program argument.
    Parameter(usize),
    /// Embedded row-major value.
    Constant(Literal),
    Unary(UnaryOp, ValueId),
    Binary(BinaryOp, ValueId, ValueId),
    /// Numeric conversion; the target element type is the result shape's.
    Convert(ValueId),
    /// Row-major reinterpretation; the target dims are the result shape's.
    Reshape(ValueId),
    Tuple(Vec<ValueId>),
    GetTupleElement(ValueId, usize),
    /// Dequeue one value of the result shape from the device infeed.
    Infeed,
    /// Enqueue the operand on the device outfeed; produces an empty tuple.
    Outfeed(ValueId),
}

impl Op {
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Op::Parameter(_) | Op::Constant(_) | Op::Infeed => Vec::new(),
            Op::Unary(_, x)
            | Op::Convert(x)
            | Op::Reshape(x)
            | Op::GetTupleElement(x, _)
            | Op::Outfeed(x) => vec![*x],
            Op::Binary(_, lhs, rhs) => vec![*lhs, *rhs],
            Op::Tuple(elements) => elements.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Parameter(_) => "parameter",
            Op::Constant(_) => "constant",
            Op::Unary(op, _) => op.name(),
            Op::Binary(op, _, _) => op.name(),
            Op::Convert(_) => "convert",
            Op::Reshape(_) => "reshape",
            Op::Tuple(_) => "tuple",
            Op::GetTupleElement(_, _) => "get-tuple-element",
            Op::Infeed => "infeed",
            Op::Outfeed(_) => "outfeed",
        }
    }
}

/// One SSA instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    pub shape: Shape,
    pub op: Op,
}

/// A validated-on-demand computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub root: ValueId,
}

impl Program {
    /// Look up an instruction by id.
    pub fn instruction(&self, id: ValueId) -> Option<&Instruction> {
        self.instructions.get(id.0).filter(|inst| inst.id == id)
    }

    /// Parameter shapes ordered by parameter number.
    pub fn parameter_shapes(&self) -> Vec<&Shape> {
        let mut params: Vec<(usize, &Shape)> = self
            .instructions
            .iter()
            .filter_map(|inst| match inst.op {
                Op::Parameter(n) => Some((n, &inst.shape)),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(n, _)| *n);
        params.into_iter().map(|(_, shape)| shape).collect()
    }

    /// Shape of the root instruction.
    pub fn result_shape(&self) -> Result<&Shape> {
        self.instruction(self.root)
            .map(|inst| &inst.shape)
            .ok_or_else(|| Error::InvalidProgram(format!("root {} is not defined", self.root)))
    }

    /// True if any instruction touches the infeed or outfeed queues.
    pub fn uses_feeds(&self) -> bool {
        self.instructions
            .iter()
            .any(|inst| matches!(inst.op, Op::Infeed | Op::Outfeed(_)))
    }

    /// Check structural and shape consistency.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] naming the first offending instruction.
    pub fn validate(&self) -> Result<()> {
        if self.instructions.is_empty() {
            return Err(Error::InvalidProgram(format!(
                "program '{}' has no instructions",
                self.name
            )));
        }

        let mut shapes: Vec<&Shape> = Vec::with_capacity(self.instructions.len());
        let mut parameters = Vec::new();
        for (index, inst) in self.instructions.iter().enumerate() {
            if inst.id.0 != index {
                return Err(Error::InvalidProgram(format!(
                    "instruction {} is defined at position {index}",
                    inst.id
                )));
            }
            for operand in inst.op.operands() {
                if operand.0 >= index {
                    return Err(Error::InvalidProgram(format!(
                        "{} uses {operand} before it is defined",
                        inst.id
                    )));
                }
            }
            inst.shape
                .validate()
                .map_err(|e| Error::InvalidProgram(format!("{}: {e}", inst.id)))?;

            if let Op::Parameter(n) = inst.op {
                parameters.push(n);
            }

            let inferred = infer_shape(&inst.op, &inst.shape, &shapes)
                .map_err(|e| Error::InvalidProgram(format!("{} = {}: {e}", inst.id, inst.op.name())))?;
            if !inferred.compatible(&inst.shape) {
                return Err(Error::InvalidProgram(format!(
                    "{} = {}: declared shape {} but operands produce {inferred}",
                    inst.id,
                    inst.op.name(),
                    inst.shape
                )));
            }
            shapes.push(&inst.shape);
        }

        parameters.sort_unstable();
        for (expected, &n) in parameters.iter().enumerate() {
            if n != expected {
                return Err(Error::InvalidProgram(format!(
                    "parameters must be numbered 0..{} without gaps or duplicates",
                    parameters.len()
                )));
            }
        }

        self.result_shape()?;
        Ok(())
    }

    /// Stable content hash of the program's textual form.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Infer the result shape of `op` given the shapes defined so far.
///
/// `declared` supplies the parts an op takes from its own result shape
/// (parameters, infeed, convert target type, reshape target dims).
pub(crate) fn infer_shape(op: &Op, declared: &Shape, defined: &[&Shape]) -> Result<Shape> {
    let operand = |id: ValueId| -> Result<&Shape> {
        defined
            .get(id.0)
            .copied()
            .ok_or_else(|| Error::Shape(format!("operand {id} is not defined")))
    };

    match op {
        Op::Parameter(_) | Op::Infeed => Ok(declared.clone()),
        Op::Constant(literal) => Ok(Shape::Array(literal.shape().without_layout())),
        Op::Unary(unary, x) => {
            let x = operand(*x)?.expect_array("unary operand")?;
            if !unary.accepts(x.element_type) {
                return Err(Error::Shape(format!(
                    "{} is not defined for {} elements",
                    unary.name(),
                    x.element_type
                )));
            }
            Ok(Shape::Array(x.without_layout()))
        }
        Op::Binary(binary, lhs, rhs) => {
            let lhs = operand(*lhs)?.expect_array("binary lhs")?;
            let rhs = operand(*rhs)?.expect_array("binary rhs")?;
            if !lhs.compatible(rhs) {
                return Err(Error::Shape(format!("operand shapes differ: {lhs} vs {rhs}")));
            }
            if !binary.accepts(lhs.element_type) {
                return Err(Error::Shape(format!(
                    "{} is not defined for {} elements",
                    binary.name(),
                    lhs.element_type
                )));
            }
            Ok(Shape::Array(lhs.without_layout()))
        }
        Op::Convert(x) => {
            let x = operand(*x)?.expect_array("convert operand")?;
            let target = declared.expect_array("convert result")?;
            Ok(Shape::array(target.element_type, x.dims.clone()))
        }
        Op::Reshape(x) => {
            let x = operand(*x)?.expect_array("reshape operand")?;
            let target = declared.expect_array("reshape result")?;
            if x.element_count() != target.element_count() {
                return Err(Error::Shape(format!(
                    "reshape changes element count: {x} to {target}"
                )));
            }
            Ok(Shape::array(x.element_type, target.dims.clone()))
        }
        Op::Tuple(elements) => elements
            .iter()
            .map(|id| operand(*id).cloned())
            .collect::<Result<Vec<_>>>()
            .map(Shape::Tuple),
        Op::GetTupleElement(x, index) => match operand(*x)? {
            Shape::Tuple(elements) => elements.get(*index).cloned().ok_or_else(|| {
                Error::Shape(format!(
                    "tuple index {index} out of range for {} elements",
                    elements.len()
                ))
            }),
            other => Err(Error::Shape(format!(
                "get-tuple-element on non-tuple {other}"
            ))),
        },
        Op::Outfeed(x) => {
            operand(*x)?;
            Ok(Shape::Tuple(Vec::new()))
        }
    }
}
