//! Reference evaluator for programs on host memory.
//!
//! All array values are kept row-major. Arguments are normalized before
//! evaluation starts.

use crate::error::{Result, RuntimeError};
use crate::feed::DeviceFeeds;
use bytemuck::Pod;
use spindle_core::{BinaryOp, ElementType, Literal, Op, Program, Shape, UnaryOp, Value};

/// Bind a host scalar type for `$element_type` to `$t` and evaluate `$body`.
macro_rules! with_scalar_type {
    ($element_type:expr, $t:ident => $body:expr) => {
        match $element_type {
            ElementType::Pred | ElementType::U8 => {
                type $t = u8;
                $body
            }
            ElementType::S8 => {
                type $t = i8;
                $body
            }
            ElementType::S32 => {
                type $t = i32;
                $body
            }
            ElementType::S64 => {
                type $t = i64;
                $body
            }
            ElementType::U32 => {
                type $t = u32;
                $body
            }
            ElementType::F32 => {
                type $t = f32;
                $body
            }
            ElementType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Element arithmetic with XLA-style integer semantics: wrapping overflow,
/// division by zero yields all ones.
trait Scalar: Pod + PartialOrd {
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
    fn neg(self) -> Self;
    fn abs(self) -> Self;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn to_i128(self) -> i128;
    fn from_i128(value: i128) -> Self;

    fn exp(self) -> Self {
        Self::from_f64(self.to_f64().exp())
    }
    fn ln(self) -> Self {
        Self::from_f64(self.to_f64().ln())
    }
    fn sqrt(self) -> Self {
        Self::from_f64(self.to_f64().sqrt())
    }
    fn tanh(self) -> Self {
        Self::from_f64(self.to_f64().tanh())
    }
}

macro_rules! int_scalar {
    ($t:ty, |$x:ident| $abs:expr) => {
        impl Scalar for $t {
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn div(self, rhs: Self) -> Self {
                if rhs == 0 { !0 } else { self.wrapping_div(rhs) }
            }
            fn neg(self) -> Self {
                self.wrapping_neg()
            }
            fn abs(self) -> Self {
                let $x = self;
                $abs
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(value: f64) -> Self {
                value as $t
            }
            fn to_i128(self) -> i128 {
                self as i128
            }
            fn from_i128(value: i128) -> Self {
                value as $t
            }
        }
    };
}

int_scalar!(i8, |x| x.wrapping_abs());
int_scalar!(i32, |x| x.wrapping_abs());
int_scalar!(i64, |x| x.wrapping_abs());
int_scalar!(u8, |x| x);
int_scalar!(u32, |x| x);

macro_rules! float_scalar {
    ($t:ty) => {
        impl Scalar for $t {
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn div(self, rhs: Self) -> Self {
                self / rhs
            }
            fn neg(self) -> Self {
                -self
            }
            fn abs(self) -> Self {
                <$t>::abs(self)
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(value: f64) -> Self {
                value as $t
            }
            fn to_i128(self) -> i128 {
                self as i128
            }
            fn from_i128(value: i128) -> Self {
                value as $t
            }
            fn exp(self) -> Self {
                <$t>::exp(self)
            }
            fn ln(self) -> Self {
                <$t>::ln(self)
            }
            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }
            fn tanh(self) -> Self {
                <$t>::tanh(self)
            }
        }
    };
}

float_scalar!(f32);
float_scalar!(f64);

fn apply_unary<T: Scalar>(op: UnaryOp, x: T) -> T {
    match op {
        UnaryOp::Neg => x.neg(),
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Tanh => x.tanh(),
    }
}

fn apply_binary<T: Scalar>(op: BinaryOp, a: T, b: T) -> T {
    match op {
        BinaryOp::Add => a.add(b),
        BinaryOp::Sub => a.sub(b),
        BinaryOp::Mul => a.mul(b),
        BinaryOp::Div => a.div(b),
        // NaN propagates from either side.
        BinaryOp::Max => {
            if a.partial_cmp(&a).is_none() || a >= b { a } else { b }
        }
        BinaryOp::Min => {
            if a.partial_cmp(&a).is_none() || a <= b { a } else { b }
        }
    }
}

fn unary(op: UnaryOp, x: &Literal) -> Result<Literal> {
    let data = with_scalar_type!(x.element_type(), T => {
        let values: Vec<T> = x.to_vec::<T>()?.into_iter().map(|v| apply_unary(op, v)).collect();
        bytemuck::cast_slice::<T, u8>(&values).to_vec()
    });
    Ok(Literal::from_bytes(x.shape().without_layout(), data)?)
}

fn binary(op: BinaryOp, lhs: &Literal, rhs: &Literal) -> Result<Literal> {
    let data = with_scalar_type!(lhs.element_type(), T => {
        let a = lhs.to_vec::<T>()?;
        let b = rhs.to_vec::<T>()?;
        let values: Vec<T> = a.into_iter().zip(b).map(|(a, b)| apply_binary(op, a, b)).collect();
        bytemuck::cast_slice::<T, u8>(&values).to_vec()
    });
    Ok(Literal::from_bytes(lhs.shape().without_layout(), data)?)
}

/// Numeric conversion. Float sources or targets go through `f64`
/// (saturating, NaN to zero); integer-to-integer conversions wrap.
/// Converting to `pred` yields 1 for any nonzero input.
fn convert(x: &Literal, target: ElementType) -> Result<Literal> {
    let source = x.element_type();
    let via_float = source.is_float() || target.is_float();
    let data = with_scalar_type!(source, S => {
        let values = x.to_vec::<S>()?;
        with_scalar_type!(target, D => {
            let converted: Vec<D> = values
                .iter()
                .map(|&v| {
                    if target == ElementType::Pred {
                        D::from_i128(i128::from(v.to_f64() != 0.0))
                    } else if via_float {
                        D::from_f64(v.to_f64())
                    } else {
                        D::from_i128(v.to_i128())
                    }
                })
                .collect();
            bytemuck::cast_slice::<D, u8>(&converted).to_vec()
        })
    });
    Ok(Literal::from_bytes(
        spindle_core::ArrayShape::new(target, x.dims().to_vec()),
        data,
    )?)
}

fn array<'a>(values: &'a [Option<Value>], id: spindle_core::ValueId) -> Result<&'a Literal> {
    value(values, id)?
        .as_literal()
        .map_err(|e| RuntimeError::ExecutionError(format!("{id}: {e}")))
}

fn value<'a>(values: &'a [Option<Value>], id: spindle_core::ValueId) -> Result<&'a Value> {
    values
        .get(id.0)
        .and_then(Option::as_ref)
        .ok_or_else(|| RuntimeError::ExecutionError(format!("{id} used before it was computed")))
}

/// Reorder a value's arrays into row-major layout.
fn normalize(value: Value) -> Result<Value> {
    match value {
        Value::Array(literal) if literal.is_row_major() && literal.shape().layout.is_none() => {
            Ok(Value::Array(literal))
        }
        Value::Array(literal) => Ok(Value::Array(literal.to_row_major()?)),
        Value::Tuple(elements) => elements
            .into_iter()
            .map(normalize)
            .collect::<Result<Vec<_>>>()
            .map(Value::Tuple),
    }
}

/// Evaluate `program` on `arguments`, using `feeds` for infeed/outfeed.
///
/// Infeed blocks the calling thread until a value is available.
pub(crate) fn evaluate(program: &Program, arguments: Vec<Literal>, feeds: &DeviceFeeds) -> Result<Value> {
    let mut arguments: Vec<Option<Literal>> = arguments.into_iter().map(Some).collect();
    let mut values: Vec<Option<Value>> = Vec::with_capacity(program.instructions.len());

    for inst in &program.instructions {
        let result = match &inst.op {
            Op::Parameter(n) => {
                let literal = arguments
                    .get_mut(*n)
                    .and_then(Option::take)
                    .ok_or_else(|| RuntimeError::ExecutionError(format!("missing argument {n}")))?;
                Value::Array(literal.to_row_major()?)
            }
            Op::Constant(literal) => Value::Array(literal.clone()),
            Op::Unary(op, x) => Value::Array(unary(*op, array(&values, *x)?)?),
            Op::Binary(op, lhs, rhs) => {
                Value::Array(binary(*op, array(&values, *lhs)?, array(&values, *rhs)?)?)
            }
            Op::Convert(x) => {
                let target = inst.shape.expect_array("convert")?.element_type;
                Value::Array(convert(array(&values, *x)?, target)?)
            }
            Op::Reshape(x) => {
                let dims = &inst.shape.expect_array("reshape")?.dims;
                Value::Array(array(&values, *x)?.reshape(dims)?)
            }
            Op::Tuple(elements) => Value::Tuple(
                elements
                    .iter()
                    .map(|id| value(&values, *id).cloned())
                    .collect::<Result<Vec<_>>>()?,
            ),
            Op::GetTupleElement(x, index) => match value(&values, *x)? {
                Value::Tuple(elements) => elements.get(*index).cloned().ok_or_else(|| {
                    RuntimeError::ExecutionError(format!("{x} has no element {index}"))
                })?,
                Value::Array(_) => {
                    return Err(RuntimeError::ExecutionError(format!(
                        "get-tuple-element on array {x}"
                    )));
                }
            },
            Op::Infeed => {
                let fed = normalize(feeds.infeed.pop()?)?;
                if !fed.shape().compatible(&inst.shape) {
                    return Err(RuntimeError::ExecutionError(format!(
                        "infeed expected {}, got {}",
                        inst.shape,
                        fed.shape()
                    )));
                }
                fed
            }
            Op::Outfeed(x) => {
                feeds.outfeed.push(value(&values, *x)?.clone())?;
                Value::Tuple(Vec::new())
            }
        };
        values.push(Some(result));
    }

    values
        .get_mut(program.root.0)
        .and_then(Option::take)
        .ok_or_else(|| RuntimeError::ExecutionError(format!("root {} was not computed", program.root)))
}

/// Flatten an evaluated result into output literals.
pub(crate) fn untuple(result: Value, untuple_result: bool) -> Result<Vec<Literal>> {
    match result {
        Value::Array(literal) => Ok(vec![literal]),
        Value::Tuple(elements) if untuple_result => elements
            .into_iter()
            .map(|element| element.into_literal().map_err(RuntimeError::from))
            .collect(),
        Value::Tuple(_) => Err(RuntimeError::ExecutionError(
            "tuple result requires untuple_result".to_string(),
        )),
    }
}

/// Parameter shapes in canonical layout, in parameter order.
pub(crate) fn parameter_arrays(program: &Program) -> Result<Vec<spindle_core::ArrayShape>> {
    program
        .parameter_shapes()
        .into_iter()
        .map(|shape| match shape {
            Shape::Array(array) => Ok(array.without_layout()),
            Shape::Tuple(_) => Err(RuntimeError::CompileError(format!(
                "tuple parameter {shape} is not supported"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ArrayShape, Layout, ProgramBuilder};

    fn f32s(dims: &[usize], values: &[f32]) -> Literal {
        Literal::from_slice(ElementType::F32, dims, values).unwrap()
    }

    fn run(program: &Program, arguments: Vec<Literal>) -> Value {
        evaluate(program, arguments, &DeviceFeeds::default()).unwrap()
    }

    #[test]
    fn test_add() {
        let shape = Shape::array(ElementType::F32, vec![4]);
        let mut builder = ProgramBuilder::new("add");
        let a = builder.parameter(shape.clone());
        let b = builder.parameter(shape);
        let sum = builder.add(a, b).unwrap();
        let program = builder.build(sum).unwrap();

        let result = run(
            &program,
            vec![f32s(&[4], &[1.0, 2.0, 3.0, 4.0]), f32s(&[4], &[5.0, 6.0, 7.0, 8.0])],
        );
        assert_eq!(
            result.into_literal().unwrap().to_vec::<f32>().unwrap(),
            vec![6.0, 8.0, 10.0, 12.0]
        );
    }

    #[test]
    fn test_integer_division_by_zero() {
        let shape = Shape::array(ElementType::S32, vec![3]);
        let mut builder = ProgramBuilder::new("div");
        let a = builder.parameter(shape.clone());
        let b = builder.parameter(shape);
        let q = builder.div(a, b).unwrap();
        let program = builder.build(q).unwrap();

        let lhs = Literal::from_slice(ElementType::S32, &[3], &[7i32, i32::MIN, 5]).unwrap();
        let rhs = Literal::from_slice(ElementType::S32, &[3], &[2i32, -1, 0]).unwrap();
        let result = run(&program, vec![lhs, rhs]).into_literal().unwrap();
        assert_eq!(result.to_vec::<i32>().unwrap(), vec![3, i32::MIN, -1]);
    }

    #[test]
    fn test_unary_and_max_nan() {
        assert_eq!(apply_unary(UnaryOp::Abs, -3i8), 3);
        assert_eq!(apply_unary(UnaryOp::Neg, 2.5f64), -2.5);
        assert!((apply_unary(UnaryOp::Tanh, 0.5f32) - 0.5f32.tanh()).abs() < 1e-7);
        assert!(apply_binary(BinaryOp::Max, f32::NAN, 1.0).is_nan());
        assert!(apply_binary(BinaryOp::Min, 1.0, f32::NAN).is_nan());
        assert_eq!(apply_binary(BinaryOp::Max, 3u8, 9), 9);
    }

    #[test]
    fn test_convert() {
        let x = f32s(&[4], &[1.7, -2.5, f32::NAN, 3e10]);
        let ints = convert(&x, ElementType::S32).unwrap();
        assert_eq!(ints.to_vec::<i32>().unwrap(), vec![1, -2, 0, i32::MAX]);

        let preds = convert(&x, ElementType::Pred).unwrap();
        assert_eq!(preds.to_vec::<u8>().unwrap(), vec![1, 1, 1, 1]);

        let wide = Literal::from_slice(ElementType::S64, &[2], &[300i64, -1]).unwrap();
        let narrow = convert(&wide, ElementType::U8).unwrap();
        assert_eq!(narrow.to_vec::<u8>().unwrap(), vec![44, 255]);
    }

    #[test]
    fn test_column_major_argument_is_normalized() {
        let shape = Shape::array(ElementType::F32, vec![2, 2]);
        let mut builder = ProgramBuilder::new("neg");
        let x = builder.parameter(shape);
        let y = builder.unary(UnaryOp::Neg, x).unwrap();
        let program = builder.build(y).unwrap();

        // Logical [[1, 2], [3, 4]] stored column-major.
        let column_major = Literal::from_bytes(
            ArrayShape::new(ElementType::F32, vec![2, 2]).with_layout(Layout::column_major(2)),
            bytemuck::cast_slice(&[1.0f32, 3.0, 2.0, 4.0]).to_vec(),
        )
        .unwrap();
        let result = run(&program, vec![column_major]).into_literal().unwrap();
        assert_eq!(result.to_vec::<f32>().unwrap(), vec![-1.0, -2.0, -3.0, -4.0]);
    }

    #[test]
    fn test_feeds_and_tuples() {
        let vec3 = Shape::array(ElementType::F32, vec![3]);
        let mut builder = ProgramBuilder::new("echo");
        let x = builder.infeed(vec3);
        let doubled = builder.add(x, x).unwrap();
        builder.outfeed(doubled).unwrap();
        let root = builder.tuple(vec![x, doubled]).unwrap();
        let program = builder.build(root).unwrap();

        let feeds = DeviceFeeds::default();
        feeds.infeed.push(f32s(&[3], &[1.0, 2.0, 3.0]).into()).unwrap();
        let result = evaluate(&program, Vec::new(), &feeds).unwrap();

        let outputs = untuple(result, true).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].to_vec::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
        let sent = feeds.outfeed.pop().unwrap().into_literal().unwrap();
        assert_eq!(sent, outputs[1]);
    }
}
