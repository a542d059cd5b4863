//! Textual program form.
//!
//! ```text
//! program add
//! %0 = parameter(0) f32[4]
//! %1 = parameter(1) f32[4]
//! %2 = add(%0, %1) f32[4]
//! root %2
//! ```
//!
//! Blank lines and `#` comments are ignored. Constants list their elements
//! in row-major order: `%3 = constant(1, 2, 3) s32[3]`.

use super::{BinaryOp, Instruction, Op, Program, UnaryOp, ValueId};
use crate::literal::Literal;
use crate::types::Shape;
use crate::{Error, Result};
use std::fmt;

/// Maximum accepted program text size in bytes (16 MB).
pub const MAX_PROGRAM_SIZE: usize = 16 * 1024 * 1024;

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {}", self.name)?;
        for inst in &self.instructions {
            write!(f, "{} = {}(", inst.id, inst.op.name())?;
            match &inst.op {
                Op::Parameter(n) => write!(f, "{n}")?,
                Op::Constant(literal) => f.write_str(&literal.format_elements().join(", "))?,
                Op::GetTupleElement(x, index) => write!(f, "{x}, {index}")?,
                op => {
                    let operands: Vec<String> =
                        op.operands().iter().map(ValueId::to_string).collect();
                    f.write_str(&operands.join(", "))?;
                }
            }
            writeln!(f, ") {}", inst.shape)?;
        }
        writeln!(f, "root {}", self.root)
    }
}

impl Program {
    /// Parse and validate a program from its textual form.
    ///
    /// # Errors
    /// Returns [`Error::Parse`] with the offending line number, or
    /// [`Error::InvalidProgram`] if the parsed program fails validation.
    pub fn parse(input: &str) -> Result<Program> {
        if input.len() > MAX_PROGRAM_SIZE {
            return Err(Error::Parse {
                line: 0,
                message: format!(
                    "input too large: {} bytes (max {MAX_PROGRAM_SIZE} bytes)",
                    input.len()
                ),
            });
        }

        let mut name = None;
        let mut root = None;
        let mut instructions = Vec::new();

        for (index, raw) in input.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let error = |message: String| Error::Parse {
                line: line_no,
                message,
            };

            if let Some(rest) = line.strip_prefix("program ") {
                if name.is_some() {
                    return Err(error("duplicate program header".to_string()));
                }
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("root ") {
                root = Some(parse_value_id(rest.trim()).map_err(error)?);
            } else if name.is_none() {
                return Err(error("missing 'program <name>' header".to_string()));
            } else {
                instructions.push(parse_instruction(line).map_err(error)?);
            }
        }

        let program = Program {
            name: name.ok_or_else(|| Error::Parse {
                line: 0,
                message: "empty input".to_string(),
            })?,
            instructions,
            root: root.ok_or_else(|| Error::Parse {
                line: 0,
                message: "missing 'root %N' line".to_string(),
            })?,
        };
        program.validate()?;
        tracing::debug!(
            program = %program.name,
            instructions = program.instructions.len(),
            "parsed program"
        );
        Ok(program)
    }
}

fn parse_value_id(text: &str) -> std::result::Result<ValueId, String> {
    text.strip_prefix('%')
        .and_then(|n| n.parse().ok())
        .map(ValueId)
        .ok_or_else(|| format!("invalid value id '{text}'"))
}

fn parse_instruction(line: &str) -> std::result::Result<Instruction, String> {
    let (lhs, rhs) = line
        .split_once('=')
        .ok_or_else(|| format!("expected '%N = op(...) shape', got '{line}'"))?;
    let id = parse_value_id(lhs.trim())?;

    let rhs = rhs.trim();
    let open = rhs.find('(').ok_or_else(|| format!("missing '(' in '{rhs}'"))?;
    let close = rhs[open..]
        .find(')')
        .map(|offset| open + offset)
        .ok_or_else(|| format!("missing ')' in '{rhs}'"))?;
    let op_name = rhs[..open].trim();
    let args: Vec<&str> = rhs[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .collect();
    let shape = Shape::parse(&rhs[close + 1..]).map_err(|e| e.to_string())?;

    let ids = |expected: usize| -> std::result::Result<Vec<ValueId>, String> {
        if args.len() != expected {
            return Err(format!(
                "{op_name} takes {expected} operands, got {}",
                args.len()
            ));
        }
        args.iter().map(|arg| parse_value_id(arg)).collect()
    };

    let op = match op_name {
        "parameter" => {
            let n = args
                .first()
                .filter(|_| args.len() == 1)
                .and_then(|arg| arg.parse().ok())
                .ok_or_else(|| "parameter takes one index".to_string())?;
            Op::Parameter(n)
        }
        "constant" => {
            let array = shape.expect_array("constant").map_err(|e| e.to_string())?;
            Op::Constant(Literal::parse_elements(array, &args).map_err(|e| e.to_string())?)
        }
        "convert" => Op::Convert(ids(1)?[0]),
        "reshape" => Op::Reshape(ids(1)?[0]),
        "tuple" => Op::Tuple(
            args.iter()
                .map(|arg| parse_value_id(arg))
                .collect::<std::result::Result<_, _>>()?,
        ),
        "get-tuple-element" => {
            if args.len() != 2 {
                return Err("get-tuple-element takes a value and an index".to_string());
            }
            let index = args[1]
                .parse()
                .map_err(|_| format!("invalid tuple index '{}'", args[1]))?;
            Op::GetTupleElement(parse_value_id(args[0])?, index)
        }
        "infeed" => {
            ids(0)?;
            Op::Infeed
        }
        "outfeed" => Op::Outfeed(ids(1)?[0]),
        other => {
            if let Some(unary) = UnaryOp::ALL.iter().find(|op| op.name() == other) {
                Op::Unary(*unary, ids(1)?[0])
            } else if let Some(binary) = BinaryOp::ALL.iter().find(|op| op.name() == other) {
                let operands = ids(2)?;
                Op::Binary(*binary, operands[0], operands[1])
            } else {
                return Err(format!("unknown operation '{other}'"));
            }
        }
    };

    Ok(Instruction { id, shape, op })
}
