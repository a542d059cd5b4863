//! Parsing of `--arg` values and formatting of results.

use anyhow::{Context, Result, bail};
use spindle_core::{ArrayShape, Literal, Shape};

/// One host argument given on the command line as `SHAPE=V1,V2,...`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArgument {
    pub shape: Shape,
    pub data: Vec<u8>,
}

impl HostArgument {
    /// Parse `f32[2,2]=1,2,3,4`.
    ///
    /// Values are always listed in row-major order; a shape with an explicit
    /// layout gets its bytes rewritten to that layout.
    pub fn parse(text: &str) -> Result<Self> {
        let (shape_text, values) = text
            .split_once('=')
            .with_context(|| format!("expected SHAPE=VALUES, got '{text}'"))?;
        let shape = Shape::parse(shape_text)
            .with_context(|| format!("invalid argument shape '{shape_text}'"))?;
        let Some(array) = shape.as_array() else {
            bail!("tuple arguments are not supported: '{shape_text}'");
        };

        let items: Vec<&str> = values
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .collect();
        let literal = Literal::parse_elements(array, &items)
            .with_context(|| format!("invalid values for {shape}"))?;
        let literal = if array.layout.is_some() {
            literal.relayout(&array.layout())?
        } else {
            literal
        };

        Ok(Self {
            shape,
            data: literal.into_data(),
        })
    }
}

/// Render row-major bytes of `shape` as `f32[4] [1.0, 2.0, ...]`.
pub fn format_value(shape: &ArrayShape, data: Vec<u8>) -> Result<String> {
    let literal = Literal::from_bytes(shape.without_layout(), data)?;
    Ok(format!("{shape} [{}]", literal.format_elements().join(", ")))
}

/// Array shapes of the values a run returns, in order.
pub fn result_arrays(result: &Shape) -> Result<Vec<ArrayShape>> {
    match result {
        Shape::Array(array) => Ok(vec![array.clone()]),
        Shape::Tuple(elements) => elements
            .iter()
            .map(|element| Ok(element.expect_array("result element")?.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ElementType, Layout};

    #[test]
    fn test_parse_vector_argument() {
        let arg = HostArgument::parse("f32[4]=1,2,3,4").unwrap();
        assert_eq!(arg.shape, Shape::array(ElementType::F32, vec![4]));
        let values: &[f32] = bytemuck::cast_slice(&arg.data);
        assert_eq!(values, &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_parse_scalar_and_layout() {
        let scalar = HostArgument::parse("s32[]=-7").unwrap();
        assert_eq!(scalar.data, (-7i32).to_le_bytes().to_vec());

        let arg = HostArgument::parse("u8[2,2]{0,1}=1,2,3,4").unwrap();
        assert_eq!(
            arg.shape.as_array().unwrap().layout(),
            Layout::column_major(2)
        );
        assert_eq!(arg.data, vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(HostArgument::parse("f32[4]").is_err());
        assert!(HostArgument::parse("f32[3]=1,2").is_err());
        assert!(HostArgument::parse("s32[1]=x").is_err());
        assert!(HostArgument::parse("(f32[1])=1").is_err());
    }

    #[test]
    fn test_format_value() {
        let shape = ArrayShape::new(ElementType::S32, vec![2]);
        let data = bytemuck::cast_slice(&[3i32, -1]).to_vec();
        assert_eq!(format_value(&shape, data).unwrap(), "s32[2] [3, -1]");
    }
}
