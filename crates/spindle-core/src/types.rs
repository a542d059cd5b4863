//! Element types, layouts and shapes.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Element data type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Pred,
    S8,
    S32,
    S64,
    U8,
    U32,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElementType::Pred | ElementType::S8 | ElementType::U8 => 1,
            ElementType::S32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::S64 | ElementType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ElementType::S8 | ElementType::S32 | ElementType::S64 | ElementType::F32 | ElementType::F64
        )
    }

    /// Name used in the textual program and shape form.
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Pred => "pred",
            ElementType::S8 => "s8",
            ElementType::S32 => "s32",
            ElementType::S64 => "s64",
            ElementType::U8 => "u8",
            ElementType::U32 => "u32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pred" => Ok(ElementType::Pred),
            "s8" => Ok(ElementType::S8),
            "s32" => Ok(ElementType::S32),
            "s64" => Ok(ElementType::S64),
            "u8" => Ok(ElementType::U8),
            "u32" => Ok(ElementType::U32),
            "f32" => Ok(ElementType::F32),
            "f64" => Ok(ElementType::F64),
            other => Err(Error::Shape(format!("unknown element type '{other}'"))),
        }
    }
}

/// Physical arrangement of an array's elements.
///
/// `minor_to_major[0]` is the fastest-varying dimension. The canonical
/// (row-major) layout of a rank-`n` array is `[n-1, ..., 1, 0]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    pub minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: Vec<usize>) -> Self {
        Self { minor_to_major }
    }

    /// Canonical row-major layout for the given rank.
    pub fn row_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    /// Column-major layout for the given rank.
    pub fn column_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).collect(),
        }
    }

    pub fn is_row_major(&self) -> bool {
        self.minor_to_major.iter().rev().copied().eq(0..self.minor_to_major.len())
    }

    /// Check that this layout is a permutation of `0..rank`.
    pub fn validate(&self, rank: usize) -> Result<()> {
        if self.minor_to_major.len() != rank {
            return Err(Error::Layout(format!(
                "layout {:?} has {} entries for a rank-{rank} shape",
                self.minor_to_major,
                self.minor_to_major.len()
            )));
        }
        let mut seen = vec![false; rank];
        for &dim in &self.minor_to_major {
            if dim >= rank || seen[dim] {
                return Err(Error::Layout(format!(
                    "layout {:?} is not a permutation of 0..{rank}",
                    self.minor_to_major
                )));
            }
            seen[dim] = true;
        }
        Ok(())
    }

    /// Element strides (in elements, not bytes) for `dims` under this layout.
    pub fn strides(&self, dims: &[usize]) -> Vec<usize> {
        let mut strides = vec![0; dims.len()];
        let mut stride = 1;
        for &dim in &self.minor_to_major {
            strides[dim] = stride;
            stride *= dims[dim];
        }
        strides
    }
}

/// Shape of a dense array: element type, dimensions and an optional layout.
///
/// A missing layout means the canonical row-major layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub element_type: ElementType,
    pub dims: Vec<usize>,
    pub layout: Option<Layout>,
}

impl ArrayShape {
    pub fn new(element_type: ElementType, dims: Vec<usize>) -> Self {
        Self {
            element_type,
            dims,
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.element_count() * self.element_type.size()
    }

    /// Byte size, or a shape error if it doesn't fit in `usize`.
    pub fn checked_size_bytes(&self) -> Result<usize> {
        self.dims
            .iter()
            .try_fold(self.element_type.size(), |size, &dim| size.checked_mul(dim))
            .ok_or_else(|| Error::Shape(format!("shape {self} is too large to address")))
    }

    /// The effective layout (explicit or canonical).
    pub fn layout(&self) -> Layout {
        self.layout
            .clone()
            .unwrap_or_else(|| Layout::row_major(self.rank()))
    }

    /// Same element type and dimensions, canonical layout.
    pub fn without_layout(&self) -> Self {
        Self::new(self.element_type, self.dims.clone())
    }

    /// True when both shapes have the same element type and dimensions.
    pub fn compatible(&self, other: &ArrayShape) -> bool {
        self.element_type == other.element_type && self.dims == other.dims
    }

    /// True when the effective layouts agree.
    pub fn layout_equal(&self, other: &ArrayShape) -> bool {
        self.layout() == other.layout()
    }
}

impl fmt::Display for ArrayShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.element_type)?;
        write_list(f, &self.dims)?;
        f.write_str("]")?;
        if let Some(layout) = &self.layout {
            f.write_str("{")?;
            write_list(f, &layout.minor_to_major)?;
            f.write_str("}")?;
        }
        Ok(())
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[usize]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// An array shape or an ordered tuple of shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
}

impl Shape {
    /// Array shape with the canonical layout.
    pub fn array(element_type: ElementType, dims: Vec<usize>) -> Self {
        Shape::Array(ArrayShape::new(element_type, dims))
    }

    /// Rank-0 array shape.
    pub fn scalar(element_type: ElementType) -> Self {
        Shape::array(element_type, Vec::new())
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    /// True for a tuple that contains at least one tuple element.
    pub fn is_nested_tuple(&self) -> bool {
        match self {
            Shape::Tuple(elements) => elements.iter().any(Shape::is_tuple),
            Shape::Array(_) => false,
        }
    }

    pub fn tuple_element_count(&self) -> usize {
        match self {
            Shape::Tuple(elements) => elements.len(),
            Shape::Array(_) => 0,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Shape::Array(array) => Some(array),
            Shape::Tuple(_) => None,
        }
    }

    /// The array shape, or a shape error naming `what` for tuples.
    pub fn expect_array(&self, what: &str) -> Result<&ArrayShape> {
        self.as_array()
            .ok_or_else(|| Error::Shape(format!("{what} must be an array shape, got {self}")))
    }

    /// Total byte size of all array leaves.
    pub fn size_bytes(&self) -> usize {
        match self {
            Shape::Array(array) => array.size_bytes(),
            Shape::Tuple(elements) => elements.iter().map(Shape::size_bytes).sum(),
        }
    }

    /// Total byte size, or a shape error if it doesn't fit in `usize`.
    pub fn checked_size_bytes(&self) -> Result<usize> {
        match self {
            Shape::Array(array) => array.checked_size_bytes(),
            Shape::Tuple(elements) => elements.iter().try_fold(0usize, |total, element| {
                total.checked_add(element.checked_size_bytes()?).ok_or_else(|| {
                    Error::Shape(format!("shape {self} is too large to address"))
                })
            }),
        }
    }

    /// Copy of this shape with every explicit layout cleared.
    pub fn without_layout(&self) -> Shape {
        match self {
            Shape::Array(array) => Shape::Array(array.without_layout()),
            Shape::Tuple(elements) => {
                Shape::Tuple(elements.iter().map(Shape::without_layout).collect())
            }
        }
    }

    /// Equality ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Array(a), Shape::Array(b)) => a.compatible(b),
            (Shape::Tuple(a), Shape::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(y))
            }
            _ => false,
        }
    }

    /// Validate every explicit layout against its array's rank and check
    /// that the total byte size is addressable.
    pub fn validate(&self) -> Result<()> {
        self.validate_layouts()?;
        self.checked_size_bytes().map(drop)
    }

    fn validate_layouts(&self) -> Result<()> {
        match self {
            Shape::Array(array) => match &array.layout {
                Some(layout) => layout.validate(array.rank()),
                None => Ok(()),
            },
            Shape::Tuple(elements) => elements.iter().try_for_each(Shape::validate_layouts),
        }
    }

    /// Parse the textual form, e.g. `f32[2,3]`, `f32[2,3]{0,1}` or `(f32[4], s32[])`.
    pub fn parse(text: &str) -> Result<Shape> {
        let mut cursor = ShapeCursor {
            text: text.trim(),
            pos: 0,
        };
        let shape = cursor.shape()?;
        cursor.skip_ws();
        if cursor.pos != cursor.text.len() {
            return Err(Error::Shape(format!(
                "trailing characters in shape '{}'",
                cursor.text
            )));
        }
        shape.validate()?;
        Ok(shape)
    }
}

impl From<ArrayShape> for Shape {
    fn from(array: ArrayShape) -> Self {
        Shape::Array(array)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array(array) => write!(f, "{array}"),
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for Shape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Shape::parse(s)
    }
}

struct ShapeCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl ShapeCursor<'_> {
    fn rest(&self) -> &str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(Error::Shape(format!(
                "expected '{c}' at offset {} in shape '{}'",
                self.pos, self.text
            )))
        }
    }

    fn shape(&mut self) -> Result<Shape> {
        if self.eat('(') {
            let mut elements = Vec::new();
            if self.eat(')') {
                return Ok(Shape::Tuple(elements));
            }
            loop {
                elements.push(self.shape()?);
                if self.eat(')') {
                    return Ok(Shape::Tuple(elements));
                }
                self.expect(',')?;
            }
        }

        self.skip_ws();
        let name_len = self
            .rest()
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(self.rest().len());
        let element_type: ElementType = self.rest()[..name_len].parse()?;
        self.pos += name_len;

        self.expect('[')?;
        let dims = self.list(']')?;
        let mut array = ArrayShape::new(element_type, dims);
        if self.eat('{') {
            array.layout = Some(Layout::new(self.list('}')?));
        }
        Ok(Shape::Array(array))
    }

    fn list(&mut self, close: char) -> Result<Vec<usize>> {
        let end = self.rest().find(close).ok_or_else(|| {
            Error::Shape(format!("missing '{close}' in shape '{}'", self.text))
        })?;
        let body = &self.rest()[..end];
        let items = body
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<usize>()
                    .map_err(|_| Error::Shape(format!("invalid dimension '{item}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.pos += end + close.len_utf8();
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::Pred.size(), 1);
        assert_eq!(ElementType::S32.size(), 4);
        assert_eq!(ElementType::F64.size(), 8);
        assert!(ElementType::F32.is_float());
        assert!(!ElementType::U32.is_signed());
    }

    #[test]
    fn test_layout_strides() {
        let dims = [2, 3, 4];
        assert_eq!(Layout::row_major(3).strides(&dims), vec![12, 4, 1]);
        assert_eq!(Layout::column_major(3).strides(&dims), vec![1, 2, 6]);
        assert!(Layout::row_major(3).is_row_major());
        assert!(!Layout::column_major(2).is_row_major());
    }

    #[test]
    fn test_layout_validation() {
        assert!(Layout::new(vec![0, 1]).validate(2).is_ok());
        assert!(Layout::new(vec![0, 0]).validate(2).is_err());
        assert!(Layout::new(vec![0]).validate(2).is_err());
    }

    #[test]
    fn test_shape_parse_and_display() {
        for text in ["f32[4]", "s32[]", "f32[2,3]{0,1}", "(f32[4], (u8[2], pred[]))"] {
            let shape = Shape::parse(text).unwrap();
            assert_eq!(shape.to_string(), text);
        }
        assert!(Shape::parse("f16[4]").is_err());
        assert!(Shape::parse("f32[2,3]{0,0}").is_err());
        assert!(Shape::parse("f32[4] x").is_err());
    }

    #[test]
    fn test_nested_tuple_detection() {
        let flat = Shape::parse("(f32[4], s32[])").unwrap();
        let nested = Shape::parse("(f32[4], (s32[]))").unwrap();
        assert!(flat.is_tuple() && !flat.is_nested_tuple());
        assert!(nested.is_nested_tuple());
        assert_eq!(flat.tuple_element_count(), 2);
        assert_eq!(flat.size_bytes(), 20);
    }

    #[test]
    fn test_oversized_shape_is_rejected() {
        let huge = ArrayShape::new(ElementType::F32, vec![1 << 32, 1 << 32, 1 << 32]);
        assert!(matches!(huge.checked_size_bytes(), Err(Error::Shape(_))));
        assert!(Shape::Array(huge).validate().is_err());
        assert!(Shape::parse("f32[4294967296,4294967296,4294967296]").is_err());

        let max = ArrayShape::new(ElementType::U8, vec![usize::MAX]);
        assert_eq!(max.checked_size_bytes().unwrap(), usize::MAX);
        let pair = Shape::Tuple(vec![Shape::Array(max.clone()), Shape::Array(max)]);
        assert!(pair.validate().is_err());

        let empty = ArrayShape::new(ElementType::F64, vec![0, usize::MAX]);
        assert_eq!(empty.checked_size_bytes().unwrap(), 0);
    }

    #[test]
    fn test_without_layout_keeps_dims() {
        let shape = Shape::parse("f32[2,3]{0,1}").unwrap();
        let cleared = shape.without_layout();
        assert_eq!(cleared.to_string(), "f32[2,3]");
        assert!(shape.compatible(&cleared));
        assert_ne!(shape, cleared);
    }
}
