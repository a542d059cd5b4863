//! Host-resident array values.
//!
//! A [`Literal`] owns the raw bytes of one array laid out according to its
//! shape's layout. Backends exchange literals with the runtime when data
//! crosses the host/device boundary; [`Literal::relayout`] reconciles a
//! device layout with the canonical host layout.

use crate::types::{ArrayShape, ElementType, Layout, Shape};
use crate::{Error, Result};
use bytemuck::Pod;

macro_rules! for_each_element_type {
    ($element_type:expr, $mac:ident, $($arg:expr),*) => {
        match $element_type {
            ElementType::Pred => $mac!(u8, $($arg),*),
            ElementType::S8 => $mac!(i8, $($arg),*),
            ElementType::S32 => $mac!(i32, $($arg),*),
            ElementType::S64 => $mac!(i64, $($arg),*),
            ElementType::U8 => $mac!(u8, $($arg),*),
            ElementType::U32 => $mac!(u32, $($arg),*),
            ElementType::F32 => $mac!(f32, $($arg),*),
            ElementType::F64 => $mac!(f64, $($arg),*),
        }
    };
}

/// A dense array value in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    shape: ArrayShape,
    data: Vec<u8>,
}

impl Literal {
    /// Wrap raw bytes laid out per `shape`.
    ///
    /// # Errors
    /// Returns an error if the byte length doesn't match the shape or the
    /// shape's layout is invalid.
    pub fn from_bytes(shape: ArrayShape, data: Vec<u8>) -> Result<Self> {
        if let Some(layout) = &shape.layout {
            layout.validate(shape.rank())?;
        }
        let expected = shape.checked_size_bytes()?;
        if data.len() != expected {
            return Err(Error::Literal(format!(
                "{} bytes supplied for shape {shape} ({expected} expected)",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled literal.
    pub fn zeros(shape: ArrayShape) -> Self {
        let data = vec![0; shape.size_bytes()];
        Self { shape, data }
    }

    /// Build a row-major literal from typed elements.
    ///
    /// # Example
    /// ```
    /// # use spindle_core::{ElementType, Literal};
    /// let literal = Literal::from_slice(ElementType::F32, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(literal.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    /// ```
    pub fn from_slice<T: Pod>(element_type: ElementType, dims: &[usize], values: &[T]) -> Result<Self> {
        if std::mem::size_of::<T>() != element_type.size() {
            return Err(Error::Literal(format!(
                "host element size {} doesn't match {element_type}",
                std::mem::size_of::<T>()
            )));
        }
        Self::from_bytes(
            ArrayShape::new(element_type, dims.to_vec()),
            bytemuck::cast_slice(values).to_vec(),
        )
    }

    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.shape.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Decode the elements in storage order.
    ///
    /// # Errors
    /// Returns an error if `T` has a different size than the element type.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        if std::mem::size_of::<T>() != self.shape.element_type.size() {
            return Err(Error::Literal(format!(
                "cannot read {} elements as a {}-byte host type",
                self.shape.element_type,
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Elements in storage order, formatted as text.
    pub fn format_elements(&self) -> Vec<String> {
        macro_rules! format_as {
            ($t:ty, $literal:expr) => {
                $literal
                    .to_vec::<$t>()
                    .map(|values| values.iter().map(|v| format!("{v:?}")).collect())
                    .unwrap_or_default()
            };
        }
        for_each_element_type!(self.shape.element_type, format_as, self)
    }

    /// Parse row-major elements from text, one entry per element.
    ///
    /// # Example
    /// ```
    /// # use spindle_core::{ArrayShape, ElementType, Literal};
    /// let shape = ArrayShape::new(ElementType::S32, vec![3]);
    /// let literal = Literal::parse_elements(&shape, &["1", "-2", "3"]).unwrap();
    /// assert_eq!(literal.to_vec::<i32>().unwrap(), vec![1, -2, 3]);
    /// ```
    pub fn parse_elements(shape: &ArrayShape, items: &[&str]) -> Result<Literal> {
        shape.checked_size_bytes()?;
        if items.len() != shape.element_count() {
            return Err(Error::Literal(format!(
                "shape {shape} needs {} elements, got {}",
                shape.element_count(),
                items.len()
            )));
        }
        macro_rules! parse_as {
            ($t:ty, $items:expr) => {{
                let values = $items
                    .iter()
                    .map(|item| {
                        item.trim().parse::<$t>().map_err(|_| {
                            Error::Literal(format!("invalid {} element '{item}'", shape.element_type))
                        })
                    })
                    .collect::<Result<Vec<$t>>>()?;
                bytemuck::cast_slice::<$t, u8>(&values).to_vec()
            }};
        }
        let data = for_each_element_type!(shape.element_type, parse_as, items);
        Literal::from_bytes(shape.without_layout(), data)
    }

    /// Reinterpret the same bytes with new dimensions (row-major only).
    pub fn reshape(&self, dims: &[usize]) -> Result<Literal> {
        let target = ArrayShape::new(self.shape.element_type, dims.to_vec());
        if target.element_count() != self.shape.element_count() {
            return Err(Error::Shape(format!(
                "cannot reshape {} into {target}",
                self.shape
            )));
        }
        let source = self.to_row_major()?;
        Ok(Literal {
            shape: target,
            data: source.data,
        })
    }

    /// True if the bytes are already in canonical row-major order.
    pub fn is_row_major(&self) -> bool {
        self.shape.layout().is_row_major()
    }

    /// Normalize to the canonical row-major layout, copying only if needed.
    pub fn to_row_major(&self) -> Result<Literal> {
        if self.is_row_major() {
            return Ok(Literal {
                shape: self.shape.without_layout(),
                data: self.data.clone(),
            });
        }
        self.relayout(&Layout::row_major(self.shape.rank()))
    }

    /// Copy the elements into `target` layout.
    ///
    /// Logical element `(i0, .., in)` keeps its value; only its byte offset
    /// changes.
    ///
    /// # Errors
    /// Returns an error if `target` is not a valid layout for this rank.
    pub fn relayout(&self, target: &Layout) -> Result<Literal> {
        let rank = self.shape.rank();
        target.validate(rank)?;

        let dims = &self.shape.dims;
        let element_size = self.shape.element_type.size();
        let source_strides = self.shape.layout().strides(dims);
        let target_strides = target.strides(dims);

        let mut data = vec![0u8; self.data.len()];
        let mut index = vec![0usize; rank];
        for _ in 0..self.shape.element_count() {
            let src: usize = index.iter().zip(&source_strides).map(|(i, s)| i * s).sum();
            let dst: usize = index.iter().zip(&target_strides).map(|(i, s)| i * s).sum();
            data[dst * element_size..(dst + 1) * element_size]
                .copy_from_slice(&self.data[src * element_size..(src + 1) * element_size]);

            // Advance the logical index in row-major order
            for axis in (0..rank).rev() {
                index[axis] += 1;
                if index[axis] < dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }

        let shape = if target.is_row_major() {
            self.shape.without_layout()
        } else {
            self.shape.without_layout().with_layout(target.clone())
        };
        Ok(Literal { shape, data })
    }
}

/// A host value: an array literal or a tuple of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(Literal),
    Tuple(Vec<Value>),
}

impl Value {
    /// The shape of this value, layouts included.
    pub fn shape(&self) -> Shape {
        match self {
            Value::Array(literal) => Shape::Array(literal.shape().clone()),
            Value::Tuple(elements) => Shape::Tuple(elements.iter().map(Value::shape).collect()),
        }
    }

    pub fn as_literal(&self) -> Result<&Literal> {
        match self {
            Value::Array(literal) => Ok(literal),
            Value::Tuple(_) => Err(Error::Literal(format!(
                "expected an array value, got tuple {}",
                self.shape()
            ))),
        }
    }

    pub fn into_literal(self) -> Result<Literal> {
        match self {
            Value::Array(literal) => Ok(literal),
            Value::Tuple(_) => Err(Error::Literal(format!(
                "expected an array value, got tuple {}",
                self.shape()
            ))),
        }
    }

    /// Build a value of `shape` from one chunk per array leaf, in order.
    ///
    /// # Errors
    /// Returns an error if the chunk count or any chunk size disagrees with
    /// the shape.
    pub fn from_chunks(shape: &Shape, chunks: &[&[u8]]) -> Result<Value> {
        let mut remaining = chunks.iter();
        let value = Self::take_chunks(shape, &mut remaining)?;
        if remaining.next().is_some() {
            return Err(Error::Literal(format!(
                "{} chunks supplied for shape {shape}",
                chunks.len()
            )));
        }
        Ok(value)
    }

    fn take_chunks(shape: &Shape, chunks: &mut std::slice::Iter<'_, &[u8]>) -> Result<Value> {
        match shape {
            Shape::Array(array) => {
                let chunk = chunks.next().ok_or_else(|| {
                    Error::Literal(format!("missing data chunk for {array}"))
                })?;
                Ok(Value::Array(Literal::from_bytes(array.clone(), chunk.to_vec())?))
            }
            Shape::Tuple(elements) => elements
                .iter()
                .map(|element| Self::take_chunks(element, chunks))
                .collect::<Result<Vec<_>>>()
                .map(Value::Tuple),
        }
    }
}

impl From<Literal> for Value {
    fn from(literal: Literal) -> Self {
        Value::Array(literal)
    }
}
