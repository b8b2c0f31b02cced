//! One-sided operation requests and their validation

use serde::{Deserialize, Serialize};

use crate::{
    error::{FamError, Result},
    memory::AccessType,
};

/// Read-modify-write operator of the bitwise family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitwiseOp {
    Or,
    And,
    Xor,
}

/// Operand of a bitwise operation; the variant fixes the access width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicValue {
    U32(u32),
    U64(u64),
}

impl AtomicValue {
    /// Width in bytes
    pub fn width(&self) -> u64 {
        match self {
            AtomicValue::U32(_) => 4,
            AtomicValue::U64(_) => 8,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match *self {
            AtomicValue::U32(v) => v as u64,
            AtomicValue::U64(v) => v,
        }
    }

    /// Decode a value of the same width as `self` from little-endian bytes
    pub(crate) fn read_same_width(&self, bytes: &[u8]) -> AtomicValue {
        match self {
            AtomicValue::U32(_) => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[..4]);
                AtomicValue::U32(u32::from_le_bytes(raw))
            }
            AtomicValue::U64(_) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                AtomicValue::U64(u64::from_le_bytes(raw))
            }
        }
    }

    pub(crate) fn write_le(&self, bytes: &mut [u8]) {
        match *self {
            AtomicValue::U32(v) => bytes[..4].copy_from_slice(&v.to_le_bytes()),
            AtomicValue::U64(v) => bytes[..8].copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// `self op operand`, keeping the width of `self`
    pub fn combine(&self, op: BitwiseOp, operand: AtomicValue) -> AtomicValue {
        let rhs = operand.as_u64();
        match *self {
            AtomicValue::U32(v) => {
                let rhs = rhs as u32;
                AtomicValue::U32(match op {
                    BitwiseOp::Or => v | rhs,
                    BitwiseOp::And => v & rhs,
                    BitwiseOp::Xor => v ^ rhs,
                })
            }
            AtomicValue::U64(v) => AtomicValue::U64(match op {
                BitwiseOp::Or => v | rhs,
                BitwiseOp::And => v & rhs,
                BitwiseOp::Xor => v ^ rhs,
            }),
        }
    }
}

impl From<u32> for AtomicValue {
    fn from(value: u32) -> Self {
        AtomicValue::U32(value)
    }
}

impl From<u64> for AtomicValue {
    fn from(value: u64) -> Self {
        AtomicValue::U64(value)
    }
}

/// Fixed-stride element layout; offsets are in bytes from the request base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StridedLayout {
    pub n_elements: u64,
    pub first_element: u64,
    pub stride: u64,
    pub element_size: u64,
}

impl StridedLayout {
    pub fn new(n_elements: u64, first_element: u64, stride: u64, element_size: u64) -> Self {
        Self {
            n_elements,
            first_element,
            stride,
            element_size,
        }
    }

    /// Bytes from the base to the end of the last element
    pub fn span(&self) -> Result<u64> {
        self.n_elements
            .checked_sub(1)
            .and_then(|last| last.checked_mul(self.stride))
            .and_then(|v| v.checked_add(self.first_element))
            .and_then(|v| v.checked_add(self.element_size))
            .ok_or_else(|| FamError::invalid_range("strided layout overflows"))
    }

    pub fn validate(&self, extent: u64) -> Result<()> {
        if self.n_elements == 0 || self.element_size == 0 {
            return Err(FamError::invalid_parameter(
                "layout",
                "element count and element size must be greater than 0",
            ));
        }
        if self.n_elements > 1 && self.stride < self.element_size {
            return Err(FamError::invalid_range(format!(
                "stride {} is smaller than element size {}",
                self.stride, self.element_size
            )));
        }
        let span = self.span()?;
        if span > extent {
            return Err(FamError::invalid_range(format!(
                "strided access ends at {} past extent {}",
                span, extent
            )));
        }
        Ok(())
    }

    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.n_elements).map(move |i| self.first_element + i * self.stride)
    }

    pub fn payload_len(&self) -> u64 {
        self.n_elements * self.element_size
    }
}

/// Arbitrary element index list; element `i` lives at `indexes[i] * element_size`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedLayout {
    pub indexes: Vec<u64>,
    pub element_size: u64,
}

impl IndexedLayout {
    pub fn new(indexes: Vec<u64>, element_size: u64) -> Self {
        Self {
            indexes,
            element_size,
        }
    }

    /// Every index is checked before anything is applied
    pub fn validate(&self, extent: u64) -> Result<()> {
        if self.indexes.is_empty() || self.element_size == 0 {
            return Err(FamError::invalid_parameter(
                "layout",
                "index list and element size must be non-empty",
            ));
        }
        for (position, &index) in self.indexes.iter().enumerate() {
            let end = index
                .checked_mul(self.element_size)
                .and_then(|start| start.checked_add(self.element_size));
            match end {
                Some(end) if end <= extent => {}
                _ => {
                    return Err(FamError::invalid_index(
                        position,
                        index,
                        format!("element past extent {}", extent),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn span(&self) -> u64 {
        self.indexes
            .iter()
            .map(|&index| index * self.element_size + self.element_size)
            .max()
            .unwrap_or(0)
    }

    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.indexes.iter().map(move |&index| index * self.element_size)
    }

    pub fn payload_len(&self) -> u64 {
        self.indexes.len() as u64 * self.element_size
    }
}

/// One-sided operation against registered region memory
///
/// `offset` is region-relative; every layout is relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicRequest {
    Get {
        offset: u64,
        len: u64,
    },
    Put {
        offset: u64,
        data: Vec<u8>,
    },
    ScatterStrided {
        offset: u64,
        layout: StridedLayout,
        data: Vec<u8>,
    },
    GatherStrided {
        offset: u64,
        layout: StridedLayout,
    },
    ScatterIndexed {
        offset: u64,
        layout: IndexedLayout,
        data: Vec<u8>,
    },
    GatherIndexed {
        offset: u64,
        layout: IndexedLayout,
    },
    Bitwise {
        offset: u64,
        op: BitwiseOp,
        value: AtomicValue,
        /// Return the prior value
        fetch: bool,
    },
}

/// Operation kinds, used for profiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Put,
    ScatterStrided,
    GatherStrided,
    ScatterIndexed,
    GatherIndexed,
    Bitwise,
}

impl AtomicRequest {
    pub fn kind(&self) -> OpKind {
        match self {
            AtomicRequest::Get { .. } => OpKind::Get,
            AtomicRequest::Put { .. } => OpKind::Put,
            AtomicRequest::ScatterStrided { .. } => OpKind::ScatterStrided,
            AtomicRequest::GatherStrided { .. } => OpKind::GatherStrided,
            AtomicRequest::ScatterIndexed { .. } => OpKind::ScatterIndexed,
            AtomicRequest::GatherIndexed { .. } => OpKind::GatherIndexed,
            AtomicRequest::Bitwise { .. } => OpKind::Bitwise,
        }
    }

    pub fn base_offset(&self) -> u64 {
        match self {
            AtomicRequest::Get { offset, .. }
            | AtomicRequest::Put { offset, .. }
            | AtomicRequest::ScatterStrided { offset, .. }
            | AtomicRequest::GatherStrided { offset, .. }
            | AtomicRequest::ScatterIndexed { offset, .. }
            | AtomicRequest::GatherIndexed { offset, .. }
            | AtomicRequest::Bitwise { offset, .. } => *offset,
        }
    }

    /// Whether the request only reads target memory
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            AtomicRequest::Get { .. }
                | AtomicRequest::GatherStrided { .. }
                | AtomicRequest::GatherIndexed { .. }
        )
    }

    pub fn required_access(&self) -> AccessType {
        if self.is_read_only() {
            AccessType::ReadOnly
        } else {
            AccessType::ReadWrite
        }
    }

    /// Check the request against the `extent` bytes available from its base
    /// offset to the end of the target dataitem, returning the touched span
    pub fn validate(&self, extent: u64) -> Result<u64> {
        let within = |span: u64| {
            if span > extent {
                Err(FamError::invalid_range(format!(
                    "access of {} bytes past extent {}",
                    span, extent
                )))
            } else {
                Ok(span)
            }
        };
        let payload_matches = |data: &[u8], expected: u64| {
            if data.len() as u64 != expected {
                Err(FamError::invalid_parameter(
                    "data",
                    format!("payload is {} bytes, layout needs {}", data.len(), expected),
                ))
            } else {
                Ok(())
            }
        };

        match self {
            AtomicRequest::Get { len, .. } => within(*len),
            AtomicRequest::Put { data, .. } => within(data.len() as u64),
            AtomicRequest::ScatterStrided { layout, data, .. } => {
                layout.validate(extent)?;
                payload_matches(data, layout.payload_len())?;
                layout.span()
            }
            AtomicRequest::GatherStrided { layout, .. } => {
                layout.validate(extent)?;
                layout.span()
            }
            AtomicRequest::ScatterIndexed { layout, data, .. } => {
                layout.validate(extent)?;
                payload_matches(data, layout.payload_len())?;
                Ok(layout.span())
            }
            AtomicRequest::GatherIndexed { layout, .. } => {
                layout.validate(extent)?;
                Ok(layout.span())
            }
            AtomicRequest::Bitwise { value, .. } => within(value.width()),
        }
    }

    /// Payload bytes moved by the request
    pub fn transfer_len(&self) -> u64 {
        match self {
            AtomicRequest::Get { len, .. } => *len,
            AtomicRequest::Put { data, .. }
            | AtomicRequest::ScatterStrided { data, .. }
            | AtomicRequest::ScatterIndexed { data, .. } => data.len() as u64,
            AtomicRequest::GatherStrided { layout, .. } => layout.payload_len(),
            AtomicRequest::GatherIndexed { layout, .. } => layout.payload_len(),
            AtomicRequest::Bitwise { value, .. } => value.width(),
        }
    }
}

/// Result of an executed [`AtomicRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicResponse {
    Done,
    Data(Vec<u8>),
    Value(AtomicValue),
}

impl AtomicResponse {
    pub fn into_data(self) -> Result<Vec<u8>> {
        match self {
            AtomicResponse::Data(data) => Ok(data),
            other => Err(FamError::invalid_state(format!(
                "expected data response, got {:?}",
                other
            ))),
        }
    }

    pub fn into_value(self) -> Result<AtomicValue> {
        match self {
            AtomicResponse::Value(value) => Ok(value),
            other => Err(FamError::invalid_state(format!(
                "expected value response, got {:?}",
                other
            ))),
        }
    }
}
