use core::fmt;

/// Scalar element types.
///
/// `Index` is the type of loop counters and range bounds; `MemRef` wraps the
/// element type of an externally allocated memory reference. Neither may be
/// stored in an allocated buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F64,
    I32,
    I64,
    Index,
    MemRef(Box<ScalarType>),
}

impl ScalarType {
    /// Whether a value of this type may be placed in an allocated memory
    /// buffer. Index computations and memory references must stay in
    /// registers.
    pub fn is_memory_eligible(&self) -> bool {
        !matches!(self, Self::Index | Self::MemRef(_))
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::Index => f.write_str("index"),
            Self::MemRef(elem) => write!(f, "memref<{elem}>"),
        }
    }
}

/// The type of a value: a scalar element replicated over a `rank`-dimensional
/// iteration domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueType {
    pub element_type: ScalarType,
    pub rank: usize,
}

impl ValueType {
    pub fn new(element_type: ScalarType, rank: usize) -> Self {
        Self { element_type, rank }
    }

    /// A 0-dimensional value.
    pub fn scalar(element_type: ScalarType) -> Self {
        Self { element_type, rank: 0 }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}d", self.element_type, self.rank)
    }
}
