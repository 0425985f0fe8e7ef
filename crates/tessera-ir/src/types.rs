//! Element precisions and operand shapes.
//!
//! A shape is either fully static or carries one dynamic descriptor. The
//! canonical descriptor is a [`ShapeRange`] of three same-rank arrays
//! (`opt`, `min`, `max`); a list of concrete [`DynamicDims::Variants`] is
//! accepted on input and folded into a range by
//! [`OperandType::canonicalize`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IrError, Result};

/// Marker for a dimension that is only known at execution time.
pub const DYNAMIC_DIM: i32 = -1;

/// Element precision of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    Bool8,
    Int8,
    UInt8,
    Int16,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl Precision {
    /// Size of one element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Precision::Bool8 | Precision::Int8 | Precision::UInt8 => 1,
            Precision::Int16 | Precision::Float16 => 2,
            Precision::Int32 | Precision::Float32 => 4,
            Precision::Int64 | Precision::Float64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Precision::Float16 | Precision::Float32 | Precision::Float64)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Bool8 => "bool8",
            Precision::Int8 => "int8",
            Precision::UInt8 => "uint8",
            Precision::Int16 => "int16",
            Precision::Int32 => "int32",
            Precision::Int64 => "int64",
            Precision::Float16 => "float16",
            Precision::Float32 => "float32",
            Precision::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Number of elements in a concrete shape.
///
/// Fails if any dimension is negative. A rank-0 shape holds one element.
pub fn element_count(dims: &[i32]) -> Result<usize> {
    dims.iter().try_fold(1usize, |count, &dim| {
        if dim < 0 {
            Err(IrError::UnresolvedDimensions(dims.to_vec()))
        } else {
            Ok(count * dim as usize)
        }
    })
}

/// Canonical dynamic-shape descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRange {
    /// Preferred shape, used for plan tuning.
    pub opt: Vec<i32>,
    pub min: Vec<i32>,
    pub max: Vec<i32>,
}

impl ShapeRange {
    /// Build a range, enforcing equal ranks and `min <= opt <= max`.
    pub fn new(opt: Vec<i32>, min: Vec<i32>, max: Vec<i32>) -> Result<Self> {
        let range = Self { opt, min, max };
        range.validate()?;
        Ok(range)
    }

    /// Read `[opt, min, max]` variants into a range. Any other count is
    /// rejected.
    pub fn from_variants(variants: &[Vec<i32>]) -> Result<Self> {
        match variants {
            [opt, min, max] => Self::new(opt.clone(), min.clone(), max.clone()),
            _ => Err(IrError::shape_range(format!(
                "expected 3 shape variants (opt, min, max), got {}",
                variants.len()
            ))),
        }
    }

    pub fn rank(&self) -> usize {
        self.opt.len()
    }

    pub fn validate(&self) -> Result<()> {
        let rank = self.opt.len();
        if self.min.len() != rank || self.max.len() != rank {
            return Err(IrError::shape_range(format!(
                "ranks differ: opt {}, min {}, max {}",
                rank,
                self.min.len(),
                self.max.len()
            )));
        }
        for d in 0..rank {
            if self.min[d] < 0 || !(self.min[d] <= self.opt[d] && self.opt[d] <= self.max[d]) {
                return Err(IrError::shape_range(format!(
                    "dimension {d} violates 0 <= min <= opt <= max: min {}, opt {}, max {}",
                    self.min[d], self.opt[d], self.max[d]
                )));
            }
        }
        Ok(())
    }

    /// Whether `dims` has the range's rank and every dimension lies in `[min, max]`.
    pub fn contains(&self, dims: &[i32]) -> bool {
        dims.len() == self.rank()
            && dims
                .iter()
                .zip(self.min.iter().zip(&self.max))
                .all(|(&dim, (&min, &max))| min <= dim && dim <= max)
    }
}

/// Dynamic-shape descriptor as supplied by the graph author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DynamicDims {
    /// Concrete shapes the operand may take.
    Variants(Vec<Vec<i32>>),
    /// Canonical `(opt, min, max)` form.
    Range(ShapeRange),
}

/// Precision, shape and optional dynamic descriptor of an operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandType {
    pub precision: Precision,
    /// Declared dimensions. [`DYNAMIC_DIM`] marks an unknown extent.
    pub dims: Vec<i32>,
    pub dynamic: Option<DynamicDims>,
}

impl OperandType {
    /// Static shape.
    pub fn new(precision: Precision, dims: impl Into<Vec<i32>>) -> Self {
        Self {
            precision,
            dims: dims.into(),
            dynamic: None,
        }
    }

    pub fn float32(dims: impl Into<Vec<i32>>) -> Self {
        Self::new(Precision::Float32, dims)
    }

    /// Attach a canonical range; dimensions that vary become [`DYNAMIC_DIM`].
    pub fn with_range(mut self, range: ShapeRange) -> Self {
        self.dims = dims_from_range(&range);
        self.dynamic = Some(DynamicDims::Range(range));
        self
    }

    /// Attach shape variants, kept as given until [`Self::canonicalize`].
    pub fn with_variants(mut self, variants: Vec<Vec<i32>>) -> Self {
        self.dynamic = Some(DynamicDims::Variants(variants));
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// True when some declared dimension is only known at execution time.
    pub fn is_dynamic(&self) -> bool {
        self.dims.contains(&DYNAMIC_DIM)
    }

    /// The canonical range, if the descriptor has been canonicalized.
    pub fn shape_range(&self) -> Option<&ShapeRange> {
        match &self.dynamic {
            Some(DynamicDims::Range(range)) => Some(range),
            _ => None,
        }
    }

    /// Fold variants into a [`ShapeRange`] and validate an existing range.
    pub fn canonicalize(&mut self) -> Result<()> {
        match &self.dynamic {
            None => Ok(()),
            Some(DynamicDims::Range(range)) => {
                range.validate()?;
                if range.rank() != self.rank() {
                    return Err(IrError::shape_range(format!(
                        "range rank {} does not match declared rank {}",
                        range.rank(),
                        self.rank()
                    )));
                }
                Ok(())
            }
            Some(DynamicDims::Variants(variants)) => {
                let range = ShapeRange::from_variants(variants)?;
                if range.rank() != self.rank() {
                    return Err(IrError::shape_range(format!(
                        "variant rank {} does not match declared rank {}",
                        range.rank(),
                        self.rank()
                    )));
                }
                self.dynamic = Some(DynamicDims::Range(range));
                Ok(())
            }
        }
    }

    /// Worst-case shape: the range maximum if dynamic, else the declared dims.
    pub fn max_dims(&self) -> Result<Vec<i32>> {
        match &self.dynamic {
            Some(DynamicDims::Range(range)) => Ok(range.max.clone()),
            Some(DynamicDims::Variants(variants)) => Ok(ShapeRange::from_variants(variants)?.max),
            None if self.is_dynamic() => Err(IrError::UnresolvedDimensions(self.dims.clone())),
            None => Ok(self.dims.clone()),
        }
    }

    /// Size in bytes of a tensor of this type with concrete `dims`.
    pub fn byte_len(&self) -> Result<usize> {
        Ok(element_count(&self.dims)? * self.precision.byte_size())
    }
}

impl fmt::Display for OperandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.precision, self.dims)?;
        if let Some(range) = self.shape_range() {
            write!(f, " opt={:?} min={:?} max={:?}", range.opt, range.min, range.max)?;
        }
        Ok(())
    }
}

fn dims_from_range(range: &ShapeRange) -> Vec<i32> {
    range
        .min
        .iter()
        .zip(&range.max)
        .map(|(&min, &max)| if min == max { min } else { DYNAMIC_DIM })
        .collect()
}
