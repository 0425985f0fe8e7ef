//! Operation kinds understood by the partitioner, kernels and converters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::graph::OperandId;

/// Kind of an operation.
///
/// Parameters travel as constant operands, following the operand list
/// conventions below.
///
/// | Kind                | Inputs                               |
/// |---------------------|--------------------------------------|
/// | unary element-wise  | `x`                                  |
/// | binary element-wise | `a`, `b` (same shape, or `b` scalar) |
/// | `Softmax`           | `x`, optional int32 `axis` constant  |
/// | `Quantize`          | `x`, float32 `scale` constant        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
    Exp,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Softmax,
    Quantize,
}

impl OperationType {
    pub const ALL: [OperationType; 15] = [
        OperationType::Identity,
        OperationType::Relu,
        OperationType::Sigmoid,
        OperationType::Tanh,
        OperationType::Abs,
        OperationType::Neg,
        OperationType::Exp,
        OperationType::Add,
        OperationType::Sub,
        OperationType::Mul,
        OperationType::Div,
        OperationType::Max,
        OperationType::Min,
        OperationType::Softmax,
        OperationType::Quantize,
    ];

    /// Upper-case name used in operation lists and graph dumps.
    pub const fn name(self) -> &'static str {
        match self {
            OperationType::Identity => "IDENTITY",
            OperationType::Relu => "RELU",
            OperationType::Sigmoid => "SIGMOID",
            OperationType::Tanh => "TANH",
            OperationType::Abs => "ABS",
            OperationType::Neg => "NEG",
            OperationType::Exp => "EXP",
            OperationType::Add => "ADD",
            OperationType::Sub => "SUB",
            OperationType::Mul => "MUL",
            OperationType::Div => "DIV",
            OperationType::Max => "MAX",
            OperationType::Min => "MIN",
            OperationType::Softmax => "SOFTMAX",
            OperationType::Quantize => "QUANTIZE",
        }
    }

    pub const fn is_unary(self) -> bool {
        matches!(
            self,
            OperationType::Identity
                | OperationType::Relu
                | OperationType::Sigmoid
                | OperationType::Tanh
                | OperationType::Abs
                | OperationType::Neg
                | OperationType::Exp
        )
    }

    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            OperationType::Add
                | OperationType::Sub
                | OperationType::Mul
                | OperationType::Div
                | OperationType::Max
                | OperationType::Min
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OperationType {
    type Err = IrError;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        OperationType::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| IrError::UnknownOperationType(wanted.to_string()))
    }
}

/// Stable identifier of an operation, assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub op_type: OperationType,
    pub inputs: Vec<OperandId>,
    pub outputs: Vec<OperandId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("softmax".parse::<OperationType>().unwrap(), OperationType::Softmax);
        assert_eq!(" RELU ".parse::<OperationType>().unwrap(), OperationType::Relu);
        assert!("conv2d".parse::<OperationType>().is_err());
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for op in OperationType::ALL {
            assert_eq!(op.name().parse::<OperationType>().unwrap(), op);
        }
    }
}
