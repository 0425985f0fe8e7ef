//! # tessera-ir
//!
//! Graph IR consumed by the tessera program builder: typed operands with
//! optional dynamic-shape ranges, operations, a dependency DAG with
//! topological ordering, and a bincode blob encoding used for cached
//! sub-graphs.

pub mod error;
pub mod graph;
pub mod operation;
pub mod topology;
pub mod types;

pub use error::{IrError, Result};
pub use graph::{Graph, Operand, OperandId, OperandLifetime};
pub use operation::{Operation, OperationId, OperationType};
pub use topology::{sort_operations_in_topological_order, OperationDag};
pub use types::{element_count, DynamicDims, OperandType, Precision, ShapeRange, DYNAMIC_DIM};
