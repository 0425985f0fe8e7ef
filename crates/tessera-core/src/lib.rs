//! # tessera-core - Heterogeneous Program Builder
//!
//! Turns a computation [`Graph`](tessera_ir::Graph) into a [`Program`] that
//! runs across three backends: an accelerator runtime, GPU kernels and host
//! kernels.
//!
//! ## Architecture
//!
//! ```text
//! Graph ──► GraphPartitioner ──► SubModel* ──► SubProgram* ──► Program::execute
//!                                   │               │
//!                                   └── ProgramCache ◄┘  (sub-graphs, index tables, plans)
//! ```
//!
//! - **Partitioning**: operations listed in the GPU table run as GPU kernels,
//!   those in the host table as host kernels, everything else on the
//!   accelerator. Maximal single-backend runs become sub-models.
//! - **Caching**: a fresh build serializes every sub-model and its compiled
//!   backend blob into a [`Cache`]. Building from a non-empty cache skips
//!   partitioning and compilation.
//! - **Execution**: caller shapes are checked against the declared types,
//!   then sub-programs run strictly in partition order.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_core::{Argument, Cache, Context, HostBuffer, Program, ProgramConfig};
//! use tessera_ir::{Graph, OperandType, OperationType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = Graph::new();
//! let x = graph.add_input(OperandType::float32([3]));
//! let t = graph.add_operand(OperandType::float32([3]));
//! let y = graph.add_operand(OperandType::float32([3]));
//! graph.add_operation(OperationType::Abs, [x], [t])?;
//! graph.add_operation(OperationType::Relu, [t], [y])?;
//! graph.mark_output(y)?;
//!
//! let config = ProgramConfig::from_properties("TESSERA_HOST_OPERATIONS_LIST=ABS")?;
//! let mut program = Program::new(Arc::new(Context::new(config)));
//! let mut cache = Cache::new();
//! program.build(&Arc::new(graph), &mut cache)?;
//! assert_eq!(program.sub_models().len(), 2);
//!
//! let mut input = HostBuffer::from_f32([3], &[-1.0, 2.0, -3.0]);
//! let mut output = HostBuffer::output();
//! program.execute(&mut [Argument::new(0, &mut input)], &mut [Argument::new(0, &mut output)])?;
//! assert_eq!(output.to_f32_vec()?, vec![1.0, 2.0, 3.0]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod partition;
pub mod passes;
pub mod program;
pub mod subprogram;

pub use cache::{Cache, ProgramCache};
pub use config::{Context, ProgramConfig};
pub use error::{Error, ErrorCategory, Result};
pub use partition::{BackendKind, GraphArena, GraphId, GraphPartitioner, SubModel, SupportTables, TensorIndex};
pub use passes::{run_passes, EliminateIdentity, GraphPass};
pub use program::{Argument, ArgumentAccess, HostBuffer, Program};
pub use subprogram::{AcceleratorSubProgram, KernelSubProgram, SubProgram};
