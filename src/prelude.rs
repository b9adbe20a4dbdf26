//! The traits needed to plug in custom devices and cost models
pub use crate::accelerator::{ColumnKernel, ComputeDevice};
pub use crate::dispatch::CostModel;
