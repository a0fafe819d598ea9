//! Shared data contracts for heads, detection records, and evaluation results.

pub mod arrays;
pub mod detection;
pub mod heads;

pub use arrays::{ArrayError, HostArray, HostArrays};
pub use detection::{ContractError, Detection, EvalResults};
pub use heads::{Head, HeadWeights, LOSS_ORDER};
