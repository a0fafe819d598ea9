//! Loss criteria and the multi-head, multi-stack loss aggregator.
//!
//! Every criterion takes dense head predictions `[N, C, H, W]` and gathers them at the
//! per-object flat indices `ind` (`[N, M]`, `y * W + x` on the output map) before comparing
//! with `[N, M, D]` targets. Scalars are returned as rank-1 tensors of shape `[1]`.

pub mod attribute;
pub mod depth;
pub mod error;
pub mod focal;
pub mod gather;
pub mod generic;
pub mod regression;
pub mod rotation;
pub mod targets;
pub mod vertex;

pub use depth::{DepthAdjustment, DepthScaling};
pub use error::LossError;
pub use generic::{GenericLoss, LossBreakdown, LossConfig, LossKey};
pub use targets::{KeypointTargets, LossTargets, MaskedTarget, RotationTarget};

pub mod prelude {
    pub use crate::{
        DepthAdjustment, GenericLoss, LossBreakdown, LossConfig, LossError, LossKey, LossTargets,
    };
}
