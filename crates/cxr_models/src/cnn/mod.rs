//! CNN models for radiograph classification.

mod efficientnet;
mod norm;

pub use efficientnet::{
    EfficientNet, EfficientNetConfig, EfficientNetRecord, MbConv, MbConvStageConfig,
    SqueezeExcitation, EFFICIENTNET_B0,
};
pub use norm::{ConvNorm, FrozenBatchNorm};
