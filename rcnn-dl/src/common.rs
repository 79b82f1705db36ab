pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{Polygon, RotatedRect, HW, XYXY};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{chain, iproduct, izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::{Borrow, Cow},
    cell::Cell,
    cmp::{self, Ordering},
    collections::{HashMap, HashSet},
    f64::consts::PI,
    fmt::{self, Debug},
    fs,
    iter::{self, FromIterator},
    ops::{Deref, Range},
    path::{Path, PathBuf},
};
pub use tch::{
    nn::{self, Module as _, ModuleT as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_goodies::{
    batched_nms, batched_nms_rotated, nms, nms_rotated, roi_align, roi_align_rotated, roi_pool,
    BoxTensor, Boxes, ImageSize, ImageSizeExt as _, RotatedBoxes, TensorExt as _,
};
pub use tch_modules::{
    bottleneck_stage, scale_gradient, BceWithLogitsLossInit, BottleneckBlock, BottleneckBlockInit,
    ConvNorm2D, ConvNorm2DInit, CrossEntropyLoss, NormKind, SmoothL1Loss,
};
pub use tch_tensor_like::TensorLike;

/// Feature maps keyed by name, in backbone order.
pub type FeatureMap = IndexMap<String, Tensor>;

/// Named scalar losses.
pub type LossDict = IndexMap<String, Tensor>;

unzip_n::unzip_n!(pub 2);
unzip_n::unzip_n!(pub 3);
unzip_n::unzip_n!(pub 4);

#[cfg(test)]
pub use approx::assert_abs_diff_eq;
