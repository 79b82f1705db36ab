pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{RotatedRect, HW, XYXY};
pub use getset::Getters;
pub use itertools::{izip, Itertools};
pub use log::debug;
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::HashSet,
    convert::{TryFrom, TryInto},
    f64::consts::PI,
    fmt::{self, Display, Formatter},
    iter,
    ops::{Deref, Range},
};
pub use tch::{Device, IndexOp, Kind, Tensor};
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = Result<T, Error>;

