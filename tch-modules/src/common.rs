pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use derivative::Derivative;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt::{self, Display, Formatter},
    iter,
};
pub use strum::AsRefStr;
pub use tch::{
    nn::{self, Module as _, ModuleT as _, OptimizerConfig as _},
    Device, IndexOp, Kind, Reduction, Tensor,
};

pub type Fallible<T> = Result<T, Error>;
