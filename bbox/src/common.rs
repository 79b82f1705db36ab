pub use anyhow::{bail, ensure, Result};
pub use num_traits::{Float, FloatConst, Num};
