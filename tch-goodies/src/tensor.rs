use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    /// Whether every element is finite.
    fn all_finite(&self) -> bool;

    /// Select rows by an int64 index tensor or a boolean mask.
    fn f_select_rows(&self, index: &Tensor) -> Result<Tensor>;

    fn select_rows(&self, index: &Tensor) -> Tensor {
        self.f_select_rows(index).unwrap()
    }

    /// Indices of nonzero elements of a 1-d tensor, flattened to `[n]`.
    fn f_nonzero_1d(&self) -> Result<Tensor>;

    fn nonzero_1d(&self) -> Tensor {
        self.f_nonzero_1d().unwrap()
    }

    /// The number of elements that are nonzero.
    fn count_true(&self) -> i64;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }

    fn sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Tensor
    where
        T: Borrow<Tensor>,
    {
        Self::f_sum_tensors(tensors).unwrap()
    }

    fn f_mean_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let tensors: Vec<_> = tensors
            .into_iter()
            .map(|tensor| tensor.borrow().shallow_clone())
            .collect();
        let count = tensors.len();
        let sum = Self::f_sum_tensors(tensors)?;
        Ok(sum / count as f64)
    }

    /// Concatenate along dim 0, returning `empty` if the list is empty.
    fn f_cat_or(tensors: &[impl Borrow<Tensor>], empty: impl FnOnce() -> Tensor) -> Result<Tensor> {
        if tensors.is_empty() {
            return Ok(empty());
        }
        Ok(Tensor::f_cat(tensors, 0)?)
    }

    /// Split along dim 0 with `sizes` summing to the leading dimension.
    fn f_split_rows(&self, sizes: &[i64]) -> Result<Vec<Tensor>>;

    fn split_rows(&self, sizes: &[i64]) -> Vec<Tensor> {
        self.f_split_rows(sizes).unwrap()
    }

    /// Shift angles in degrees into `[-180, 180)`.
    fn normalize_degrees(&self) -> Tensor;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn all_finite(&self) -> bool {
        self.is_empty() || bool::from(self.isfinite().all())
    }

    fn f_select_rows(&self, index: &Tensor) -> Result<Tensor> {
        match index.kind() {
            Kind::Bool => {
                ensure!(
                    index.dim() == 1 && index.size()[0] == self.size()[0],
                    "mask length {:?} does not match tensor length {}",
                    index.size(),
                    self.size()[0]
                );
            }
            Kind::Int64 => {
                ensure!(index.dim() == 1, "index must be 1-d");
            }
            kind => bail!("index tensor must be bool or int64, but get {:?}", kind),
        }
        Ok(self.f_index(&[Some(index)])?)
    }

    fn f_nonzero_1d(&self) -> Result<Tensor> {
        ensure!(self.dim() == 1, "expect a 1-d tensor");
        Ok(self.f_nonzero()?.f_view([-1])?)
    }

    fn count_true(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        i64::from(self.ne(0i64).sum(Kind::Int64))
    }

    fn f_split_rows(&self, sizes: &[i64]) -> Result<Vec<Tensor>> {
        let total: i64 = sizes.iter().sum();
        let len = self.size().first().cloned().unwrap_or(0);
        ensure!(
            total == len,
            "split sizes sum to {}, but the tensor has {} rows",
            total,
            len
        );
        Ok(self.f_split_with_sizes(sizes, 0)?)
    }

    fn normalize_degrees(&self) -> Tensor {
        (self + 180.0).remainder(360.0) - 180.0
    }
}
