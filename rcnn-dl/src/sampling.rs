use crate::common::*;

/// Randomly sample a balanced subset of positive and negative labels.
///
/// Labels equal to -1 are ignored, labels equal to `bg_label` are negatives
/// and the rest are positives. At most `num_samples * positive_fraction`
/// positives are kept, and negatives fill the remainder. Returns the int64
/// indices `(positive, negative)`.
pub fn subsample_labels(
    labels: &Tensor,
    num_samples: i64,
    positive_fraction: f64,
    bg_label: i64,
) -> Result<(Tensor, Tensor)> {
    ensure!(labels.dim() == 1, "labels must be 1-d");
    ensure!(num_samples >= 0, "num_samples must be non-negative");
    ensure!(
        (0.0..=1.0).contains(&positive_fraction),
        "positive_fraction must be within [0, 1], but get {}",
        positive_fraction
    );

    let positive = labels
        .ne(-1i64)
        .logical_and(&labels.ne(bg_label))
        .f_nonzero_1d()?;
    let negative = labels.eq(bg_label).f_nonzero_1d()?;

    let num_pos = ((num_samples as f64 * positive_fraction) as i64).min(positive.numel() as i64);
    let num_neg = (num_samples - num_pos).min(negative.numel() as i64);

    let pick = |candidates: &Tensor, count: i64| {
        let perm = Tensor::randperm(candidates.numel() as i64, (Kind::Int64, candidates.device()));
        candidates.index_select(0, &perm.i(0..count))
    };

    Ok((pick(&positive, num_pos), pick(&negative, num_neg)))
}
