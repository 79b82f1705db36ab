//! Assignment of ground truth to predictions by quality thresholds.

use crate::common::*;

/// Label for predictions that are neither positive nor negative.
pub const IGNORE_LABEL: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherInit {
    /// Ascending, strictly increasing quality thresholds. The first one must be positive.
    pub thresholds: Vec<R64>,
    /// One label per threshold band, each of -1, 0 or 1.
    pub labels: Vec<i64>,
    /// Mark predictions tied for the best quality of some ground truth as positive.
    pub allow_low_quality_matches: bool,
}

impl MatcherInit {
    pub fn build(self) -> Result<Matcher> {
        let Self {
            thresholds,
            labels,
            allow_low_quality_matches,
        } = self;

        ensure!(!thresholds.is_empty(), "at least one threshold is required");
        ensure!(
            thresholds[0].raw() > 0.0,
            "the first threshold must be positive, but get {}",
            thresholds[0]
        );
        let thresholds: Vec<f64> = chain!(
            iter::once(f64::NEG_INFINITY),
            thresholds.iter().map(|thresh| thresh.raw()),
            iter::once(f64::INFINITY)
        )
        .collect();
        ensure!(
            thresholds.windows(2).all(|pair| pair[0] < pair[1]),
            "thresholds must be strictly increasing"
        );
        ensure!(
            labels.iter().all(|&label| [-1, 0, 1].contains(&label)),
            "labels must be one of -1, 0 or 1, but get {:?}",
            labels
        );
        ensure!(
            labels.len() == thresholds.len() - 1,
            "expect {} labels, but get {}",
            thresholds.len() - 1,
            labels.len()
        );

        Ok(Matcher {
            thresholds,
            labels,
            allow_low_quality_matches,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    thresholds: Vec<f64>,
    labels: Vec<i64>,
    allow_low_quality_matches: bool,
}

impl Matcher {
    /// Match a `[M, N]` quality matrix between M ground truths and N predictions.
    ///
    /// Returns `(matches, match_labels)`. `matches` holds the best ground truth
    /// index of each prediction as int64, and `match_labels` the int8 band label.
    pub fn forward(&self, quality: &Tensor) -> Result<(Tensor, Tensor)> {
        let (num_gt, num_pred) = quality.size2()?;
        let device = quality.device();

        if num_gt == 0 {
            let matches = Tensor::zeros(&[num_pred], (Kind::Int64, device));
            let match_labels =
                Tensor::full(&[num_pred], self.labels[0], (Kind::Int8, device));
            return Ok((matches, match_labels));
        }
        ensure!(
            bool::from(quality.ge(0.0).all()),
            "the quality matrix must be non-negative"
        );

        let (matched_vals, matches) = quality.max_dim(0, false);
        let mut match_labels = Tensor::ones(&[num_pred], (Kind::Int8, device));

        izip!(
            &self.labels,
            self.thresholds.iter(),
            self.thresholds.iter().skip(1)
        )
        .for_each(|(&label, &low, &high)| {
            let band = matched_vals.ge(low).logical_and(&matched_vals.lt(high));
            let _ = match_labels.masked_fill_(&band, label);
        });

        if self.allow_low_quality_matches {
            set_low_quality_matches(quality, &mut match_labels);
        }

        Ok((matches, match_labels))
    }
}

/// Label positive every prediction tied for the highest quality of some ground truth.
///
/// The matched index is left as is, so a prediction rescued by one ground
/// truth can still point to another one with higher quality.
fn set_low_quality_matches(quality: &Tensor, match_labels: &mut Tensor) {
    let (highest, _) = quality.max_dim(1, true);
    let pred_indexes = quality.eq_tensor(&highest).nonzero().select(1, 1);
    let _ = match_labels.index_fill_(0, &pred_indexes, 1i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpn_matcher(allow_low_quality_matches: bool) -> Result<Matcher> {
        MatcherInit {
            thresholds: vec![r64(0.3), r64(0.7)],
            labels: vec![0, -1, 1],
            allow_low_quality_matches,
        }
        .build()
    }

    #[test]
    fn threshold_bands() -> Result<()> {
        let quality = Tensor::of_slice(&[
            0.1f32, 0.5, 0.8, 0.2, //
            0.0, 0.2, 0.1, 0.9,
        ])
        .view([2, 4]);

        let (matches, labels) = rpn_matcher(false)?.forward(&quality)?;
        assert_eq!(Vec::<i64>::from(&matches), vec![0, 0, 0, 1]);
        assert_eq!(Vec::<i8>::from(&labels), vec![0, -1, 1, 1]);
        Ok(())
    }

    #[test]
    fn low_quality_rescue() -> Result<()> {
        // the second ground truth peaks at 0.4 on two tied predictions
        let quality = Tensor::of_slice(&[
            0.9f32, 0.1, 0.5, 0.0, //
            0.0, 0.4, 0.2, 0.4,
        ])
        .view([2, 4]);

        let (matches, labels) = rpn_matcher(true)?.forward(&quality)?;
        assert_eq!(Vec::<i8>::from(&labels), vec![1, 1, -1, 1]);
        assert_eq!(Vec::<i64>::from(&matches), vec![0, 1, 0, 1]);
        Ok(())
    }

    #[test]
    fn no_ground_truth() -> Result<()> {
        let quality = Tensor::zeros(&[0, 5], (Kind::Float, Device::Cpu));
        let (matches, labels) = rpn_matcher(true)?.forward(&quality)?;
        assert_eq!(Vec::<i64>::from(&matches), vec![0; 5]);
        assert_eq!(Vec::<i8>::from(&labels), vec![0; 5]);
        Ok(())
    }

    #[test]
    fn random_quality_stays_in_range() -> Result<()> {
        tch::manual_seed(7);
        let quality = Tensor::rand(&[6, 50], (Kind::Float, Device::Cpu));
        let (matches, labels) = rpn_matcher(true)?.forward(&quality)?;
        assert!(bool::from(matches.ge(0i64).logical_and(&matches.lt(6i64)).all()));
        assert!(bool::from(labels.ge(-1i64).logical_and(&labels.le(1i64)).all()));
        Ok(())
    }

    #[test]
    fn invalid_init() {
        let build = |thresholds: Vec<f64>, labels: Vec<i64>| {
            MatcherInit {
                thresholds: thresholds.into_iter().map(r64).collect(),
                labels,
                allow_low_quality_matches: false,
            }
            .build()
        };
        assert!(build(vec![0.0], vec![0, 1]).is_err());
        assert!(build(vec![0.7, 0.3], vec![0, -1, 1]).is_err());
        assert!(build(vec![0.5], vec![0, 2]).is_err());
        assert!(build(vec![0.5], vec![0]).is_err());
        assert!(build(vec![0.5], vec![0, 1]).is_ok());
    }
}
