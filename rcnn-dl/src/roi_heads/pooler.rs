//! Multi-level RoI feature extraction.

use crate::common::*;

pub const CANONICAL_BOX_SIZE: i64 = 224;
pub const CANONICAL_LEVEL: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolerType {
    #[serde(rename = "ROIAlign")]
    RoiAlign,
    #[serde(rename = "ROIAlignV2")]
    RoiAlignV2,
    #[serde(rename = "ROIPool")]
    RoiPool,
    #[serde(rename = "ROIAlignRotated")]
    RoiAlignRotated,
}

impl PoolerType {
    pub fn box_dim(&self) -> i64 {
        match self {
            Self::RoiAlignRotated => RotatedBoxes::BOX_DIM,
            _ => Boxes::BOX_DIM,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoiPoolerInit {
    pub pooler_type: PoolerType,
    pub output_size: i64,
    /// Feature scales, the reciprocal of strides, from the finest level.
    pub scales: Vec<f64>,
    pub sampling_ratio: i64,
    pub canonical_box_size: i64,
    pub canonical_level: i64,
}

impl RoiPoolerInit {
    pub fn new(pooler_type: PoolerType, output_size: i64, scales: Vec<f64>, sampling_ratio: i64) -> Self {
        Self {
            pooler_type,
            output_size,
            scales,
            sampling_ratio,
            canonical_box_size: CANONICAL_BOX_SIZE,
            canonical_level: CANONICAL_LEVEL,
        }
    }

    pub fn build(self) -> Result<RoiPooler> {
        let Self {
            pooler_type,
            output_size,
            scales,
            sampling_ratio,
            canonical_box_size,
            canonical_level,
        } = self;

        ensure!(output_size > 0, "output_size must be positive");
        ensure!(sampling_ratio >= 0, "sampling_ratio must be non-negative");
        ensure!(canonical_box_size > 0, "canonical_box_size must be positive");

        let (first, last) = match (scales.first(), scales.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => bail!("at least one feature scale is required"),
        };
        let to_level = |scale: f64| -> Result<i64> {
            ensure!(scale > 0.0, "scales must be positive, but get {}", scale);
            let level = -scale.log2();
            ensure!(
                (level - level.round()).abs() <= 1e-6,
                "scale {} is not a power of two",
                scale
            );
            Ok(level.round() as i64)
        };
        let min_level = to_level(first)?;
        let max_level = to_level(last)?;
        ensure!(
            0 < min_level && min_level <= max_level,
            "expect 0 < min_level <= max_level, but get {} and {}",
            min_level,
            max_level
        );
        ensure!(
            scales.len() as i64 == max_level - min_level + 1,
            "feature scales {:?} do not form a pyramid",
            scales
        );

        Ok(RoiPooler {
            pooler_type,
            output_size,
            scales,
            sampling_ratio,
            canonical_box_size,
            canonical_level,
            min_level,
            max_level,
        })
    }
}

/// Pools a fixed-size feature for each box from the level matching its size.
#[derive(Debug, CopyGetters)]
pub struct RoiPooler {
    #[get_copy = "pub"]
    pooler_type: PoolerType,
    #[get_copy = "pub"]
    output_size: i64,
    scales: Vec<f64>,
    sampling_ratio: i64,
    canonical_box_size: i64,
    canonical_level: i64,
    min_level: i64,
    max_level: i64,
}

impl RoiPooler {
    /// Pool `[R, C, S, S]` features for the boxes of all images.
    ///
    /// `features` are `[N, C, H, W]` maps ordered from the finest level and
    /// `boxes` holds one box list per image.
    pub fn forward<T>(&self, features: &[T], boxes: &[BoxTensor]) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        ensure!(
            features.len() == self.scales.len(),
            "expect {} feature levels, but get {}",
            self.scales.len(),
            features.len()
        );
        let first = features[0].borrow();
        let (num_images, num_channels, _, _) = first.size4()?;
        ensure!(
            boxes.len() as i64 == num_images,
            "expect box lists of {} images, but get {}",
            num_images,
            boxes.len()
        );
        ensure!(
            boxes
                .iter()
                .all(|boxes| boxes.box_dim() == self.pooler_type.box_dim()),
            "{:?} expects {}-d boxes",
            self.pooler_type,
            self.pooler_type.box_dim()
        );

        let rois = convert_boxes_to_pooler_format(boxes)?;
        if features.len() == 1 {
            return self.pool_level(first, &rois, self.scales[0]);
        }

        let level_assignments = assign_boxes_to_levels(
            boxes,
            self.min_level,
            self.max_level,
            self.canonical_box_size,
            self.canonical_level,
        )?;
        let num_boxes = rois.size()[0];
        let size = self.output_size;
        let output = Tensor::zeros(
            &[num_boxes, num_channels, size, size],
            (first.kind(), first.device()),
        );

        izip!(features, &self.scales)
            .enumerate()
            .try_fold(output, |output, (level, (feature, &scale))| {
                let indexes = level_assignments.eq(level as i64).nonzero_1d();
                if indexes.is_empty() {
                    return Ok(output);
                }
                let pooled = self.pool_level(feature.borrow(), &rois.index_select(0, &indexes), scale)?;
                Ok(output.index_copy(0, &indexes, &pooled))
            })
    }

    fn pool_level(&self, feature: &Tensor, rois: &Tensor, scale: f64) -> Result<Tensor> {
        let output_size = (self.output_size, self.output_size);
        match self.pooler_type {
            PoolerType::RoiAlign => {
                roi_align(feature, rois, output_size, scale, self.sampling_ratio, false)
            }
            PoolerType::RoiAlignV2 => {
                roi_align(feature, rois, output_size, scale, self.sampling_ratio, true)
            }
            PoolerType::RoiPool => roi_pool(feature, rois, output_size, scale),
            PoolerType::RoiAlignRotated => {
                roi_align_rotated(feature, rois, output_size, scale, self.sampling_ratio)
            }
        }
    }
}

/// Map each box to a pyramid level by its size, as an offset from `min_level`.
pub fn assign_boxes_to_levels(
    boxes: &[BoxTensor],
    min_level: i64,
    max_level: i64,
    canonical_box_size: i64,
    canonical_level: i64,
) -> Result<Tensor> {
    let areas: Vec<_> = boxes.iter().map(|boxes| boxes.area()).collect();
    let box_sizes = Tensor::f_cat(&areas, 0)?.sqrt();
    let levels = ((box_sizes / canonical_box_size as f64 + f32::EPSILON as f64).log2()
        + canonical_level as f64)
        .floor()
        .clamp(min_level as f64, max_level as f64);
    Ok(levels.to_kind(Kind::Int64) - min_level)
}

/// Concatenate box lists into `[R, 1 + B]` rows prefixed by the image index.
pub fn convert_boxes_to_pooler_format(boxes: &[BoxTensor]) -> Result<Tensor> {
    let rows: Vec<_> = boxes
        .iter()
        .enumerate()
        .map(|(index, boxes)| {
            let tensor = boxes.tensor();
            let batch_index = Tensor::full(
                &[boxes.len(), 1],
                index as f64,
                (tensor.kind(), tensor.device()),
            );
            Tensor::cat(&[&batch_index, tensor], 1)
        })
        .collect();
    Ok(Tensor::f_cat(&rows, 0)?)
}
