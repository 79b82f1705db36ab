//! Dense anchors tiled over feature maps.

use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorGeneratorKind {
    #[serde(rename = "DefaultAnchorGenerator")]
    Default,
    #[serde(rename = "RotatedAnchorGenerator")]
    Rotated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorGeneratorInit {
    pub name: AnchorGeneratorKind,
    /// Anchor sizes per feature level, or a single list shared by all levels.
    pub sizes: Vec<Vec<R64>>,
    /// Height over width ratios per feature level, or a single shared list.
    pub aspect_ratios: Vec<Vec<R64>>,
    /// Angles in degrees per feature level for rotated anchors.
    pub angles: Vec<Vec<R64>>,
    /// Position of the anchor center within a cell as a fraction of the stride.
    pub offset: R64,
}

impl Default for AnchorGeneratorInit {
    fn default() -> Self {
        Self {
            name: AnchorGeneratorKind::Default,
            sizes: vec![vec![32.0, 64.0, 128.0, 256.0, 512.0]
                .into_iter()
                .map(r64)
                .collect()],
            aspect_ratios: vec![vec![r64(0.5), r64(1.0), r64(2.0)]],
            angles: vec![vec![r64(-90.0), r64(0.0), r64(90.0)]],
            offset: r64(0.5),
        }
    }
}

impl AnchorGeneratorInit {
    /// Build a generator for feature levels with the given strides.
    pub fn build(self, strides: &[i64]) -> Result<AnchorGenerator> {
        let Self {
            name,
            sizes,
            aspect_ratios,
            angles,
            offset,
        } = self;
        let num_features = strides.len();
        let offset = offset.raw();

        ensure!(num_features > 0, "at least one feature level is required");
        ensure!(
            (0.0..1.0).contains(&offset),
            "offset must be within [0, 1), but get {}",
            offset
        );
        ensure!(
            strides.iter().all(|&stride| stride > 0),
            "strides must be positive, but get {:?}",
            strides
        );

        let sizes = broadcast_params(sizes, num_features, "sizes")?;
        let aspect_ratios = broadcast_params(aspect_ratios, num_features, "aspect_ratios")?;
        let angles = match name {
            AnchorGeneratorKind::Default => vec![vec![0.0]; num_features],
            AnchorGeneratorKind::Rotated => broadcast_params(angles, num_features, "angles")?,
        };

        let cell_anchors: Vec<_> = izip!(&sizes, &aspect_ratios, &angles)
            .map(|(sizes, aspect_ratios, angles)| {
                ensure!(
                    aspect_ratios.iter().all(|&ratio| ratio > 0.0),
                    "aspect ratios must be positive"
                );
                let anchors: Vec<f32> = iproduct!(sizes, aspect_ratios)
                    .flat_map(|(&size, &ratio)| {
                        let w = (size * size / ratio).sqrt();
                        let h = ratio * w;
                        match name {
                            AnchorGeneratorKind::Default => {
                                vec![-w / 2.0, -h / 2.0, w / 2.0, h / 2.0]
                            }
                            AnchorGeneratorKind::Rotated => angles
                                .iter()
                                .flat_map(|&angle| [0.0, 0.0, w, h, angle])
                                .collect(),
                        }
                    })
                    .map(|value| value as f32)
                    .collect();
                Ok(anchors)
            })
            .try_collect()?;

        let box_dim = match name {
            AnchorGeneratorKind::Default => Boxes::BOX_DIM,
            AnchorGeneratorKind::Rotated => RotatedBoxes::BOX_DIM,
        };
        let cell_anchors: Vec<_> = cell_anchors
            .iter()
            .map(|anchors| Tensor::of_slice(anchors).view([-1, box_dim]))
            .collect();
        let num_anchors: Vec<_> = cell_anchors.iter().map(|anchors| anchors.size()[0]).collect();
        debug!(
            "anchor generator with {} levels, {:?} anchors per cell",
            num_features, num_anchors
        );

        Ok(AnchorGenerator {
            kind: name,
            strides: strides.to_vec(),
            offset,
            cell_anchors,
            num_anchors,
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct AnchorGenerator {
    kind: AnchorGeneratorKind,
    strides: Vec<i64>,
    offset: f64,
    #[derivative(Debug = "ignore")]
    cell_anchors: Vec<Tensor>,
    num_anchors: Vec<i64>,
}

impl AnchorGenerator {
    pub fn kind(&self) -> AnchorGeneratorKind {
        self.kind
    }

    pub fn box_dim(&self) -> i64 {
        match self.kind {
            AnchorGeneratorKind::Default => Boxes::BOX_DIM,
            AnchorGeneratorKind::Rotated => RotatedBoxes::BOX_DIM,
        }
    }

    /// The number of anchors per spatial location of each level.
    pub fn num_anchors(&self) -> &[i64] {
        &self.num_anchors
    }

    /// Anchors centered at the origin for each level.
    pub fn cell_anchors(&self) -> &[Tensor] {
        &self.cell_anchors
    }

    /// Tile cell anchors over `[N, C, H, W]` feature maps.
    ///
    /// Each level yields `H * W * A` boxes ordered by row, then column, then cell anchor.
    pub fn forward<T>(&self, features: &[T]) -> Result<Vec<BoxTensor>>
    where
        T: Borrow<Tensor>,
    {
        ensure!(
            features.len() == self.strides.len(),
            "expect {} feature levels, but get {}",
            self.strides.len(),
            features.len()
        );

        izip!(features, &self.strides, &self.cell_anchors)
            .map(|(feature, &stride, base_anchors)| {
                let feature = feature.borrow();
                let (_, _, height, width) = feature.size4()?;
                let device = feature.device();
                let (shift_x, shift_y) = grid_offsets(height, width, stride, self.offset, device);

                let box_dim = self.box_dim();
                let shifts = match self.kind {
                    AnchorGeneratorKind::Default => {
                        Tensor::stack(&[&shift_x, &shift_y, &shift_x, &shift_y], 1)
                    }
                    AnchorGeneratorKind::Rotated => {
                        let zeros = shift_x.zeros_like();
                        Tensor::stack(&[&shift_x, &shift_y, &zeros, &zeros, &zeros], 1)
                    }
                };
                let anchors = (shifts.view([-1, 1, box_dim])
                    + base_anchors.to_device(device).view([1, -1, box_dim]))
                .reshape(&[-1, box_dim]);
                BoxTensor::new(anchors)
            })
            .try_collect()
    }
}

/// Anchor center coordinates of a `height` x `width` grid in row-major order.
fn grid_offsets(
    height: i64,
    width: i64,
    stride: i64,
    offset: f64,
    device: Device,
) -> (Tensor, Tensor) {
    let options = (Kind::Float, device);
    let stride = stride as f64;
    let shifts_x = Tensor::arange_start_step(offset * stride, width as f64 * stride, stride, options);
    let shifts_y =
        Tensor::arange_start_step(offset * stride, height as f64 * stride, stride, options);
    let num_x = shifts_x.size()[0];
    let num_y = shifts_y.size()[0];

    let shift_x = shifts_x.view([1, num_x]).expand(&[num_y, num_x], false).reshape(&[-1]);
    let shift_y = shifts_y.view([num_y, 1]).expand(&[num_y, num_x], false).reshape(&[-1]);
    (shift_x, shift_y)
}

/// Replicate a single parameter list to every level, or check there is one per level.
fn broadcast_params(
    params: Vec<Vec<R64>>,
    num_features: usize,
    name: &str,
) -> Result<Vec<Vec<f64>>> {
    ensure!(!params.is_empty(), "{} must not be empty", name);
    let params: Vec<Vec<f64>> = params
        .into_iter()
        .map(|level| level.into_iter().map(|value| value.raw()).collect())
        .collect();

    if params.len() == 1 {
        Ok(vec![params[0].clone(); num_features])
    } else {
        ensure!(
            params.len() == num_features,
            "{} has {} levels, but there are {} feature levels",
            name,
            params.len(),
            num_features
        );
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(height: i64, width: i64) -> Tensor {
        Tensor::zeros(&[1, 8, height, width], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn default_cell_anchors() -> Result<()> {
        let generator = AnchorGeneratorInit {
            sizes: vec![vec![r64(32.0)]],
            aspect_ratios: vec![vec![r64(0.25), r64(1.0)]],
            ..Default::default()
        }
        .build(&[4])?;

        assert_eq!(generator.num_anchors(), &[2]);
        let cell = Vec::<f32>::from(&generator.cell_anchors()[0].view([-1]));
        // aspect ratio 0.25 gives w = 64, h = 16
        let expect = [-32.0, -8.0, 32.0, 8.0, -16.0, -16.0, 16.0, 16.0];
        cell.iter()
            .zip(expect.iter())
            .for_each(|(&lhs, &rhs)| assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4));
        Ok(())
    }

    #[test]
    fn grid_layout() -> Result<()> {
        let generator = AnchorGeneratorInit {
            sizes: vec![vec![r64(8.0)], vec![r64(16.0)]],
            aspect_ratios: vec![vec![r64(1.0)]],
            ..Default::default()
        }
        .build(&[4, 8])?;

        let anchors = generator.forward(&[feature(2, 3), feature(1, 2)])?;
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].tensor().size(), vec![6, 4]);
        assert_eq!(anchors[1].tensor().size(), vec![2, 4]);

        // anchors sit at cell centers by default, so the second row, third
        // column of the first level is centered at (10, 6)
        let row = Vec::<f32>::from(&anchors[0].tensor().get(5));
        assert_eq!(row, vec![6.0, 2.0, 14.0, 10.0]);
        Ok(())
    }

    #[test]
    fn rotated_anchors() -> Result<()> {
        let generator = AnchorGeneratorInit {
            name: AnchorGeneratorKind::Rotated,
            sizes: vec![vec![r64(16.0)]],
            aspect_ratios: vec![vec![r64(1.0)]],
            angles: vec![vec![r64(-45.0), r64(45.0)]],
            offset: r64(0.0),
        }
        .build(&[16])?;

        assert_eq!(generator.box_dim(), 5);
        let anchors = generator.forward(&[feature(2, 2)])?;
        let tensor = anchors[0].tensor();
        assert_eq!(tensor.size(), vec![8, 5]);
        assert_eq!(Vec::<f32>::from(&tensor.get(3)), vec![16.0, 0.0, 16.0, 16.0, 45.0]);
        Ok(())
    }

    #[test]
    fn invalid_params() {
        let init = AnchorGeneratorInit {
            sizes: vec![vec![r64(8.0)], vec![r64(16.0)]],
            ..Default::default()
        };
        assert!(init.clone().build(&[4, 8, 16]).is_err());
        assert!(AnchorGeneratorInit {
            offset: r64(1.0),
            ..init
        }
        .build(&[4, 8])
        .is_err());
    }
}
