use crate::{common::*, rotated_boxes::RotatedBoxes, size::ImageSize, tensor::TensorExt};

/// Axis-aligned boxes in XYXY format with shape `[N, 4]`.
#[derive(Debug, TensorLike, Getters)]
pub struct Boxes {
    #[get = "pub"]
    pub(crate) tensor: Tensor,
}

impl Boxes {
    pub const BOX_DIM: i64 = 4;

    /// Wrap a `[N, 4]` tensor. An empty tensor becomes a `[0, 4]` float tensor.
    pub fn new(tensor: Tensor) -> Result<Self> {
        let tensor = if tensor.numel() == 0 {
            Tensor::zeros(&[0, 4], (Kind::Float, tensor.device()))
        } else {
            tensor
        };
        match tensor.size().as_slice() {
            &[_, 4] => (),
            shape => bail!("expect a [N, 4] tensor, but get shape {:?}", shape),
        }
        Ok(Self { tensor })
    }

    pub fn empty(device: Device) -> Self {
        Self {
            tensor: Tensor::zeros(&[0, 4], (Kind::Float, device)),
        }
    }

    pub fn from_xyxy(boxes: &[[f32; 4]]) -> Result<Self> {
        let flat: Vec<f32> = boxes.iter().flatten().cloned().collect();
        Self::new(Tensor::of_slice(&flat).view([-1, 4]))
    }

    pub fn len(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn x1(&self) -> Tensor {
        self.tensor.select(1, 0)
    }

    pub fn y1(&self) -> Tensor {
        self.tensor.select(1, 1)
    }

    pub fn x2(&self) -> Tensor {
        self.tensor.select(1, 2)
    }

    pub fn y2(&self) -> Tensor {
        self.tensor.select(1, 3)
    }

    pub fn widths(&self) -> Tensor {
        self.x2() - self.x1()
    }

    pub fn heights(&self) -> Tensor {
        self.y2() - self.y1()
    }

    pub fn area(&self) -> Tensor {
        self.widths() * self.heights()
    }

    /// Box centers with shape `[N, 2]` in (x, y) order.
    pub fn centers(&self) -> Tensor {
        Tensor::stack(
            &[
                (self.x1() + self.x2()) / 2.0,
                (self.y1() + self.y2()) / 2.0,
            ],
            1,
        )
    }

    /// Clamp x into `[0, width]` and y into `[0, height]`.
    pub fn clip(&self, image_size: &ImageSize) -> Result<Self> {
        ensure!(
            self.tensor.all_finite(),
            "box tensor contains infinite or NaN"
        );
        let h = image_size.h() as f64;
        let w = image_size.w() as f64;
        let tensor = Tensor::stack(
            &[
                self.x1().clamp(0.0, w),
                self.y1().clamp(0.0, h),
                self.x2().clamp(0.0, w),
                self.y2().clamp(0.0, h),
            ],
            1,
        );
        Ok(Self { tensor })
    }

    /// Boolean mask of boxes whose both sides exceed `threshold`.
    pub fn nonempty(&self, threshold: f64) -> Tensor {
        self.widths()
            .gt(threshold)
            .logical_and(&self.heights().gt(threshold))
    }

    /// Boolean mask of boxes lying inside the image, allowing `boundary_threshold` pixels of slack.
    pub fn inside_box(&self, image_size: &ImageSize, boundary_threshold: i64) -> Tensor {
        let h = image_size.h();
        let w = image_size.w();
        let b = boundary_threshold;
        self.x1()
            .ge(-b)
            .logical_and(&self.y1().ge(-b))
            .logical_and(&self.x2().lt(w + b))
            .logical_and(&self.y2().lt(h + b))
    }

    /// Multiply x coordinates by `scale_x` and y coordinates by `scale_y`.
    pub fn scale(&self, scale_x: f64, scale_y: f64) -> Self {
        let factors = Tensor::of_slice(&[scale_x, scale_y, scale_x, scale_y])
            .to_kind(self.tensor.kind())
            .to_device(self.device());
        Self {
            tensor: &self.tensor * factors.view([1, 4]),
        }
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.f_select_rows(index)?,
        })
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        Self {
            tensor: self.tensor.i(range),
        }
    }

    pub fn cat<B>(boxes: &[B]) -> Result<Self>
    where
        B: Borrow<Boxes>,
    {
        let tensors: Vec<_> = boxes.iter().map(|b| b.borrow().tensor()).collect();
        let tensor = Tensor::f_cat_or(&tensors, || Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu)))?;
        Self::new(tensor)
    }

    /// IoU between every pair of boxes, shape `[N, M]`.
    pub fn pairwise_iou(lhs: &Self, rhs: &Self) -> Tensor {
        let area1 = lhs.area();
        let area2 = rhs.area();

        let lhs = lhs.tensor.unsqueeze(1);
        let rhs = rhs.tensor.unsqueeze(0);
        let lt = lhs.i((.., .., 0..2)).maximum(&rhs.i((.., .., 0..2)));
        let rb = lhs.i((.., .., 2..4)).minimum(&rhs.i((.., .., 2..4)));
        let wh = (rb - lt).clamp_min(0.0);
        let inter = wh.select(2, 0) * wh.select(2, 1);

        let union = area1.unsqueeze(1) + area2.unsqueeze(0) - &inter;
        let iou = (&inter / union).where_self(&inter.gt(0.0), &inter.zeros_like());
        iou
    }

    /// IoU of corresponding boxes of two equal-length lists, shape `[N]`.
    pub fn matched_iou(lhs: &Self, rhs: &Self) -> Result<Tensor> {
        ensure!(
            lhs.len() == rhs.len(),
            "box lists must have the same length, but get {} and {}",
            lhs.len(),
            rhs.len()
        );
        let area1 = lhs.area();
        let area2 = rhs.area();
        let lt = lhs.tensor.i((.., 0..2)).maximum(&rhs.tensor.i((.., 0..2)));
        let rb = lhs.tensor.i((.., 2..4)).minimum(&rhs.tensor.i((.., 2..4)));
        let wh = (rb - lt).clamp_min(0.0);
        let inter = wh.select(1, 0) * wh.select(1, 1);
        Ok(&inter / (area1 + area2 - &inter))
    }

    /// Scalar copies of the boxes, on the host.
    pub fn to_xyxy_vec(&self) -> Vec<XYXY<f32>> {
        let flat = Vec::<f32>::from(&self.tensor.to_kind(Kind::Float).contiguous().view([-1]));
        flat.chunks(4)
            .map(|c| XYXY::from_xyxy([c[0], c[1], c[2].max(c[0]), c[3].max(c[1])]))
            .collect()
    }
}

/// A box tensor of either representation, dispatched on the trailing dimension.
#[derive(Debug, TensorLike)]
pub enum BoxTensor {
    Boxes(Boxes),
    Rotated(RotatedBoxes),
}

impl BoxTensor {
    /// Pick the representation by the size of the last dimension, 4 or 5.
    pub fn new(tensor: Tensor) -> Result<Self> {
        let box_dim = tensor.size().last().cloned();
        let boxes = match box_dim {
            Some(4) => Self::Boxes(Boxes::new(tensor)?),
            Some(5) => Self::Rotated(RotatedBoxes::new(tensor)?),
            _ => bail!(
                "cannot infer box type from a tensor of shape {:?}",
                tensor.size()
            ),
        };
        Ok(boxes)
    }

    pub fn box_dim(&self) -> i64 {
        match self {
            Self::Boxes(_) => Boxes::BOX_DIM,
            Self::Rotated(_) => RotatedBoxes::BOX_DIM,
        }
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Boxes(boxes) => boxes.tensor(),
            Self::Rotated(boxes) => boxes.tensor(),
        }
    }

    pub fn into_tensor(self) -> Tensor {
        match self {
            Self::Boxes(boxes) => boxes.into_tensor(),
            Self::Rotated(boxes) => boxes.into_tensor(),
        }
    }

    pub fn len(&self) -> i64 {
        self.tensor().size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn area(&self) -> Tensor {
        match self {
            Self::Boxes(boxes) => boxes.area(),
            Self::Rotated(boxes) => boxes.area(),
        }
    }

    /// Clip to the image. Rotated boxes use the default angle threshold of one degree.
    pub fn clip(&self, image_size: &ImageSize) -> Result<Self> {
        let clipped = match self {
            Self::Boxes(boxes) => Self::Boxes(boxes.clip(image_size)?),
            Self::Rotated(boxes) => Self::Rotated(
                boxes.clip(image_size, RotatedBoxes::DEFAULT_CLIP_ANGLE_THRESHOLD)?,
            ),
        };
        Ok(clipped)
    }

    pub fn nonempty(&self, threshold: f64) -> Tensor {
        match self {
            Self::Boxes(boxes) => boxes.nonempty(threshold),
            Self::Rotated(boxes) => boxes.nonempty(threshold),
        }
    }

    pub fn inside_box(&self, image_size: &ImageSize, boundary_threshold: i64) -> Tensor {
        match self {
            Self::Boxes(boxes) => boxes.inside_box(image_size, boundary_threshold),
            Self::Rotated(boxes) => boxes.inside_box(image_size, boundary_threshold),
        }
    }

    pub fn scale(&self, scale_x: f64, scale_y: f64) -> Self {
        match self {
            Self::Boxes(boxes) => Self::Boxes(boxes.scale(scale_x, scale_y)),
            Self::Rotated(boxes) => Self::Rotated(boxes.scale(scale_x, scale_y)),
        }
    }

    pub fn device(&self) -> Device {
        self.tensor().device()
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        match self {
            Self::Boxes(boxes) => Self::Boxes(boxes.slice(range)),
            Self::Rotated(boxes) => Self::Rotated(boxes.slice(range)),
        }
    }

    /// Concatenate box lists that share one representation.
    pub fn cat<B>(boxes: &[B]) -> Result<Self>
    where
        B: Borrow<BoxTensor>,
    {
        let first = boxes
            .first()
            .ok_or_else(|| format_err!("cannot concatenate an empty list of boxes"))?
            .borrow();
        let tensors: Vec<_> = boxes
            .iter()
            .map(|boxes| {
                let boxes = boxes.borrow();
                ensure!(
                    boxes.box_dim() == first.box_dim(),
                    "cannot concatenate axis-aligned and rotated boxes"
                );
                Ok(boxes.tensor())
            })
            .try_collect()?;
        Self::new(Tensor::f_cat(&tensors, 0)?)
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        let indexed = match self {
            Self::Boxes(boxes) => Self::Boxes(boxes.f_index(index)?),
            Self::Rotated(boxes) => Self::Rotated(boxes.f_index(index)?),
        };
        Ok(indexed)
    }

    /// IoU matrix of two lists of the same representation.
    pub fn pairwise_iou(lhs: &Self, rhs: &Self) -> Result<Tensor> {
        let iou = match (lhs, rhs) {
            (Self::Boxes(lhs), Self::Boxes(rhs)) => Boxes::pairwise_iou(lhs, rhs),
            (Self::Rotated(lhs), Self::Rotated(rhs)) => RotatedBoxes::pairwise_iou(lhs, rhs),
            _ => bail!("cannot compute IoU between axis-aligned and rotated boxes"),
        };
        Ok(iou)
    }
}
