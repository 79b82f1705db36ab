use crate::common::*;

/// Per-instance binary masks with shape `[N, H, W]`.
#[derive(Debug, TensorLike, Getters)]
pub struct BitMasks {
    #[get = "pub"]
    tensor: Tensor,
}

impl BitMasks {
    pub fn new(tensor: Tensor) -> Result<Self> {
        ensure!(
            tensor.dim() == 3,
            "expect a [N, H, W] mask tensor, but get shape {:?}",
            tensor.size()
        );
        Ok(Self {
            tensor: tensor.to_kind(Kind::Bool),
        })
    }

    pub fn len(&self) -> i64 {
        self.tensor.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn image_size(&self) -> (i64, i64) {
        let size = self.tensor.size();
        (size[1], size[2])
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        Self {
            tensor: self.tensor.i(range),
        }
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.f_select_rows(index)?,
        })
    }

    pub fn cat<M>(masks: &[M]) -> Result<Self>
    where
        M: Borrow<BitMasks>,
    {
        let tensors: Vec<_> = masks.iter().map(|m| m.borrow().tensor()).collect();
        ensure!(!tensors.is_empty(), "cannot concatenate an empty list of masks");
        Self::new(Tensor::f_cat(&tensors, 0)?)
    }

    /// Whether each mask has at least one foreground pixel.
    pub fn nonempty(&self) -> Tensor {
        self.tensor.flatten(1, 2).any_dim(1, false)
    }

    pub fn area(&self) -> Tensor {
        self.tensor.sum_dim_intlist(&[1, 2], false, Kind::Int64)
    }

    /// Tight boxes around the foreground pixels, or zeros for empty masks.
    pub fn get_bounding_boxes(&self) -> Result<Boxes> {
        let n = self.len();
        let device = self.tensor.device();
        if n == 0 {
            return Ok(Boxes::empty(device));
        }
        let (height, width) = self.image_size();

        let extent = |any: Tensor, size: i64| {
            // any: [N, size]
            let coords = Tensor::arange(size, (Kind::Float, device)).view([1, size]);
            let big = Tensor::from(size as f32).to_device(device);
            let low = coords
                .where_self(&any, &big.expand_as(&coords))
                .min_dim(1, false)
                .0;
            let high = (&coords + 1.0)
                .where_self(&any, &Tensor::zeros(&[1, size], (Kind::Float, device)))
                .max_dim(1, false)
                .0;
            let nonempty = any.any_dim(1, false);
            let zeros = Tensor::zeros(&[n], (Kind::Float, device));
            (
                low.where_self(&nonempty, &zeros),
                high.where_self(&nonempty, &zeros),
            )
        };

        let (x1, x2) = extent(self.tensor.any_dim(1, false), width);
        let (y1, y2) = extent(self.tensor.any_dim(2, false), height);
        Boxes::new(Tensor::stack(&[x1, y1, x2, y2], 1))
    }

    /// Crop each mask by its box and resize to `mask_size x mask_size`.
    ///
    /// Uses aligned ROIAlign with adaptive sampling, then thresholds at 0.5.
    pub fn crop_and_resize(&self, boxes: &Tensor, mask_size: i64) -> Result<Tensor> {
        ensure!(
            boxes.size() == vec![self.len(), 4],
            "expect [{}, 4] boxes, but get {:?}",
            self.len(),
            boxes.size()
        );
        let device = self.tensor.device();
        if self.is_empty() {
            return Ok(Tensor::zeros(
                &[0, mask_size, mask_size],
                (Kind::Bool, device),
            ));
        }
        let batch_inds = Tensor::arange(self.len(), (Kind::Float, device)).view([-1, 1]);
        let rois = Tensor::cat(&[batch_inds, boxes.to_kind(Kind::Float).to_device(device)], 1);
        let output = roi_align(
            &self.tensor.to_kind(Kind::Float).unsqueeze(1),
            &rois,
            (mask_size, mask_size),
            1.0,
            0,
            true,
        )?;
        Ok(output.squeeze_dim(1).ge(0.5))
    }
}

/// Per-instance polygon masks. Each instance is a union of polygons in image coordinates.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct PolygonMasks {
    #[get = "pub"]
    polygons: Vec<Vec<Polygon<f64>>>,
}

impl PolygonMasks {
    pub fn new(polygons: Vec<Vec<Polygon<f64>>>) -> Result<Self> {
        for instance in &polygons {
            for polygon in instance {
                ensure!(
                    polygon.len() >= 3,
                    "a polygon must have at least 3 points, but get {}",
                    polygon.len()
                );
            }
        }
        Ok(Self { polygons })
    }

    /// Build from COCO-style flat coordinate lists.
    pub fn from_flat(instances: &[Vec<Vec<f64>>]) -> Result<Self> {
        let polygons: Vec<Vec<_>> = instances
            .iter()
            .map(|polygons| {
                polygons
                    .iter()
                    .map(|coords| Polygon::try_from_flat(coords))
                    .try_collect()
            })
            .try_collect()?;
        Self::new(polygons)
    }

    pub fn len(&self) -> i64 {
        self.polygons.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        let len = self.polygons.len();
        let start = (range.start.max(0) as usize).min(len);
        let end = (range.end.max(0) as usize).min(len).max(start);
        Self {
            polygons: self.polygons[start..end].to_vec(),
        }
    }

    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        let indices = index_to_vec(index, self.len())?;
        let polygons = indices
            .into_iter()
            .map(|i| self.polygons[i as usize].clone())
            .collect();
        Ok(Self { polygons })
    }

    pub fn cat<M>(masks: &[M]) -> Self
    where
        M: Borrow<PolygonMasks>,
    {
        let polygons = masks
            .iter()
            .flat_map(|m| m.borrow().polygons.iter().cloned())
            .collect();
        Self { polygons }
    }

    /// Sum of polygon areas per instance.
    pub fn area(&self) -> Tensor {
        let areas: Vec<f32> = self
            .polygons
            .iter()
            .map(|instance| instance.iter().map(|p| p.area()).sum::<f64>() as f32)
            .collect();
        Tensor::of_slice(&areas)
    }

    pub fn nonempty(&self) -> Tensor {
        let nonempty: Vec<bool> = self.polygons.iter().map(|p| !p.is_empty()).collect();
        Tensor::of_slice(&nonempty)
    }

    pub fn get_bounding_boxes(&self) -> Result<Boxes> {
        let boxes: Vec<[f32; 4]> = self
            .polygons
            .iter()
            .map(|instance| {
                instance
                    .iter()
                    .filter_map(|polygon| polygon.bounding_box())
                    .fold(None, |acc: Option<[f64; 4]>, bbox| {
                        let [x1, y1, x2, y2] = bbox.xyxy();
                        Some(match acc {
                            None => [x1, y1, x2, y2],
                            Some([ax1, ay1, ax2, ay2]) => {
                                [ax1.min(x1), ay1.min(y1), ax2.max(x2), ay2.max(y2)]
                            }
                        })
                    })
                    .map(|[x1, y1, x2, y2]| [x1 as f32, y1 as f32, x2 as f32, y2 as f32])
                    .unwrap_or([0.0; 4])
            })
            .collect();
        let flat: Vec<f32> = boxes.iter().flatten().cloned().collect();
        Boxes::new(Tensor::of_slice(&flat).view([-1, 4]))
    }

    /// Rasterize each instance inside its box onto a `mask_size x mask_size` grid.
    ///
    /// Polygons are moved into the box frame and pixels are tested at their centers.
    pub fn crop_and_resize(&self, boxes: &Tensor, mask_size: i64) -> Result<Tensor> {
        ensure!(
            boxes.size() == vec![self.len(), 4],
            "expect [{}, 4] boxes, but get {:?}",
            self.len(),
            boxes.size()
        );
        let device = boxes.device();
        let boxes = Vec::<f64>::from(
            &boxes
                .detach()
                .to_kind(Kind::Double)
                .to_device(Device::Cpu)
                .contiguous()
                .view([-1]),
        );
        let size = mask_size as usize;
        let target = XYXY::from_xyxy([0.0, 0.0, mask_size as f64, mask_size as f64]);

        let transforms: Vec<_> = boxes
            .chunks(4)
            .map(|bbox| -> Result<_> {
                let w = (bbox[2] - bbox[0]).max(1e-5);
                let h = (bbox[3] - bbox[1]).max(1e-5);
                let source = XYXY::try_from_xywh([bbox[0], bbox[1], w, h])?;
                Ok(bbox::Transform::from_rects(&source, &target))
            })
            .try_collect()?;

        let masks: Vec<bool> = self
            .polygons
            .iter()
            .zip(transforms.iter())
            .flat_map(|(instance, transform)| {
                let local: Vec<_> = instance.iter().map(|p| p.transform(transform)).collect();

                iproduct!(0..size, 0..size).map(move |(row, col)| {
                    let x = col as f64 + 0.5;
                    let y = row as f64 + 0.5;
                    local.iter().any(|p| p.contains(x, y))
                })
            })
            .collect();

        Ok(Tensor::of_slice(&masks)
            .view([self.len(), mask_size, mask_size])
            .to_device(device))
    }
}

pub(crate) fn index_to_vec(index: &Tensor, len: i64) -> Result<Vec<i64>> {
    let index = index.to_device(Device::Cpu);
    let indices = match index.kind() {
        Kind::Bool => {
            ensure!(
                index.size() == vec![len],
                "mask length {:?} does not match length {}",
                index.size(),
                len
            );
            Vec::<i64>::from(&index.nonzero_1d())
        }
        Kind::Int64 => Vec::<i64>::from(&index.view([-1])),
        kind => bail!("index tensor must be bool or int64, but get {:?}", kind),
    };
    let indices: Vec<_> = indices
        .into_iter()
        .map(|i| if i < 0 { i + len } else { i })
        .collect();
    ensure!(
        indices.iter().all(|&i| (0..len).contains(&i)),
        "index out of range for length {}",
        len
    );
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_masks_bounding_boxes() -> Result<()> {
        let tensor = Tensor::zeros(&[2, 6, 8], (Kind::Bool, Device::Cpu));
        let _ = tensor.i((0, 1..4, 2..5)).fill_(1i64);
        let masks = BitMasks::new(tensor)?;
        let boxes = Vec::<f32>::from(&masks.get_bounding_boxes()?.tensor().view([-1]));
        assert_eq!(boxes, vec![2.0, 1.0, 5.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(Vec::<bool>::from(&masks.nonempty()), vec![true, false]);
        assert_eq!(Vec::<i64>::from(&masks.area()), vec![9, 0]);
        Ok(())
    }

    #[test]
    fn bit_masks_crop_and_resize() -> Result<()> {
        let tensor = Tensor::zeros(&[1, 10, 10], (Kind::Bool, Device::Cpu));
        let _ = tensor.i((0, 0..10, 0..5)).fill_(1i64);
        let masks = BitMasks::new(tensor)?;
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 10.0, 10.0]).view([1, 4]);
        let cropped = masks.crop_and_resize(&boxes, 4)?;
        assert_eq!(cropped.size(), vec![1, 4, 4]);
        let row = Vec::<bool>::from(&cropped.i((0, 0)));
        assert_eq!(row, vec![true, true, false, false]);
        Ok(())
    }

    #[test]
    fn polygon_masks_ops() -> Result<()> {
        let masks = PolygonMasks::from_flat(&[
            vec![vec![0.0, 0.0, 4.0, 0.0, 4.0, 4.0, 0.0, 4.0]],
            vec![
                vec![10.0, 10.0, 12.0, 10.0, 12.0, 12.0],
                vec![20.0, 20.0, 22.0, 20.0, 22.0, 22.0],
            ],
        ])?;
        assert_eq!(masks.len(), 2);
        assert_eq!(Vec::<f32>::from(&masks.area()), vec![16.0, 4.0]);

        let boxes = Vec::<f32>::from(&masks.get_bounding_boxes()?.tensor().view([-1]));
        assert_eq!(boxes, vec![0.0, 0.0, 4.0, 4.0, 10.0, 10.0, 22.0, 22.0]);

        let picked = masks.f_index(&Tensor::of_slice(&[false, true]))?;
        assert_eq!(picked.len(), 1);
        let cat = PolygonMasks::cat(&[&masks, &picked]);
        assert_eq!(cat.len(), 3);
        assert_eq!(masks.slice(1..5).len(), 1);
        Ok(())
    }

    #[test]
    fn polygon_masks_crop_and_resize() -> Result<()> {
        // the left half of the box is covered
        let masks = PolygonMasks::from_flat(&[vec![vec![
            10.0, 10.0, 15.0, 10.0, 15.0, 20.0, 10.0, 20.0,
        ]]])?;
        let boxes = Tensor::of_slice(&[10.0f32, 10.0, 20.0, 20.0]).view([1, 4]);
        let cropped = masks.crop_and_resize(&boxes, 4)?;
        let row = Vec::<bool>::from(&cropped.i((0, 2)));
        assert_eq!(row, vec![true, true, false, false]);
        Ok(())
    }
}
