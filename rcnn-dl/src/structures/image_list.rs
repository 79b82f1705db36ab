use crate::common::*;

/// A batch of images padded to a common size, with their true sizes.
#[derive(Debug, TensorLike, Getters)]
pub struct ImageList {
    #[get = "pub"]
    tensor: Tensor,
    #[tensor_like(clone)]
    #[get = "pub"]
    image_sizes: Vec<ImageSize>,
}

impl ImageList {
    /// Pad `[C, H, W]` images to the largest size, rounded up to `size_divisibility`.
    pub fn from_tensors<T>(images: &[T], size_divisibility: i64, pad_value: f64) -> Result<Self>
    where
        T: Borrow<Tensor>,
    {
        ensure!(!images.is_empty(), "at least one image is required");
        ensure!(size_divisibility >= 0, "size_divisibility must be non-negative");

        let shapes: Vec<(i64, i64, i64)> = images
            .iter()
            .map(|image| image.borrow().size3())
            .try_collect()?;
        let channels = shapes[0].0;
        ensure!(
            shapes.iter().all(|&(c, _, _)| c == channels),
            "all images must have the same number of channels"
        );

        let round_up = |size: i64| {
            if size_divisibility > 1 {
                (size + size_divisibility - 1) / size_divisibility * size_divisibility
            } else {
                size
            }
        };
        let max_h = round_up(shapes.iter().map(|&(_, h, _)| h).max().unwrap_or(0));
        let max_w = round_up(shapes.iter().map(|&(_, _, w)| w).max().unwrap_or(0));

        let padded: Vec<_> = images
            .iter()
            .zip(shapes.iter())
            .map(|(image, &(_, h, w))| {
                image
                    .borrow()
                    .f_constant_pad_nd(&[0, max_w - w, 0, max_h - h])
                    .map(|padded| {
                        if pad_value != 0.0 {
                            let mask = Tensor::ones(&[h, w], (Kind::Bool, padded.device()))
                                .constant_pad_nd(&[0, max_w - w, 0, max_h - h]);
                            padded.where_self(&mask, &padded.full_like(pad_value))
                        } else {
                            padded
                        }
                    })
            })
            .try_collect()?;

        let image_sizes: Vec<_> = shapes
            .iter()
            .map(|&(_, h, w)| ImageSize::new_size(h, w))
            .try_collect()?;

        Ok(Self {
            tensor: Tensor::stack(&padded, 0),
            image_sizes,
        })
    }

    pub fn from_parts(tensor: Tensor, image_sizes: Vec<ImageSize>) -> Result<Self> {
        let (batch_size, _, height, width) = tensor.size4()?;
        ensure!(
            batch_size == image_sizes.len() as i64,
            "batch size {} does not match {} image sizes",
            batch_size,
            image_sizes.len()
        );
        ensure!(
            image_sizes
                .iter()
                .all(|size| size.h() <= height && size.w() <= width),
            "image sizes must fit in the padded tensor"
        );
        Ok(Self {
            tensor,
            image_sizes,
        })
    }

    pub fn len(&self) -> usize {
        self.image_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sizes.is_empty()
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    /// The `index`-th image cropped to its true size.
    pub fn get(&self, index: usize) -> Tensor {
        let size = &self.image_sizes[index];
        self.tensor
            .get(index as i64)
            .i((.., 0..size.h(), 0..size.w()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_list_padding() -> Result<()> {
        let images = vec![
            Tensor::ones(&[3, 5, 7], (Kind::Float, Device::Cpu)),
            Tensor::ones(&[3, 9, 4], (Kind::Float, Device::Cpu)),
        ];
        let list = ImageList::from_tensors(&images, 4, 0.0)?;
        assert_eq!(list.tensor().size(), vec![2, 3, 12, 8]);
        assert_eq!(list.image_sizes()[1].hw(), [9, 4]);
        assert_eq!(list.get(0).size(), vec![3, 5, 7]);

        let total = f64::from(list.tensor().sum(Kind::Float));
        assert_abs_diff_eq!(total, 3.0 * (35.0 + 36.0));
        Ok(())
    }
}
