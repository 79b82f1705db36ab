use super::{BitMasks, Keypoints, PolygonMasks};
use crate::common::*;

/// A per-instance field stored in [Instances].
#[derive(Debug)]
pub enum Sequence {
    Tensor(Tensor),
    Boxes(BoxTensor),
    BitMasks(BitMasks),
    PolygonMasks(PolygonMasks),
    Keypoints(Keypoints),
}

impl Sequence {
    pub fn len(&self) -> i64 {
        match self {
            Self::Tensor(tensor) => tensor.size().first().cloned().unwrap_or(1),
            Self::Boxes(boxes) => boxes.len(),
            Self::BitMasks(masks) => masks.len(),
            Self::PolygonMasks(masks) => masks.len(),
            Self::Keypoints(keypoints) => keypoints.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Boxes(BoxTensor::Boxes(_)) => "boxes",
            Self::Boxes(BoxTensor::Rotated(_)) => "rotated boxes",
            Self::BitMasks(_) => "bit masks",
            Self::PolygonMasks(_) => "polygon masks",
            Self::Keypoints(_) => "keypoints",
        }
    }

    pub fn shallow_clone(&self) -> Self {
        match self {
            Self::Tensor(tensor) => Self::Tensor(tensor.shallow_clone()),
            Self::Boxes(boxes) => Self::Boxes(boxes.shallow_clone()),
            Self::BitMasks(masks) => Self::BitMasks(masks.shallow_clone()),
            Self::PolygonMasks(masks) => Self::PolygonMasks(masks.clone()),
            Self::Keypoints(keypoints) => Self::Keypoints(keypoints.shallow_clone()),
        }
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        match self {
            Self::Tensor(tensor) => Self::Tensor(tensor.i(range)),
            Self::Boxes(boxes) => Self::Boxes(boxes.slice(range)),
            Self::BitMasks(masks) => Self::BitMasks(masks.slice(range)),
            Self::PolygonMasks(masks) => Self::PolygonMasks(masks.slice(range)),
            Self::Keypoints(keypoints) => Self::Keypoints(keypoints.slice(range)),
        }
    }

    /// Select elements by an int64 index or a bool mask.
    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        let indexed = match self {
            Self::Tensor(tensor) => Self::Tensor(tensor.f_select_rows(index)?),
            Self::Boxes(boxes) => Self::Boxes(boxes.f_index(index)?),
            Self::BitMasks(masks) => Self::BitMasks(masks.f_index(index)?),
            Self::PolygonMasks(masks) => Self::PolygonMasks(masks.f_index(index)?),
            Self::Keypoints(keypoints) => Self::Keypoints(keypoints.f_index(index)?),
        };
        Ok(indexed)
    }

    /// Concatenate sequences of one variant.
    pub fn cat<S>(sequences: &[S]) -> Result<Self>
    where
        S: Borrow<Sequence>,
    {
        let first = sequences
            .first()
            .ok_or_else(|| format_err!("cannot concatenate an empty list of sequences"))?
            .borrow();

        macro_rules! collect_variant {
            ($variant:ident) => {{
                let items: Vec<_> = sequences
                    .iter()
                    .map(|seq| match seq.borrow() {
                        Self::$variant(item) => Ok(item),
                        other => Err(format_err!(
                            "cannot concatenate {} with {}",
                            first.kind_name(),
                            other.kind_name()
                        )),
                    })
                    .try_collect()?;
                items
            }};
        }

        let output = match first {
            Self::Tensor(_) => {
                let tensors = collect_variant!(Tensor);
                Self::Tensor(Tensor::f_cat(&tensors, 0)?)
            }
            Self::Boxes(_) => Self::Boxes(BoxTensor::cat(&collect_variant!(Boxes))?),
            Self::BitMasks(_) => Self::BitMasks(BitMasks::cat(&collect_variant!(BitMasks))?),
            Self::PolygonMasks(_) => {
                Self::PolygonMasks(PolygonMasks::cat(&collect_variant!(PolygonMasks)))
            }
            Self::Keypoints(_) => Self::Keypoints(Keypoints::cat(&collect_variant!(Keypoints))?),
        };
        Ok(output)
    }

    pub fn to_device(&self, device: Device) -> Self {
        match self {
            Self::Tensor(tensor) => Self::Tensor(tensor.to_device(device)),
            Self::Boxes(boxes) => Self::Boxes(boxes.to_device(device)),
            Self::BitMasks(masks) => Self::BitMasks(masks.to_device(device)),
            Self::PolygonMasks(masks) => Self::PolygonMasks(masks.clone()),
            Self::Keypoints(keypoints) => Self::Keypoints(keypoints.to_device(device)),
        }
    }
}

impl From<Tensor> for Sequence {
    fn from(from: Tensor) -> Self {
        Self::Tensor(from)
    }
}

impl From<BoxTensor> for Sequence {
    fn from(from: BoxTensor) -> Self {
        Self::Boxes(from)
    }
}

impl From<Boxes> for Sequence {
    fn from(from: Boxes) -> Self {
        Self::Boxes(BoxTensor::Boxes(from))
    }
}

impl From<RotatedBoxes> for Sequence {
    fn from(from: RotatedBoxes) -> Self {
        Self::Boxes(BoxTensor::Rotated(from))
    }
}

impl From<BitMasks> for Sequence {
    fn from(from: BitMasks) -> Self {
        Self::BitMasks(from)
    }
}

impl From<PolygonMasks> for Sequence {
    fn from(from: PolygonMasks) -> Self {
        Self::PolygonMasks(from)
    }
}

impl From<Keypoints> for Sequence {
    fn from(from: Keypoints) -> Self {
        Self::Keypoints(from)
    }
}

/// Per-image collection of named fields that share one length.
///
/// Field order is the insertion order. The common field names are
/// `proposal_boxes`, `objectness_logits`, `gt_boxes`, `gt_classes`,
/// `gt_masks`, `gt_keypoints`, `pred_boxes`, `scores`, `pred_classes`,
/// `pred_masks` and `pred_keypoints`.
#[derive(Debug, Getters)]
pub struct Instances {
    #[get = "pub"]
    image_size: ImageSize,
    #[get = "pub"]
    fields: IndexMap<String, Sequence>,
}

impl Instances {
    pub fn new(image_size: ImageSize) -> Self {
        Self {
            image_size,
            fields: IndexMap::new(),
        }
    }

    /// The common length of all fields, 0 if there is no field.
    pub fn len(&self) -> i64 {
        self.fields.values().next().map(|seq| seq.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|name| name.as_str())
    }

    /// Insert or replace a field. Its length must agree with the existing fields.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Sequence>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        let expect_len = self
            .fields
            .iter()
            .find(|(key, _)| **key != name)
            .map(|(_, seq)| seq.len());
        if let Some(expect_len) = expect_len {
            ensure!(
                value.len() == expect_len,
                "adding a field '{}' of length {} to instances of length {}",
                name,
                value.len(),
                expect_len
            );
        }
        self.fields.insert(name, value);
        Ok(())
    }

    /// Builder-style [Instances::set].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Sequence>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn remove(&mut self, name: &str) -> Result<Sequence> {
        self.fields
            .shift_remove(name)
            .ok_or_else(|| format_err!("cannot delete the field '{}', it does not exist", name))
    }

    pub fn get(&self, name: &str) -> Result<&Sequence> {
        self.fields
            .get(name)
            .ok_or_else(|| format_err!("the field '{}' does not exist", name))
    }

    pub fn get_tensor(&self, name: &str) -> Result<&Tensor> {
        match self.get(name)? {
            Sequence::Tensor(tensor) => Ok(tensor),
            other => bail!("the field '{}' is {}, not a tensor", name, other.kind_name()),
        }
    }

    pub fn get_boxes(&self, name: &str) -> Result<&BoxTensor> {
        match self.get(name)? {
            Sequence::Boxes(boxes) => Ok(boxes),
            other => bail!("the field '{}' is {}, not boxes", name, other.kind_name()),
        }
    }

    pub fn get_bit_masks(&self, name: &str) -> Result<&BitMasks> {
        match self.get(name)? {
            Sequence::BitMasks(masks) => Ok(masks),
            other => bail!("the field '{}' is {}, not bit masks", name, other.kind_name()),
        }
    }

    pub fn get_keypoints(&self, name: &str) -> Result<&Keypoints> {
        match self.get(name)? {
            Sequence::Keypoints(keypoints) => Ok(keypoints),
            other => bail!("the field '{}' is {}, not keypoints", name, other.kind_name()),
        }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            image_size: self.image_size,
            fields: self
                .fields
                .iter()
                .map(|(name, seq)| (name.clone(), seq.shallow_clone()))
                .collect(),
        }
    }

    /// Keep the instances picked by an int64 index or a bool mask.
    pub fn f_index(&self, index: &Tensor) -> Result<Self> {
        let fields = self
            .fields
            .iter()
            .map(|(name, seq)| -> Result<_> {
                let indexed = seq
                    .f_index(index)
                    .with_context(|| format!("unable to index the field '{}'", name))?;
                Ok((name.clone(), indexed))
            })
            .try_collect()?;
        Ok(Self {
            image_size: self.image_size,
            fields,
        })
    }

    pub fn index(&self, index: &Tensor) -> Self {
        self.f_index(index).unwrap()
    }

    pub fn slice(&self, range: Range<i64>) -> Self {
        Self {
            image_size: self.image_size,
            fields: self
                .fields
                .iter()
                .map(|(name, seq)| (name.clone(), seq.slice(range.clone())))
                .collect(),
        }
    }

    /// Concatenate instances of one image size that carry the same field names.
    pub fn cat<I>(instances: &[I]) -> Result<Self>
    where
        I: Borrow<Instances>,
    {
        let first = instances
            .first()
            .ok_or_else(|| format_err!("cannot concatenate an empty list of instances"))?
            .borrow();
        if instances.len() == 1 {
            return Ok(first.shallow_clone());
        }
        ensure!(
            instances
                .iter()
                .all(|inst| inst.borrow().image_size == first.image_size),
            "cannot concatenate instances of different image sizes"
        );

        let fields = first
            .fields
            .keys()
            .map(|name| -> Result<_> {
                let sequences: Vec<_> = instances
                    .iter()
                    .map(|inst| inst.borrow().get(name))
                    .try_collect()?;
                let seq = Sequence::cat(&sequences)
                    .with_context(|| format!("unable to concatenate the field '{}'", name))?;
                Ok((name.clone(), seq))
            })
            .try_collect()?;

        Ok(Self {
            image_size: first.image_size,
            fields,
        })
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            image_size: self.image_size,
            fields: self
                .fields
                .iter()
                .map(|(name, seq)| (name.clone(), seq.to_device(device)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instances() -> Result<Instances> {
        let boxes = Boxes::from_xyxy(&[[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 3.0, 5.0], [2.0, 2.0, 6.0, 6.0]])?;
        Instances::new(ImageSize::new_size(10, 10)?)
            .with("gt_boxes", boxes)?
            .with("gt_classes", Tensor::of_slice(&[0i64, 2, 1]))
    }

    #[test]
    fn set_checks_length() -> Result<()> {
        let mut instances = sample_instances()?;
        assert_eq!(instances.len(), 3);
        assert!(instances
            .set("scores", Tensor::of_slice(&[0.5f32, 0.1]))
            .is_err());
        // overwriting an existing field keeps its position
        instances.set("gt_classes", Tensor::of_slice(&[1i64, 1, 1]))?;
        assert_eq!(
            instances.field_names().collect::<Vec<_>>(),
            vec!["gt_boxes", "gt_classes"]
        );
        assert!(instances.get_tensor("gt_boxes").is_err());
        assert!(instances.get("missing").is_err());
        Ok(())
    }

    #[test]
    fn index_slice_and_cat() -> Result<()> {
        let instances = sample_instances()?;

        let picked = instances.f_index(&Tensor::of_slice(&[2i64, 0]))?;
        assert_eq!(picked.len(), 2);
        assert_eq!(
            Vec::<i64>::from(picked.get_tensor("gt_classes")?),
            vec![1, 0]
        );

        let masked = instances.f_index(&Tensor::of_slice(&[false, true, false]))?;
        assert_eq!(masked.len(), 1);

        let sliced = instances.slice(1..3);
        let joined = Instances::cat(&[&instances, &sliced])?;
        assert_eq!(joined.len(), 5);
        assert_eq!(joined.get_boxes("gt_boxes")?.tensor().size(), vec![5, 4]);

        let mut removed = joined;
        removed.remove("gt_boxes")?;
        assert!(!removed.has("gt_boxes"));
        assert!(removed.remove("gt_boxes").is_err());
        Ok(())
    }

    #[test]
    fn cat_rejects_mixed_fields() -> Result<()> {
        let lhs = sample_instances()?;
        let rotated = RotatedBoxes::from_cxcywha(&[[1.0, 1.0, 2.0, 2.0, 0.0]])?;
        let rhs = Instances::new(ImageSize::new_size(10, 10)?)
            .with("gt_boxes", rotated)?
            .with("gt_classes", Tensor::of_slice(&[0i64]))?;
        assert!(Instances::cat(&[&lhs, &rhs]).is_err());

        let other_size = Instances::new(ImageSize::new_size(12, 10)?);
        assert!(Instances::cat(&[&lhs, &other_size]).is_err());
        Ok(())
    }
}
