use super::Instances;
use crate::common::*;

/// Instances of a batch of images, one entry per image.
#[derive(Debug)]
pub struct InstancesList(Vec<Instances>);

impl InstancesList {
    pub fn new(list: Vec<Instances>) -> Self {
        Self(list)
    }

    pub fn into_inner(self) -> Vec<Instances> {
        self.0
    }

    pub fn image_sizes(&self) -> Vec<ImageSize> {
        self.0.iter().map(|inst| *inst.image_size()).collect()
    }

    /// The number of instances of each image.
    pub fn len_vec(&self) -> Vec<i64> {
        self.0.iter().map(|inst| inst.len()).collect()
    }

    /// Collect one tensor field from every image.
    pub fn get_tensor_vec(&self, name: &str) -> Result<Vec<Tensor>> {
        self.0
            .iter()
            .map(|inst| Ok(inst.get_tensor(name)?.shallow_clone()))
            .try_collect()
    }

    /// Collect one box field from every image.
    pub fn get_boxes_vec(&self, name: &str) -> Result<Vec<BoxTensor>> {
        self.0
            .iter()
            .map(|inst| Ok(inst.get_boxes(name)?.shallow_clone()))
            .try_collect()
    }

    pub fn shallow_clone(&self) -> Self {
        Self(self.0.iter().map(|inst| inst.shallow_clone()).collect())
    }
}

impl Deref for InstancesList {
    type Target = [Instances];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<Instances> for InstancesList {
    fn from_iter<T: IntoIterator<Item = Instances>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for InstancesList {
    type Item = Instances;
    type IntoIter = std::vec::IntoIter<Instances>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<Instances>> for InstancesList {
    fn from(from: Vec<Instances>) -> Self {
        Self(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_fields() -> Result<()> {
        let list: InstancesList = [3i64, 0]
            .iter()
            .map(|&n| -> Result<_> {
                Instances::new(ImageSize::new_size(8, 6)?)
                    .with("scores", Tensor::ones(&[n], (Kind::Float, Device::Cpu)))
            })
            .collect::<Result<Vec<_>>>()?
            .into();

        assert_eq!(list.len(), 2);
        assert_eq!(list.len_vec(), vec![3, 0]);
        assert_eq!(list.image_sizes()[1].w(), 6);
        let scores = list.get_tensor_vec("scores")?;
        assert_eq!(scores[0].size(), vec![3]);
        assert!(list.get_boxes_vec("scores").is_err());
        Ok(())
    }
}
