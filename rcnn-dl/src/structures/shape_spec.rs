use crate::common::*;

/// Shape metadata of a feature map produced by the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub channels: Option<i64>,
    pub height: Option<i64>,
    pub width: Option<i64>,
    pub stride: Option<i64>,
}

impl ShapeSpec {
    pub fn new(channels: i64, stride: i64) -> Self {
        Self {
            channels: Some(channels),
            stride: Some(stride),
            ..Default::default()
        }
    }

    /// Channels times height times width, counting missing dimensions as 1.
    pub fn prod(&self) -> i64 {
        [self.channels, self.height, self.width]
            .iter()
            .map(|dim| dim.unwrap_or(1))
            .product()
    }

    pub fn try_channels(&self) -> Result<i64> {
        self.channels
            .ok_or_else(|| format_err!("the channels of the shape spec is not set"))
    }

    pub fn try_stride(&self) -> Result<i64> {
        self.stride
            .ok_or_else(|| format_err!("the stride of the shape spec is not set"))
    }
}

/// Look up the shapes of `in_features` and require them to share a channel count.
pub fn shared_channels(shapes: &IndexMap<String, ShapeSpec>, in_features: &[String]) -> Result<i64> {
    let channels: Vec<i64> = in_features
        .iter()
        .map(|name| {
            shapes
                .get(name)
                .ok_or_else(|| format_err!("feature '{}' is not produced by the backbone", name))?
                .try_channels()
        })
        .try_collect()?;

    let first = *channels
        .first()
        .ok_or_else(|| format_err!("at least one input feature is required"))?;
    ensure!(
        channels.iter().all(|&c| c == first),
        "each level must have the same channel, but get {:?}",
        channels
    );
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_spec_prod() {
        let spec = ShapeSpec {
            channels: Some(256),
            height: Some(7),
            width: Some(7),
            stride: None,
        };
        assert_eq!(spec.prod(), 256 * 49);
        assert_eq!(ShapeSpec::new(64, 4).prod(), 64);
    }

    #[test]
    fn shared_channels_mismatch() {
        let shapes: IndexMap<_, _> = vec![
            ("p2".to_string(), ShapeSpec::new(256, 4)),
            ("p3".to_string(), ShapeSpec::new(128, 8)),
        ]
        .into_iter()
        .collect();
        assert!(shared_channels(&shapes, &["p2".into(), "p3".into()]).is_err());
        assert!(shared_channels(&shapes, &["p4".into()]).is_err());
        assert_eq!(shared_channels(&shapes, &["p3".into()]).unwrap(), 128);
    }
}
