use anyhow::{bail, Result};
use indexmap::IndexMap;
use rcnn_dl::{
    config::Config,
    model::{GeneralizedRcnnHeads, RcnnOutput},
    structures::{BitMasks, ImageList, Instances, InstancesList, ShapeSpec},
    FeatureMap,
};
use tch::{nn, Device, IndexOp, Kind, Tensor};
use tch_goodies::{Boxes, ImageSize, ImageSizeExt as _};

const CONFIG: &str = r#"{
    // a small mask R-CNN on a single stride-8 feature
    model: {
        mask_on: true,
        anchor_generator: { sizes: [[16, 32]], aspect_ratios: [[0.5, 1.0, 2.0]] },
        rpn: {
            in_features: ["p3"],
            batch_size_per_image: 32,
            pre_nms_topk_train: 200,
            post_nms_topk_train: 50,
            pre_nms_topk_test: 200,
            post_nms_topk_test: 50,
        },
        roi_heads: {
            name: "StandardROIHeads",
            num_classes: 3,
            in_features: ["p3"],
            batch_size_per_image: 32,
        },
        roi_box_head: { pooler_resolution: 4, num_fc: 1, fc_dim: 32 },
        roi_mask_head: { pooler_resolution: 4, num_conv: 1, conv_dim: 8 },
    },
    test: { detections_per_image: 20 },
}"#;

fn build() -> Result<(nn::VarStore, GeneralizedRcnnHeads)> {
    let _ = pretty_env_logger::try_init();
    let config: Config = json5::from_str(CONFIG)?;
    let shapes: IndexMap<_, _> = vec![("p3".to_string(), ShapeSpec::new(16, 8))]
        .into_iter()
        .collect();
    let vs = nn::VarStore::new(Device::Cpu);
    let model = GeneralizedRcnnHeads::new(&vs.root(), &config, &shapes)?;
    Ok((vs, model))
}

fn inputs() -> Result<(ImageList, FeatureMap)> {
    tch::manual_seed(3);
    let images = ImageList::from_tensors(
        &[
            Tensor::rand(&[3, 64, 64], (Kind::Float, Device::Cpu)),
            Tensor::rand(&[3, 56, 64], (Kind::Float, Device::Cpu)),
        ],
        8,
        0.0,
    )?;
    let mut features = FeatureMap::new();
    features.insert(
        "p3".into(),
        Tensor::randn(&[2, 16, 8, 8], (Kind::Float, Device::Cpu)),
    );
    Ok((images, features))
}

fn targets(images: &ImageList) -> Result<InstancesList> {
    images
        .image_sizes()
        .iter()
        .map(|&size| -> Result<_> {
            let masks = Tensor::zeros(&[2, size.h(), size.w()], (Kind::Bool, Device::Cpu));
            let _ = masks.i((0, 8..30, 6..34)).fill_(1i64);
            let _ = masks.i((1, 30..50, 36..60)).fill_(1i64);
            let instances = Instances::new(size)
                .with(
                    "gt_boxes",
                    Boxes::from_xyxy(&[[6.0, 8.0, 34.0, 30.0], [36.0, 30.0, 60.0, 50.0]])?,
                )?
                .with("gt_classes", Tensor::of_slice(&[0i64, 2]))?
                .with("gt_masks", BitMasks::new(masks)?)?;
            Ok(instances)
        })
        .collect::<Result<Vec<_>>>()
        .map(InstancesList::new)
}

#[test]
fn training_produces_all_losses() -> Result<()> {
    let (vs, model) = build()?;
    let (images, features) = inputs()?;
    let targets = targets(&images)?;

    let losses = match model.forward_t(&images, &features, Some(&targets), true)? {
        RcnnOutput::Losses(losses) => losses,
        RcnnOutput::Detections(_) => bail!("expect losses in training"),
    };
    let keys: Vec<_> = losses.keys().map(|key| key.as_str()).collect();
    assert_eq!(
        keys,
        ["loss_rpn_cls", "loss_rpn_loc", "loss_cls", "loss_box_reg", "loss_mask"]
    );

    let total = losses
        .values()
        .fold(Tensor::zeros(&[], (Kind::Float, Device::Cpu)), |sum, loss| sum + loss);
    assert!(f64::from(&total).is_finite());

    // gradients reach the parameters
    total.backward();
    let num_with_grad = vs
        .trainable_variables()
        .iter()
        .filter(|var| var.grad().defined())
        .count();
    assert!(num_with_grad > 0);
    Ok(())
}

#[test]
fn training_requires_targets() -> Result<()> {
    let (_vs, model) = build()?;
    let (images, features) = inputs()?;
    assert!(model.forward_t(&images, &features, None, true).is_err());
    Ok(())
}

#[test]
fn inference_rescales_detections() -> Result<()> {
    let (_vs, model) = build()?;
    let (images, features) = inputs()?;
    let output_sizes = [ImageSize::new_size(128, 128)?, ImageSize::new_size(112, 128)?];

    let detections = tch::no_grad(|| model.inference(&images, &features, Some(&output_sizes)))?;
    assert_eq!(detections.len(), 2);

    for (instances, size) in detections.iter().zip(&output_sizes) {
        assert_eq!(instances.image_size(), size);
        assert!(instances.len() <= 20);
        if instances.is_empty() {
            continue;
        }
        let boxes = instances.get_boxes("pred_boxes")?.tensor();
        assert!(bool::from(boxes.ge(0.0).all()));
        assert!(bool::from(boxes.i((.., 2)).le(size.w() as f64).all()));
        assert!(bool::from(boxes.i((.., 3)).le(size.h() as f64).all()));

        let masks = instances.get_tensor("pred_masks")?;
        assert_eq!(masks.kind(), Kind::Bool);
        assert_eq!(masks.size(), vec![instances.len(), size.h(), size.w()]);

        let scores = Vec::<f32>::from(instances.get_tensor("scores")?);
        assert!(scores.iter().all(|&score| score > 0.05));
    }
    Ok(())
}

#[test]
fn forward_keeps_input_sizes_in_inference() -> Result<()> {
    let (_vs, model) = build()?;
    let (images, features) = inputs()?;

    let detections = match tch::no_grad(|| model.forward_t(&images, &features, None, false))? {
        RcnnOutput::Detections(detections) => detections,
        RcnnOutput::Losses(_) => bail!("expect detections in inference"),
    };
    for (instances, size) in detections.iter().zip(images.image_sizes()) {
        assert_eq!(instances.image_size(), size);
    }

    Ok(())
}
