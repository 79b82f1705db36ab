//! Proposal generators producing candidate object boxes from feature maps.

mod rpn;
mod rpn_head;

pub use rpn::*;
pub use rpn_head::*;

use crate::{
    common::*,
    structures::{ImageList, InstancesList},
};

/// A region proposal network over axis-aligned or rotated anchors.
#[derive(Debug)]
pub enum ProposalGenerator {
    Rpn(Rpn),
    Rrpn(Rrpn),
}

impl ProposalGenerator {
    pub fn forward_t(
        &self,
        images: &ImageList,
        features: &FeatureMap,
        gt_instances: Option<&InstancesList>,
        train: bool,
    ) -> Result<(InstancesList, LossDict)> {
        match self {
            Self::Rpn(rpn) => rpn.forward_t(images, features, gt_instances, train),
            Self::Rrpn(rrpn) => rrpn.forward_t(images, features, gt_instances, train),
        }
    }
}
