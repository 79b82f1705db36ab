use crate::common::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupNormInit {
    pub num_groups: i64,
    pub eps: R64,
    pub affine: bool,
}

impl Default for GroupNormInit {
    fn default() -> Self {
        Self {
            num_groups: 32,
            eps: r64(1e-5),
            affine: true,
        }
    }
}

impl GroupNormInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: i64) -> Result<GroupNorm> {
        let path = path.borrow();
        let Self {
            num_groups,
            eps,
            affine,
        } = self;

        ensure!(num_groups > 0, "num_groups must be positive");
        ensure!(
            out_dim % num_groups == 0,
            "channels {} is not divisible by num_groups {}",
            out_dim,
            num_groups
        );

        let (ws, bs) = if affine {
            (
                Some(path.var("weight", &[out_dim], nn::Init::Const(1.0))),
                Some(path.var("bias", &[out_dim], nn::Init::Const(0.0))),
            )
        } else {
            (None, None)
        };

        Ok(GroupNorm {
            ws,
            bs,
            num_groups,
            eps: eps.raw(),
        })
    }
}

#[derive(Debug)]
pub struct GroupNorm {
    ws: Option<Tensor>,
    bs: Option<Tensor>,
    eps: f64,
    num_groups: i64,
}

impl nn::ModuleT for GroupNorm {
    fn forward_t(&self, input: &Tensor, _train: bool) -> Tensor {
        let Self {
            ref ws,
            ref bs,
            eps,
            num_groups,
        } = *self;

        Tensor::group_norm(input, num_groups, ws.as_ref(), bs.as_ref(), eps, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn group_norm_normalizes_groups() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let norm = GroupNormInit {
            num_groups: 2,
            ..Default::default()
        }
        .build(&root / "gn", 4)?;

        let input = Tensor::randn(&[3, 4, 5, 5], (Kind::Float, Device::Cpu)) * 7.0 + 3.0;
        let output = norm.forward_t(&input, true);
        let group = output.view([3, 2, -1]);
        assert_abs_diff_eq!(
            f64::from(group.mean_dim(&[2], false, Kind::Float).abs().max()),
            0.0,
            epsilon = 1e-4
        );

        assert!(GroupNormInit::default().build(&root / "bad", 12).is_err());
        Ok(())
    }
}
