use candle::{D, Module, Result, Tensor};
use candle_nn::{Conv2d, Linear, VarBuilder};

use crate::{config::KpnConfig, init, tensor_ext::TensorExt};

const DISTANCE_EPS: f64 = 1e-6;

/// Which sequence the response is matched against; each has its own
/// projection because the grids differ in size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchTarget {
    Context,
    Knowledge,
}

/// Bilinear and cosine similarity between the rows of `a` and `c`.
///
/// a: (n, la, d), b: (d, d), c: (n, lc, d). Both results are (n, la, lc).
pub fn distance(a: &Tensor, b: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
    let c_t = c.t()?;
    let m1 = a.broadcast_matmul(b)?.matmul(&c_t)?;

    let a_norm = a.l2_norm(D::Minus1)?;
    let c_norm = c.l2_norm(D::Minus1)?.t()?;
    let norms = a_norm.matmul(&c_norm)?;
    let m2 = a.matmul(&c_t)?.div(&(norms + DISTANCE_EPS)?)?;
    Ok((m1, m2))
}

/// Utterance-response matching: four similarity channels through two
/// convolution and pooling rounds into a fixed-width vector.
#[derive(Clone, Debug)]
pub struct UrMatching {
    a1: Tensor,
    a2: Tensor,
    conv1: Conv2d,
    conv2: Conv2d,
    affine_context: Linear,
    affine_knowledge: Linear,
}

impl UrMatching {
    pub fn new(config: &KpnConfig, vb: VarBuilder) -> Result<Self> {
        let a1 = init::matrix(config.emb_size, config.emb_size, "a1", &vb)?;
        let a2 = init::matrix(config.hidden_size, config.hidden_size, "a2", &vb)?;
        let conv1 = init::conv2d(4, 32, 3, vb.pp("conv1"))?;
        let conv2 = init::conv2d(32, 64, 3, vb.pp("conv2"))?;
        let affine_context = init::linear(
            config.context_match_features(),
            config.hidden_size,
            vb.pp("affine_context"),
        )?;
        let affine_knowledge = init::linear(
            config.knowledge_match_features(),
            config.hidden_size,
            vb.pp("affine_knowledge"),
        )?;

        Ok(Self {
            a1,
            a2,
            conv1,
            conv2,
            affine_context,
            affine_knowledge,
        })
    }

    /// key: (n, lk, emb), resp: (n, lr, emb), key_rnn: (n, lk, hidden),
    /// resp_rnn: (n, lr, hidden). Returns (n, hidden).
    pub fn forward(
        &self,
        key: &Tensor,
        resp: &Tensor,
        key_rnn: &Tensor,
        resp_rnn: &Tensor,
        target: MatchTarget,
    ) -> Result<Tensor> {
        let (m1, m2) = distance(key, &self.a1, resp)?;
        let (m3, m4) = distance(key_rnn, &self.a2, resp_rnn)?;
        let m = Tensor::stack(&[m1, m2, m3, m4], 1)?;

        let z = self.conv1.forward(&m)?.relu()?.max_pool2d(2)?;
        let z = self.conv2.forward(&z)?.relu()?.max_pool2d(2)?;
        let z = z.flatten_from(1)?;

        let affine = match target {
            MatchTarget::Context => &self.affine_context,
            MatchTarget::Knowledge => &self.affine_knowledge,
        };
        affine.forward(&z)?.tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn cosine_channel_is_bounded() -> Result<()> {
        let dev = &Device::Cpu;
        let a = Tensor::randn(0f32, 3., (3, 6, 8), dev)?;
        let b = Tensor::randn(0f32, 1., (8, 8), dev)?;
        let c = Tensor::randn(0f32, 0.5, (3, 4, 8), dev)?;
        let (m1, m2) = distance(&a, &b, &c)?;
        assert_eq!(m1.dims(), &[3, 6, 4]);
        assert_eq!(m2.dims(), &[3, 6, 4]);
        for v in m2.flatten_all()?.to_vec1::<f32>()? {
            assert!((-1.0..=1.0).contains(&v), "{v}");
        }
        Ok(())
    }

    #[test]
    fn bilinear_channel_with_identity_is_dot_product() -> Result<()> {
        let dev = &Device::Cpu;
        let a = Tensor::new(&[[[1f32, 2.], [0., 1.]]], dev)?;
        let b = Tensor::new(&[[1f32, 0.], [0., 1.]], dev)?;
        let c = Tensor::new(&[[[3f32, 4.]]], dev)?;
        let (m1, m2) = distance(&a, &b, &c)?;
        assert_eq!(m1.to_vec3::<f32>()?, &[[[11.], [4.]]]);
        let m2 = m2.to_vec3::<f32>()?;
        assert!((m2[0][0][0] - 11.0 / (5f32.sqrt() * 5.0)).abs() < 1e-5);
        assert!((m2[0][1][0] - 0.8).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn projects_both_grids() -> Result<()> {
        let dev = &Device::Cpu;
        let config = KpnConfig {
            emb_size: 8,
            hidden_size: 6,
            n_layer: 1,
            max_context_len: 14,
            max_response_len: 18,
            max_goal_len: 3,
            max_knowledge_num: 4,
            max_knowledge_len: 10,
            dropout: 0.0,
            transformer_layer_norm: false,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let matching = UrMatching::new(&config, vb)?;

        let resp = Tensor::randn(0f32, 1., (5, 18, 8), dev)?;
        let resp_rnn = Tensor::randn(0f32, 1., (5, 18, 6), dev)?;
        for (len, target) in [(14, MatchTarget::Context), (10, MatchTarget::Knowledge)] {
            let key = Tensor::randn(0f32, 1., (5, len, 8), dev)?;
            let key_rnn = Tensor::randn(0f32, 1., (5, len, 6), dev)?;
            let v = matching.forward(&key, &resp, &key_rnn, &resp_rnn, target)?;
            assert_eq!(v.dims(), &[5, 6]);
            for x in v.flatten_all()?.to_vec1::<f32>()? {
                assert!((-1.0..=1.0).contains(&x));
            }
        }
        Ok(())
    }
}
