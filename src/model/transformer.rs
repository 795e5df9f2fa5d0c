use candle::{D, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::{init, model::norm::LayerNorm, tensor_ext::TensorExt};

const SCALE_EPS: f64 = 1e-8;

/// Single-head residual attention block without projections or masking.
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    layer_norm: Option<LayerNorm>,
    linear1: Linear,
    linear2: Linear,
}

impl TransformerBlock {
    pub fn new(input_size: usize, is_layer_norm: bool, vb: VarBuilder) -> Result<Self> {
        let layer_norm = if is_layer_norm {
            Some(LayerNorm::new(input_size, vb.pp("layer_norm"))?)
        } else {
            None
        };
        let linear1 = init::linear(input_size, input_size, vb.pp("linear1"))?;
        let linear2 = init::linear(input_size, input_size, vb.pp("linear2"))?;

        Ok(Self {
            layer_norm,
            linear1,
            linear2,
        })
    }

    fn ffn(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.linear1.forward(x)?.relu()?;
        self.linear2.forward(&x)
    }

    fn norm(&self, x: Tensor) -> Result<Tensor> {
        match &self.layer_norm {
            Some(layer_norm) => layer_norm.forward(&x),
            None => Ok(x),
        }
    }

    /// q: (batch, lq, d), k and v: (batch, lk, d). Returns (batch, lq, d).
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let dk = q.size(q.rank() - 1).max(1) as f64;
        let scores = (q.matmul(&k.t()?)? / (dk.sqrt() + SCALE_EPS))?;
        let v_att = scores.softmax(D::Minus1)?.matmul(v)?;

        let x = self.norm((q + v_att)?)?;
        let x = (self.ffn(&x)? + x)?;
        self.norm(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_has_query_shape() -> Result<()> {
        let dev = &Device::Cpu;
        let q = Tensor::randn(0f32, 1., (2, 5, 8), dev)?;
        let kv = Tensor::randn(0f32, 1., (2, 7, 8), dev)?;
        for is_layer_norm in [false, true] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
            let block = TransformerBlock::new(8, is_layer_norm, vb)?;
            let out = block.forward(&q, &kv, &kv)?;
            assert_eq!(out.dims(), q.dims());
        }
        Ok(())
    }

    #[test]
    fn layer_norm_parameters_are_trained() -> Result<()> {
        let dev = &Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let block = TransformerBlock::new(4, true, vb)?;
        let q = Tensor::randn(0f32, 1., (2, 3, 4), dev)?;
        let loss = block.forward(&q, &q, &q)?.sqr()?.sum_all()?;
        let grads = loss.backward()?;

        for (name, var) in varmap.data().lock().unwrap().iter() {
            let grad = grads.get(var).expect(name);
            let grad = grad.flatten_all()?.to_vec1::<f32>()?;
            assert!(grad.iter().all(|g| g.is_finite()), "{name}");
        }
        assert!(grads.get(&varmap.data().lock().unwrap()["layer_norm.weight"]).is_some());
        Ok(())
    }

    #[test]
    fn zero_weights_reduce_to_residual_attention() -> Result<()> {
        let dev = &Device::Cpu;
        let block = TransformerBlock::new(2, false, VarBuilder::zeros(DType::F32, dev))?;
        // Single key: the attention weight is 1 whatever the score.
        let q = Tensor::new(&[[[1f32, 2.], [3., 4.]]], dev)?;
        let kv = Tensor::new(&[[[10f32, 20.]]], dev)?;
        let out = block.forward(&q, &kv, &kv)?;
        assert_eq!(out.to_vec3::<f32>()?, &[[[11., 22.], [13., 24.]]]);
        Ok(())
    }
}
