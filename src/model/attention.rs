use candle::{D, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::{init, tensor_ext::TensorExt};

/// Attention pooling over the sequence axis with an optional validity mask.
#[derive(Clone, Debug)]
pub struct Attention {
    linear1: Linear,
    linear2: Linear,
}

impl Attention {
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let linear1 = init::linear(input_size, hidden_size, vb.pp("linear1"))?;
        let linear2 = init::linear(hidden_size, 1, vb.pp("linear2"))?;
        Ok(Self { linear1, linear2 })
    }

    /// xs: (batch, len, d), mask: u8 (batch, len) with 1 on valid positions.
    /// Returns (batch, d).
    ///
    /// A row with no valid position is pooled with uniform weights.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let scores = self.linear1.forward(xs)?.tanh()?;
        let scores = self.linear2.forward(&scores)?;

        let scores = match mask {
            Some(mask) => {
                let mask = mask.unsqueeze(D::Minus1)?;
                let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.shape(), scores.device())?
                    .to_dtype(scores.dtype())?;
                let scores = mask.where_cond(&scores, &neg_inf)?;
                let empty_rows = mask.max_keepdim(1)?.eq(0u8)?.broadcast_as(scores.shape())?;
                empty_rows.where_cond(&scores.zeros_like()?, &scores)?
            }
            None => scores,
        };

        let weights = scores.softmax(1)?;
        weights.broadcast_mul(xs)?.sum(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    fn attention(dev: &Device) -> Result<Attention> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        Ok(Attention::new(6, 4, vb)?)
    }

    #[test]
    fn full_mask_is_a_no_op() -> Result<()> {
        let dev = &Device::Cpu;
        let attention = attention(dev)?;
        let xs = Tensor::randn(0f32, 1., (2, 5, 6), dev)?;
        let mask = Tensor::ones((2, 5), DType::U8, dev)?;
        let masked = attention.forward(&xs, Some(&mask))?;
        let unmasked = attention.forward(&xs, None)?;
        assert_eq!(masked.dims(), &[2, 6]);
        assert_eq!(masked.to_vec2::<f32>()?, unmasked.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn masked_positions_get_no_weight() -> Result<()> {
        let dev = &Device::Cpu;
        let attention = attention(dev)?;
        let xs = Tensor::randn(0f32, 1., (1, 5, 6), dev)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 0, 0]], dev)?;
        let masked = attention.forward(&xs, Some(&mask))?;
        let prefix = attention.forward(&xs.i((.., ..3, ..))?.contiguous()?, None)?;
        assert!(max_abs_diff(&masked, &prefix)? < 1e-5);
        Ok(())
    }

    #[test]
    fn fully_masked_row_pools_uniformly() -> Result<()> {
        let dev = &Device::Cpu;
        let attention = attention(dev)?;
        let xs = Tensor::randn(0f32, 1., (2, 4, 6), dev)?;
        let mask = Tensor::new(&[[0u8, 0, 0, 0], [1, 1, 1, 1]], dev)?;
        let out = attention.forward(&xs, Some(&mask))?;
        let mean = xs.i(0)?.mean(0)?;
        assert!(max_abs_diff(&out.i(0)?, &mean)? < 1e-5);
        assert!(out.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| v.is_finite()));
        Ok(())
    }
}
