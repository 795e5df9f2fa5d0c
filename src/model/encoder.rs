use candle::{Result, Tensor};
use candle_nn::{LSTM, RNN, VarBuilder};

use crate::init;

/// Unidirectional single-layer LSTM over (batch, seq, features) inputs.
#[derive(Debug)]
pub struct SequenceEncoder {
    rnn: LSTM,
}

impl SequenceEncoder {
    pub fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let rnn = init::lstm(in_dim, hidden_dim, vb)?;
        Ok(Self { rnn })
    }

    /// Hidden state at every step, (batch, seq, hidden).
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.contiguous()?;
        let states = self.rnn.seq(&xs)?;
        self.rnn.states_to_tensor(&states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device, IndexOp, test_utils};
    use candle_nn::VarMap;

    #[test]
    fn encodes_every_step() -> Result<()> {
        let dev = &Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let encoder = SequenceEncoder::new(4, 3, vb)?;

        let xs = Tensor::randn(0f32, 1., (2, 5, 4), dev)?;
        let ys = encoder.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 5, 3]);

        // Outputs are causal: a prefix encodes to the same states.
        let prefix = encoder.forward(&xs.i((.., ..2, ..))?)?;
        assert_eq!(
            test_utils::to_vec3_round(&prefix, 5)?,
            test_utils::to_vec3_round(&ys.i((.., ..2, ..))?, 5)?
        );
        Ok(())
    }
}
