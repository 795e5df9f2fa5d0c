use candle::{Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Conv2d, Linear, VarBuilder};

use crate::{config::KpnConfig, init, model::transformer::TransformerBlock, tensor_ext::TensorExt};

/// The stacked similarity grid is divided by the square root of this.
const SIMILARITY_SCALE: f64 = 200.0;

/// Matches the candidate response against the speaker's own earlier
/// responses and the positions they answered.
///
/// Odd context turns are previous responses, even turns (except the last)
/// the positions before them, and the last turn is the query. Every stream
/// goes through the shared self-attention stack; snapshot `i` of each pair of
/// streams is then cross-attended by cross block `i`.
#[derive(Clone, Debug)]
pub struct StyleMatcher {
    self_attention: Vec<TransformerBlock>,
    cross_attention: Vec<TransformerBlock>,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    affine: Linear,
}

/// Number of (previous position, previous response) pairs for `turns`
/// context turns.
pub fn style_pairs(turns: usize) -> usize {
    turns / 2
}

impl StyleMatcher {
    pub fn new(config: &KpnConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.emb_size;
        let norm = config.transformer_layer_norm;
        let self_attention = (0..config.n_layer)
            .map(|i| TransformerBlock::new(d, norm, vb.pp(format!("self_attention.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let cross_attention = (0..=config.n_layer)
            .map(|i| TransformerBlock::new(d, norm, vb.pp(format!("cross_attention.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let channels = 2 * (config.n_layer + 1);
        let conv1 = init::conv2d(channels, 16, 3, vb.pp("conv1"))?;
        let conv2 = init::conv2d(16, 32, 3, vb.pp("conv2"))?;
        let conv3 = init::conv2d(32, 64, 3, vb.pp("conv3"))?;
        let affine = init::linear(config.style_match_features(), d, vb.pp("affine"))?;

        Ok(Self {
            self_attention,
            cross_attention,
            conv1,
            conv2,
            conv3,
            affine,
        })
    }

    /// u_emb: (batch, turns, seq_len, d), r_emb: (batch, resp_len, d).
    /// Returns (batch * turns / 2, d), pairs of one example kept together.
    pub fn forward(&self, u_emb: &Tensor, r_emb: &Tensor) -> Result<Tensor> {
        let (batch, turns, seq_len, d) = u_emb.dims4()?;
        let pairs = style_pairs(turns);
        if pairs == 0 {
            candle::bail!("style matching needs at least two context turns, got {turns}")
        }

        let select = |offset: usize| -> Result<Tensor> {
            let index = turn_index(pairs, offset, u_emb.device())?;
            u_emb
                .index_select(&index, 1)?
                .reshape((batch * pairs, seq_len, d))
        };
        let mut pre_res = select(1)?;
        let mut pre_pos = select(0)?;
        let mut query = u_emb.i((.., turns - 1))?;
        let mut res = r_emb.clone();

        let mut pre_res_stack = vec![pre_res.clone()];
        let mut pre_pos_stack = vec![pre_pos.clone()];
        let mut res_stack = vec![res.repeat_batch(pairs)?];
        let mut query_stack = vec![query.repeat_batch(pairs)?];

        for block in &self.self_attention {
            pre_res = block.forward(&pre_res, &pre_res, &pre_res)?;
            pre_pos = block.forward(&pre_pos, &pre_pos, &pre_pos)?;
            res = block.forward(&res, &res, &res)?;
            query = block.forward(&query, &query, &query)?;

            pre_res_stack.push(pre_res.clone());
            pre_pos_stack.push(pre_pos.clone());
            res_stack.push(res.repeat_batch(pairs)?);
            query_stack.push(query.repeat_batch(pairs)?);
        }

        let mut pre_res_cross = Vec::with_capacity(self.cross_attention.len());
        let mut res_cross = Vec::with_capacity(self.cross_attention.len());
        for (i, block) in self.cross_attention.iter().enumerate() {
            pre_res_cross.push(block.forward(
                &pre_res_stack[i],
                &pre_pos_stack[i],
                &pre_pos_stack[i],
            )?);
            res_cross.push(block.forward(&res_stack[i], &query_stack[i], &query_stack[i])?);
        }
        res_stack.extend(res_cross);
        pre_res_stack.extend(pre_res_cross);

        // (batch * pairs, channels, resp_len, seq_len)
        let res_stack = Tensor::stack(&res_stack, 1)?;
        let pre_res_stack = Tensor::stack(&pre_res_stack, 1)?;
        let m = (res_stack.matmul(&pre_res_stack.t()?)? / SIMILARITY_SCALE.sqrt())?;

        let z = self.conv1.forward(&m)?.relu()?.max_pool2d(2)?;
        let z = self.conv2.forward(&z)?.relu()?.max_pool2d(2)?;
        let z = self.conv3.forward(&z)?.relu()?.max_pool2d(3)?;
        let z = z.flatten_from(1)?;

        self.affine.forward(&z)?.tanh()
    }
}

/// Turn indices `offset, offset + 2, ...`, `pairs` of them.
fn turn_index(pairs: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let index: Vec<u32> = (0..pairs).map(|i| (2 * i + offset) as u32).collect();
    Tensor::new(index, device)
}
