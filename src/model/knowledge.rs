use candle::{D, IndexOp, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::{init, tensor_ext::TensorExt};

const SELECTOR_EPS: f64 = 1e-6;

/// Context turns, most recent first, scored against every knowledge snippet.
pub const SELECTOR_TURNS: usize = 3;

/// Relevance of each snippet of `context` to `key` after mean pooling both
/// over their token axes.
///
/// key: (batch, len, d), context: (batch, num, len, d). Returns (batch, num).
pub fn utterance_selector(key: &Tensor, context: &Tensor) -> Result<Tensor> {
    let key = key.mean(1)?;
    let context = context.mean(2)?;
    let dot = context.broadcast_mul(&key.unsqueeze(1)?)?.sum(D::Minus1)?;
    let norms = context
        .l2_norm(D::Minus1)?
        .squeeze(D::Minus1)?
        .broadcast_mul(&key.l2_norm(D::Minus1)?)?;
    dot / (norms + SELECTOR_EPS)?
}

/// Gates knowledge snippets by a learned combination of their relevance to
/// the goal and to the last [`SELECTOR_TURNS`] context turns.
#[derive(Clone, Debug)]
pub struct KnowledgeSelector {
    linear_score: Linear,
}

impl KnowledgeSelector {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let linear_score = init::linear_uniform(SELECTOR_TURNS + 1, 1, vb.pp("linear_score"))?;
        Ok(Self { linear_score })
    }

    /// u_emb: (batch, turns, seq_len, d), g_emb: (batch, goal_len, d),
    /// k_emb: (batch, num, knowledge_len, d).
    ///
    /// Returns the gated knowledge embeddings and the (batch, num) match score.
    pub fn forward(
        &self,
        u_emb: &Tensor,
        g_emb: &Tensor,
        k_emb: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let turns = u_emb.dim(1)?;
        if turns < SELECTOR_TURNS {
            candle::bail!("knowledge selection needs {SELECTOR_TURNS} context turns, got {turns}")
        }

        let mut scores = vec![utterance_selector(g_emb, k_emb)?];
        for i in 1..=SELECTOR_TURNS {
            let utterance = u_emb.i((.., turns - i))?;
            scores.push(utterance_selector(&utterance, k_emb)?);
        }
        // (batch, num, SELECTOR_TURNS + 1)
        let scores = Tensor::stack(&scores, D::Minus1)?;
        let match_score = self
            .linear_score
            .forward(&scores)?
            .squeeze(D::Minus1)?
            .sigmoid()?;

        let gate = match_score.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
        let k_emb = k_emb.broadcast_mul(&gate)?;
        Ok((k_emb, match_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle::{DType, Device, test_utils};
    use candle_nn::VarMap;

    #[test]
    fn selector_is_cosine_of_means() -> Result<()> {
        let dev = &Device::Cpu;
        let key = Tensor::new(&[[[1f32, 0.], [1., 2.]]], dev)?;
        let context = Tensor::new(&[[[[0f32, 2.], [0., 4.]], [[-3., -3.], [-1., -3.]]]], dev)?;
        let scores = utterance_selector(&key, &context)?;
        // mean key (1, 1); mean snippets (0, 3) and (-2, -3).
        let expected = [
            3.0 / (2f32.sqrt() * 3.0),
            -5.0 / (2f32.sqrt() * 13f32.sqrt()),
        ];
        let scores = scores.to_vec2::<f32>()?;
        for (score, expected) in scores[0].iter().zip(expected) {
            assert!((score - expected).abs() < 1e-5, "{score} != {expected}");
        }
        Ok(())
    }

    #[test]
    fn match_scores_gate_knowledge() -> Result<()> {
        let dev = &Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let selector = KnowledgeSelector::new(vb)?;

        let u_emb = Tensor::randn(0f32, 1., (2, 4, 5, 6), dev)?;
        let g_emb = Tensor::randn(0f32, 1., (2, 3, 6), dev)?;
        let k_emb = Tensor::randn(0f32, 1., (2, 7, 4, 6), dev)?;
        let (gated, scores) = selector.forward(&u_emb, &g_emb, &k_emb)?;
        assert_eq!(gated.dims(), k_emb.dims());
        assert_eq!(scores.dims(), &[2, 7]);
        for score in scores.flatten_all()?.to_vec1::<f32>()? {
            assert!(score > 0.0 && score < 1.0, "{score}");
        }

        let expected = k_emb.broadcast_mul(&scores.unsqueeze(2)?.unsqueeze(3)?)?;
        assert_eq!(
            test_utils::to_vec3_round(&gated.flatten_to(1)?, 5)?,
            test_utils::to_vec3_round(&expected.flatten_to(1)?, 5)?
        );
        Ok(())
    }
}
