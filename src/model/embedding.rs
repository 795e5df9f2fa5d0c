use candle::{D, Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, VarBuilder};

use crate::{config::KpnConfig, model::norm::LayerNorm};

/// Token lookup followed by layer normalization and dropout.
///
/// Id 0 is padding. Padding positions are zeroed after the lookup, so the padding row of the
/// table neither contributes to the output nor receives gradient.
#[derive(Clone, Debug)]
pub struct TokenEmbedding {
    embedding: Embedding,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl TokenEmbedding {
    pub fn new(config: &KpnConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.pp("embedding").get_with_hints(
            (vocab_size, config.emb_size),
            "weight",
            candle_nn::init::ZERO,
        )?;
        let embedding = Embedding::new(weight, config.emb_size);
        let layer_norm = LayerNorm::new(config.emb_size, vb.pp("layer_norm"))?;
        let dropout = Dropout::new(config.dropout);

        Ok(Self {
            embedding,
            layer_norm,
            dropout,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.embeddings().dims()[0]
    }

    /// ids of any rank -> (..., emb_size).
    pub fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.embedding.forward(ids)?;
        let keep = ids
            .ne(&ids.zeros_like()?)?
            .to_dtype(xs.dtype())?
            .unsqueeze(D::Minus1)?;
        let xs = xs.broadcast_mul(&keep)?;
        let xs = self.layer_norm.forward(&xs)?;
        self.dropout.forward(&xs, train)
    }
}
