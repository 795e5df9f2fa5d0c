mod attention;
mod detector;
mod embedding;
mod encoder;
mod fusion;
mod knowledge;
mod matching;
mod norm;
mod style;
mod transformer;

use candle::{D, DType, Device, Module, Tensor, safetensors};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};

use crate::{
    config::{KpnConfig, Settings},
    error::{KpnError, Result},
    init,
    tensor_ext::TensorExt,
};

pub use self::{
    attention::Attention,
    detector::{UBER_GOAL_TURNS, goal_detector, uber_goal_detector},
    embedding::TokenEmbedding,
    encoder::SequenceEncoder,
    fusion::BranchScores,
    knowledge::{KnowledgeSelector, SELECTOR_TURNS, utterance_selector},
    matching::{MatchTarget, UrMatching, distance},
    norm::LayerNorm,
    style::{StyleMatcher, style_pairs},
    transformer::TransformerBlock,
};

/// Fewest context turns every branch can work with.
pub const MIN_CONTEXT_TURNS: usize = UBER_GOAL_TURNS + 1;

const SENTENCE_ENCODER: &str = "sentence_encoder";
const TURN_ENCODER: &str = "turn_encoder";

/// One batch of token ids. Every sequence axis is right-padded with id 0.
#[derive(Clone, Debug)]
pub struct Batch {
    /// (batch, turns, seq_len)
    pub context: Tensor,
    /// (batch, resp_len)
    pub response: Tensor,
    /// (batch, knowledge_num, knowledge_len)
    pub knowledge: Tensor,
    /// (batch, goal_len)
    pub goal: Tensor,
    /// Gold knowledge labels; accepted for interface compatibility and not
    /// used for scoring.
    pub ground_truth_knowledge: Option<Tensor>,
}

#[derive(Clone, Debug)]
pub struct KpnOutput {
    /// (batch,)
    pub logits: Tensor,
    /// (batch, knowledge_num), each in (0, 1).
    pub knowledge_scores: Tensor,
    pub scores: BranchScores,
}

#[derive(Debug)]
pub struct Kpn {
    config: KpnConfig,
    embedding: TokenEmbedding,
    knowledge_selector: KnowledgeSelector,
    sentence_encoder: SequenceEncoder,
    turn_encoder: SequenceEncoder,
    ur_matching: UrMatching,
    style_matcher: StyleMatcher,
    attention: Attention,
    affine_attn: Linear,
    out_response: Linear,
    out_style: Linear,
    out_knowledge: Linear,
    out_goal: Linear,
    out_uber_goal: Linear,
    dropout: Dropout,
}

impl Kpn {
    /// Builds the network from `vb`, whose embedding table has `vocab_size`
    /// rows.
    pub fn new(config: &KpnConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let emb = config.emb_size;
        let hidden = config.hidden_size;

        let embedding = TokenEmbedding::new(config, vocab_size, vb.clone())?;
        let knowledge_selector = KnowledgeSelector::new(vb.pp("knowledge_selector"))?;
        let sentence_encoder = SequenceEncoder::new(emb, hidden, vb.pp(SENTENCE_ENCODER))?;
        let turn_encoder = SequenceEncoder::new(hidden, hidden, vb.pp(TURN_ENCODER))?;
        let ur_matching = UrMatching::new(config, vb.pp("ur_matching"))?;
        let style_matcher = StyleMatcher::new(config, vb.pp("style_matcher"))?;
        let attention = Attention::new(emb, hidden, vb.pp("attention"))?;

        let affine_attn = init::linear(hidden, 1, vb.pp("affine_attn"))?;
        let out_response = init::linear(hidden, 1, vb.pp("out_response"))?;
        let out_style = init::linear(emb, 1, vb.pp("out_style"))?;
        let out_knowledge = init::linear(hidden, 1, vb.pp("out_knowledge"))?;
        let out_goal = init::linear(2 * hidden, 1, vb.pp("out_goal"))?;
        let out_uber_goal = init::linear(2 * hidden, 1, vb.pp("out_uber_goal"))?;

        Ok(Self {
            config: config.clone(),
            embedding,
            knowledge_selector,
            sentence_encoder,
            turn_encoder,
            ur_matching,
            style_matcher,
            attention,
            affine_attn,
            out_response,
            out_style,
            out_knowledge,
            out_goal,
            out_uber_goal,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Fresh trainable network around a pretrained (vocab_size, emb_size)
    /// embedding table. Both LSTMs get orthogonal weight matrices.
    pub fn init(config: &KpnConfig, embedding: &Tensor, device: &Device) -> Result<(Self, VarMap)> {
        let (vocab_size, width) = embedding.dims2()?;
        if width != config.emb_size {
            return Err(KpnError::Embedding {
                expected: config.emb_size,
                actual: width,
            });
        }

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vocab_size, vb)?;

        let embedding = embedding.to_dtype(DType::F32)?.to_device(device)?;
        varmap.set_one("embedding.weight", embedding)?;
        for prefix in [SENTENCE_ENCODER, TURN_ENCODER] {
            for name in init::lstm_weight_names(prefix) {
                init::set_orthogonal(&varmap, &name)?;
            }
        }

        tracing::info!(
            vocab_size,
            emb_size = config.emb_size,
            max_goal_len = config.max_goal_len,
            max_knowledge_num = config.max_knowledge_num,
            max_knowledge_len = config.max_knowledge_len,
            "initialized kpn"
        );
        Ok((model, varmap))
    }

    /// Builds a fresh network from `kpn.ini`-style settings, loading the
    /// pretrained embedding from a safetensors file.
    pub fn from_settings(settings: &Settings) -> Result<(Self, VarMap)> {
        let device = settings.device()?;
        let config = settings.model_config()?;
        let embedding = load_embedding(&settings.embedding, &settings.embedding_tensor, &device)?;
        Self::init(&config, &embedding, &device)
    }

    pub fn config(&self) -> &KpnConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    pub fn forward(&self, batch: &Batch) -> Result<KpnOutput> {
        self.forward_t(batch, false)
    }

    /// Scores every candidate response; dropout is active when `train` is set.
    pub fn forward_t(&self, batch: &Batch, train: bool) -> Result<KpnOutput> {
        self.check(batch)?;
        let config = &self.config;
        if batch.ground_truth_knowledge.is_some() {
            tracing::trace!("ignoring ground truth knowledge");
        }

        let context = pad_axis(&batch.context, 2, config.max_context_len)?;
        let response = pad_axis(&batch.response, 1, config.max_response_len)?;
        let knowledge = pad_axis(&batch.knowledge, 2, config.max_knowledge_len)?;
        tracing::debug!(
            context = ?batch.context.dims(),
            response = ?batch.response.dims(),
            knowledge = ?batch.knowledge.dims(),
            goal = ?batch.goal.dims(),
            padded_context = ?context.dims(),
            padded_response = ?response.dims(),
            padded_knowledge = ?knowledge.dims(),
            "kpn forward"
        );

        let u_emb = self.embedding.forward_t(&context, train)?;
        let r_emb = self.embedding.forward_t(&response, train)?;
        let k_emb = self.embedding.forward_t(&knowledge, train)?;
        let g_emb = self.embedding.forward_t(&batch.goal, train)?;

        let (b, turns, seq_len, emb) = u_emb.dims4()?;
        let (_, knowledge_num, knowledge_len, _) = k_emb.dims4()?;
        let hidden = config.hidden_size;

        let g_emb = goal_detector(&u_emb, &g_emb)?;
        let uber_g_emb = uber_goal_detector(&u_emb, &g_emb)?;
        let (k_emb, knowledge_scores) = self.knowledge_selector.forward(&u_emb, &g_emb, &k_emb)?;

        let bu = u_emb.reshape((b * turns, seq_len, emb))?;
        let bk = k_emb.reshape((b * knowledge_num, knowledge_len, emb))?;
        let bu_rnn = self.sentence_encoder.forward(&bu)?;
        let bk_rnn = self.sentence_encoder.forward(&bk)?;
        let r_rnn = self.sentence_encoder.forward(&r_emb)?;
        let g_rnn = self.sentence_encoder.forward(&g_emb)?;
        let uber_g_rnn = self.sentence_encoder.forward(&uber_g_emb)?;

        let response_score = {
            let br = r_emb.repeat_batch(turns)?;
            let br_rnn = r_rnn.repeat_batch(turns)?;
            let v = self
                .ur_matching
                .forward(&bu, &br, &bu_rnn, &br_rnn, MatchTarget::Context)?
                .reshape((b, turns, hidden))?;
            let h = self.turn_encoder.forward(&v)?.last_step()?;
            let h = self.dropout.forward(&h, train)?;
            self.out_response.forward(&h)?.squeeze(D::Minus1)?
        };

        let style_score = {
            let v = self
                .style_matcher
                .forward(&u_emb, &r_emb)?
                .reshape((b, style_pairs(turns), emb))?;
            let pooled = self.attention.forward(&v, None)?;
            let pooled = self.dropout.forward(&pooled, train)?;
            self.out_style.forward(&pooled)?.squeeze(D::Minus1)?
        };

        let knowledge_score = {
            let br = r_emb.repeat_batch(knowledge_num)?;
            let br_rnn = r_rnn.repeat_batch(knowledge_num)?;
            let v = self
                .ur_matching
                .forward(&bk, &br, &bk_rnn, &br_rnn, MatchTarget::Knowledge)?
                .reshape((b, knowledge_num, hidden))?;
            let weight = self
                .affine_attn
                .forward(&v)?
                .squeeze(D::Minus1)?
                .relu()?
                .softmax(D::Minus1)?;
            let pooled = weight.unsqueeze(1)?.matmul(&v)?.squeeze(1)?;
            let pooled = self.dropout.forward(&pooled, train)?;
            self.out_knowledge.forward(&pooled)?.squeeze(D::Minus1)?
        };

        let r_final = r_rnn.last_step()?;
        let goal_score = {
            let x = Tensor::cat(&[g_rnn.last_step()?, r_final.clone()], D::Minus1)?;
            self.out_goal.forward(&x)?.squeeze(D::Minus1)?
        };
        let uber_goal_score = {
            let x = Tensor::cat(&[uber_g_rnn.last_step()?, r_final], D::Minus1)?;
            self.out_uber_goal.forward(&x)?.squeeze(D::Minus1)?
        };

        let scores = BranchScores {
            response: response_score,
            style: style_score,
            knowledge: knowledge_score,
            goal: goal_score,
            uber_goal: uber_goal_score,
        };
        let logits = scores.fuse()?;

        Ok(KpnOutput {
            logits,
            knowledge_scores,
            scores,
        })
    }

    /// Rejects inputs whose rank, batch size or lengths do not fit the
    /// configuration, before any computation runs.
    fn check(&self, batch: &Batch) -> Result<()> {
        let config = &self.config;
        let context = dims::<3>("context", &batch.context, "(batch, turns, seq_len)")?;
        let response = dims::<2>("response", &batch.response, "(batch, resp_len)")?;
        let knowledge = dims::<3>(
            "knowledge",
            &batch.knowledge,
            "(batch, knowledge_num, knowledge_len)",
        )?;
        let goal = dims::<2>("goal", &batch.goal, "(batch, goal_len)")?;

        let b = context[0];
        for (input, xs) in [
            ("response", &batch.response),
            ("knowledge", &batch.knowledge),
            ("goal", &batch.goal),
        ] {
            if xs.dim(0)? != b {
                return Err(KpnError::Shape {
                    input,
                    expected: format!("batch size {b}"),
                    actual: xs.dims().to_vec(),
                });
            }
        }

        if context[1] < MIN_CONTEXT_TURNS {
            return Err(KpnError::TooFewTurns {
                actual: context[1],
                min: MIN_CONTEXT_TURNS,
            });
        }
        for (input, shape) in [("knowledge", &knowledge[..]), ("goal", &goal[..])] {
            if shape.contains(&0) {
                return Err(KpnError::Shape {
                    input,
                    expected: "non-empty axes".to_string(),
                    actual: shape.to_vec(),
                });
            }
        }

        let limits = [
            ("context", "seq_len", context[2], config.max_context_len),
            ("response", "resp_len", response[1], config.max_response_len),
            ("knowledge", "knowledge_num", knowledge[1], config.max_knowledge_num),
            ("knowledge", "knowledge_len", knowledge[2], config.max_knowledge_len),
            ("goal", "goal_len", goal[1], config.max_goal_len),
        ];
        for (input, axis, actual, max) in limits {
            if actual > max {
                return Err(KpnError::TooLong {
                    input,
                    axis,
                    max,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Reads a (vocab_size, emb_size) table stored under `name` in a safetensors
/// file.
pub fn load_embedding<P: AsRef<std::path::Path>>(
    path: P,
    name: &str,
    device: &Device,
) -> Result<Tensor> {
    let mut tensors = safetensors::load(path, device)?;
    let embedding = tensors
        .remove(name)
        .ok_or_else(|| candle::Error::CannotFindTensor {
            path: name.to_string(),
        })?;
    Ok(embedding)
}

fn dims<const N: usize>(
    input: &'static str,
    xs: &Tensor,
    expected: &'static str,
) -> Result<[usize; N]> {
    <[usize; N]>::try_from(xs.dims()).map_err(|_| KpnError::Shape {
        input,
        expected: expected.to_string(),
        actual: xs.dims().to_vec(),
    })
}

/// Right-pads `dim` of an id tensor with id 0 up to `len`.
fn pad_axis(ids: &Tensor, dim: usize, len: usize) -> candle::Result<Tensor> {
    let current = ids.dim(dim)?;
    if current < len {
        ids.pad_with_zeros(dim, 0, len - current)
    } else {
        Ok(ids.clone())
    }
}
