//! Goal suppression: goal tokens already expressed in the conversation are
//! scaled down by their best cosine match against the context tokens.

use candle::{D, Result, Tensor};

use crate::tensor_ext::pairwise_cosine;

const COSINE_EPS: f64 = 1e-8;

/// Turns seen by [`uber_goal_detector`]: the three before the most recent one.
pub const UBER_GOAL_TURNS: usize = 3;

/// u_emb: (batch, turns, seq_len, d), g_emb: (batch, goal_len, d).
///
/// Each goal token is multiplied by `1 - relu(max cosine similarity)` over
/// every context token.
pub fn goal_detector(u_emb: &Tensor, g_emb: &Tensor) -> Result<Tensor> {
    let (batch, turns, seq_len, d) = u_emb.dims4()?;
    let u_emb = u_emb.reshape((batch, turns * seq_len, d))?;

    // (batch, turns * seq_len, goal_len)
    let similarity = pairwise_cosine(&u_emb, g_emb, COSINE_EPS)?;
    let covered = similarity.max(1)?.relu()?;
    let keep = covered.affine(-1.0, 1.0)?;
    g_emb.broadcast_mul(&keep.unsqueeze(D::Minus1)?)
}

/// Same suppression restricted to turns `turns-4 .. turns-2`.
pub fn uber_goal_detector(u_emb: &Tensor, g_emb: &Tensor) -> Result<Tensor> {
    let turns = u_emb.dim(1)?;
    if turns < UBER_GOAL_TURNS + 1 {
        candle::bail!("uber goal detection needs {} context turns, got {turns}", UBER_GOAL_TURNS + 1)
    }
    let recent = u_emb.narrow(1, turns - UBER_GOAL_TURNS - 1, UBER_GOAL_TURNS)?;
    goal_detector(&recent, g_emb)
}
