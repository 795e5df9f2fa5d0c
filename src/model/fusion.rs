use candle::{Result, Tensor};

/// Per-branch scores, each shaped (batch,).
#[derive(Clone, Debug)]
pub struct BranchScores {
    /// Context-response matching accumulated over turns.
    pub response: Tensor,
    /// Personalized style matching.
    pub style: Tensor,
    /// Knowledge-response matching weighted over snippets.
    pub knowledge: Tensor,
    pub goal: Tensor,
    pub uber_goal: Tensor,
}

impl BranchScores {
    /// Unweighted mean of the response, style, knowledge and goal scores,
    /// where the goal score is itself the mean of `goal` and `uber_goal`.
    pub fn fuse(&self) -> Result<Tensor> {
        let goal = ((&self.goal + &self.uber_goal)? / 2.0)?;
        let sum = (((&self.response + &self.style)? + &self.knowledge)? + goal)?;
        sum / 4.0
    }
}
