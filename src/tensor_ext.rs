use candle::{D, IndexOp, Result, Tensor, shape::Dim};

const SQUARED_NORM_FLOOR: f64 = 1e-24;

pub trait TensorExt {
    fn size(&self, dim: usize) -> usize;
    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor>;
    fn sigmoid(&self) -> Result<Tensor>;
    fn l2_norm<D: Dim>(&self, dim: D) -> Result<Tensor>;
    fn unit<D: Dim>(&self, dim: D, eps: f64) -> Result<Tensor>;
    fn last_step(&self) -> Result<Tensor>;
    fn repeat_batch(&self, n: usize) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn size(&self, dim: usize) -> usize {
        self.dims()[dim]
    }

    fn softmax<D: Dim>(&self, dim: D) -> Result<Tensor> {
        candle_nn::ops::softmax(self, dim)
    }

    fn sigmoid(&self) -> Result<Tensor> {
        candle_nn::ops::sigmoid(self)
    }

    /// Euclidean norm over `dim`, keeping the reduced axis. The squared norm
    /// is floored before the root, so all-zero rows get a zero gradient.
    fn l2_norm<D: Dim>(&self, dim: D) -> Result<Tensor> {
        self.sqr()?
            .sum_keepdim(dim)?
            .maximum(SQUARED_NORM_FLOOR)?
            .sqrt()
    }

    /// Rescales to unit length over `dim`; norms below `eps` are clamped.
    fn unit<D: Dim>(&self, dim: D, eps: f64) -> Result<Tensor> {
        let norm = self.l2_norm(dim)?.maximum(eps)?;
        self.broadcast_div(&norm)
    }

    /// Last step of a (batch, seq, features) tensor.
    fn last_step(&self) -> Result<Tensor> {
        let (_, seq_len, _) = self.dims3()?;
        self.i((.., seq_len - 1, ..))
    }

    /// (batch, ...) -> (batch * n, ...), each row repeated `n` times in place.
    fn repeat_batch(&self, n: usize) -> Result<Tensor> {
        let mut dims = self.dims().to_vec();
        let mut repeats = vec![1; dims.len() + 1];
        repeats[1] = n;
        let xs = self.unsqueeze(1)?.repeat(repeats)?;
        dims[0] *= n;
        xs.reshape(dims)
    }
}

/// Cosine similarity between every row of `a` (batch, n, d) and every row of
/// `b` (batch, m, d), giving (batch, n, m).
pub fn pairwise_cosine(a: &Tensor, b: &Tensor, eps: f64) -> Result<Tensor> {
    let a = a.unit(D::Minus1, eps)?;
    let b = b.unit(D::Minus1, eps)?;
    a.matmul(&b.t()?)
}
