//! Parameter construction with the initializers the network was trained with.
//!
//! candle's layer helpers default to Kaiming initialization; these builders
//! request Xavier-normal weights and torch-style uniform biases instead. The
//! hints only matter for a fresh [`VarMap`]; weights loaded from a checkpoint
//! ignore them.

use candle::{DType, Device, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, LSTM, LSTMConfig, Linear, VarBuilder, VarMap};

pub fn xavier_normal(fan_in: usize, fan_out: usize) -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: (2.0 / (fan_in + fan_out) as f64).sqrt(),
    }
}

/// torch's default bias initialization, uniform in ±1/sqrt(fan_in).
pub fn fan_in_uniform(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

pub fn matrix(rows: usize, cols: usize, name: &str, vb: &VarBuilder) -> Result<Tensor> {
    vb.get_with_hints((rows, cols), name, xavier_normal(cols, rows))
}

pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", xavier_normal(in_dim, out_dim))?;
    let bias = vb.get_with_hints(out_dim, "bias", fan_in_uniform(in_dim))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Linear layer whose weight is drawn from uniform [0, 1).
pub fn linear_uniform(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform { lo: 0.0, up: 1.0 },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", fan_in_uniform(in_dim))?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let receptive = kernel_size * kernel_size;
    let weight = vb.get_with_hints(
        (out_channels, in_channels, kernel_size, kernel_size),
        "weight",
        xavier_normal(in_channels * receptive, out_channels * receptive),
    )?;
    let bias = vb.get_with_hints(
        out_channels,
        "bias",
        fan_in_uniform(in_channels * receptive),
    )?;
    Ok(Conv2d::new(weight, Some(bias), Conv2dConfig::default()))
}

pub fn lstm(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<LSTM> {
    let bias = fan_in_uniform(hidden_dim);
    let config = LSTMConfig {
        w_ih_init: bias,
        w_hh_init: bias,
        b_ih_init: Some(bias),
        b_hh_init: Some(bias),
        ..Default::default()
    };
    candle_nn::lstm(in_dim, hidden_dim, config, vb)
}

/// Names of the LSTM matrices below `prefix` that are re-drawn orthogonal.
pub fn lstm_weight_names(prefix: &str) -> [String; 2] {
    [
        format!("{prefix}.weight_ih_l0"),
        format!("{prefix}.weight_hh_l0"),
    ]
}

/// Overwrites a 2-d variable of `varmap` in place with a random orthogonal
/// matrix. Layers built from the same map see the new values.
pub fn set_orthogonal(varmap: &VarMap, name: &str) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle::Error::Msg("variable map lock poisoned".to_string()))?;
    let var = data
        .get(name)
        .ok_or_else(|| candle::Error::Msg(format!("no variable named {name}")))?;
    let (rows, cols) = var.dims2()?;
    let weight = orthogonal(rows, cols, var.dtype(), var.device())?;
    var.set(&weight)
}

/// Random (semi-)orthogonal matrix: orthonormal columns when `rows >= cols`,
/// orthonormal rows otherwise.
pub fn orthogonal(rows: usize, cols: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let transposed = rows < cols;
    let (n, m) = if transposed { (cols, rows) } else { (rows, cols) };

    let gaussian = Tensor::randn(0f32, 1f32, (m, n), &Device::Cpu)?.to_vec2::<f32>()?;
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(m);
    for column in gaussian {
        let mut v: Vec<f64> = column.into_iter().map(f64::from).collect();
        for q in &basis {
            let proj: f64 = v.iter().zip(q).map(|(a, b)| a * b).sum();
            v.iter_mut().zip(q).for_each(|(a, b)| *a -= proj * b);
        }
        let norm = v.iter().map(|a| a * a).sum::<f64>().sqrt();
        if norm < 1e-10 {
            candle::bail!("degenerate draw while building an orthogonal matrix")
        }
        v.iter_mut().for_each(|a| *a /= norm);
        basis.push(v);
    }

    // basis holds the m orthonormal columns of an n x m matrix.
    let flat: Vec<f32> = if transposed {
        basis.iter().flatten().map(|&a| a as f32).collect()
    } else {
        (0..n)
            .flat_map(|i| basis.iter().map(move |q| q[i] as f32))
            .collect()
    };
    Tensor::from_vec(flat, (rows, cols), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}
