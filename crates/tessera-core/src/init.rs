//! Tensor initializers and the random samplers behind them.

use std::fmt;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::shape::TensorDim;

/// How a freshly allocated tensor is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Leave the zero-filled allocation untouched.
    #[default]
    None,
    Zeros,
    Ones,
    LecunNormal,
    LecunUniform,
    XavierNormal,
    XavierUniform,
    HeNormal,
    HeUniform,
}

/// Concrete fill chosen for an initializer on a given dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill {
    Keep,
    Constant(f32),
    Normal { mean: f32, stddev: f32 },
    Uniform { min: f32, max: f32 },
}

impl Initializer {
    /// Resolve this initializer against `dim`'s fan-in/fan-out.
    pub fn fill_for(&self, dim: &TensorDim) -> Fill {
        let (fan_in, fan_out) = fans(dim);
        let (fan_in, fan_out) = (fan_in as f32, fan_out as f32);
        match self {
            Initializer::None => Fill::Keep,
            Initializer::Zeros => Fill::Constant(0.0),
            Initializer::Ones => Fill::Constant(1.0),
            Initializer::LecunNormal => Fill::Normal {
                mean: 0.0,
                stddev: (1.0 / fan_in).sqrt(),
            },
            Initializer::XavierNormal => Fill::Normal {
                mean: 0.0,
                stddev: (2.0 / (fan_in + fan_out)).sqrt(),
            },
            Initializer::HeNormal => Fill::Normal {
                mean: 0.0,
                stddev: (2.0 / fan_in).sqrt(),
            },
            Initializer::LecunUniform => symmetric((1.0 / fan_in).sqrt()),
            Initializer::XavierUniform => symmetric((6.0 / (fan_in + fan_out)).sqrt()),
            Initializer::HeUniform => symmetric((6.0 / fan_in).sqrt()),
        }
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Initializer::None => "none",
            Initializer::Zeros => "zeros",
            Initializer::Ones => "ones",
            Initializer::LecunNormal => "lecun_normal",
            Initializer::LecunUniform => "lecun_uniform",
            Initializer::XavierNormal => "xavier_normal",
            Initializer::XavierUniform => "xavier_uniform",
            Initializer::HeNormal => "he_normal",
            Initializer::HeUniform => "he_uniform",
        };
        write!(f, "{s}")
    }
}

fn symmetric(limit: f32) -> Fill {
    Fill::Uniform {
        min: -limit,
        max: limit,
    }
}

/// Fan-in/fan-out heuristics.
///
/// A single row uses its width for both; a 2-D weight (b·c = 1) maps height
/// to fan-in and width to fan-out; anything else is treated as a filter bank.
pub fn fans(dim: &TensorDim) -> (usize, usize) {
    let (fan_in, fan_out) = if dim.batch() * dim.channel() * dim.height() == 1 {
        (dim.width(), dim.width())
    } else if dim.batch() * dim.channel() == 1 {
        (dim.height(), dim.width())
    } else {
        let field = dim.height() * dim.width();
        (dim.channel() * field, dim.batch() * field)
    };
    (fan_in.max(1), fan_out.max(1))
}

/// Draw `n` samples from N(mean, stddev²) with the Box-Muller transform.
pub fn sample_normal(rng: &mut dyn RngCore, n: usize, mean: f32, stddev: f32) -> Vec<f32> {
    (0..n)
        .map(|_| {
            let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
            let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
            mean + stddev * (-2.0 * u1.ln()).sqrt() * u2.cos()
        })
        .collect()
}

/// Draw `n` samples uniformly from `[min, max)`; a degenerate range yields `min`.
pub fn sample_uniform(rng: &mut dyn RngCore, n: usize, min: f32, max: f32) -> Vec<f32> {
    if max <= min {
        return vec![min; n];
    }
    (0..n).map(|_| rng.gen_range(min..max)).collect()
}

/// Draw `n` Bernoulli(p) samples as 0.0 / 1.0. `p` must already be in [0, 1].
pub fn sample_bernoulli(rng: &mut dyn RngCore, n: usize, p: f32) -> Vec<f32> {
    (0..n)
        .map(|_| if rng.gen_bool(p as f64) { 1.0 } else { 0.0 })
        .collect()
}
