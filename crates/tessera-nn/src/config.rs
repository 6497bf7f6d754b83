//! Structured configuration for the fully-connected layer.

use serde::{Deserialize, Serialize};
use tessera_core::{Initializer, Result, TesseraError};

use crate::weight::WeightRegularizer;

/// Settings resolved before [`finalize`](crate::Layer::finalize).
///
/// Missing fields take their defaults when deserializing:
///
/// ```
/// use tessera_nn::FullyConnectedConfig;
///
/// let cfg: FullyConnectedConfig = serde_json::from_str(r#"{"unit": 8, "lora_rank": 2}"#).unwrap();
/// assert_eq!(cfg.unit, 8);
/// assert!(!cfg.disable_bias);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullyConnectedConfig {
    /// Output features.
    pub unit: usize,
    /// LoRA rank; 0 disables the low-rank path.
    pub lora_rank: usize,
    pub weight_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub weight_regularizer: WeightRegularizer,
    pub weight_regularizer_constant: f32,
    pub weight_decay: f32,
    pub bias_decay: f32,
    pub disable_bias: bool,
}

impl Default for FullyConnectedConfig {
    fn default() -> Self {
        Self {
            unit: 0,
            lora_rank: 0,
            weight_initializer: Initializer::XavierUniform,
            bias_initializer: Initializer::Zeros,
            weight_regularizer: WeightRegularizer::None,
            weight_regularizer_constant: 1.0,
            weight_decay: 0.0,
            bias_decay: 0.0,
            disable_bias: false,
        }
    }
}

impl FullyConnectedConfig {
    pub fn new(unit: usize) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }

    pub fn with_lora_rank(mut self, rank: usize) -> Self {
        self.lora_rank = rank;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.disable_bias = true;
        self
    }

    pub fn with_weight_initializer(mut self, init: Initializer) -> Self {
        self.weight_initializer = init;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit == 0 {
            return Err(TesseraError::InvalidConfig("unit must be positive".into()));
        }
        for (name, v) in [
            ("weight_regularizer_constant", self.weight_regularizer_constant),
            ("weight_decay", self.weight_decay),
            ("bias_decay", self.bias_decay),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(TesseraError::InvalidConfig(format!("{name} must be finite and non-negative, got {v}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FullyConnectedConfig::default();
        assert_eq!(cfg.weight_initializer, Initializer::XavierUniform);
        assert_eq!(cfg.bias_initializer, Initializer::Zeros);
        assert_eq!(cfg.weight_regularizer_constant, 1.0);
        assert!(cfg.validate().is_err());
        assert!(FullyConnectedConfig::new(4).validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let cfg = FullyConnectedConfig::new(3)
            .with_lora_rank(2)
            .without_bias()
            .with_weight_initializer(Initializer::HeNormal);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"he_normal\""));
        let back: FullyConnectedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_negative_decay_rejected() {
        let mut cfg = FullyConnectedConfig::new(2);
        cfg.weight_decay = -0.1;
        assert!(matches!(cfg.validate(), Err(TesseraError::InvalidConfig(_))));
    }
}
