//! Engine configuration.
//!
//! One [`ReductionConfig`] is fixed per model. Everything that varies by
//! layer (strategy, keep ratio, margin) lives in the
//! [`Schedule`](crate::schedule::Schedule) instead.

use crate::error::{ReductionError, Result};
use serde::{Deserialize, Serialize};

/// Which per-token signal ranks isolation-mode merge candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationScoring {
    /// Mean of the margin-sharpened cosine similarity to every token.
    Similarity,
    /// Attention weight supplied by the host for the current layer.
    /// Falls back to similarity when no attention is supplied.
    Attention,
}

/// Sort direction applied to isolation scores before taking candidates.
///
/// Each signal carries its own order in [`ReductionConfig`]: similarity is
/// usually ranked descending (most redundant first), attention ascending
/// (least attended first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    /// Highest score first.
    Descending,
    /// Lowest score first.
    Ascending,
}

/// Model-wide reduction settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// Token 0 is an aggregate (class) token that is never merged.
    pub class_token: bool,

    /// Track the `[B, T, T_original]` provenance matrix across layers.
    pub trace_source: bool,

    /// Margins at or above this value route isolation layers to
    /// bipartite matching.
    pub margin_fallback: f32,

    /// Divisor applied to `(similarity - margin)` before the ELU.
    pub temperature: f32,

    /// ELU `alpha` for the negative branch of the sharpened similarity.
    pub elu_alpha: f32,

    /// Signal used to rank isolation candidates.
    pub scoring: IsolationScoring,

    /// Sort direction when candidates are ranked by similarity.
    pub similarity_order: RankOrder,

    /// Sort direction when candidates are ranked by supplied attention.
    pub attention_order: RankOrder,

    /// Norm clamp used by L2 normalisation.
    pub eps: f32,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self::vision()
    }
}

impl ReductionConfig {
    /// Vision transformers: leading class token, ELU alpha 0.5.
    pub fn vision() -> Self {
        Self {
            class_token: true,
            trace_source: false,
            margin_fallback: 0.45,
            temperature: 0.01,
            elu_alpha: 0.5,
            scoring: IsolationScoring::Similarity,
            similarity_order: RankOrder::Descending,
            attention_order: RankOrder::Ascending,
            eps: 1e-12,
        }
    }

    /// Text encoders: attention-ranked candidates (least attended first),
    /// standard ELU. Without attention the similarity order applies.
    pub fn text() -> Self {
        Self {
            class_token: false,
            elu_alpha: 1.0,
            scoring: IsolationScoring::Attention,
            ..Self::vision()
        }
    }

    /// Enable provenance tracking.
    pub fn with_trace_source(mut self, trace: bool) -> Self {
        self.trace_source = trace;
        self
    }

    /// Set the class token flag.
    pub fn with_class_token(mut self, class_token: bool) -> Self {
        self.class_token = class_token;
        self
    }

    /// Sort direction for scores produced by `signal`.
    #[inline]
    pub fn rank_order(&self, signal: IsolationScoring) -> RankOrder {
        match signal {
            IsolationScoring::Similarity => self.similarity_order,
            IsolationScoring::Attention => self.attention_order,
        }
    }

    /// Tokens excluded from scoring and merging (the aggregate token).
    #[inline]
    pub fn protected_count(&self) -> usize {
        usize::from(self.class_token)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(ReductionError::out_of_range(
                "temperature",
                self.temperature as f64,
                "finite and > 0",
            ));
        }
        if !(self.elu_alpha >= 0.0 && self.elu_alpha.is_finite()) {
            return Err(ReductionError::out_of_range(
                "elu_alpha",
                self.elu_alpha as f64,
                "finite and >= 0",
            ));
        }
        if !(self.margin_fallback > 0.0 && self.margin_fallback <= 1.0) {
            return Err(ReductionError::out_of_range(
                "margin_fallback",
                self.margin_fallback as f64,
                "(0, 1]",
            ));
        }
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(ReductionError::out_of_range(
                "eps",
                self.eps as f64,
                "finite and > 0",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take the
    /// [`vision`](Self::vision) defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReductionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialise to JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ReductionError::InvalidConfig(e.to_string()))
    }
}
