//! Per-layer reduction schedules.
//!
//! A [`Schedule`] holds one [`LayerPlan`] per transformer layer. Plans are
//! read by layer index and never consumed, so running the same schedule
//! for a second forward pass needs no rebuild.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReductionError, Result};

/// Reduction strategy applied at one layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Leave the layer's tokens untouched.
    Identity,
    /// Even/odd bipartite soft matching with size-weighted averaging (ToMe).
    Bipartite,
    /// Isolation-score clustering around a similarity margin (PiToMe).
    Isolation,
    /// Content-independent DCT truncation along the token axis.
    Spectral,
    /// Bipartite matching whose donors are dropped instead of averaged.
    Prune,
}

impl Strategy {
    /// Strategies that need similarity scoring and a token partition.
    #[inline]
    pub fn uses_matching(&self) -> bool {
        matches!(
            self,
            Strategy::Bipartite | Strategy::Isolation | Strategy::Prune
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Identity => write!(f, "identity"),
            Strategy::Bipartite => write!(f, "bipartite"),
            Strategy::Isolation => write!(f, "isolation"),
            Strategy::Spectral => write!(f, "spectral"),
            Strategy::Prune => write!(f, "prune"),
        }
    }
}

impl FromStr for Strategy {
    type Err = ReductionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "identity" => Ok(Strategy::Identity),
            "tome" | "bipartite" => Ok(Strategy::Bipartite),
            "pitome" | "isolation" => Ok(Strategy::Isolation),
            "dct" | "spectral" => Ok(Strategy::Spectral),
            "tofu" | "prune" => Ok(Strategy::Prune),
            _ => Err(ReductionError::UnsupportedStrategy(s.to_string())),
        }
    }
}

/// How many tokens a layer should remove.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    /// Remove exactly `r` tokens (before clamping).
    Count(usize),
    /// Keep this fraction of the tokens, in `(0, 1]`.
    Ratio(f64),
}

impl Amount {
    /// `r = 0` or keep ratio `1.0`.
    #[inline]
    pub fn is_identity(&self) -> bool {
        match *self {
            Amount::Count(r) => r == 0,
            Amount::Ratio(keep) => keep >= 1.0,
        }
    }

    /// Requested reduction for a sequence of `tokens`, before clamping.
    ///
    /// Ratios resolve to `floor(T - T * keep)`.
    pub fn requested(&self, tokens: usize) -> usize {
        match *self {
            Amount::Count(r) => r,
            Amount::Ratio(keep) if keep >= 1.0 => 0,
            Amount::Ratio(keep) => {
                let t = tokens as f64;
                (t - t * keep).floor().max(0.0) as usize
            }
        }
    }

    /// Validate the amount.
    pub fn validate(&self) -> Result<()> {
        if let Amount::Ratio(keep) = *self {
            if !(keep > 0.0 && keep <= 1.0) {
                return Err(ReductionError::out_of_range("ratio", keep, "(0, 1]"));
            }
        }
        Ok(())
    }
}

impl Default for Amount {
    fn default() -> Self {
        Amount::Count(0)
    }
}

/// Reduction count actually applied: the request clamped so that at most
/// half of the reducible tokens are removed.
///
/// `tokens` counts every token in the scored sequence; `protected` of them
/// can never be merged.
#[inline]
pub fn reduction_count(amount: Amount, tokens: usize, protected: usize) -> usize {
    let limit = tokens.saturating_sub(protected) / 2;
    amount.requested(tokens).min(limit)
}

/// Margin per layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginSchedule {
    /// Same margin at every layer.
    Constant(f32),
    /// `start - start * i / L`, decreasing with depth.
    Linear {
        /// Margin at layer 0.
        start: f32,
    },
}

impl MarginSchedule {
    /// Margin for `layer` of a `layers`-deep model.
    pub fn margin_at(&self, layer: usize, layers: usize) -> f32 {
        match *self {
            MarginSchedule::Constant(m) => m,
            MarginSchedule::Linear { start } => {
                if layers == 0 {
                    start
                } else {
                    start - start * (layer as f32 / layers as f32)
                }
            }
        }
    }
}

impl Default for MarginSchedule {
    fn default() -> Self {
        MarginSchedule::Constant(0.9)
    }
}

/// What one layer does.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerPlan {
    /// Strategy for this layer.
    pub strategy: Strategy,
    /// Reduction amount.
    pub amount: Amount,
    /// Similarity margin for isolation scoring, in `[0, 1)`.
    pub margin: f32,
}

impl LayerPlan {
    /// A layer that leaves tokens untouched.
    pub fn identity() -> Self {
        Self {
            strategy: Strategy::Identity,
            amount: Amount::Count(0),
            margin: 0.0,
        }
    }

    /// Whether this plan can change the token sequence at all.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.strategy == Strategy::Identity || self.amount.is_identity()
    }

    /// Validate the plan.
    pub fn validate(&self) -> Result<()> {
        self.amount.validate()?;
        if !(self.margin >= 0.0 && self.margin < 1.0) {
            return Err(ReductionError::out_of_range(
                "margin",
                self.margin as f64,
                "[0, 1)",
            ));
        }
        Ok(())
    }
}

/// Fixed-length, read-only list of layer plans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    plans: Vec<LayerPlan>,
}

impl Schedule {
    /// Wrap explicit plans, validating each one.
    pub fn from_plans(plans: Vec<LayerPlan>) -> Result<Self> {
        for plan in &plans {
            plan.validate()?;
        }
        Ok(Self { plans })
    }

    /// Same strategy and amount at every layer.
    pub fn uniform(
        layers: usize,
        strategy: Strategy,
        amount: Amount,
        margins: MarginSchedule,
    ) -> Result<Self> {
        Self::from_plans(
            (0..layers)
                .map(|i| LayerPlan {
                    strategy,
                    amount,
                    margin: margins.margin_at(i, layers),
                })
                .collect(),
        )
    }

    /// Reduce at even layers only; odd layers are identity.
    pub fn alternating(
        layers: usize,
        strategy: Strategy,
        amount: Amount,
        margins: MarginSchedule,
    ) -> Result<Self> {
        Self::from_plans(
            (0..layers)
                .map(|i| {
                    if i % 2 == 0 {
                        LayerPlan {
                            strategy,
                            amount,
                            margin: margins.margin_at(i, layers),
                        }
                    } else {
                        LayerPlan::identity()
                    }
                })
                .collect(),
        )
    }

    /// Prune in the first half of the stack (`i <= L / 2`), merge with
    /// bipartite matching in the deeper layers.
    pub fn prune_then_merge(layers: usize, amount: Amount, margins: MarginSchedule) -> Result<Self> {
        Self::from_plans(
            (0..layers)
                .map(|i| LayerPlan {
                    strategy: if i > layers / 2 {
                        Strategy::Bipartite
                    } else {
                        Strategy::Prune
                    },
                    amount,
                    margin: margins.margin_at(i, layers),
                })
                .collect(),
        )
    }

    /// One keep ratio per layer.
    pub fn from_ratios(strategy: Strategy, ratios: &[f64], margins: MarginSchedule) -> Result<Self> {
        let layers = ratios.len();
        Self::from_plans(
            ratios
                .iter()
                .enumerate()
                .map(|(i, &keep)| LayerPlan {
                    strategy,
                    amount: Amount::Ratio(keep),
                    margin: margins.margin_at(i, layers),
                })
                .collect(),
        )
    }

    /// Number of layer entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the schedule has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Plan for `layer`.
    pub fn plan(&self, layer: usize) -> Result<&LayerPlan> {
        self.plans
            .get(layer)
            .ok_or(ReductionError::LayerOutOfRange {
                layer,
                layers: self.plans.len(),
            })
    }

    /// All plans in layer order.
    pub fn plans(&self) -> &[LayerPlan] {
        &self.plans
    }

    /// Fail unless the schedule covers exactly `layers` layers.
    pub fn validate_for(&self, layers: usize) -> Result<()> {
        if self.plans.len() != layers {
            return Err(ReductionError::ScheduleLength {
                expected: layers,
                found: self.plans.len(),
            });
        }
        Ok(())
    }
}
