//! # Token Merge
//!
//! Token reduction for transformer layers: fewer tokens through the
//! intermediate blocks, with the information they carried folded into the
//! tokens that remain.
//!
//! ## Strategies
//!
//! 1. **Bipartite soft matching** (Bolya et al., 2023) - even/odd split,
//!    each even token merges into its most similar odd token
//! 2. **Isolation-score merging** (Tran et al., 2024) - rank tokens by
//!    margin-sharpened similarity, merge the most redundant ones
//! 3. **Spectral compression** - DCT truncation along the sequence axis
//! 4. **Prune/merge hybrid** (Kim et al., 2024) - drop tokens in early
//!    layers, merge in deeper ones
//!
//! ## Guarantees
//!
//! 1. **Deterministic** - same inputs give bit-identical partitions and outputs
//! 2. **Mass conservation** - token sizes always sum to the original count
//! 3. **Complete provenance** - every original token maps to exactly one
//!    current token
//! 4. **Aggregate protection** - a leading class token is never merged
//!
//! ## Example
//!
//! ```rust
//! use ruvector_token_merge::{
//!     Amount, MarginSchedule, ReductionConfig, Schedule, Strategy, TokenMergeRouter, TokenTensor,
//! };
//!
//! let router = TokenMergeRouter::new(ReductionConfig::vision().with_trace_source(true)).unwrap();
//! let schedule = Schedule::uniform(4, Strategy::Bipartite, Amount::Count(8), MarginSchedule::default())
//!     .unwrap();
//!
//! let data = (0..2 * 65 * 16).map(|i| ((i * 31 % 17) as f32) - 8.0).collect();
//! let mut x = TokenTensor::from_vec(data, 2, 65, 16).unwrap();
//!
//! let mut pass = router.begin_pass(&schedule, 4).unwrap();
//! for layer in 0..4 {
//!     // ... attention and MLP of `layer` ...
//!     x = pass.reduce_layer(layer, &x, None).unwrap();
//! }
//! let out = pass.finish();
//!
//! assert_eq!(x.tokens, 33);
//! assert_eq!(out.size.unwrap().sum(), 130.0);
//! ```

pub mod bipartite;
pub mod bookkeeping;
pub mod config;
pub mod error;
pub mod isolation;
pub mod merge;
pub mod partition;
pub mod pass;
pub mod router;
pub mod schedule;
pub mod scoring;
pub mod spectral;
pub mod tensor;
pub mod traits;

pub use bipartite::BipartiteReducer;
pub use bookkeeping::{
    log_size_bias, merge_attention_mask, merge_size, merge_source, merge_wavg, source_owner,
};
pub use config::{IsolationScoring, RankOrder, ReductionConfig};
pub use error::{ReductionError, Result};
pub use isolation::IsolationReducer;
pub use merge::{Layout, Merge, ReduceMode};
pub use partition::Split;
pub use pass::{block_flops, LayerStats, PassOutput, PassStats, ReductionPass};
pub use router::{Reduction, TokenMergeRouter};
pub use schedule::{reduction_count, Amount, LayerPlan, MarginSchedule, Schedule, Strategy};
pub use scoring::IsolationWeighting;
pub use spectral::SpectralReducer;
pub use tensor::{l2_normalize, TokenTensor};
pub use traits::{IdentityReducer, ReductionRequest, TokenReducer};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Amount, LayerPlan, MarginSchedule, Merge, PassOutput, PassStats, ReduceMode, Reduction,
        ReductionConfig, ReductionError, ReductionPass, Result, Schedule, Strategy,
        TokenMergeRouter, TokenReducer, TokenTensor,
    };
}
