//! Context management: token estimation, history compression and model
//! input assembly.
//!
//! | Part | Role |
//! |------|------|
//! | [`token`] | Deterministic token estimates |
//! | [`compressor`] | Recency keep, salient facts, rolling summary |
//! | [`builder`] | Ordered model input within the token budget |

pub mod builder;
pub mod compressor;
pub mod token;

pub use builder::{
    AssemblyError, AssemblyMetadata, BuildRequest, ContextBuilder, ContextInput, DropInfo, LayerStats,
    RuntimeContext,
};
pub use compressor::{
    CompressedContext, CompressionError, CompressionReport, CompressionState, ContextCompressor, FactExtractor,
    HeuristicFactExtractor, HeuristicSummarizer, ModelFactExtractor, ModelSummarizer, Summarizer,
};
