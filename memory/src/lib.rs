//! taskpilot memory: statistics that outlive a single run
//!
//! - [`confidence`]: per-tool performance and confidence scoring
//! - [`learning`]: error → fix → outcome records clustered by error signature
//! - [`cache`]: memoized results of read-only tool calls
//! - [`store`]: SQLite persistence for the first two

pub mod cache;
pub mod confidence;
pub mod learning;
pub mod store;

pub use cache::{cache_key, CacheConfig, CacheStats, ToolResultCache};
pub use confidence::{
    AdaptiveSuggestion, AutoApproveDecision, ConfidenceContext, ConfidenceScore,
    ConfidenceScorer, ExecutionRecord, Recommendation, ToolPerformance,
};
pub use learning::{
    normalize_error_signature, CorrectionContext, CorrectionRecord, ErrorPattern, LearningConfig,
    LearningStore, NewCorrection, SimilarCorrection, ToolRecommendation,
};
pub use store::MemoryStore;
