pub mod analyzers;
pub mod content;
pub mod context;
pub mod lighthouse;
pub mod orchestrator;
pub mod resilient;

pub use analyzers::{create_analyzer, create_analyzer_named, Analyzer, AnalyzerDeps, AnalyzerState};
pub use content::{ContentImprovementService, ContentProvider, ContentRequest, ContentSuggestion};
pub use context::RunContext;
pub use lighthouse::{LighthouseBackend, LighthouseClient, LighthouseReport, SidecarBackend};
pub use orchestrator::{DependencyGraph, Orchestrator, ProgressReporter, ProgressSink, RunReport, ScheduleWarning};
pub use resilient::{CacheBackend, CacheKey, MemoryCache, ResilientClient, RetryPolicy, TokenBucket};
