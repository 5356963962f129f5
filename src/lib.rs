// Tour search orchestration over an asynchronous tour-data provider

pub mod cache;
pub mod config;
pub mod engine;
pub mod notify;
pub mod provider;
pub mod random_tours;
pub mod scheduler;
pub mod session;
pub mod strategy;
pub mod tour;
pub mod warming;
pub mod wire;

// Re-export key types for convenience
pub use cache::{Cache, CacheConfig, CacheKey, CacheStore, MemoryCache, TtlPolicy};
pub use config::EngineConfig;
pub use engine::Engine;
pub use notify::{NotificationHub, SessionEvent, Subscription};
pub use provider::{HttpProvider, ProviderConfig, ProviderError, ReferenceKind, RetryConfig, TourProvider};
pub use random_tours::{RandomTourGenerator, RandomToursConfig, RandomToursReport};
pub use scheduler::{JobKind, JobStatus, Scheduler};
pub use session::{
    ContinueOutcome, FailureCause, SearchSession, SessionError, SessionManager, SessionStatus,
    SortOrder,
};
pub use tour::{SearchParams, TourResult, TourSource};
pub use warming::{CacheWarmer, WarmingConfig, WarmingReport};
