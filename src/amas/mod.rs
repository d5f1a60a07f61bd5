pub mod config;
pub mod decision;
pub mod delayed_reward;
pub mod features;
pub mod metrics;
pub mod modeling;
pub mod offline;
pub mod online;
pub mod optimizer;
pub mod persistence;
pub mod reward;
pub mod types;

pub use config::AMASConfig;
pub use decision::DecisionPolicy;
pub use delayed_reward::DelayedRewardAggregator;
pub use metrics::AmasMetrics;
pub use offline::{OfflineLoop, PolicyRewardApplier, RewardApplier};
pub use online::{OnlineLoop, OnlineResult, ProcessContext};
pub use optimizer::BayesianOptimizer;
pub use persistence::{AmasRepository, CachedRepository, UserStateProvider};
pub use types::*;
