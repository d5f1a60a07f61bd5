pub mod linucb;
pub mod matrix;
pub mod policy;

pub use linucb::{ActionSelection, DecisionContext, LinUCBModel, FEATURE_DIMENSION};
pub use policy::DecisionPolicy;
