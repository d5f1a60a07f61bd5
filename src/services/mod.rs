pub mod decision_recorder;

pub use decision_recorder::{
    DecisionEvent, DecisionEventSink, DecisionInsight, DecisionRecorder, DecisionStore, StoreError,
};
