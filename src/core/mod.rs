mod event_bus;

pub use event_bus::{
    DecisionRecordedPayload, EventBus, EventBusStats, EventEnvelope, LearningEvent,
    RewardDistributedPayload,
};
