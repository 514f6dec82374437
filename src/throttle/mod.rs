//! Resource constraint throttle

pub mod model;
pub mod service;

pub use model::{
    ConstraintStrategy, ConstraintUsage, ConsumerRequest, ConsumerState, ResourceConstraint,
    ResourceConstraintInstance, ThrottleEvent,
};
pub use service::ResourceConstraintThrottle;
