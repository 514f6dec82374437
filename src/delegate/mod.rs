//! Delegates and the registry that tracks them

pub mod model;
pub mod registry;

pub use model::{
    ConnectionHeartbeat, Delegate, DelegateActivity, DelegateConnection, DelegateScope,
    DelegateStatus, NewDelegate,
};
pub use registry::DelegateRegistry;
