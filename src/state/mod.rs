//! Real-time state: the versioned projection and its subscribers.

mod broadcaster;
mod types;

pub use broadcaster::{StateBroadcaster, Subscription};
pub use types::*;
