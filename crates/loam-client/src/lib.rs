// Loam Client
// Replica cache and local notification delivery

pub mod notify;
pub mod replica;

pub use notify::{Change, EventKind, Notification, NotificationBus, SubscriptionId};
pub use replica::{EntityHead, Replica};
