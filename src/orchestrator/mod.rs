//! Session orchestration.
//!
//! Covers process spawning, the per-session controller actor, the session
//! registry, subscriptions, and idle auto-termination.

pub(crate) mod controller;
pub mod idle_watchdog;
pub mod session_manager;
pub mod spawner;
pub mod subscription;

pub use session_manager::SessionManager;
pub use subscription::{Subscription, SubscriptionId};
