//! Task classification and provider selection.
//!
//! [`classify`] maps a free-form task description onto a [`TaskCategory`];
//! [`policy::PolicyTable::route`] maps (category, policy) onto a provider,
//! honouring forced overrides and live availability.

pub mod classify;
pub mod policy;

pub use classify::{TaskCategory, classify};
pub use policy::{Policy, PolicyTable};
