//! Data types for the historian
//!
//! Snapshots, consumer registrations and the responses handed to consumers.

mod registration;
mod response;
mod snapshot;

pub use registration::{AggregateFlags, ConsumerRegistration, ConsumerToken, HistoryParameters};
pub use response::{HistorianStats, HistoryResponse};
pub use snapshot::{Expiration, PropertyMap, ThingSnapshot};
