//! Coordination core for roadside service requests.
//!
//! A customer files a [`lifecycle::ServiceRequest`] against a garage, one of the
//! garage's mechanics claims it, reports progress through
//! [`workflow::StatusUpdate`]s that the customer approves or rejects, and books
//! billable [`ledger::LedgerItem`]s under those updates. Completing the request
//! bills the finished work ([`billing`]). Every step leaves notifications for
//! the other parties ([`fanout`]), which they poll.
//!
//! [`service::GarageService`] is the entry point.

pub mod actor;
pub mod billing;
pub mod config;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod guard;
pub mod ledger;
pub mod lifecycle;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
pub mod workflow;

pub use actor::{Actor, Role};
pub use error::{CoreError, CoreResult};
pub use service::{Completion, GarageService};
