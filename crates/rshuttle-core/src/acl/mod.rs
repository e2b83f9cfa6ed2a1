//! Access control: which sources may connect through the redirector, and
//! which destinations they may reach.

pub mod tables;

#[cfg(feature = "acl-redis")]
pub mod subscriber;

pub use tables::{AclSnapshot, AclTables, PortSpec, SourceTable, TargetTable};
