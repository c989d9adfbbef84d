//! Data models of the coordinator.
//!
//! All records persisted to the metadata store, along with the payloads crossing the worker RPC
//! boundary, are modeled as protobuf messages so that every durable or wire-visible structure
//! has a stable, evolvable encoding.

mod meta;

pub use meta::*;
