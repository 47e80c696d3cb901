//! Install session coordination: session table, persistence, stage
//! reconciliation and lifecycle callbacks, served over tarpc.

pub mod allocator;
pub mod build_info;
pub mod callbacks;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod errors;
pub mod paths;
pub mod persistence;
pub mod reconciler;
pub mod registry;
pub mod rpc;
pub mod session;
