//! selfpatch library crate
//!
//! Proposals flow through drafting, diff validation, the path guard and a
//! sandboxed test run before a transactional apply may touch the working
//! tree. The CLI in `main.rs` is a thin layer over [`pipeline::Pipeline`].

pub mod apply;
pub mod config;
pub mod diff;
pub mod draft;
pub mod git_ops;
pub mod guard;
pub mod index;
pub mod lock;
pub mod pipeline;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod util;
