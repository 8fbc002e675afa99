//! linescope - line coverage instrumentation with a live counting registry
//!
//! This library rewrites method bodies so every source line reports its
//! visits, and collects those visits in a concurrent registry that fans out
//! per-cycle deltas to listeners without ever blocking the instrumented code.

pub mod cli;
pub mod config;
pub mod filter;
pub mod method;
pub mod phaser;
pub mod planner;
pub mod registry;
pub mod rewriter;
pub mod source;
pub mod transformer;
pub mod update_loop;
pub mod verifier;
pub mod vm;
pub mod wire;
