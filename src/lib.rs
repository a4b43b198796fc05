//! Dubbing pipeline driven by an external media worker.
//!
//! - [`protocol`]: the worker's line protocol and stage contract.
//! - [`worker`]: spawning, streaming and killing worker processes.
//! - [`pipeline`]: recognize → translate → synthesize → merge.
//! - [`config`]: settings and artifact paths.

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod worker;
