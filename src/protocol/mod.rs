//! Worker wire protocol.
//!
//! The worker speaks plain UTF-8 text on stdout.  This module turns that
//! byte stream into typed values:
//!
//! ```text
//! stdout bytes ──▶ LineReassembler ──▶ classify() ──▶ Progress / Partial / Log
//!      │
//!      └── accumulated ──▶ extract() ──▶ StageInvocation::interpret() ──▶ StageReply
//! ```
//!
//! Nothing here touches processes or I/O; see [`crate::worker`] for that.

pub mod lines;
pub mod markers;
pub mod segment;
pub mod sentinel;
pub mod stage;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use lines::{CompleteLines, LineReassembler};
pub use markers::{
    classify, LineKind, PartialResultEvent, PartialUpdate, ProgressEvent, PARTIAL_TAG,
    PROGRESS_TAG,
};
pub use segment::{sort_by_start, AudioStatus, Segment};
pub use sentinel::{extract, Extraction, RESULT_END, RESULT_START};
pub use stage::{
    decode, BatchItem, ProtocolError, StageAction, StageInvocation, StageOutput, StageReply,
    Translation,
};
