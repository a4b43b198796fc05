//! Final-result extraction.
//!
//! The worker prints arbitrary log noise and, somewhere in its stdout, one
//! JSON value wrapped in a sentinel pair:
//!
//! ```text
//! Initializing model...
//! __JSON_START__
//! {"success": true, "outputPath": "/out/clip_dubbed.mp4"}
//! __JSON_END__
//! cleanup done
//! ```

/// Marks the beginning of the stage result payload.
pub const RESULT_START: &str = "__JSON_START__";

/// Marks the end of the stage result payload.
pub const RESULT_END: &str = "__JSON_END__";

/// Outcome of scanning a worker's accumulated output.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<'a> {
    /// Trimmed text found strictly between the sentinels.
    Payload(&'a str),
    /// At least one sentinel was missing.  Carries the raw streams so the
    /// caller can show something useful; never satisfies a typed result.
    Diagnostic { stdout: &'a str, stderr: &'a str },
}

/// Locate the first start sentinel and the first end sentinel after it.
pub fn extract<'a>(stdout: &'a str, stderr: &'a str) -> Extraction<'a> {
    let payload = stdout.find(RESULT_START).and_then(|start| {
        let body = &stdout[start + RESULT_START.len()..];
        body.find(RESULT_END).map(|end| body[..end].trim())
    });

    match payload {
        Some(payload) => Extraction::Payload(payload),
        None => {
            log::warn!("sentinel: result markers not found in worker output");
            Extraction::Diagnostic { stdout, stderr }
        }
    }
}
