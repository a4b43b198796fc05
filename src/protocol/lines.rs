//! Line reassembly over an unframed byte stream.
//!
//! The worker's stdout arrives in reads of arbitrary size, so a single
//! logical line may be split across several chunks (or a chunk may carry many
//! lines).  [`LineReassembler`] keeps the unterminated tail of the stream and
//! only hands out a line once its `\n` delimiter has been seen.
//!
//! ```text
//! chunk 1: "[PROGRESS] 4"        → (nothing yet)
//! chunk 2: "0\nloading mo"       → "[PROGRESS] 40"
//! chunk 3: "del\n"               → "loading model"
//! finish()                       → (nothing left)
//! ```
//!
//! Bytes are decoded only once a line is complete, so a multi-byte UTF-8
//! character that straddles two reads is never mangled.

// ---------------------------------------------------------------------------
// LineReassembler
// ---------------------------------------------------------------------------

/// Turns a sequence of byte chunks into a sequence of complete text lines.
///
/// No line-length limit is imposed and no input is ever dropped: anything
/// not yet terminated stays buffered until the next [`push`](Self::push) or
/// until [`finish`](Self::finish) flushes it.
///
/// ```
/// use video_dub::protocol::LineReassembler;
///
/// let mut lines = LineReassembler::new();
/// assert_eq!(lines.push(b"hel").count(), 0);
/// let got: Vec<String> = lines.push(b"lo\nwor").collect();
/// assert_eq!(got, vec!["hello"]);
/// let rest: Vec<String> = lines.finish().collect();
/// assert_eq!(rest, vec!["wor"]);
/// ```
#[derive(Debug, Default)]
pub struct LineReassembler {
    /// Bytes received but not yet handed out as a line.
    pending: Vec<u8>,
    /// Prefix length of `pending` already known to contain no `\n`.
    scanned: usize,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return a lazy iterator over the lines it completes.
    ///
    /// Lines left unread when the iterator is dropped remain buffered and are
    /// yielded by a later call.
    pub fn push(&mut self, chunk: &[u8]) -> CompleteLines<'_> {
        self.pending.extend_from_slice(chunk);
        CompleteLines {
            owner: self,
            start: 0,
        }
    }

    /// Number of buffered bytes that do not yet form a complete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream: yield every remaining line, including an unterminated
    /// final fragment.
    pub fn finish(mut self) -> std::vec::IntoIter<String> {
        let mut lines: Vec<String> = self.push(&[]).collect();
        if !self.pending.is_empty() {
            lines.push(decode_line(&self.pending));
        }
        lines.into_iter()
    }
}

// ---------------------------------------------------------------------------
// CompleteLines
// ---------------------------------------------------------------------------

/// Iterator returned by [`LineReassembler::push`].
///
/// Consumed bytes are released from the reassembler's buffer when the
/// iterator is dropped.
pub struct CompleteLines<'a> {
    owner: &'a mut LineReassembler,
    /// Offset of the first byte not yet yielded.
    start: usize,
}

impl Iterator for CompleteLines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let buf = &self.owner.pending;
        let from = self.owner.scanned.max(self.start);

        match buf[from..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let end = from + offset;
                let line = decode_line(&buf[self.start..end]);
                self.start = end + 1;
                self.owner.scanned = self.start;
                Some(line)
            }
            None => {
                let len = buf.len();
                self.owner.scanned = len;
                None
            }
        }
    }
}

impl Drop for CompleteLines<'_> {
    fn drop(&mut self) {
        if self.start > 0 {
            self.owner.pending.drain(..self.start);
            self.owner.scanned -= self.start;
        }
    }
}

/// Decode one line, dropping a trailing `\r` left by CRLF output.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
