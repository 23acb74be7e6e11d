//! Incremental extraction of top-level JSON objects from a byte stream.
//!
//! Gemini's `streamGenerateContent` answers with one JSON array whose elements
//! arrive split at arbitrary byte offsets. [`JsonObjectScanner`] accepts those
//! bytes as they come and hands back each complete `{...}` element. Bytes
//! outside any object (array punctuation, whitespace, SSE `data:` prefixes) are
//! skipped.
//!
//! Braces inside string literals do not count towards nesting, and a `\"`
//! escape does not end a string. All four structural bytes are ASCII, so the
//! scan is safe on UTF-8 input split in the middle of a multi-byte character.
//!
//! Scan state survives between [`feed`](JsonObjectScanner::feed) calls, so
//! every byte is examined once no matter how the input is chunked.

use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buf: BytesMut,
    /// Next byte of `buf` to examine.
    pos: usize,
    /// Set once the opening brace of the current object has been seen.
    in_object: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of an object.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// The next complete top-level object, or `None` once the buffered bytes
    /// hold no further complete object. Never waits for input.
    pub fn next_object(&mut self) -> Option<Bytes> {
        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            self.pos += 1;

            if !self.in_object {
                if b == b'{' {
                    // Drop everything before the object start.
                    self.buf.advance(self.pos - 1);
                    self.pos = 1;
                    self.in_object = true;
                    self.depth = 1;
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let object = self.buf.split_to(self.pos).freeze();
                        self.reset_object_state();
                        return Some(object);
                    }
                }
                _ => {}
            }
        }

        if !self.in_object {
            // Nothing but inter-object noise left.
            self.buf.clear();
            self.pos = 0;
        }
        None
    }

    fn reset_object_state(&mut self) {
        self.pos = 0;
        self.in_object = false;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}
