//! Reassembly of socket reads into complete lines.
//!
//! Reads are split on `\n` (a trailing `\r` is dropped). Bytes after the
//! last newline stay buffered for the next read, so neither a multi-byte
//! character nor a tag is ever cut at a read boundary. A complete line that
//! still ends inside a tag is held and joined with the following line when
//! that line continues the tag; otherwise it is released as-is for the
//! sanitizer to heal.

use std::sync::LazyLock;

use bytes::BytesMut;
use regex::Regex;

use crate::constants::MAX_PENDING_LINE_LEN;
use crate::sanitizer::has_unterminated_tag;

/// Start of a line that finishes a tag left open by the previous one.
static TAG_CONTINUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:/?>|[A-Za-z_][\w.\-]*\s*=)").expect("valid regex"));

/// Incremental line splitter.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: BytesMut,
    pending: Option<String>,
}

impl LineAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's bytes and return every line completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let mut text = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if text.ends_with('\r') {
                text.pop();
            }
            self.push_line(text, &mut lines);
        }

        if self.buf.len() > MAX_PENDING_LINE_LEN {
            log::warn!(
                "[Session] Unterminated line exceeded {} bytes; flushing",
                MAX_PENDING_LINE_LEN
            );
            let raw = self.buf.split();
            let text = String::from_utf8_lossy(&raw).into_owned();
            self.push_line(text, &mut lines);
            lines.extend(self.pending.take());
        }
        lines
    }

    /// Return whatever is buffered (at end of stream).
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buf.split();
        let mut out = self.pending.take().unwrap_or_default();
        out.push_str(&String::from_utf8_lossy(&rest));
        (!out.is_empty()).then_some(out)
    }

    fn push_line(&mut self, text: String, lines: &mut Vec<String>) {
        let line = match self.pending.take() {
            Some(mut held) if TAG_CONTINUATION.is_match(&text) => {
                held.push_str(&text);
                held
            }
            Some(held) => {
                log::debug!("[Session] Releasing held line; next line does not continue its tag");
                lines.push(held);
                text
            }
            None => text,
        };
        if has_unterminated_tag(&line) && line.len() < MAX_PENDING_LINE_LEN {
            log::debug!("[Session] Holding line with unterminated tag");
            self.pending = Some(line);
        } else {
            lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_and_strips_cr() {
        let mut la = LineAssembler::new();
        assert_eq!(la.feed(b"one\r\ntwo\nthr"), vec!["one", "two"]);
        assert_eq!(la.feed(b"ee\n"), vec!["three"]);
        assert!(la.flush().is_none());
    }

    #[test]
    fn test_multibyte_char_across_reads() {
        let mut la = LineAssembler::new();
        let bytes = "caf\u{e9}\n".as_bytes();
        assert!(la.feed(&bytes[..4]).is_empty());
        assert_eq!(la.feed(&bytes[4..]), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_unterminated_tag_joined_with_next_line() {
        let mut la = LineAssembler::new();
        assert!(la.feed(b"<pushStream id=\"inv\"\n").is_empty());
        assert_eq!(
            la.feed(b"/>You have nothing.\n"),
            vec!["<pushStream id=\"inv\"/>You have nothing."]
        );
    }

    #[test]
    fn test_attribute_continuation_is_joined() {
        let mut la = LineAssembler::new();
        assert!(la.feed(b"<progressBar id=\"health\"\n").is_empty());
        assert_eq!(
            la.feed(b" value=\"90\"/>Ok.\n"),
            vec!["<progressBar id=\"health\" value=\"90\"/>Ok."]
        );
    }

    #[test]
    fn test_truncated_tag_released_before_unrelated_line() {
        let mut la = LineAssembler::new();
        assert!(la.feed(b"You see.<popStream\n").is_empty());
        assert_eq!(
            la.feed(b"A goblin arrives.\n"),
            vec!["You see.<popStream", "A goblin arrives."]
        );
    }

    #[test]
    fn test_flush_returns_partial() {
        let mut la = LineAssembler::new();
        la.feed(b"<prompt");
        assert_eq!(la.flush().as_deref(), Some("<prompt"));
    }
}
