//! Incremental merge of content arriving in parts.
//!
//! Bytes are fed segment by segment (HTTP body chunks or paginated reads).
//! Whenever a delimiter arrives, everything up to the last delimiter is
//! decoded and appended to the merged text, so only the undelimited tail
//! stays as raw segments. If the tail grows past `window` segments it is
//! compacted: everything but a code point split at the very end is merged
//! (invalid bytes become U+FFFD) and the split bytes are carried over.

use std::collections::VecDeque;

pub struct StreamMerger {
    delimiter: Vec<u8>,
    window: usize,
    pending: VecDeque<Vec<u8>>,
    merged: String,
    bytes_fed: usize,
    peak_pending: usize,
}

impl StreamMerger {
    pub fn new(delimiter: &[u8], window: usize) -> Self {
        Self {
            delimiter: if delimiter.is_empty() {
                b"\n".to_vec()
            } else {
                delimiter.to_vec()
            },
            window: window.max(1),
            pending: VecDeque::new(),
            merged: String::new(),
            bytes_fed: 0,
            peak_pending: 0,
        }
    }

    /// Line-oriented merger.
    pub fn lines(window: usize) -> Self {
        Self::new(b"\n", window)
    }

    /// Feed one segment and return the text merged so far.
    pub fn feed(&mut self, segment: &[u8]) -> &str {
        if segment.is_empty() {
            return &self.merged;
        }
        self.bytes_fed += segment.len();
        let has_delimiter = self.completes_delimiter(segment);
        self.pending.push_back(segment.to_vec());
        self.peak_pending = self.peak_pending.max(self.pending.len());

        if has_delimiter {
            self.merge_through_last_delimiter();
        }
        if self.pending.len() > self.window {
            self.compact();
        }
        &self.merged
    }

    /// Merge whatever is left and return the complete content.
    pub fn finalize(mut self) -> String {
        let rest = self.join_pending();
        self.merged.push_str(&String::from_utf8_lossy(&rest));
        self.merged
    }

    pub fn merged(&self) -> &str {
        &self.merged
    }

    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    /// Highest number of raw segments held at once.
    pub fn peak_pending(&self) -> usize {
        self.peak_pending
    }

    pub fn bytes_fed(&self) -> usize {
        self.bytes_fed
    }

    /// Whether `segment`, together with the tail already pending, contains
    /// a delimiter. Catches delimiters split across segment boundaries.
    fn completes_delimiter(&self, segment: &[u8]) -> bool {
        let overlap = self.delimiter.len() - 1;
        if overlap == 0 {
            return contains(segment, &self.delimiter);
        }
        let mut tail: Vec<u8> = Vec::with_capacity(overlap);
        for seg in self.pending.iter().rev() {
            let need = overlap - tail.len();
            let take = need.min(seg.len());
            let mut prefix = seg[seg.len() - take..].to_vec();
            prefix.extend_from_slice(&tail);
            tail = prefix;
            if tail.len() == overlap {
                break;
            }
        }
        tail.extend_from_slice(segment);
        contains(&tail, &self.delimiter)
    }

    fn join_pending(&mut self) -> Vec<u8> {
        let total: usize = self.pending.iter().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(total);
        for seg in self.pending.drain(..) {
            buf.extend_from_slice(&seg);
        }
        buf
    }

    fn merge_through_last_delimiter(&mut self) {
        let buf = self.join_pending();
        match rfind(&buf, &self.delimiter) {
            Some(pos) => {
                let cut = pos + self.delimiter.len();
                self.merged.push_str(&String::from_utf8_lossy(&buf[..cut]));
                if cut < buf.len() {
                    self.pending.push_back(buf[cut..].to_vec());
                }
            }
            None => self.pending.push_back(buf),
        }
    }

    fn compact(&mut self) {
        let buf = self.join_pending();
        let split = buf.len() - incomplete_tail(&buf);
        self.merged.push_str(&String::from_utf8_lossy(&buf[..split]));
        if split < buf.len() {
            self.pending.push_back(buf[split..].to_vec());
        }
    }
}

/// Length of a code point cut off at the end of `buf`, or 0. Invalid bytes
/// earlier in the buffer do not matter.
fn incomplete_tail(buf: &[u8]) -> usize {
    let floor = buf.len().saturating_sub(3);
    for i in (floor..buf.len()).rev() {
        let width = match buf[i] {
            0x80..=0xBF => continue,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = buf.len() - i;
        let truncated = matches!(std::str::from_utf8(&buf[i..]), Err(e) if e.error_len().is_none());
        return if have < width && truncated { have } else { 0 };
    }
    0
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merges_on_delimiter() {
        let mut m = StreamMerger::lines(8);
        assert_eq!(m.feed(b"alpha pro"), "");
        assert_eq!(m.feed(b"ject\nbeta"), "alpha project\n");
        assert_eq!(m.pending_segments(), 1);
        assert_eq!(m.finalize(), "alpha project\nbeta");
    }

    #[test]
    fn test_window_bounds_pending_segments() {
        let mut m = StreamMerger::lines(3);
        for _ in 0..50 {
            m.feed(b"no delimiter here ");
        }
        assert!(m.peak_pending() <= 4);
        assert!(m.pending_segments() <= 3);
        let out = m.finalize();
        assert_eq!(out.len(), 50 * 18);
    }

    #[test]
    fn test_split_code_point_survives_compaction() {
        let text = "café ünïcode";
        let bytes = text.as_bytes();
        let mut m = StreamMerger::new(b"\n", 1);
        for b in bytes {
            m.feed(std::slice::from_ref(b));
        }
        assert_eq!(m.finalize(), text);
    }

    #[test]
    fn test_split_code_point_after_invalid_byte() {
        let mut m = StreamMerger::new(b"\n", 1);
        m.feed(b"x");
        m.feed(&[b'a', 0xFF, b'b', 0xE2, 0x82]);
        assert_eq!(m.pending_segments(), 1);
        m.feed(&[0xAC]);
        assert_eq!(m.finalize(), "xa\u{FFFD}b€");
    }

    #[test]
    fn test_incomplete_tail() {
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&[b'a', 0xE2, 0x82]), 2);
        assert_eq!(incomplete_tail(&[0xFF, 0xF0, 0x9F]), 2);
        assert_eq!(incomplete_tail("€".as_bytes()), 0);
        assert_eq!(incomplete_tail(&[b'a', 0xFF]), 0);
    }

    #[test]
    fn test_multibyte_delimiter_across_segments() {
        let mut m = StreamMerger::new(b"\n\n", 8);
        m.feed(b"para one\n");
        m.feed(b"\npara two");
        assert_eq!(m.merged(), "para one\n\n");
        assert_eq!(m.finalize(), "para one\n\npara two");
    }

    #[test]
    fn test_empty_segments_ignored() {
        let mut m = StreamMerger::lines(2);
        m.feed(b"");
        assert_eq!(m.bytes_fed(), 0);
        assert_eq!(m.finalize(), "");
    }
}
