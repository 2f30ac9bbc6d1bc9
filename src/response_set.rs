//! Per-probe response summary: the set of observed status strings plus
//! the range of body lengths. Two probes are worth reporting only if
//! these summaries stay disjoint across the whole sample schedule.

use crate::request::HttpMessage;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Default)]
pub struct ResponseSet {
    statuses: HashSet<String>,
    min_length: usize,
    max_length: usize,
    has_non_timeout: bool,
}

impl ResponseSet {
    pub fn new() -> Self {
        ResponseSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Whether at least one sample on this side was something other than
    /// a timeout (any real response or non-timeout error counts).
    pub fn has_non_timeout(&self) -> bool {
        self.has_non_timeout
    }

    /// Records one sample. `response` is `None` when the request errored;
    /// `timed_out` marks a terminal timeout.
    pub fn account(&mut self, response: Option<&HttpMessage>, timed_out: bool) {
        let status = response
            .and_then(|r| r.headers.get(b":status"))
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_else(|| "<error>".to_string());
        let length = response.map(HttpMessage::body_len).unwrap_or(0);

        if self.statuses.is_empty() {
            self.min_length = length;
            self.max_length = length;
        } else {
            self.min_length = self.min_length.min(length);
            self.max_length = self.max_length.max(length);
        }
        self.statuses.insert(status);
        self.has_non_timeout |= !timed_out;
    }

    /// Whether the two sample populations look different: disjoint status
    /// sets, or disjoint body-length ranges. Empty sets are considered
    /// distinguishable so the detect loop keeps sampling.
    pub fn distinguishable_from(&self, other: &ResponseSet) -> bool {
        if self.is_empty() || other.is_empty() {
            return true;
        }
        if self.statuses.is_disjoint(&other.statuses) {
            return true;
        }
        self.min_length > other.max_length || self.max_length < other.min_length
    }
}

impl fmt::Display for ResponseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut statuses: Vec<&str> = self.statuses.iter().map(String::as_str).collect();
        statuses.sort_unstable();
        write!(
            f,
            "statuses {:?}, {} <= size <= {}",
            statuses, self.min_length, self.max_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{Header, Headers};

    fn response(status: &str, body_len: usize) -> HttpMessage {
        HttpMessage {
            headers: Headers(vec![Header::new(":status", status)]),
            body: vec![vec![b'x'; body_len]],
        }
    }

    #[test]
    fn empty_sets_are_distinguishable() {
        let a = ResponseSet::new();
        let mut b = ResponseSet::new();
        assert!(a.distinguishable_from(&b));
        b.account(Some(&response("200", 10)), false);
        assert!(a.distinguishable_from(&b));
        assert!(b.distinguishable_from(&a));
    }

    #[test]
    fn disjoint_statuses_distinguish() {
        let mut a = ResponseSet::new();
        let mut b = ResponseSet::new();
        a.account(Some(&response("200", 10)), false);
        b.account(Some(&response("400", 10)), false);
        assert!(a.distinguishable_from(&b));
        assert!(b.distinguishable_from(&a));
    }

    #[test]
    fn disjoint_length_ranges_distinguish() {
        let mut a = ResponseSet::new();
        let mut b = ResponseSet::new();
        a.account(Some(&response("200", 10)), false);
        a.account(Some(&response("200", 20)), false);
        b.account(Some(&response("200", 21)), false);
        assert!(a.distinguishable_from(&b));

        // Overlapping ranges with a shared status: indistinguishable.
        b.account(Some(&response("200", 15)), false);
        assert!(!a.distinguishable_from(&b));
        assert!(!b.distinguishable_from(&a));
    }

    #[test]
    fn indistinguishability_is_monotone() {
        let mut a = ResponseSet::new();
        let mut b = ResponseSet::new();
        a.account(Some(&response("200", 10)), false);
        b.account(Some(&response("200", 10)), false);
        assert!(!a.distinguishable_from(&b));

        // The ranges and status sets only grow; more samples from the
        // same populations cannot separate them again.
        a.account(Some(&response("200", 5)), false);
        b.account(Some(&response("404", 50)), false);
        assert!(!a.distinguishable_from(&b));
    }

    #[test]
    fn errors_count_as_error_status() {
        let mut a = ResponseSet::new();
        a.account(None, true);
        assert!(!a.is_empty());
        assert!(!a.has_non_timeout());

        let mut b = ResponseSet::new();
        b.account(None, false);
        assert!(b.has_non_timeout());
        // Both recorded "<error>" with zero length.
        assert!(!a.distinguishable_from(&b));
    }

    #[test]
    fn display_is_sorted_and_bounded() {
        let mut a = ResponseSet::new();
        a.account(Some(&response("404", 7)), false);
        a.account(Some(&response("200", 3)), false);
        assert_eq!(a.to_string(), r#"statuses ["200", "404"], 3 <= size <= 7"#);
    }
}
