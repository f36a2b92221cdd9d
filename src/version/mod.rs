// src/version/mod.rs

//! Debian package version parsing and ordering
//!
//! Versions have the form `[epoch:]upstream[-revision]`. The epoch is a
//! non-negative integer (default 0); the revision is everything after the
//! last `-` and is limited to `[A-Za-z0-9+.~]`.
//!
//! Upstream and revision are compared by splitting them into alternating
//! (non-digit run, digit run) segments. Non-digit runs compare character by
//! character with `~` lowest, then the end of the run, then letters, then
//! the remaining punctuation. Digit runs compare as integers. A missing
//! segment compares as an empty run followed by zero, which is why
//! `1.0~rc1` sorts before `1.0`.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// Marks the end of a non-digit run; sorts after the remapped `~` and
/// before every letter and remapped punctuation character
const RUN_END: char = '#';

/// Remap a non-digit character so that byte order matches Debian order
fn remap(c: char) -> char {
    match c {
        '~' => '!',
        '+' => '{',
        '-' => '|',
        '.' => '}',
        ':' => '~',
        other => other,
    }
}

/// One (non-digit run, digit run) pair of a version component
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    /// Remapped non-digit run, terminated by [`RUN_END`]
    text: String,
    /// Digit run without leading zeros
    number: String,
}

impl Segment {
    fn empty() -> Self {
        Self {
            text: RUN_END.to_string(),
            number: String::new(),
        }
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text.cmp(&other.text).then_with(|| {
            self.number
                .len()
                .cmp(&other.number.len())
                .then_with(|| self.number.cmp(&other.number))
        })
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Split a version component into segments
fn scan(component: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut chars = component.chars().peekable();

    while chars.peek().is_some() {
        let mut text = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                break;
            }
            text.push(remap(c));
            chars.next();
        }
        text.push(RUN_END);

        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            chars.next();
        }
        let number = digits.trim_start_matches('0').to_string();

        segments.push(Segment { text, number });
    }
    segments
}

fn compare_segments(a: &[Segment], b: &[Segment]) -> Ordering {
    let empty = Segment::empty();
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).unwrap_or(&empty);
        let right = b.get(i).unwrap_or(&empty);
        match left.cmp(right) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

fn is_upstream_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '~' | ':' | '-')
}

fn is_revision_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~')
}

/// A parsed Debian version
///
/// Equality follows the ordering, so `1.0` and `1.00` are equal.
#[derive(Debug, Clone)]
pub struct DebianVersion {
    pub epoch: u64,
    pub upstream: String,
    pub revision: String,
    original: String,
    upstream_key: Vec<Segment>,
    revision_key: Vec<Segment>,
}

impl DebianVersion {
    /// Parse a Debian version string
    ///
    /// Examples:
    /// - "1.2.3" → epoch=0, upstream="1.2.3", revision=""
    /// - "2:1.2.3" → epoch=2, upstream="1.2.3", revision=""
    /// - "1.2-3-1ubuntu1" → epoch=0, upstream="1.2-3", revision="1ubuntu1"
    pub fn parse(s: &str) -> Result<Self> {
        let (epoch_str, rest) = match s.split_once(':') {
            Some((epoch, rest)) => (epoch, rest),
            None => ("", s),
        };

        if !epoch_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::ParseError(format!("Invalid epoch in version '{}'", s)));
        }
        let epoch = if epoch_str.is_empty() {
            0
        } else {
            epoch_str
                .parse::<u64>()
                .map_err(|e| Error::ParseError(format!("Invalid epoch in version '{}': {}", s, e)))?
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, revision),
            None => (rest, ""),
        };

        if upstream.is_empty() || !upstream.chars().all(is_upstream_char) {
            return Err(Error::ParseError(format!("Invalid debian version '{}'", s)));
        }
        if !revision.chars().all(is_revision_char) {
            return Err(Error::ParseError(format!(
                "Invalid debian revision '{}' in version '{}'",
                revision, s
            )));
        }

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.to_string(),
            original: s.to_string(),
            upstream_key: scan(upstream),
            revision_key: scan(revision),
        })
    }

    /// The version string as it was parsed
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

/// Compare two version strings
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(DebianVersion::parse(a)?.cmp(&DebianVersion::parse(b)?))
}

impl Ord for DebianVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_segments(&self.upstream_key, &other.upstream_key))
            .then_with(|| compare_segments(&self.revision_key, &other.revision_key))
    }
}

impl PartialOrd for DebianVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DebianVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DebianVersion {}

impl std::str::FromStr for DebianVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DebianVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> DebianVersion {
        DebianVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let version = v("1.2.3");
        assert_eq!(version.epoch, 0);
        assert_eq!(version.upstream, "1.2.3");
        assert_eq!(version.revision, "");
    }

    #[test]
    fn test_parse_with_epoch_and_revision() {
        let version = v("1:2.3.4-5ubuntu1");
        assert_eq!(version.epoch, 1);
        assert_eq!(version.upstream, "2.3.4");
        assert_eq!(version.revision, "5ubuntu1");
        assert_eq!(version.to_string(), "1:2.3.4-5ubuntu1");
    }

    #[test]
    fn test_parse_revision_splits_at_last_dash() {
        let version = v("1.2-3-4");
        assert_eq!(version.upstream, "1.2-3");
        assert_eq!(version.revision, "4");
    }

    #[test]
    fn test_parse_colon_in_upstream() {
        let version = v("1:2:3");
        assert_eq!(version.epoch, 1);
        assert_eq!(version.upstream, "2:3");
    }

    #[test]
    fn test_parse_empty_epoch() {
        assert_eq!(v(":1.0").epoch, 0);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(matches!(DebianVersion::parse("a:1.0"), Err(Error::ParseError(_))));
        assert!(matches!(DebianVersion::parse("1.0-r:1"), Err(Error::ParseError(_))));
        assert!(matches!(DebianVersion::parse("1.0 beta"), Err(Error::ParseError(_))));
        assert!(matches!(DebianVersion::parse(""), Err(Error::ParseError(_))));
    }

    #[test]
    fn test_known_orderings() {
        assert!(v("1.0~rc1") < v("1.0"));
        assert!(v("1.0") < v("1.0-1"));
        assert!(v("2:1.0") > v("1:9.9"));
        assert!(v("1.0a") < v("1.0b"));
        assert!(v("1.0+git") > v("1.0"));
    }

    #[test]
    fn test_tilde_rules() {
        assert!(v("1.0~~") < v("1.0~~a"));
        assert!(v("1.0~~a") < v("1.0~"));
        assert!(v("1.0~") < v("1.0"));
        assert!(v("1.0") < v("1.0a"));
    }

    #[test]
    fn test_numeric_runs_compare_as_integers() {
        assert!(v("1.10") > v("1.9"));
        assert_eq!(v("1.0"), v("1.00"));
        assert_eq!(v("1.001"), v("1.1"));
        assert!(v("1.99999999999999999999999") > v("1.9999999999999999999999"));
    }

    #[test]
    fn test_compare_strings() {
        assert_eq!(compare("1.0", "1.0").unwrap(), Ordering::Equal);
        assert_eq!(compare("1.0", "1.1").unwrap(), Ordering::Less);
        assert_eq!(compare("0:1.1", "1.0").unwrap(), Ordering::Greater);
        assert!(compare("x:1", "1").is_err());
    }

    const VERSION: &str = "([0-9]{1,2}:)?[0-9][a-z0-9.+~]{0,5}(-[a-z0-9+.~]{1,4})?";

    proptest! {
        #[test]
        fn prop_compare_is_reflexive(a in VERSION) {
            let a = v(&a);
            prop_assert_eq!(a.cmp(&a), Ordering::Equal);
        }

        #[test]
        fn prop_compare_is_antisymmetric(a in VERSION, b in VERSION) {
            let (a, b) = (v(&a), v(&b));
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn prop_compare_is_transitive(a in VERSION, b in VERSION, c in VERSION) {
            let (a, b, c) = (v(&a), v(&b), v(&c));
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            if a >= b && b >= c {
                prop_assert!(a >= c);
            }
        }
    }
}
