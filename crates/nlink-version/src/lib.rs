//! Component A — version parsing, comparison, and constraint satisfaction.
//!
//! Grammar:
//! `MAJOR("."MINOR("."PATCH)?)? ("-"PRERELEASE)? ("+"BUILD)?`
//!
//! Two deliberate deviations from SemVer 2.0 are kept rather than
//! "fixed": prerelease comparison is byte-wise lexical, not the dotted-
//! identifier rule, and build metadata never participates in comparison.

use nlink_result::{NexusError, Result};
use std::cmp::Ordering;
use std::fmt;

/// Sentinel used for the wildcard major/minor/patch fields (`*` / `latest`).
pub const WILDCARD: i64 = -1;

#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub const fn wildcard() -> Self {
        Self {
            major: WILDCARD,
            minor: WILDCARD,
            patch: WILDCARD,
            prerelease: None,
            build: None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.major == WILDCARD
    }

    /// Parses a version string per the grammar above.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(NexusError::VersionMalformed(input.to_string()));
        }
        if trimmed == "*" || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::wildcard());
        }

        // Split off build metadata first (everything after the first '+'),
        // then prerelease (everything after the first '-' in what remains).
        let (core_and_pre, build) = match trimmed.split_once('+') {
            Some((a, b)) => (a, Some(b.to_string())),
            None => (trimmed, None),
        };
        let (core, prerelease) = match core_and_pre.split_once('-') {
            Some((a, b)) => (a, Some(b.to_string())),
            None => (core_and_pre, None),
        };

        let mut parts = core.split('.');
        let major = parse_segment(parts.next(), input)?;
        let minor = match parts.next() {
            Some(s) => parse_segment(Some(s), input)?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(s) => parse_segment(Some(s), input)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(NexusError::VersionMalformed(input.to_string()));
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    /// Total order, ignoring build metadata.
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self.is_wildcard(), other.is_wildcard()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.as_bytes().cmp(b.as_bytes()),
            })
    }
}

fn parse_segment(segment: Option<&str>, original: &str) -> Result<i64> {
    let segment = segment.ok_or_else(|| NexusError::VersionMalformed(original.to_string()))?;
    segment
        .parse::<i64>()
        .map_err(|_| NexusError::VersionMalformed(original.to_string()))
        .and_then(|v| {
            if v < 0 {
                Err(NexusError::VersionMalformed(original.to_string()))
            } else {
                Ok(v)
            }
        })
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            return write!(f, "*");
        }
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Tilde,
    Caret,
    Any,
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub op: ConstraintOp,
    pub reference: Version,
}

impl Constraint {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(NexusError::ConstraintMalformed(input.to_string()));
        }
        if trimmed == "*" {
            return Ok(Self {
                op: ConstraintOp::Any,
                reference: Version::wildcard(),
            });
        }

        // Longest-glyph-first so "<=" isn't mistaken for "<".
        const GLYPHS: &[(&str, ConstraintOp)] = &[
            ("<=", ConstraintOp::Le),
            (">=", ConstraintOp::Ge),
            ("=", ConstraintOp::Eq),
            ("<", ConstraintOp::Lt),
            (">", ConstraintOp::Gt),
            ("~", ConstraintOp::Tilde),
            ("^", ConstraintOp::Caret),
        ];

        let (op, rest) = GLYPHS
            .iter()
            .find_map(|(glyph, op)| trimmed.strip_prefix(glyph).map(|rest| (*op, rest)))
            .ok_or_else(|| NexusError::ConstraintMalformed(input.to_string()))?;

        let reference = Version::parse(rest.trim())
            .map_err(|_| NexusError::ConstraintMalformed(input.to_string()))?;

        Ok(Self { op, reference })
    }

    /// Whether `version` satisfies this constraint.
    pub fn satisfies(&self, version: &Version) -> bool {
        use ConstraintOp::*;
        match self.op {
            Any => true,
            Eq => version.compare(&self.reference) == Ordering::Equal,
            Lt => version.compare(&self.reference) == Ordering::Less,
            Le => version.compare(&self.reference) != Ordering::Greater,
            Gt => version.compare(&self.reference) == Ordering::Greater,
            Ge => version.compare(&self.reference) != Ordering::Less,
            Tilde => {
                version.major == self.reference.major
                    && version.minor == self.reference.minor
                    && version.patch >= self.reference.patch
            }
            Caret => {
                if version.major != self.reference.major {
                    return false;
                }
                if self.reference.major == 0 {
                    version.minor == self.reference.minor && version.patch >= self.reference.patch
                } else {
                    version.compare(&self.reference) != Ordering::Less
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_full_form() {
        for s in ["1.2.3", "0.0.1", "10.20.30-beta", "1.0.0-alpha+build5"] {
            let v = Version::parse(s).unwrap();
            assert_eq!(v.to_string(), s);
        }
    }

    #[test]
    fn missing_segments_default_to_zero() {
        let v = Version::parse("1").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 0, 0));
        let v = Version::parse("1.2").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 0));
    }

    #[test]
    fn wildcard_literals() {
        assert!(Version::parse("*").unwrap().is_wildcard());
        assert!(Version::parse("latest").unwrap().is_wildcard());
    }

    #[test]
    fn wildcard_is_less_than_everything_but_itself() {
        let w = Version::wildcard();
        let v = Version::parse("0.0.1").unwrap();
        assert_eq!(w.compare(&w), Ordering::Equal);
        assert_eq!(w.compare(&v), Ordering::Less);
        assert_eq!(v.compare(&w), Ordering::Greater);
    }

    #[test]
    fn prerelease_orders_before_release() {
        let pre = Version::parse("1.0.0-alpha").unwrap();
        let rel = Version::parse("1.0.0").unwrap();
        assert!(pre < rel);
    }

    #[test]
    fn prerelease_compares_byte_wise() {
        let a = Version::parse("1.0.0-alpha").unwrap();
        let b = Version::parse("1.0.0-beta").unwrap();
        assert!(a < b);
    }

    #[test]
    fn build_metadata_ignored_in_comparison() {
        let a = Version::parse("1.0.0+001").unwrap();
        let b = Version::parse("1.0.0+002").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_version_errors() {
        assert!(matches!(
            Version::parse("abc"),
            Err(NexusError::VersionMalformed(_))
        ));
        assert!(matches!(
            Version::parse("1.2.3.4"),
            Err(NexusError::VersionMalformed(_))
        ));
    }

    #[test]
    fn constraint_glyphs_tolerate_spaces() {
        let c = Constraint::parse(">= 1.2.3").unwrap();
        assert_eq!(c.op, ConstraintOp::Ge);
        assert_eq!(c.reference, Version::parse("1.2.3").unwrap());
    }

    #[test]
    fn malformed_constraint_errors() {
        assert!(matches!(
            Constraint::parse("huh 1.2.3"),
            Err(NexusError::ConstraintMalformed(_))
        ));
    }

    // caret on zero-major.
    #[test]
    fn caret_zero_major_scenario() {
        let c = Constraint::parse("^0.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("0.2.5").unwrap()));
        assert!(!c.satisfies(&Version::parse("0.3.0").unwrap()));
    }

    #[test]
    fn caret_nonzero_major_only_requires_major_match() {
        let c = Constraint::parse("^1.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("1.9.0").unwrap()));
        assert!(!c.satisfies(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn tilde_requires_major_minor_match() {
        let c = Constraint::parse("~1.2.3").unwrap();
        assert!(c.satisfies(&Version::parse("1.2.9").unwrap()));
        assert!(!c.satisfies(&Version::parse("1.3.0").unwrap()));
    }

    #[test]
    fn ge_is_monotonic() {
        let c = Constraint::parse(">=1.0.0").unwrap();
        let b = Version::parse("1.0.0").unwrap();
        assert!(c.satisfies(&b));
        let a = Version::parse("2.0.0").unwrap();
        assert!(a >= b);
        assert!(c.satisfies(&a));
    }
}
