//! Minimal semantic versions as used by the manifest and `spec.version`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version")]
    Empty,
    #[error("invalid version: {0}")]
    Invalid(String),
}

/// `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`, with an optional leading `v`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl SemVersion {
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }
        let s = s.strip_prefix('v').unwrap_or(s);
        let core = s.split('+').next().unwrap_or(s);
        let (nums, pre) = match core.split_once('-') {
            Some((n, p)) if !p.is_empty() => (n, Some(p.to_string())),
            Some(_) => return Err(VersionError::Invalid(s.to_string())),
            None => (core, None),
        };
        let mut parts = nums.split('.');
        let mut next = || -> Result<u64, VersionError> {
            parts
                .next()
                .ok_or_else(|| VersionError::Invalid(s.to_string()))?
                .parse::<u64>()
                .map_err(|_| VersionError::Invalid(s.to_string()))
        };
        let (major, minor, patch) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(VersionError::Invalid(s.to_string()));
        }
        Ok(Self { major, minor, patch, prerelease: pre })
    }

    /// Equal ignoring prerelease tags.
    pub fn same_release(&self, other: &SemVersion) -> bool {
        (self.major, self.minor, self.patch) == (other.major, other.minor, other.patch)
    }
}

impl FromStr for SemVersion {
    type Err = VersionError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for SemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(p) = &self.prerelease {
            write!(f, "-{p}")?;
        }
        Ok(())
    }
}

impl Ord for SemVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => cmp_prerelease(a, b),
            })
    }
}

/// Dot-separated identifiers left to right; a shorter list of equal
/// identifiers sorts first.
fn cmp_prerelease(a: &str, b: &str) -> Ordering {
    cmp_each(a.split('.'), b.split('.'), cmp_identifier).then_with(|| a.cmp(b))
}

/// Numeric identifiers by value and below alphanumeric ones. Alphanumeric
/// identifiers compare digit runs by value, so `rc2 < rc10`.
fn cmp_identifier(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    match (numeric(a), numeric(b)) {
        (true, true) => cmp_digits(a, b),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => cmp_each(runs(a), runs(b), |x, y| {
            if numeric(x) && numeric(y) {
                cmp_digits(x, y)
            } else {
                x.cmp(y)
            }
        }),
    }
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn cmp_each<'a>(
    mut xs: impl Iterator<Item = &'a str>,
    mut ys: impl Iterator<Item = &'a str>,
    f: impl Fn(&str, &str) -> Ordering,
) -> Ordering {
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match f(x, y) {
                Ordering::Equal => continue,
                o => return o,
            },
        }
    }
}

/// Alternating runs of digits and non-digits.
fn runs(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let digit = rest.bytes().next()?.is_ascii_digit();
        let end = rest.find(|c: char| c.is_ascii_digit() != digit).unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        rest = tail;
        Some(run)
    })
}

impl PartialOrd for SemVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
