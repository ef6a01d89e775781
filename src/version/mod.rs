// src/version/mod.rs

//! RPM-style version comparison
//!
//! Used to tell updates from downgrades when a requested package replaces
//! one already present in the base tree.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A parsed epoch:version-release triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpmVersion {
    pub epoch: u64,
    pub version: String,
    pub release: Option<String>,
}

impl RpmVersion {
    /// Parse an RPM version string
    ///
    /// Format: [epoch:]version[-release]
    /// - "1.2.3" → epoch=0, version="1.2.3", release=None
    /// - "1:2.3.4-5.el8" → epoch=1, version="2.3.4", release=Some("5.el8")
    pub fn parse(s: &str) -> Result<Self> {
        let (epoch_str, rest) = match s.split_once(':') {
            Some((e, r)) => (e, r),
            None => ("0", s),
        };

        let epoch = if epoch_str.is_empty() {
            0
        } else {
            epoch_str
                .parse::<u64>()
                .map_err(|e| Error::ParseError(format!("Invalid epoch in version '{}': {}", s, e)))?
        };

        let (version, release) = match rest.rsplit_once('-') {
            Some((v, r)) => (v.to_string(), Some(r.to_string())),
            None => (rest.to_string(), None),
        };

        if version.is_empty() {
            return Err(Error::ParseError(format!("Empty version component in '{}'", s)));
        }

        Ok(Self {
            epoch,
            version,
            release,
        })
    }

    /// Compare two versions the way rpm does
    pub fn compare(&self, other: &RpmVersion) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| match (&self.release, &other.release) {
                (Some(a), Some(b)) => rpmvercmp(a, b),
                // A missing release matches anything
                _ => Ordering::Equal,
            })
    }
}

impl fmt::Display for RpmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.version)?;
        if let Some(ref release) = self.release {
            write!(f, "-{}", release)?;
        }
        Ok(())
    }
}

impl Ord for RpmVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for RpmVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Segment-wise version comparison
///
/// Versions are split into alternating runs of digits and letters; other
/// characters only separate segments. Numeric runs compare numerically and
/// beat alphabetic runs. `~` sorts before everything (pre-releases) and `^`
/// sorts after the base version but before any further segment.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    loop {
        while i < a.len() && !a[i].is_ascii_alphanumeric() && a[i] != b'~' && a[i] != b'^' {
            i += 1;
        }
        while j < b.len() && !b[j].is_ascii_alphanumeric() && b[j] != b'~' && b[j] != b'^' {
            j += 1;
        }

        // Tilde: the side that has it is older
        let at = a.get(i) == Some(&b'~');
        let bt = b.get(j) == Some(&b'~');
        if at || bt {
            if at && bt {
                i += 1;
                j += 1;
                continue;
            }
            return if at { Ordering::Less } else { Ordering::Greater };
        }

        // Caret: newer than end-of-string, older than any other segment
        let ac = a.get(i) == Some(&b'^');
        let bc = b.get(j) == Some(&b'^');
        if ac || bc {
            if i >= a.len() {
                return Ordering::Less;
            }
            if j >= b.len() {
                return Ordering::Greater;
            }
            if !ac {
                return Ordering::Greater;
            }
            if !bc {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        if i >= a.len() || j >= b.len() {
            break;
        }

        let numeric = a[i].is_ascii_digit();
        let seg_end = |s: &[u8], start: usize| {
            let mut end = start;
            while end < s.len()
                && (if numeric { s[end].is_ascii_digit() } else { s[end].is_ascii_alphabetic() })
            {
                end += 1;
            }
            end
        };
        let ie = seg_end(a, i);
        let je = seg_end(b, j);

        let sa = &a[i..ie];
        let sb = &b[j..je];

        if sb.is_empty() {
            // Segment types differ; numeric wins
            return if numeric { Ordering::Greater } else { Ordering::Less };
        }

        let ord = if numeric {
            let ta = trim_leading_zeros(sa);
            let tb = trim_leading_zeros(sb);
            ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb))
        } else {
            sa.cmp(sb)
        };
        if ord != Ordering::Equal {
            return ord;
        }

        i = ie;
        j = je;
    }

    match (i >= a.len(), j >= b.len()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}
