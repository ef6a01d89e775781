// src/cache_key.rs

//! Cache branch naming for imported packages
//!
//! Every imported package lives in the object store under a reference
//! derived only from its name, epoch-normalized version-release and
//! architecture:
//!
//! ```text
//! treeforge/pkg/<name>/<evr>.<arch>
//! ```
//!
//! Each component is escaped so the mapping stays injective: ASCII
//! alphanumerics, `.` and `-` pass through, `_` becomes `__`, and any other
//! byte becomes `_XX` with two uppercase hex digits. The architecture also
//! escapes `.` so the final separator is unambiguous.

use crate::error::{Error, Result};
use crate::packages::Nevra;
use std::fmt::Write;

/// Prefix shared by all package cache references
pub const CACHE_BRANCH_PREFIX: &str = "treeforge/pkg/";

/// Compute the cache branch for a package identity
///
/// A leading `0:` epoch on `evr` is dropped so that zero-epoch and
/// epoch-less spellings share one cache entry.
pub fn cache_branch(name: &str, evr: &str, arch: &str) -> String {
    let evr = evr.strip_prefix("0:").unwrap_or(evr);

    let mut branch = String::with_capacity(CACHE_BRANCH_PREFIX.len() + name.len() + evr.len() + arch.len() + 2);
    branch.push_str(CACHE_BRANCH_PREFIX);
    quote_into(&mut branch, name, true);
    branch.push('/');
    quote_into(&mut branch, evr, true);
    branch.push('.');
    quote_into(&mut branch, arch, false);
    branch
}

/// Compute the cache branch for a parsed identity
pub fn cache_branch_for(nevra: &Nevra) -> String {
    cache_branch(&nevra.name, &nevra.evr(), &nevra.arch)
}

fn quote_into(out: &mut String, s: &str, allow_dot: bool) {
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => out.push(b as char),
            b'.' if allow_dot => out.push('.'),
            b'_' => out.push_str("__"),
            _ => {
                // Writing to a String cannot fail
                let _ = write!(out, "_{:02X}", b);
            }
        }
    }
}

fn unquote(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'_' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'_') => {
                out.push(b'_');
                i += 2;
            }
            Some(_) if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .map_err(|_| Error::ParseError(format!("Invalid escape in cache branch component '{}'", s)))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::ParseError(format!("Invalid escape '_{}' in '{}'", hex, s)))?;
                out.push(byte);
                i += 3;
            }
            _ => {
                return Err(Error::ParseError(format!(
                    "Truncated escape in cache branch component '{}'",
                    s
                )));
            }
        }
    }
    String::from_utf8(out).map_err(|e| Error::ParseError(format!("Non-UTF-8 cache branch component: {}", e)))
}

/// Decode a cache branch back into `(name, evr, arch)`
pub fn decode_cache_branch(branch: &str) -> Result<(String, String, String)> {
    let rest = branch
        .strip_prefix(CACHE_BRANCH_PREFIX)
        .ok_or_else(|| Error::ParseError(format!("Not a package cache branch: {}", branch)))?;

    let (name, evr_arch) = rest
        .split_once('/')
        .ok_or_else(|| Error::ParseError(format!("Missing version in cache branch: {}", branch)))?;
    let (evr, arch) = evr_arch
        .rsplit_once('.')
        .ok_or_else(|| Error::ParseError(format!("Missing architecture in cache branch: {}", branch)))?;

    Ok((unquote(name)?, unquote(evr)?, unquote(arch)?))
}

/// Decode a cache branch into a `name-evr.arch` string
pub fn cache_branch_to_nevra(branch: &str) -> Result<String> {
    let (name, evr, arch) = decode_cache_branch(branch)?;
    Ok(format!("{}-{}.{}", name, evr, arch))
}
