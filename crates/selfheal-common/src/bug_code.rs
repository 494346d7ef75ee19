//! Bug code generation: `BUG-<YYYYMMDD>-<4 lowercase alphanumerics>`.
//!
//! Uniqueness is best-effort. The store enforces it with a UNIQUE index and
//! callers retry with a fresh code on collision.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;

pub const BUG_CODE_PATTERN: &str = r"^BUG-\d{8}-[a-z0-9]{4}$";

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 4;

static BUG_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(BUG_CODE_PATTERN).expect("bug code pattern is valid"));

pub fn generate_bug_code<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("BUG-{}-{}", now.format("%Y%m%d"), suffix)
}

pub fn is_valid_bug_code(code: &str) -> bool {
    BUG_CODE_RE.is_match(code)
}
