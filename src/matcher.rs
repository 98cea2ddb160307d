//! URL pattern matching for rules.
//!
//! A pattern without `*` is a case-insensitive substring test. A pattern with
//! `*` is a glob over the full URL: it gains a `*://` scheme when it has none,
//! a `/*` path when it stops at the host, and is then anchored at both ends.

use crate::error::{PulseError, Result};
use regex::{Regex, RegexBuilder};
use std::sync::LazyLock;

static SCHEME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9+.\-]+://").ok());

/// A compiled rule pattern.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    /// Lower-cased needle for substring containment.
    Substring(String),
    /// Anchored, case-insensitive glob.
    Glob(Regex),
}

impl UrlPattern {
    #[must_use]
    pub fn is_match(&self, url: &str) -> bool {
        let url = url.trim();
        match self {
            Self::Substring(needle) => url.to_lowercase().contains(needle.as_str()),
            Self::Glob(re) => re.is_match(url),
        }
    }
}

fn has_scheme(pattern: &str) -> bool {
    SCHEME_RE
        .as_ref()
        .is_some_and(|re| re.is_match(pattern))
}

/// Expand a glob pattern into its anchored regex source.
fn glob_source(pattern: &str) -> String {
    let mut glob = pattern.to_owned();
    if !has_scheme(&glob) && !glob.starts_with("*://") {
        glob = format!("*://{glob}");
    }

    let has_path = glob
        .split_once("://")
        .is_some_and(|(_, rest)| rest.contains('/'));
    if !has_path {
        glob.push_str("/*");
    }

    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{body}$")
}

/// Compile a rule pattern.
///
/// # Errors
///
/// Returns [`PulseError::Pattern`] when the glob cannot be compiled, for
/// example when it exceeds the regex size limit.
pub fn compile(pattern: &str) -> Result<UrlPattern> {
    let pattern = pattern.trim();
    if !pattern.contains('*') {
        return Ok(UrlPattern::Substring(pattern.to_lowercase()));
    }

    RegexBuilder::new(&glob_source(pattern))
        .case_insensitive(true)
        .build()
        .map(UrlPattern::Glob)
        .map_err(|e| PulseError::Pattern(format!("invalid pattern `{pattern}`: {e}")))
}

/// Whether `url` satisfies `pattern`. Invalid patterns never match.
#[must_use]
pub fn matches(url: &str, pattern: &str) -> bool {
    match compile(pattern) {
        Ok(compiled) => compiled.is_match(url),
        Err(e) => {
            tracing::warn!("{e}");
            false
        }
    }
}

/// Whether a tab URL is eligible for activities (http or https).
#[must_use]
pub fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}
