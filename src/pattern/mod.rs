//! Wildcard patterns for endpoint and cache-key matching.
//!
//! A pattern is a literal string in which `*` stands for any sequence of
//! characters (including none). Matching is anchored at both ends, so
//! `/api/upload*` matches `/api/upload` and `/api/upload/big` but not
//! `/v2/api/upload`.
//!
//! | Pattern         | Matches                          | Does not match        |
//! |-----------------|----------------------------------|-----------------------|
//! | `/api/upload*`  | `/api/upload`, `/api/upload/1`   | `/v2/api/upload`      |
//! | `GET:*/news*`   | `GET:https://x/news/42`          | `POST:https://x/news` |
//! | `*`             | everything                       |                       |
//!
//! Prefix patterns are plain string prefixes, not path-segment aware.

use std::fmt;

/// A compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    raw: String,
    // Literal pieces between `*`s. `parts.len() == 1` means no wildcard.
    parts: Vec<String>,
}

impl WildcardPattern {
    /// Compiles `pattern`. Consecutive `*`s collapse into one.
    pub fn new(pattern: &str) -> Self {
        let parts = pattern.split('*').map(str::to_owned).collect();
        Self {
            raw: pattern.to_owned(),
            parts,
        }
    }

    /// Returns the source text of the pattern.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns `true` if the pattern contains no `*`.
    pub fn is_literal(&self) -> bool {
        self.parts.len() == 1
    }

    /// Tests `candidate` against the pattern.
    ///
    /// ```
    /// use apigate::pattern::WildcardPattern;
    ///
    /// let p = WildcardPattern::new("/api/*/items/*");
    /// assert!(p.matches("/api/v1/items/9"));
    /// assert!(!p.matches("/api/v1/users/9"));
    /// ```
    pub fn matches(&self, candidate: &str) -> bool {
        if self.is_literal() {
            return self.raw == candidate;
        }

        let first = &self.parts[0];
        let last = &self.parts[self.parts.len() - 1];
        if candidate.len() < first.len() + last.len()
            || !candidate.starts_with(first.as_str())
            || !candidate.ends_with(last.as_str())
        {
            return false;
        }

        // Greedy leftmost search for the middle pieces inside the window left
        // between the anchored prefix and suffix.
        let mut rest = &candidate[first.len()..candidate.len() - last.len()];
        for part in &self.parts[1..self.parts.len() - 1] {
            if part.is_empty() {
                continue;
            }
            match rest.find(part.as_str()) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
        true
    }
}

impl fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for WildcardPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_requires_exact_match() {
        let p = WildcardPattern::new("/health");
        assert!(p.is_literal());
        assert!(p.matches("/health"));
        assert!(!p.matches("/health/"));
        assert!(!p.matches("/healthz"));
    }

    #[test]
    fn trailing_star_is_prefix() {
        let p = WildcardPattern::new("/api/upload*");
        assert!(p.matches("/api/upload"));
        assert!(p.matches("/api/upload/avatar.png"));
        assert!(!p.matches("/api/download"));
        assert!(!p.matches("/v2/api/upload"));
    }

    #[test]
    fn leading_star_is_suffix() {
        let p = WildcardPattern::new("*.json");
        assert!(p.matches("config.json"));
        assert!(p.matches(".json"));
        assert!(!p.matches("config.yaml"));
    }

    #[test]
    fn inner_stars() {
        let p = WildcardPattern::new("GET:*/news/*?page=*");
        assert!(p.matches("GET:https://backend/news/42?page=1"));
        assert!(!p.matches("GET:https://backend/news/42"));
    }

    #[test]
    fn overlapping_prefix_and_suffix_do_not_match() {
        // "ab*ba" must not match "aba": prefix and suffix would share a char.
        let p = WildcardPattern::new("ab*ba");
        assert!(!p.matches("aba"));
        assert!(p.matches("abba"));
    }

    #[test]
    fn lone_star_matches_everything() {
        let p = WildcardPattern::new("*");
        assert!(p.matches(""));
        assert!(p.matches("anything at all"));
    }

    #[test]
    fn repeated_stars_collapse() {
        let p = WildcardPattern::new("/a**/b");
        assert!(p.matches("/a/x/b"));
        assert!(p.matches("/a/b"));
    }
}
