//! URI pattern matching and specificity ranking.
//!
//! Patterns split on `/`. A literal segment matches its exact string
//! (case-sensitive), `*` matches any single segment, `{name}` matches any
//! single segment and captures it, and a trailing `**` matches one or more
//! remaining segments.

use std::collections::BTreeMap;

use super::error::DomainError;

/// Captured `{param}` bindings from a successful match.
pub type Bindings = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// `*`
    Any,
    /// `**`, only valid in tail position.
    Tail,
}

/// A parsed URI pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriPattern {
    segments: Vec<Segment>,
}

/// Comparable match specificity.
///
/// Ordering is lexicographic over the fields, which yields the ranking
/// rule: exact > longer prefix > shorter prefix, literal beats `{param}`,
/// `{param}` beats `*`, and a bounded pattern beats a trailing `**`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    literals: u16,
    params: u16,
    bounded: bool,
}

impl Specificity {
    /// Packed score for the wire: higher is more specific.
    #[must_use]
    pub fn score(self) -> u64 {
        (u64::from(self.literals) << 24) | (u64::from(self.params) << 8) | u64::from(self.bounded)
    }
}

/// Split a URI path into segments, ignoring leading/trailing slashes.
#[must_use]
pub fn split_uri(uri: &str) -> Vec<&str> {
    uri.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

impl UriPattern {
    /// Parse a pattern string.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty pattern, a non-tail `**`, or
    /// an unterminated `{param}` segment.
    pub fn parse(pattern: &str) -> Result<Self, DomainError> {
        let raw = split_uri(pattern);
        if raw.is_empty() {
            return Err(DomainError::InvalidArgument(format!(
                "empty URI pattern: {pattern:?}"
            )));
        }

        let mut segments = Vec::with_capacity(raw.len());
        for (idx, seg) in raw.iter().enumerate() {
            let parsed = match *seg {
                "**" => {
                    if idx + 1 != raw.len() {
                        return Err(DomainError::InvalidArgument(
                            "`**` is only valid as the final segment".to_owned(),
                        ));
                    }
                    Segment::Tail
                }
                "*" => Segment::Any,
                s if s.starts_with('{') => {
                    let name = s
                        .strip_prefix('{')
                        .and_then(|s| s.strip_suffix('}'))
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| {
                            DomainError::InvalidArgument(format!("malformed parameter segment: {s}"))
                        })?;
                    Segment::Param(name.to_owned())
                }
                s => Segment::Literal(s.to_owned()),
            };
            segments.push(parsed);
        }

        Ok(Self { segments })
    }

    /// Match the pattern against a URI. Returns the specificity of the
    /// match and any `{param}` bindings, or `None` when it does not match.
    #[must_use]
    pub fn matches(&self, uri: &str) -> Option<(Specificity, Bindings)> {
        let parts = split_uri(uri);
        let has_tail = matches!(self.segments.last(), Some(Segment::Tail));
        let head_len = if has_tail {
            self.segments.len() - 1
        } else {
            self.segments.len()
        };

        if has_tail {
            // `**` consumes one or more trailing segments.
            if parts.len() <= head_len {
                return None;
            }
        } else if parts.len() != head_len {
            return None;
        }

        let mut bindings = Bindings::new();
        let mut literals: u16 = 0;
        let mut params: u16 = 0;

        for (seg, part) in self.segments[..head_len].iter().zip(&parts) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                    literals += 1;
                }
                Segment::Param(name) => {
                    bindings.insert(name.clone(), (*part).to_owned());
                    params += 1;
                }
                Segment::Any => {}
                Segment::Tail => unreachable!("tail handled above"),
            }
        }

        Some((
            Specificity {
                literals,
                params,
                bounded: !has_tail,
            },
            bindings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pattern: &str, uri: &str) -> Specificity {
        UriPattern::parse(pattern)
            .unwrap()
            .matches(uri)
            .unwrap_or_else(|| panic!("{pattern} should match {uri}"))
            .0
    }

    #[test]
    fn literal_match_is_exact_and_case_sensitive() {
        let p = UriPattern::parse("/api/orders").unwrap();
        assert!(p.matches("/api/orders").is_some());
        assert!(p.matches("/api/Orders").is_none());
        assert!(p.matches("/api/orders/1").is_none());
        assert!(p.matches("/api").is_none());
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        let p = UriPattern::parse("/api/*").unwrap();
        assert!(p.matches("/api/orders").is_some());
        assert!(p.matches("/api").is_none());
        assert!(p.matches("/api/orders/1").is_none());
    }

    #[test]
    fn tail_matches_one_or_more_segments() {
        let p = UriPattern::parse("/api/**").unwrap();
        assert!(p.matches("/api/orders").is_some());
        assert!(p.matches("/api/orders/1/lines").is_some());
        assert!(p.matches("/api").is_none(), "`**` requires at least one segment");
    }

    #[test]
    fn param_binds_segment() {
        let p = UriPattern::parse("/api/orders/{id}").unwrap();
        let (_, bindings) = p.matches("/api/orders/42").unwrap();
        assert_eq!(bindings.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn tail_must_be_final() {
        assert!(UriPattern::parse("/api/**/x").is_err());
        assert!(UriPattern::parse("").is_err());
        assert!(UriPattern::parse("/api/{broken").is_err());
    }

    #[test]
    fn specificity_ranking() {
        // exact beats tail wildcard
        assert!(spec("/api/orders", "/api/orders") > spec("/api/**", "/api/orders"));
        // longer literal prefix beats shorter
        assert!(spec("/api/orders/**", "/api/orders/1") > spec("/api/**", "/api/orders/1"));
        // literal beats param
        assert!(spec("/api/orders", "/api/orders") > spec("/api/{res}", "/api/orders"));
        // param beats star
        assert!(spec("/api/{res}", "/api/orders") > spec("/api/*", "/api/orders"));
        // bounded star beats tail
        assert!(spec("/api/*", "/api/orders") > spec("/api/**", "/api/orders"));
    }

    #[test]
    fn split_uri_normalizes_slashes() {
        assert_eq!(split_uri("/a/b/"), vec!["a", "b"]);
        assert_eq!(split_uri("a//b"), vec!["a", "b"]);
        assert!(split_uri("/").is_empty());
    }
}
