use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use serde::Serialize;

use super::ValidationError;

/// Key/value metadata attached to a data point.
///
/// Backed by a `BTreeMap` so iteration and display order are alphabetical by
/// key, which keeps the `{a=b,c=d}` rendering stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a tag, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds or overwrites everything from `other` into `self`.
    pub fn merge(&mut self, other: &TagSet) -> &mut Self {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    /// Returns true if every `k=v` pair of `other` is present in `self`.
    pub fn subset(&self, other: &TagSet) -> bool {
        other.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    /// Returns the pairs present with the same value in both sets.
    pub fn intersection(&self, other: &TagSet) -> TagSet {
        self.0
            .iter()
            .filter(|(k, v)| other.0.get(*k) == Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Renders `a=b,c=d` without the surrounding braces.
    pub fn tags(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 16);
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Cleans every key and value in place.
    ///
    /// Fails on the first key or value whose cleaned form is empty, and when
    /// two keys clean to the same key. The set is left untouched on failure.
    pub fn clean(&mut self) -> Result<(), ValidationError> {
        let mut cleaned = BTreeMap::new();
        for (k, v) in &self.0 {
            let kc = clean(k).map_err(|_| ValidationError::TagKey { key: k.clone() })?;
            let vc = clean(v).map_err(|_| ValidationError::TagValue {
                key: k.clone(),
                value: v.clone(),
            })?;
            if cleaned.contains_key(&kc) {
                return Err(ValidationError::DuplicateTag(kc));
            }
            cleaned.insert(kc, vc);
        }
        self.0 = cleaned;
        Ok(())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.tags())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for TagSet {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<'de> serde::Deserialize<'de> for TagSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(Self)
    }
}

// Letters, decimal digits, `-`, `_`, `.` and `/`.
fn disallowed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{Nd}\-_./]+").expect("static pattern"))
}

fn valid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\p{L}\p{Nd}\-_./]+$").expect("static pattern"))
}

/// Replace with an empty replacement string.
pub fn clean(s: &str) -> Result<String, ValidationError> {
    replace(s, "")
}

/// Rewrites `s` into the accepted character set.
///
/// Each run of disallowed characters collapses into a single `replacement`.
/// An empty result is an error.
pub fn replace(s: &str, replacement: &str) -> Result<String, ValidationError> {
    let out = disallowed_re().replace_all(s, NoExpand(replacement));
    if out.is_empty() {
        return Err(ValidationError::Empty);
    }
    Ok(out.into_owned())
}

/// Like [`replace`], but returns an empty string on error.
pub fn must_replace(s: &str, replacement: &str) -> String {
    replace(s, replacement).unwrap_or_default()
}

/// Returns true if `s` is a non-empty valid metric name or tag.
pub fn valid_tag(s: &str) -> bool {
    valid_re().is_match(s)
}

/// Parses `k=v,m=o` pairs.
///
/// Values may be `*` or `|`-separated alternatives, the query form used by
/// [`replace_tags`].
pub fn parse_tags(t: &str) -> Result<TagSet, ValidationError> {
    let mut ts = TagSet::new();
    for pair in t.split(',') {
        let Some((k, v)) = pair.split_once('=') else {
            return Err(ValidationError::BadTag(pair.to_string()));
        };
        let (k, v) = (k.trim(), v.trim());
        if !valid_tag(k) {
            return Err(ValidationError::InvalidCharacter(k.to_string()));
        }
        if !v.split('|').all(|alt| alt == "*" || valid_tag(alt)) {
            return Err(ValidationError::InvalidCharacter(v.to_string()));
        }
        if ts.contains_key(k) {
            return Err(ValidationError::DuplicateTag(pair.to_string()));
        }
        ts.insert(k, v);
    }
    Ok(ts)
}

fn group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^}]+\}").expect("static pattern"))
}

/// Replaces the values of every `{k=v}` group in `text` with the matching
/// non-empty values from `group`.
///
/// `"test.metric{host=*}"` with `host=web01` becomes `"test.metric{host=web01}"`.
/// Groups that fail to parse are left as they are.
pub fn replace_tags(text: &str, group: &TagSet) -> String {
    group_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let whole = &caps[0];
            let inner = &whole[1..whole.len() - 1];
            let Ok(mut tags) = parse_tags(inner) else {
                return whole.to_string();
            };
            let keys: Vec<String> = tags.iter().map(|(k, _)| k.to_string()).collect();
            for k in keys {
                if let Some(v) = group.get(&k).filter(|v| !v.is_empty()) {
                    tags.insert(k, v);
                }
            }
            tags.to_string()
        })
        .into_owned()
}
