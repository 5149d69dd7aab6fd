//! Hierarchical names used as keys for data and tasks.
//!
//! A [`Name`] is a sequence of tokens separated by dots, for example
//! `group.sample[3].spectrum`. Each token has a body and an optional index in
//! square brackets. The characters `.`, `[`, `]` and `\` are escaped with a
//! backslash when they occur inside a body or an index, so every name can be
//! printed and parsed back into the same value.

use std::fmt::{self, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NameError;

const SEPARATOR: char = '.';
const INDEX_OPEN: char = '[';
const INDEX_CLOSE: char = ']';
const ESCAPE: char = '\\';

/// Matches exactly one token in a [`NamePattern`].
pub const WILDCARD_ONE: &str = "*";
/// Matches one or more tokens, only allowed as the first or the last token of
/// a [`NamePattern`].
pub const WILDCARD_MANY: &str = "**";

/// A single element of a [`Name`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameToken {
    body: String,
    index: Option<String>,
}

impl NameToken {
    /// Create a token without an index.
    ///
    /// # Panics
    /// Panics if `body` is empty, tokens are never empty.
    pub fn new(body: impl Into<String>) -> Self {
        let body = body.into();
        assert!(!body.is_empty(), "name token body can't be empty");
        Self { body, index: None }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// The same token without its index.
    pub fn without_index(&self) -> NameToken {
        NameToken {
            body: self.body.clone(),
            index: None,
        }
    }

    fn is_wildcard(&self, wildcard: &str) -> bool {
        self.index.is_none() && self.body == wildcard
    }
}

fn escape_into(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for ch in text.chars() {
        if matches!(ch, SEPARATOR | INDEX_OPEN | INDEX_CLOSE | ESCAPE) {
            f.write_char(ESCAPE)?;
        }
        f.write_char(ch)?;
    }
    Ok(())
}

impl fmt::Display for NameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        escape_into(f, &self.body)?;
        if let Some(index) = &self.index {
            f.write_char(INDEX_OPEN)?;
            escape_into(f, index)?;
            f.write_char(INDEX_CLOSE)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameToken({self})")
    }
}

/// A hierarchical, dot separated path.
///
/// The empty name ([`Name::EMPTY`]) has no tokens, it addresses the root of a
/// tree and the root data of a workspace.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(Vec<NameToken>);

impl Name {
    pub const EMPTY: Name = Name(Vec::new());

    pub fn of(tokens: impl IntoIterator<Item = NameToken>) -> Self {
        Self(tokens.into_iter().collect())
    }

    /// A single token name, the body is taken literally and not parsed.
    pub fn token(body: impl Into<String>) -> Self {
        Self(vec![NameToken::new(body)])
    }

    /// Parse the textual form produced by [`Display`](fmt::Display).
    pub fn parse(text: &str) -> Result<Self, NameError> {
        if text.is_empty() {
            return Ok(Name::EMPTY);
        }

        let mut tokens = Vec::new();
        let mut body = String::new();
        let mut index: Option<String> = None;
        let mut closed = false;
        let mut chars = text.chars();

        while let Some(ch) = chars.next() {
            match ch {
                ESCAPE => {
                    let next = chars
                        .next()
                        .ok_or_else(|| NameError::Syntax(text.into(), "dangling escape"))?;
                    if closed {
                        return Err(NameError::Syntax(text.into(), "text after index"));
                    }
                    match index.as_mut() {
                        Some(index) => index.push(next),
                        None => body.push(next),
                    }
                }
                SEPARATOR if index.is_none() || closed => {
                    if body.is_empty() {
                        return Err(NameError::Syntax(text.into(), "empty token"));
                    }
                    tokens.push(NameToken {
                        body: std::mem::take(&mut body),
                        index: index.take(),
                    });
                    closed = false;
                }
                INDEX_OPEN if index.is_none() => {
                    index = Some(String::new());
                }
                INDEX_CLOSE if index.is_some() && !closed => {
                    closed = true;
                }
                INDEX_OPEN | INDEX_CLOSE => {
                    return Err(NameError::Syntax(text.into(), "unbalanced brackets"));
                }
                _ if closed => {
                    return Err(NameError::Syntax(text.into(), "text after index"));
                }
                _ => match index.as_mut() {
                    Some(index) => index.push(ch),
                    None => body.push(ch),
                },
            }
        }

        if index.is_some() && !closed {
            return Err(NameError::Syntax(text.into(), "unclosed index"));
        }
        if body.is_empty() {
            return Err(NameError::Syntax(text.into(), "empty token"));
        }
        tokens.push(NameToken { body, index });

        Ok(Name(tokens))
    }

    pub fn tokens(&self) -> &[NameToken] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&NameToken> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NameToken> {
        self.0.last()
    }

    /// The name without its first token.
    pub fn cut_first(&self) -> Name {
        Name(self.0.iter().skip(1).cloned().collect())
    }

    /// The name without its last token.
    pub fn cut_last(&self) -> Name {
        let end = self.0.len().saturating_sub(1);
        Name(self.0[..end].to_vec())
    }

    /// The first `n` tokens of this name.
    pub fn head(&self, n: usize) -> Name {
        Name(self.0.iter().take(n).cloned().collect())
    }

    pub fn push(&mut self, token: NameToken) {
        self.0.push(token);
    }

    pub fn join(&self, other: &Name) -> Name {
        let mut tokens = Vec::with_capacity(self.len() + other.len());
        tokens.extend_from_slice(&self.0);
        tokens.extend_from_slice(&other.0);
        Name(tokens)
    }

    pub fn child(&self, body: impl Into<String>) -> Name {
        let mut name = self.clone();
        name.push(NameToken::new(body));
        name
    }

    /// Replace the index of the last token.
    pub fn with_index(&self, index: impl Into<String>) -> Name {
        let mut name = self.clone();
        if let Some(last) = name.0.pop() {
            name.0.push(last.with_index(index));
        }
        name
    }

    pub fn starts_with(&self, prefix: &Name) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn ends_with(&self, suffix: &Name) -> bool {
        self.0.ends_with(&suffix.0)
    }

    pub fn strip_prefix(&self, prefix: &Name) -> Option<Name> {
        self.0.strip_prefix(prefix.0.as_slice()).map(|rest| Name(rest.to_vec()))
    }

    pub fn strip_suffix(&self, suffix: &Name) -> Option<Name> {
        self.0.strip_suffix(suffix.0.as_slice()).map(|rest| Name(rest.to_vec()))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char(SEPARATOR)?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}

/// Convenience conversion, text which is not a valid name becomes a single
/// literal token.
impl From<&str> for Name {
    fn from(text: &str) -> Self {
        Name::parse(text).unwrap_or_else(|_| Name::token(text))
    }
}

impl From<String> for Name {
    fn from(text: String) -> Self {
        Name::from(text.as_str())
    }
}

impl From<&Name> for Name {
    fn from(name: &Name) -> Self {
        name.clone()
    }
}

impl From<NameToken> for Name {
    fn from(token: NameToken) -> Self {
        Name(vec![token])
    }
}

impl PartialEq<NameToken> for Name {
    fn eq(&self, other: &NameToken) -> bool {
        self.0.len() == 1 && self.0[0] == *other
    }
}

impl std::ops::Add<&Name> for &Name {
    type Output = Name;

    fn add(self, rhs: &Name) -> Name {
        self.join(rhs)
    }
}

impl std::ops::Add<Name> for Name {
    type Output = Name;

    fn add(mut self, rhs: Name) -> Name {
        self.0.extend(rhs.0);
        self
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Name::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// A validated name used to match other names.
///
/// `*` matches exactly one token, `**` matches one or more tokens and may
/// only be the first or the last token of the pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamePattern {
    tokens: Vec<NameToken>,
    leading: bool,
    trailing: bool,
}

impl NamePattern {
    pub fn new(pattern: Name) -> Result<Self, NameError> {
        let tokens = pattern.0;
        let count = tokens.len();

        for (i, token) in tokens.iter().enumerate() {
            if token.is_wildcard(WILDCARD_MANY) && i != 0 && i + 1 != count {
                return Err(NameError::Wildcard(Name(tokens.clone()).to_string()));
            }
        }

        let leading = tokens.first().is_some_and(|t| t.is_wildcard(WILDCARD_MANY));
        let trailing = count > 1 && tokens.last().is_some_and(|t| t.is_wildcard(WILDCARD_MANY));

        let start = usize::from(leading);
        let end = count - usize::from(trailing);

        Ok(Self {
            tokens: tokens[start..end].to_vec(),
            leading,
            trailing,
        })
    }

    pub fn parse(text: &str) -> Result<Self, NameError> {
        Self::new(Name::parse(text)?)
    }

    pub fn matches(&self, name: &Name) -> bool {
        let fixed = self.tokens.len();
        let extra = usize::from(self.leading) + usize::from(self.trailing);

        if name.len() < fixed + extra {
            return false;
        }

        match (self.leading, self.trailing) {
            (false, false) => name.len() == fixed && Self::matches_run(&self.tokens, &name.0),
            (true, false) => Self::matches_run(&self.tokens, &name.0[name.len() - fixed..]),
            (false, true) => Self::matches_run(&self.tokens, &name.0[..fixed]),
            (true, true) => (1..=name.len() - fixed - 1)
                .any(|start| Self::matches_run(&self.tokens, &name.0[start..start + fixed])),
        }
    }

    fn matches_run(pattern: &[NameToken], tokens: &[NameToken]) -> bool {
        pattern
            .iter()
            .zip(tokens)
            .all(|(p, t)| p.is_wildcard(WILDCARD_ONE) || p == t)
    }
}

impl FromStr for NamePattern {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NamePattern::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let name = Name::parse("a.b[3].c").unwrap();
        assert_eq!(name.len(), 3);
        assert_eq!(name.tokens()[1].body(), "b");
        assert_eq!(name.tokens()[1].index(), Some("3"));
        assert_eq!(name.to_string(), "a.b[3].c");
    }

    #[test]
    fn test_round_trip_escaped() {
        let name = Name::of([
            NameToken::new("a.b"),
            NameToken::new("c[d]").with_index("x.y]"),
            NameToken::new("back\\slash"),
        ]);
        let text = name.to_string();
        assert_eq!(text, "a\\.b.c\\[d\\][x\\.y\\]].back\\\\slash");
        assert_eq!(Name::parse(&text).unwrap(), name);
    }

    #[test]
    fn test_round_trip_many() {
        for text in ["x", "x.y.z", "a[1]", "a[].b", "\\.", "a[\\[].b"] {
            let name = Name::parse(text).unwrap();
            assert_eq!(Name::parse(&name.to_string()).unwrap(), name, "{text}");
        }
    }

    #[test]
    fn test_parse_errors() {
        for text in ["a..b", ".a", "a.", "a[1", "a]", "a[1]b", "a\\"] {
            assert!(Name::parse(text).is_err(), "{text} should fail");
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(Name::parse("").unwrap(), Name::EMPTY);
        assert!(Name::EMPTY.is_empty());
        assert_eq!(Name::EMPTY.to_string(), "");
    }

    #[test]
    fn test_single_token_equals_token() {
        let name = Name::token("a");
        assert_eq!(name, NameToken::new("a"));
        assert_ne!(Name::from("a.b"), NameToken::new("a"));
    }

    #[test]
    fn test_prefix_and_suffix() {
        let name = Name::from("a.b.c");
        assert!(name.starts_with(&Name::from("a.b")));
        assert!(name.ends_with(&Name::from("c")));
        assert_eq!(name.strip_prefix(&Name::from("a")), Some(Name::from("b.c")));
        assert_eq!(name.strip_suffix(&Name::from("b.c")), Some(Name::from("a")));
        assert_eq!(name.strip_prefix(&Name::from("b")), None);
        assert_eq!(name.cut_first(), Name::from("b.c"));
        assert_eq!(name.cut_last(), Name::from("a.b"));
        assert_eq!(&Name::from("a") + &Name::from("b"), Name::from("a.b"));
    }

    #[test]
    fn test_pattern_single_wildcard() {
        let pattern = NamePattern::parse("a.*.c").unwrap();
        assert!(pattern.matches(&"a.b.c".into()));
        assert!(!pattern.matches(&"a.b.b.c".into()));
        assert!(!pattern.matches(&"a.c".into()));
    }

    #[test]
    fn test_pattern_multi_wildcard() {
        let prefix = NamePattern::parse("**.c").unwrap();
        assert!(prefix.matches(&"a.b.c".into()));
        assert!(prefix.matches(&"b.c".into()));
        assert!(!prefix.matches(&"c".into()));

        let suffix = NamePattern::parse("a.**").unwrap();
        assert!(suffix.matches(&"a.b".into()));
        assert!(suffix.matches(&"a.b.c".into()));
        assert!(!suffix.matches(&"a".into()));

        let both = NamePattern::parse("**.x.**").unwrap();
        assert!(both.matches(&"a.x.b".into()));
        assert!(!both.matches(&"x.b".into()));
    }

    #[test]
    fn test_pattern_rejects_inner_multi_wildcard() {
        assert!(matches!(
            NamePattern::parse("a.**.b"),
            Err(NameError::Wildcard(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let name = Name::from("a.b[1]");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"a.b[1]\"");
        assert_eq!(serde_json::from_str::<Name>(&json).unwrap(), name);
    }
}
