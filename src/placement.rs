//! Renaming rules for [`DataTree::rearrange`](crate::DataTree::rearrange).

use regex::Regex;

use crate::core::TypeTag;
use crate::error::TreeError;
use crate::meta::Meta;
use crate::name::Name;

/// A pure mapping from an entry to its new name, `None` drops the entry.
pub trait Placement: Send + Sync {
    fn place(&self, name: &Name, meta: &Meta, tag: &TypeTag) -> Option<Name>;
}

impl<F> Placement for F
where
    F: Fn(&Name, &Meta, &TypeTag) -> Option<Name> + Send + Sync,
{
    fn place(&self, name: &Name, meta: &Meta, tag: &TypeTag) -> Option<Name> {
        self(name, meta, tag)
    }
}

/// Declarative placement: keep the entries under `from` whose full name
/// matches `pattern`, and move them under `to`.
///
/// ```
/// use kumiki::{Meta, Name, PlacementRule, Placement, TypeTag};
///
/// let rule = PlacementRule::all().from("raw").to("clean");
/// let placed = rule.place(&Name::from("raw.a.b"), &Meta::empty(), &TypeTag::of::<i64>());
/// assert_eq!(placed, Some(Name::from("clean.a.b")));
/// ```
#[derive(Clone, Debug, Default)]
pub struct PlacementRule {
    from: Name,
    to: Name,
    pattern: Option<Regex>,
}

impl PlacementRule {
    /// Keeps every entry where it is.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from(mut self, prefix: impl Into<Name>) -> Self {
        self.from = prefix.into();
        self
    }

    pub fn to(mut self, prefix: impl Into<Name>) -> Self {
        self.to = prefix.into();
        self
    }

    /// Only keep entries whose whole textual name matches `pattern`.
    pub fn pattern(mut self, pattern: &str) -> Result<Self, TreeError> {
        self.pattern = Some(Regex::new(&format!("^(?:{pattern})$"))?);
        Ok(self)
    }

    /// Read the rule from the `from`, `to` and `pattern` keys of a meta.
    pub fn from_meta(meta: &Meta) -> Result<Self, TreeError> {
        let mut rule = Self::all();
        if let Some(from) = meta.get_str("from") {
            rule = rule.from(Name::parse(from)?);
        }
        if let Some(to) = meta.get_str("to") {
            rule = rule.to(Name::parse(to)?);
        }
        if let Some(pattern) = meta.get_str("pattern") {
            rule = rule.pattern(pattern)?;
        }
        Ok(rule)
    }
}

impl Placement for PlacementRule {
    fn place(&self, name: &Name, _: &Meta, _: &TypeTag) -> Option<Name> {
        if let Some(pattern) = &self.pattern
            && !pattern.is_match(&name.to_string())
        {
            return None;
        }

        let rest = name.strip_prefix(&self.from)?;
        Some(self.to.join(&rest))
    }
}
