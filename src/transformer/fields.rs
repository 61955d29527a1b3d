//! Typed field patterns for label rewriting
//!
//! A rewriter's output labels are described by (name-pattern, value-pattern)
//! pairs. Each side of a pair resolves against a regex match in one of four
//! ways, decided purely by the pattern text:
//!
//! - the identity sentinel (`__name__` / `__value__`) binds the trigger
//!   label's own name or value
//! - `$3` binds capture group 3 (group 0 is the whole match)
//! - `$port` binds the named capture group `port`
//! - anything else is taken literally
//!
//! Patterns are immutable, so classification happens once at construction;
//! there is no cache to invalidate.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Sentinel binding the trigger label's name
pub const NAME_SENTINEL: &str = "__name__";

/// Sentinel binding the trigger label's value
pub const VALUE_SENTINEL: &str = "__value__";

static GROUP_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$(\d+)$").expect("static pattern"));
static GROUP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$([^0-9]\w+)").expect("static pattern"));

/// How one side of a field pattern binds to a match result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// The trigger label's own name or value
    Identity,
    /// A numbered capture group; out of bounds resolves to ""
    Group(usize),
    /// A named capture group; missing resolves to ""
    Named(String),
    /// The pattern text itself, verbatim
    Literal(String),
}

impl Binding {
    /// Resolve the binding against a regex match
    ///
    /// `identity` is the trigger label's name (name side) or value (value side).
    pub fn resolve(&self, identity: &str, caps: &Captures<'_>) -> String {
        match self {
            Binding::Identity => identity.to_string(),
            Binding::Group(index) => caps
                .get(*index)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            Binding::Named(name) => caps
                .name(name)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            Binding::Literal(text) => text.clone(),
        }
    }
}

fn classify(pattern: &str, sentinel: &str) -> Binding {
    if pattern == sentinel {
        return Binding::Identity;
    }
    if let Some(caps) = GROUP_INDEX.captures(pattern) {
        // The digits-only guard makes the parse infallible short of overflow,
        // which falls back to a literal.
        if let Ok(index) = caps[1].parse::<usize>() {
            return Binding::Group(index);
        }
        return Binding::Literal(pattern.to_string());
    }
    if let Some(caps) = GROUP_NAME.captures(pattern) {
        return Binding::Named(caps[1].to_string());
    }
    Binding::Literal(pattern.to_string())
}

/// Classify a name-side pattern
pub fn classify_name(pattern: &str) -> Binding {
    classify(pattern, NAME_SENTINEL)
}

/// Classify a value-side pattern
pub fn classify_value(pattern: &str) -> Binding {
    classify(pattern, VALUE_SENTINEL)
}

/// One output label spec with its sides classified at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPattern {
    name: String,
    value: String,
    name_binding: Binding,
    value_binding: Binding,
}

impl FieldPattern {
    /// Create a field pattern, classifying both sides eagerly
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        let name_binding = classify_name(&name);
        let value_binding = classify_value(&value);
        Self {
            name,
            value,
            name_binding,
            value_binding,
        }
    }

    /// The raw name-side pattern text
    pub fn name_pattern(&self) -> &str {
        &self.name
    }

    /// The raw value-side pattern text
    pub fn value_pattern(&self) -> &str {
        &self.value
    }

    /// The name side's classification
    pub fn name_binding(&self) -> &Binding {
        &self.name_binding
    }

    /// The value side's classification
    pub fn value_binding(&self) -> &Binding {
        &self.value_binding
    }

    /// Resolve the output label name for a match on `trigger_key`'s value
    pub fn resolve_name(&self, trigger_key: &str, caps: &Captures<'_>) -> String {
        self.name_binding.resolve(trigger_key, caps)
    }

    /// Resolve the output label value for a match on `trigger_value`
    pub fn resolve_value(&self, trigger_value: &str, caps: &Captures<'_>) -> String {
        self.value_binding.resolve(trigger_value, caps)
    }
}
