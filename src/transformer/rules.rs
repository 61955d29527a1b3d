//! Rule-based sample routing
//!
//! This module provides the runtime form of the routing configuration:
//! metric name selectors, regex-capture label rewriters, rules bundling the
//! two with routing metadata, and the ordered first-match-wins rule set.
//!
//! Every regex is compiled once when the runtime types are built from their
//! config counterparts; after that the types are read-only and can be shared
//! across concurrent batch transforms.
//!
//! # Example
//!
//! ```ignore
//! use prom_relay::config::RuleSetConfig;
//! use prom_relay::transformer::rules::RuleSet;
//!
//! let config: RuleSetConfig = serde_yaml::from_str(yaml)?;
//! let rules = RuleSet::from_config(&config)?;
//! let rule = rules.select("node_cpu_usage");
//! ```

use std::collections::{HashMap, HashSet};

use regex::Regex;
use thiserror::Error;

use crate::config::{RewriterConfig, RuleConfig, RuleSetConfig, SelectorConfig, SelectorMethod};

use super::fields::FieldPattern;

/// Errors that can occur while building rules from configuration
#[derive(Error, Debug)]
pub enum RuleError {
    /// Invalid regex pattern
    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A rewriter inside a rule failed to build
    #[error("Rewriter '{name}' failed to build: {source}")]
    RewriterBuildFailed {
        name: String,
        #[source]
        source: Box<RuleError>,
    },

    /// A rule inside a rule set failed to build
    #[error("Rule at index {index} failed to build: {source}")]
    RuleBuildFailed {
        index: usize,
        #[source]
        source: Box<RuleError>,
    },
}

/// Result type for rule operations
pub type RuleResult<T> = Result<T, RuleError>;

/// Metric name predicate
///
/// The regex variant holds its pattern pre-compiled; matching is an
/// unanchored search, so `^` must be explicit in the config when intended.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Exact string compare
    Eq(String),
    /// Prefix match
    StartWith(String),
    /// Unanchored regex search
    Regex(Regex),
}

impl Selector {
    /// Build a selector from its config form, compiling the regex if needed
    pub fn from_config(config: &SelectorConfig) -> RuleResult<Self> {
        match config.method {
            SelectorMethod::Eq => Ok(Selector::Eq(config.value.clone())),
            SelectorMethod::StartWith => Ok(Selector::StartWith(config.value.clone())),
            SelectorMethod::Regex => Selector::regex(&config.value),
        }
    }

    /// Build a regex selector from a pattern string
    pub fn regex(pattern: &str) -> RuleResult<Self> {
        let regex = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Selector::Regex(regex))
    }

    /// Check whether a metric name satisfies this selector
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Selector::Eq(value) => name == value,
            Selector::StartWith(prefix) => name.starts_with(prefix),
            Selector::Regex(regex) => regex.is_match(name),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Eq(value) => write!(f, "Selector(method=eq,value={value})"),
            Selector::StartWith(value) => write!(f, "Selector(method=start_with,value={value})"),
            Selector::Regex(regex) => write!(f, "Selector(method=regex,value={})", regex.as_str()),
        }
    }
}

/// Regex-capture-driven generator of new labels from one existing label
#[derive(Debug, Clone)]
pub struct LabelRewriter {
    trigger: String,
    regex: Regex,
    overwrite: bool,
    labels: Vec<FieldPattern>,
}

impl LabelRewriter {
    /// Create a rewriter, compiling the regex eagerly
    pub fn new(
        trigger: impl Into<String>,
        pattern: &str,
        overwrite: bool,
        labels: Vec<FieldPattern>,
    ) -> RuleResult<Self> {
        let regex = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            trigger: trigger.into(),
            regex,
            overwrite,
            labels,
        })
    }

    /// Build a rewriter from its config form
    pub fn from_config(config: &RewriterConfig) -> RuleResult<Self> {
        let labels = config
            .labels
            .iter()
            .map(|l| FieldPattern::new(l.name.clone(), l.value.clone()))
            .collect();
        Self::new(config.name.clone(), &config.regex, config.overwrite, labels)
    }

    /// The trigger label name this rewriter reacts to
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Whether the trigger label is removed once new labels were produced
    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Derive new labels from a (label name, label value) pair
    ///
    /// Returns an empty map when the key is not this rewriter's trigger, no
    /// output patterns are configured, or the regex does not match the value.
    /// A non-matching regex is a silent no-op, not an error.
    pub fn gen_new_labels(&self, key: &str, value: &str) -> HashMap<String, String> {
        if key != self.trigger || self.labels.is_empty() {
            return HashMap::new();
        }
        let Some(caps) = self.regex.captures(value) else {
            return HashMap::new();
        };

        let mut labels = HashMap::with_capacity(self.labels.len());
        for pattern in &self.labels {
            if pattern.name_pattern().is_empty() {
                continue;
            }
            // Later entries overwrite earlier ones resolving to the same name
            labels.insert(
                pattern.resolve_name(key, &caps),
                pattern.resolve_value(value, &caps),
            );
        }
        labels
    }
}

/// Selection + rewrite + routing policy for a class of metric names
#[derive(Debug, Clone)]
pub struct Rule {
    topic: String,
    token: String,
    org: i64,
    delete_labels: HashSet<String>,
    selectors: Vec<Selector>,
    rewriters: HashMap<String, LabelRewriter>,
}

impl Rule {
    /// Build a rule from its config form
    ///
    /// Rewriters are keyed by trigger name; when a rule configures the same
    /// trigger twice, the last one registered wins.
    pub fn from_config(config: &RuleConfig) -> RuleResult<Self> {
        let selectors = config
            .selectors
            .iter()
            .map(Selector::from_config)
            .collect::<RuleResult<Vec<_>>>()?;

        let mut rewriters = HashMap::with_capacity(config.label_rewriter.len());
        for rewriter_config in &config.label_rewriter {
            let rewriter = LabelRewriter::from_config(rewriter_config).map_err(|source| {
                RuleError::RewriterBuildFailed {
                    name: rewriter_config.name.clone(),
                    source: Box::new(source),
                }
            })?;
            rewriters.insert(rewriter.trigger().to_string(), rewriter);
        }

        Ok(Self {
            topic: config.topic.clone(),
            token: config.token.clone(),
            org: config.org,
            delete_labels: config.delete_labels.clone(),
            selectors,
            rewriters,
        })
    }

    /// Destination topic for samples matched by this rule
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Credential token placed in the payload envelope
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Org id; 0 means "use the rule set default"
    pub fn org(&self) -> i64 {
        self.org
    }

    /// True iff any configured selector matches, short-circuiting
    pub fn selected(&self, name: &str) -> bool {
        self.selectors.iter().any(|s| s.matches(name))
    }

    /// Apply every registered rewriter to the label set, then the delete-set
    ///
    /// Each rewriter is looked up by its trigger key directly, so it runs at
    /// most once per call and the result does not depend on map iteration
    /// order. New labels overwrite existing ones of the same name; a rewriter
    /// with `overwrite` removes its trigger label once it produced output.
    pub fn rewrite_labels(&self, labels: &mut HashMap<String, String>) {
        for (trigger, rewriter) in &self.rewriters {
            let Some(value) = labels.get(trigger).cloned() else {
                continue;
            };
            let new_labels = rewriter.gen_new_labels(trigger, &value);
            if !new_labels.is_empty() && rewriter.overwrite() {
                labels.remove(trigger);
            }
            labels.extend(new_labels);
        }

        if self.delete_labels.is_empty() {
            return;
        }
        for key in &self.delete_labels {
            labels.remove(key);
        }
    }
}

/// Ordered collection of rules; first selected match wins
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    default_org: i64,
}

impl RuleSet {
    /// Create a rule set from already-built rules
    pub fn new(rules: Vec<Rule>, default_org: i64) -> Self {
        Self { rules, default_org }
    }

    /// Build a rule set from its config form, compiling every regex
    pub fn from_config(config: &RuleSetConfig) -> RuleResult<Self> {
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                Rule::from_config(rule).map_err(|source| RuleError::RuleBuildFailed {
                    index,
                    source: Box::new(source),
                })
            })
            .collect::<RuleResult<Vec<_>>>()?;
        Ok(Self::new(rules, config.default_org))
    }

    /// Find the first rule (in configured order) selecting this metric name
    pub fn select(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.selected(name))
    }

    /// The rule's org, or the rule set default when the rule leaves it at 0
    pub fn resolve_org(&self, rule: &Rule) -> i64 {
        if rule.org() != 0 {
            rule.org()
        } else {
            self.default_org
        }
    }

    /// Get the number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the rule set is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over all rules
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}
