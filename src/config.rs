//! Configuration management for prom-relay
//!
//! Handles loading and validating configuration from YAML files. Field names
//! mirror the wire schema used by existing deployments (`defaultOrg`,
//! `labelRewriter`, `deleteLabels`), so config files stay portable.
//!
//! The structs in this module are the declarative form only; the compiled,
//! regex-bearing runtime types live in [`crate::transformer::rules`] and are
//! built from these via fallible constructors.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error reading the configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the configuration file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Wire format for serialized payloads
    #[serde(default)]
    pub serializer: SerializerKind,

    /// Path to the Avro schema file, required for `avro_json`
    #[serde(rename = "schemaPath", default)]
    pub schema_path: Option<PathBuf>,

    /// Rule set for the rule-routed pipeline
    #[serde(default)]
    pub routing: Option<RuleSetConfig>,

    /// Topic template for the template-routed pipeline
    #[serde(rename = "topicTemplate", default)]
    pub topic_template: Option<String>,

    /// Static name+label filter for the template-routed pipeline
    #[serde(rename = "match", default)]
    pub match_entries: Vec<MatchEntryConfig>,
}

/// Wire format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// Plain structural JSON
    #[default]
    Json,
    /// Schema-validated Avro
    AvroJson,
}

/// Ordered rule collection plus the fallback org id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetConfig {
    /// Org id used when a matched rule leaves `org` at 0
    #[serde(rename = "defaultOrg")]
    pub default_org: i64,

    /// Rules, evaluated in order; first match wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Destination topic for matched samples
    pub topic: String,

    /// Credential token placed in the payload envelope
    pub token: String,

    /// Metric name predicates, OR semantics
    pub selectors: Vec<SelectorConfig>,

    /// Label rewriters, keyed at build time by trigger label name
    #[serde(rename = "labelRewriter", default)]
    pub label_rewriter: Vec<RewriterConfig>,

    /// Org id; 0 means "use the rule set default"
    #[serde(default)]
    pub org: i64,

    /// Labels removed after rewriting
    #[serde(rename = "deleteLabels", default)]
    pub delete_labels: HashSet<String>,
}

/// Metric name predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Match strategy
    pub method: SelectorMethod,

    /// Value interpreted per `method`: literal, prefix, or regex pattern
    pub value: String,
}

/// Selector match strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorMethod {
    /// Exact string compare
    #[serde(rename = "eq")]
    Eq,
    /// Prefix match
    #[serde(rename = "start_with")]
    StartWith,
    /// Unanchored regex search
    #[serde(rename = "regex")]
    Regex,
}

/// Regex-capture-driven label rewriter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriterConfig {
    /// Trigger label name
    pub name: String,

    /// Regex applied to the trigger label's value
    pub regex: String,

    /// Remove the trigger label when new labels were produced
    #[serde(default)]
    pub overwrite: bool,

    /// Output field patterns, resolved against the regex match
    pub labels: Vec<FieldPatternConfig>,
}

/// One output label spec: a (name-pattern, value-pattern) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPatternConfig {
    /// Name side: `__name__`, `$N`, `$group`, or a literal
    pub name: String,

    /// Value side: `__value__`, `$N`, `$group`, or a literal
    pub value: String,
}

/// Entry of the static filter used by the template-routed pipeline
///
/// Multiple entries may share a `name`; a sample passes when any entry for its
/// metric name has all of its labels present with equal values. An entry with
/// no labels passes every sample of that name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEntryConfig {
    /// Metric name the entry applies to
    pub name: String,

    /// Required label values; empty means "any"
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if semantic
    /// validation fails. Missing required fields fail at parse time.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.serializer == SerializerKind::AvroJson && self.schema_path.is_none() {
            return Err(ConfigError::ValidationError(
                "schemaPath is required when serializer is avro_json".to_string(),
            ));
        }

        if let Some(routing) = &self.routing {
            for (index, rule) in routing.rules.iter().enumerate() {
                rule.validate()
                    .map_err(|reason| ConfigError::ValidationError(format!("rule {index}: {reason}")))?;
            }
        }

        Ok(())
    }
}

impl RuleConfig {
    fn validate(&self) -> Result<(), String> {
        if self.topic.is_empty() {
            return Err("topic must not be empty".to_string());
        }
        if self.token.is_empty() {
            return Err("token must not be empty".to_string());
        }
        if self.selectors.is_empty() {
            return Err("at least one selector is required".to_string());
        }
        for rewriter in &self.label_rewriter {
            if rewriter.name.is_empty() {
                return Err("rewriter name must not be empty".to_string());
            }
            if rewriter.labels.is_empty() {
                return Err(format!("rewriter '{}' has no output labels", rewriter.name));
            }
        }
        Ok(())
    }
}
