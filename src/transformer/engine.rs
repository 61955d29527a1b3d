//! Batch transform pipelines
//!
//! Two independent routers turn a decoded remote-write batch into
//! `topic -> ordered payload list` maps for an external publisher:
//!
//! - [`RuleRouter`] consults the rule set per metric name, rewrites labels and
//!   emits `{source, dims, vals, time}` envelopes on the matched rule's topic.
//! - [`TemplateRouter`] renders the topic from a label template, applies a
//!   static name+label filter and emits `{timestamp, value, name, labels}`
//!   envelopes.
//!
//! Both are pure, synchronous transforms with no I/O; regexes, templates and
//! schemas were compiled at construction. A marshal failure drops that one
//! payload, never the batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use handlebars::Handlebars;
use serde_json::Value as JsonValue;

use crate::config::{Config, MatchEntryConfig};
use crate::error::{RelayError, RelayResult};
use crate::metrics::RelayMetrics;
use crate::serializer::{Record, Serializer};

use super::rules::{Rule, RuleSet};

/// Reserved label carrying the metric name in remote-write label lists
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A decoded remote-write batch
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub series: Vec<TimeSeries>,
}

/// One time series: an ordered label list plus its sample points
#[derive(Debug, Clone, Default)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

/// A protocol-level label pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// One observation point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp_ms: i64,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl TimeSeries {
    /// Flatten the protocol-level label list into a map; keys are unique per
    /// the remote-write contract, later duplicates would win
    fn label_map(&self) -> HashMap<String, String> {
        self.labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }
}

/// Serialized payloads grouped by destination topic; per-topic order matches
/// input sample order within the batch
pub type TopicPayloads = HashMap<String, Vec<Vec<u8>>>;

/// Rule-routed pipeline
#[derive(Debug)]
pub struct RuleRouter {
    rules: RuleSet,
    serializer: Serializer,
    metrics: Arc<RelayMetrics>,
}

impl RuleRouter {
    /// Create a router from already-built parts
    pub fn new(rules: RuleSet, serializer: Serializer, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            rules,
            serializer,
            metrics,
        }
    }

    /// Build a router from configuration
    ///
    /// # Errors
    /// Fails when the `routing` section is absent, a regex does not compile,
    /// or the schema file cannot be loaded.
    pub fn from_config(config: &Config, metrics: Arc<RelayMetrics>) -> RelayResult<Self> {
        let routing = config.routing.as_ref().ok_or_else(|| {
            RelayError::Config(crate::config::ConfigError::ValidationError(
                "routing section is required for the rule router".to_string(),
            ))
        })?;
        let rules = RuleSet::from_config(routing)?;
        let serializer = Serializer::from_config(config.serializer, config.schema_path.as_deref())?;
        Ok(Self::new(rules, serializer, metrics))
    }

    /// Get a reference to the rule set
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Transform one batch into topic-keyed payloads
    ///
    /// Samples whose metric name matches no rule are dropped and counted.
    pub fn serialize_batch(&self, batch: &Batch) -> TopicPayloads {
        self.metrics.batches_total.inc();
        let mut result = TopicPayloads::new();

        for series in &batch.series {
            let mut labels = series.label_map();
            let name = labels.get(METRIC_NAME_LABEL).cloned().unwrap_or_default();

            let rule = self.rules.select(&name);
            if let Some(rule) = rule {
                // Rewrite once per series; every sample shares the label set
                rule.rewrite_labels(&mut labels);
            }

            for sample in &series.samples {
                let Some(rule) = rule else {
                    self.metrics.samples_filtered_total.inc();
                    continue;
                };

                let org = self.rules.resolve_org(rule);
                let record = routed_envelope(rule, org, &labels, &name, sample);
                if let Some(payload) = self.marshal(&name, &record) {
                    result.entry(rule.topic().to_string()).or_default().push(payload);
                }
            }
        }

        result
    }

    fn marshal(&self, name: &str, record: &Record) -> Option<Vec<u8>> {
        self.metrics.serialize_total.inc();
        match self.serializer.marshal(record) {
            Ok(payload) => Some(payload),
            Err(err) => {
                self.metrics.serialize_failed_total.inc();
                tracing::error!(metric = %name, error = %err, "couldn't marshal timeseries");
                None
            }
        }
    }
}

/// Envelope for the rule-routed pipeline:
/// `{source: {key, org}, dims, vals: {name: value}, time}`
fn routed_envelope(
    rule: &Rule,
    org: i64,
    labels: &HashMap<String, String>,
    name: &str,
    sample: &Sample,
) -> Record {
    let mut source = Record::new();
    source.insert("key".to_string(), JsonValue::String(rule.token().to_string()));
    source.insert("org".to_string(), JsonValue::from(org));

    let mut vals = Record::new();
    vals.insert(name.to_string(), JsonValue::from(sample.value));

    let mut record = Record::new();
    record.insert("source".to_string(), JsonValue::Object(source));
    record.insert("dims".to_string(), labels_value(labels));
    record.insert("vals".to_string(), JsonValue::Object(vals));
    record.insert("time".to_string(), JsonValue::from(sample.timestamp_ms));
    record
}

/// Static name+label filter for the template-routed pipeline
///
/// An empty filter passes everything. Otherwise a sample passes when any
/// entry registered for its metric name matches: an entry without labels
/// matches unconditionally, one with labels requires every pair to be present
/// with an equal value.
#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    entries: HashMap<String, Vec<HashMap<String, String>>>,
}

impl MatchFilter {
    /// Build the filter from config entries, grouping them by metric name
    pub fn from_config(entries: &[MatchEntryConfig]) -> Self {
        let mut grouped: HashMap<String, Vec<HashMap<String, String>>> = HashMap::new();
        for entry in entries {
            grouped
                .entry(entry.name.clone())
                .or_default()
                .push(entry.labels.clone());
        }
        Self { entries: grouped }
    }

    /// Check whether a sample passes the filter
    pub fn pass(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let Some(candidates) = self.entries.get(name) else {
            return false;
        };
        candidates.iter().any(|wanted| {
            wanted.is_empty() || wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
        })
    }
}

const TOPIC_TEMPLATE: &str = "topic";

/// Template-routed pipeline
pub struct TemplateRouter {
    registry: Handlebars<'static>,
    filter: MatchFilter,
    serializer: Serializer,
    metrics: Arc<RelayMetrics>,
}

impl TemplateRouter {
    /// Create a router, compiling the topic template eagerly
    ///
    /// The template is rendered against the label set in strict mode, so a
    /// reference to an absent label fails the render instead of producing an
    /// empty fragment.
    pub fn new(
        template: &str,
        filter: MatchFilter,
        serializer: Serializer,
        metrics: Arc<RelayMetrics>,
    ) -> RelayResult<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_template_string(TOPIC_TEMPLATE, template)?;
        Ok(Self {
            registry,
            filter,
            serializer,
            metrics,
        })
    }

    /// Build a router from configuration
    pub fn from_config(config: &Config, metrics: Arc<RelayMetrics>) -> RelayResult<Self> {
        let template = config.topic_template.as_deref().ok_or_else(|| {
            RelayError::Config(crate::config::ConfigError::ValidationError(
                "topicTemplate is required for the template router".to_string(),
            ))
        })?;
        let filter = MatchFilter::from_config(&config.match_entries);
        let serializer = Serializer::from_config(config.serializer, config.schema_path.as_deref())?;
        Self::new(template, filter, serializer, metrics)
    }

    /// Transform one batch into topic-keyed payloads
    ///
    /// A series whose topic fails to render is dropped whole and counted;
    /// unrelated failures never share a bucket.
    pub fn serialize_batch(&self, batch: &Batch) -> TopicPayloads {
        self.metrics.batches_total.inc();
        let mut result = TopicPayloads::new();

        for series in &batch.series {
            let labels = series.label_map();
            let topic = match self.registry.render(TOPIC_TEMPLATE, &labels) {
                Ok(topic) => topic,
                Err(err) => {
                    self.metrics.render_failed_total.inc();
                    tracing::warn!(error = %err, "couldn't render topic template, dropping series");
                    continue;
                }
            };

            let name = labels.get(METRIC_NAME_LABEL).cloned().unwrap_or_default();
            for sample in &series.samples {
                if !self.filter.pass(&name, &labels) {
                    self.metrics.samples_filtered_total.inc();
                    continue;
                }

                let record = plain_envelope(&name, &labels, sample);
                if let Some(payload) = self.marshal(&name, &record) {
                    result.entry(topic.clone()).or_default().push(payload);
                }
            }
        }

        result
    }

    fn marshal(&self, name: &str, record: &Record) -> Option<Vec<u8>> {
        self.metrics.serialize_total.inc();
        match self.serializer.marshal(record) {
            Ok(payload) => Some(payload),
            Err(err) => {
                self.metrics.serialize_failed_total.inc();
                tracing::error!(metric = %name, error = %err, "couldn't marshal timeseries");
                None
            }
        }
    }
}

/// Envelope for the template-routed pipeline:
/// `{timestamp, value, name, labels}`
fn plain_envelope(name: &str, labels: &HashMap<String, String>, sample: &Sample) -> Record {
    let mut record = Record::new();
    record.insert(
        "timestamp".to_string(),
        JsonValue::String(rfc3339_seconds(sample.timestamp_ms)),
    );
    record.insert(
        "value".to_string(),
        JsonValue::String(decimal_string(sample.value)),
    );
    record.insert("name".to_string(), JsonValue::String(name.to_string()));
    record.insert("labels".to_string(), labels_value(labels));
    record
}

fn labels_value(labels: &HashMap<String, String>) -> JsonValue {
    JsonValue::Object(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}

/// Millisecond epoch timestamp truncated to seconds, RFC 3339, UTC
fn rfc3339_seconds(timestamp_ms: i64) -> String {
    DateTime::from_timestamp(timestamp_ms / 1000, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Shortest decimal representation without an exponent
fn decimal_string(value: f64) -> String {
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::AvroSerializer;

    fn series(labels: &[(&str, &str)], samples: &[(f64, i64)]) -> TimeSeries {
        TimeSeries {
            labels: labels.iter().map(|(n, v)| Label::new(*n, *v)).collect(),
            samples: samples
                .iter()
                .map(|(value, timestamp_ms)| Sample {
                    value: *value,
                    timestamp_ms: *timestamp_ms,
                })
                .collect(),
        }
    }

    fn node_rule_yaml() -> &'static str {
        r#"
routing:
  defaultOrg: 3087
  rules:
    - topic: custom_HOST
      token: T
      selectors:
        - method: regex
          value: "^node_"
      labelRewriter:
        - name: node
          regex: "(?P<ip>.*?):(?P<port>.*)"
          overwrite: false
          labels:
            - name: ip
              value: "$1"
            - name: port
              value: "$port"
"#
    }

    fn rule_router(yaml: &str) -> (RuleRouter, Arc<RelayMetrics>) {
        let config = Config::from_yaml(yaml).unwrap();
        let metrics = Arc::new(RelayMetrics::new());
        let router = RuleRouter::from_config(&config, metrics.clone()).unwrap();
        (router, metrics)
    }

    // ==========================================================================
    // RuleRouter tests
    // ==========================================================================

    #[test]
    fn test_rule_router_routes_matched_sample() {
        let (router, metrics) = rule_router(node_rule_yaml());
        let batch = Batch {
            series: vec![series(
                &[("__name__", "node_cpu_usage"), ("node", "10.10.89.61:8080")],
                &[(0.75, 1612428000000)],
            )],
        };

        let result = router.serialize_batch(&batch);
        assert_eq!(result.len(), 1);

        let payloads = result.get("custom_HOST").unwrap();
        assert_eq!(payloads.len(), 1);

        let decoded: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(decoded["source"]["key"], "T");
        assert_eq!(decoded["source"]["org"], 3087);
        assert_eq!(decoded["dims"]["node"], "10.10.89.61:8080");
        assert_eq!(decoded["dims"]["ip"], "10.10.89.61");
        assert_eq!(decoded["dims"]["port"], "8080");
        assert_eq!(decoded["vals"]["node_cpu_usage"], 0.75);
        assert_eq!(decoded["time"], 1612428000000_i64);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.serialized, 1);
        assert_eq!(snapshot.filtered, 0);
        assert_eq!(snapshot.serialize_failures, 0);
    }

    #[test]
    fn test_rule_router_drops_unmatched_sample() {
        let (router, metrics) = rule_router(node_rule_yaml());
        let batch = Batch {
            series: vec![series(
                &[("__name__", "kafka_brokers_number")],
                &[(3.0, 1612428000000)],
            )],
        };

        let result = router.serialize_batch(&batch);
        assert!(result.is_empty());
        assert_eq!(metrics.snapshot().filtered, 1);
        assert_eq!(metrics.snapshot().serialized, 0);
    }

    #[test]
    fn test_rule_router_per_topic_ordering() {
        let (router, _metrics) = rule_router(node_rule_yaml());
        let batch = Batch {
            series: vec![series(
                &[("__name__", "node_load1")],
                &[(1.0, 1000), (2.0, 2000), (3.0, 3000)],
            )],
        };

        let result = router.serialize_batch(&batch);
        let payloads = result.get("custom_HOST").unwrap();
        assert_eq!(payloads.len(), 3);

        let values: Vec<f64> = payloads
            .iter()
            .map(|p| {
                let decoded: serde_json::Value = serde_json::from_slice(p).unwrap();
                decoded["vals"]["node_load1"].as_f64().unwrap()
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rule_router_explicit_org_wins() {
        let yaml = r#"
routing:
  defaultOrg: 3087
  rules:
    - topic: t
      token: T
      org: 42
      selectors:
        - method: eq
          value: up
"#;
        let (router, _metrics) = rule_router(yaml);
        let batch = Batch {
            series: vec![series(&[("__name__", "up")], &[(1.0, 0)])],
        };

        let result = router.serialize_batch(&batch);
        let decoded: serde_json::Value =
            serde_json::from_slice(&result.get("t").unwrap()[0]).unwrap();
        assert_eq!(decoded["source"]["org"], 42);
    }

    #[test]
    fn test_rule_router_marshal_failure_drops_one_payload() {
        // Schema without any numeric wiggle room: a NaN value serializes to
        // JSON null and fails resolution, the other samples still go through.
        const ENVELOPE_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "Envelope",
  "fields": [
    { "name": "source", "type": { "type": "record", "name": "Source", "fields": [
      { "name": "key", "type": "string" },
      { "name": "org", "type": "long" }
    ] } },
    { "name": "dims", "type": { "type": "map", "values": "string" } },
    { "name": "vals", "type": { "type": "map", "values": "double" } },
    { "name": "time", "type": "long" }
  ]
}
"#;
        let config = Config::from_yaml(node_rule_yaml()).unwrap();
        let rules = RuleSet::from_config(config.routing.as_ref().unwrap()).unwrap();
        let serializer =
            Serializer::Avro(AvroSerializer::from_schema_str(ENVELOPE_SCHEMA).unwrap());
        let metrics = Arc::new(RelayMetrics::new());
        let router = RuleRouter::new(rules, serializer, metrics.clone());

        let batch = Batch {
            series: vec![series(
                &[("__name__", "node_load1")],
                &[(1.0, 1000), (f64::NAN, 2000), (3.0, 3000)],
            )],
        };

        let result = router.serialize_batch(&batch);
        assert_eq!(result.get("custom_HOST").unwrap().len(), 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.serialized, 3);
        assert_eq!(snapshot.serialize_failures, 1);
    }

    #[test]
    fn test_rule_router_requires_routing_section() {
        let config = Config::from_yaml("serializer: json\n").unwrap();
        let result = RuleRouter::from_config(&config, Arc::new(RelayMetrics::new()));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    // ==========================================================================
    // MatchFilter tests
    // ==========================================================================

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = MatchFilter::default();
        assert!(filter.pass("anything", &HashMap::new()));
    }

    #[test]
    fn test_filter_by_name_and_labels() {
        let filter = MatchFilter::from_config(&[MatchEntryConfig {
            name: "node_cpu".to_string(),
            labels: HashMap::from([("mode".to_string(), "idle".to_string())]),
        }]);

        let idle = HashMap::from([("mode".to_string(), "idle".to_string())]);
        let user = HashMap::from([("mode".to_string(), "user".to_string())]);

        assert!(filter.pass("node_cpu", &idle));
        assert!(!filter.pass("node_cpu", &user));
        assert!(!filter.pass("node_memory", &idle));
    }

    #[test]
    fn test_filter_entry_without_labels_matches_name() {
        let filter = MatchFilter::from_config(&[MatchEntryConfig {
            name: "up".to_string(),
            labels: HashMap::new(),
        }]);
        assert!(filter.pass("up", &HashMap::new()));
        assert!(!filter.pass("down", &HashMap::new()));
    }

    // ==========================================================================
    // TemplateRouter tests
    // ==========================================================================

    fn template_router(template: &str, filter: MatchFilter) -> (TemplateRouter, Arc<RelayMetrics>) {
        let metrics = Arc::new(RelayMetrics::new());
        let router =
            TemplateRouter::new(template, filter, Serializer::Json, metrics.clone()).unwrap();
        (router, metrics)
    }

    #[test]
    fn test_template_router_renders_topic_from_labels() {
        let (router, metrics) = template_router("metrics_{{job}}", MatchFilter::default());
        let batch = Batch {
            series: vec![series(
                &[("__name__", "up"), ("job", "prometheus")],
                &[(1.0, 1612428000000)],
            )],
        };

        let result = router.serialize_batch(&batch);
        let payloads = result.get("metrics_prometheus").unwrap();
        assert_eq!(payloads.len(), 1);

        let decoded: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(decoded["name"], "up");
        assert_eq!(decoded["value"], "1");
        assert_eq!(decoded["timestamp"], "2021-02-04T08:40:00Z");
        assert_eq!(decoded["labels"]["job"], "prometheus");

        assert_eq!(metrics.snapshot().serialized, 1);
    }

    #[test]
    fn test_template_router_render_failure_drops_series() {
        let (router, metrics) = template_router("metrics_{{job}}", MatchFilter::default());
        let batch = Batch {
            series: vec![
                // No "job" label; strict mode fails the render
                series(&[("__name__", "up")], &[(1.0, 0)]),
                series(&[("__name__", "up"), ("job", "node")], &[(1.0, 0)]),
            ],
        };

        let result = router.serialize_batch(&batch);
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("metrics_node"));
        // No empty-string topic bucket for the failed render
        assert!(!result.contains_key(""));
        assert_eq!(metrics.snapshot().render_failures, 1);
    }

    #[test]
    fn test_template_router_applies_filter() {
        let filter = MatchFilter::from_config(&[MatchEntryConfig {
            name: "node_cpu".to_string(),
            labels: HashMap::from([("mode".to_string(), "idle".to_string())]),
        }]);
        let (router, metrics) = template_router("t_{{job}}", filter);

        let batch = Batch {
            series: vec![
                series(
                    &[("__name__", "node_cpu"), ("job", "n"), ("mode", "idle")],
                    &[(1.0, 0)],
                ),
                series(
                    &[("__name__", "node_cpu"), ("job", "n"), ("mode", "user")],
                    &[(2.0, 0)],
                ),
            ],
        };

        let result = router.serialize_batch(&batch);
        assert_eq!(result.get("t_n").unwrap().len(), 1);
        assert_eq!(metrics.snapshot().filtered, 1);
    }

    #[test]
    fn test_template_router_invalid_template() {
        let metrics = Arc::new(RelayMetrics::new());
        let result = TemplateRouter::new(
            "{{#if job}}unclosed",
            MatchFilter::default(),
            Serializer::Json,
            metrics,
        );
        assert!(matches!(result, Err(RelayError::Template(_))));
    }

    #[test]
    fn test_template_router_from_config_requires_template() {
        let config = Config::from_yaml("serializer: json\n").unwrap();
        let result = TemplateRouter::from_config(&config, Arc::new(RelayMetrics::new()));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    // ==========================================================================
    // Helper tests
    // ==========================================================================

    #[test]
    fn test_rfc3339_truncates_to_seconds() {
        assert_eq!(rfc3339_seconds(1612428000999), "2021-02-04T08:40:00Z");
        assert_eq!(rfc3339_seconds(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_decimal_string_has_no_exponent() {
        assert_eq!(decimal_string(1.0), "1");
        assert_eq!(decimal_string(0.25), "0.25");
        assert_eq!(decimal_string(1e21), "1000000000000000000000");
    }

    #[test]
    fn test_batch_counter_incremented_per_batch() {
        let (router, metrics) = rule_router(node_rule_yaml());
        router.serialize_batch(&Batch::default());
        router.serialize_batch(&Batch::default());
        assert_eq!(metrics.snapshot().batches, 2);
    }
}
