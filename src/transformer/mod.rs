//! Sample transformation module
//!
//! Turns decoded remote-write batches into topic-keyed serialized payloads:
//! typed field patterns ([`fields`]), the declarative routing rules
//! ([`rules`]) and the two transform pipelines ([`engine`]).

pub mod engine;
pub mod fields;
pub mod rules;

pub use engine::{
    Batch, Label, MatchFilter, RuleRouter, Sample, TemplateRouter, TimeSeries, TopicPayloads,
    METRIC_NAME_LABEL,
};
pub use fields::{classify_name, classify_value, Binding, FieldPattern};
pub use rules::{LabelRewriter, Rule, RuleError, RuleResult, RuleSet, Selector};
