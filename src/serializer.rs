//! Payload serialization
//!
//! A [`Serializer`] turns a generic key/value [`Record`] into bytes. Exactly
//! two formats exist: plain structural JSON, which accepts any record, and a
//! schema-bound Avro variant that validates field names and types against a
//! schema loaded once at construction. The set is closed on purpose; this is
//! not a plugin surface.

use std::path::Path;

use apache_avro::Schema;
use thiserror::Error;

use crate::config::SerializerKind;

/// Generic key/value record handed to [`Serializer::marshal`]
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Errors loading the Avro schema; fatal at startup
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Schema file unreadable
    #[error("Failed to read schema file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Schema text invalid
    #[error("Failed to parse schema: {0}")]
    ParseError(#[source] apache_avro::Error),

    /// Avro serializer configured without a schema path
    #[error("Schema path is required for the avro_json serializer")]
    MissingPath,
}

/// Per-record marshal failure; recovered by the caller, never aborts a batch
#[derive(Error, Debug)]
pub enum SerializeError {
    /// JSON encoding failure
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Record does not conform to the schema
    #[error("Record does not conform to schema: {0}")]
    SchemaMismatch(#[source] apache_avro::Error),

    /// Avro encoding failure on a conforming record
    #[error("Avro encoding failed: {0}")]
    Avro(#[source] apache_avro::Error),
}

/// Stateless format strategy over generic records
#[derive(Debug)]
pub enum Serializer {
    /// Plain structural JSON; succeeds for any record
    Json,
    /// Schema-validated Avro
    Avro(AvroSerializer),
}

impl Serializer {
    /// Build the serializer selected by configuration
    ///
    /// For `avro_json` the schema file is read and parsed here, once;
    /// failure is fatal.
    pub fn from_config(kind: SerializerKind, schema_path: Option<&Path>) -> Result<Self, SchemaError> {
        match kind {
            SerializerKind::Json => Ok(Serializer::Json),
            SerializerKind::AvroJson => {
                let path = schema_path.ok_or(SchemaError::MissingPath)?;
                Ok(Serializer::Avro(AvroSerializer::from_schema_file(path)?))
            }
        }
    }

    /// Serialize a record into bytes
    pub fn marshal(&self, record: &Record) -> Result<Vec<u8>, SerializeError> {
        match self {
            Serializer::Json => Ok(serde_json::to_vec(record)?),
            Serializer::Avro(avro) => avro.marshal(record),
        }
    }
}

/// Schema-bound serializer; owns the compiled schema
#[derive(Debug)]
pub struct AvroSerializer {
    schema: Schema,
}

impl AvroSerializer {
    /// Parse a schema from its textual definition
    pub fn from_schema_str(raw: &str) -> Result<Self, SchemaError> {
        let schema = Schema::parse_str(raw).map_err(SchemaError::ParseError)?;
        Ok(Self { schema })
    }

    /// Read and parse a schema file
    pub fn from_schema_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            tracing::error!(path = %path.display(), error = %err, "couldn't read avro schema");
            err
        })?;
        Self::from_schema_str(&raw)
    }

    fn marshal(&self, record: &Record) -> Result<Vec<u8>, SerializeError> {
        let value = apache_avro::to_value(record).map_err(SerializeError::SchemaMismatch)?;
        let resolved = value
            .resolve(&self.schema)
            .map_err(SerializeError::SchemaMismatch)?;
        apache_avro::to_avro_datum(&self.schema, resolved).map_err(SerializeError::Avro)
    }
}
