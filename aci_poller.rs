//! # ACI Poller - Inventory Metrics for the Pushgateway
//!
//! Periodically queries managed objects from an ACI controller (APIC), turns
//! their numeric attributes into Prometheus gauges and publishes them to a
//! Pushgateway. Metric definitions and per-metric bookkeeping live in Redis,
//! so that gauges of objects that disappeared are withdrawn.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              ACI POLLER                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  REDIS (definitions) → SCHEDULER → SAMPLERS → APIC QUERY → PUSHGATEWAY      │
//! │                            ↑                                  │              │
//! │                            └──── bookkeeping (processed-/mos-) ┘              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Due-Set Scheduling**: Each metric is sampled once per its own interval
//! - **Reconciliation**: Gauges of vanished objects are deleted from the gateway
//! - **Failure Backoff**: Failed metrics are retried after a short backoff
//! - **Configuration API**: Optional HTTP surface to manage metric definitions
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use xxhash_rust::xxh3::Xxh3;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Pattern Matching & Validation
// ----------------------------------------------------------------------------
use regex::Regex;
use validator::{Validate, ValidationError, ValidationErrors};

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// Prometheus Metrics
// ----------------------------------------------------------------------------
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts,
    Registry as PrometheusRegistry, TextEncoder,
};

// ----------------------------------------------------------------------------
// Redis & HTTP Clients
// ----------------------------------------------------------------------------
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use redis::{aio::ConnectionManager, FromRedisValue};
use reqwest::{Client as HttpClient, StatusCode, Url};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and limits shared by the poller, the store layout and the
// configuration API. Durations are expressed in milliseconds unless named.
// ============================================================================

/// Poller version - follows semantic versioning
pub const POLLER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const POLLER_NAME: &str = "aci-poller";
pub const POLLER_FULL_NAME: &str = "ACI Metric Poller";

// ----------------------------------------------------------------------------
// Scheduling
// ----------------------------------------------------------------------------

/// Pause between two poll cycles
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Delay between two inventory login attempts
pub const DEFAULT_SESSION_RETRY_MS: u64 = 1000;

/// Upper bound for a single sampling pass
pub const DEFAULT_SAMPLE_TIMEOUT_SECS: u64 = 60;

/// Delay before a failed metric becomes due again (capped by its interval)
pub const DEFAULT_FAILURE_BACKOFF_SECS: u64 = 5;

/// Pushes in flight per sampling pass
pub const DEFAULT_PUSH_CONCURRENCY: usize = 8;

/// Smallest interval accepted for a metric definition
pub const MIN_METRIC_INTERVAL_MS: u64 = 500;

// ----------------------------------------------------------------------------
// Inventory (APIC)
// ----------------------------------------------------------------------------

pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 5;

/// Cookie carrying the APIC session token
pub const APIC_COOKIE_NAME: &str = "APIC-cookie";

/// Attribute holding the distinguished name of a managed object
pub const DN_ATTRIBUTE: &str = "dn";

// ----------------------------------------------------------------------------
// Gateway (Pushgateway)
// ----------------------------------------------------------------------------

pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_GATEWAY_JOB: &str = "aci_monitoring";

/// Grouping-key label addressing one pushed gauge
pub const GROUPING_KEY_LABEL: &str = "id";

pub const DN_LABEL: &str = "dn";
pub const ATTRIBUTE_LABEL: &str = "attribute_name";

/// Joins the parts of a gauge identity before hashing
pub const GAUGE_ID_SEPARATOR: u8 = 0x1f;

// ----------------------------------------------------------------------------
// Key-value store layout
// ----------------------------------------------------------------------------

pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 2;

/// Key holding the JSON list of metric definitions
pub const METRICS_KEY: &str = "metrics";

/// Prefix of the last-processed marker of a metric
pub const PROCESSED_KEY_PREFIX: &str = "processed-";

/// Prefix of the related gauge ids of a metric
pub const RELATED_IDS_KEY_PREFIX: &str = "mos-";

/// Batch size hint for SCAN
pub const SCAN_COUNT: usize = 500;

// ----------------------------------------------------------------------------
// HTTP API
// ----------------------------------------------------------------------------

pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:8080";

/// Namespace of the self-monitoring metrics
pub const STATS_NAMESPACE: &str = "aci_poller";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The values flowing through a poll cycle: metric definitions read from the
// store, managed objects returned by the inventory, gauge identities and the
// samples pushed to the gateway.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Millisecond Wall Clock
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch, the unit of every stored marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp, used for "never processed"
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier` (negative when `earlier` is ahead)
    #[inline]
    pub fn millis_since(&self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub fn sub_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis.min(i64::MAX as u64) as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Definition
// ----------------------------------------------------------------------------

static METRIC_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_]*$").expect("metric name pattern"));

const NAME_RULE: &str = "name can contain should start with letter or digit and may contain _";
const CLASS_NAME_RULE: &str = "metric should have class name";
const ATTRIBUTES_TYPE_RULE: &str = "metric should have string attributes";
const ATTRIBUTES_EMPTY_RULE: &str = "metric should have at least one monitored attribute";
const QUERY_FILTER_TYPE_RULE: &str = "metric should have a query filter";
const QUERY_FILTER_RULE: &str = "invalid query filter";
const INTERVAL_RULE: &str = "metric should have interval >= 500";
const SHAPE_RULE: &str = "invalid metric shape";

/// Fields of a metric definition in the order their rules are reported.
const METRIC_FIELDS: [(&str, &str); 5] = [
    ("name", "name"),
    ("class_name", "className"),
    ("attributes", "attributes"),
    ("query_filter", "queryFilter"),
    ("interval", "interval"),
];

/// One monitored metric: which objects to query and which attributes to sample.
///
/// Stored as JSON in the `metrics` key; the field names follow the
/// configuration API (`className`, `queryFilter`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricDefinition {
    /// Unique metric name, also the Prometheus metric name once sanitised
    #[validate(regex(path = "METRIC_NAME_REGEX", message = "name can contain should start with letter or digit and may contain _"))]
    pub name: String,

    /// Inventory class of the sampled objects
    #[validate(length(min = 1, message = "metric should have class name"))]
    pub class_name: String,

    /// Attributes sampled on every matching object
    #[validate(length(min = 1, message = "metric should have at least one monitored attribute"))]
    pub attributes: Vec<String>,

    /// Filter in the query grammar, empty to match every object
    #[validate(custom = "validate_filter_field")]
    pub query_filter: String,

    /// Sampling interval in milliseconds
    #[validate(range(min = 500, message = "metric should have interval >= 500"))]
    pub interval: u64,
}

fn validate_filter_field(filter: &str) -> Result<(), ValidationError> {
    validate_query_filter(filter).map_err(|_| {
        let mut error = ValidationError::new("query_filter");
        error.message = Some(Cow::Borrowed(QUERY_FILTER_RULE));
        error
    })
}

impl MetricDefinition {
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        attributes: impl IntoIterator<Item = impl Into<String>>,
        query_filter: impl Into<String>,
        interval: u64,
    ) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            query_filter: query_filter.into(),
            interval,
        }
    }

    /// Run every value rule, reporting the first failing one.
    pub fn check(&self) -> Result<(), MetricRejected> {
        self.validate().map_err(|errors| MetricRejected::from_validation(&errors))
    }

    /// Parse an untrusted JSON document into a checked definition.
    ///
    /// Type mismatches are reported with the same message as the value rule of
    /// the offending field, so API clients see one message per field.
    pub fn from_json(value: JsonValue) -> Result<Self, MetricRejected> {
        let object = value
            .as_object()
            .ok_or_else(|| MetricRejected::new("metric", "metric should be a dictionary"))?;

        let keys: BTreeSet<&str> = object.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = METRIC_FIELDS.iter().map(|(_, json)| *json).collect();
        if keys != expected {
            return Err(MetricRejected::new("metric", SHAPE_RULE));
        }

        if !object["name"].is_string() {
            return Err(MetricRejected::new("name", NAME_RULE));
        }
        if !object["className"].is_string() {
            return Err(MetricRejected::new("className", CLASS_NAME_RULE));
        }
        match object["attributes"].as_array() {
            Some(items) if items.iter().all(JsonValue::is_string) => {}
            _ => return Err(MetricRejected::new("attributes", ATTRIBUTES_TYPE_RULE)),
        }
        if !object["queryFilter"].is_string() {
            return Err(MetricRejected::new("queryFilter", QUERY_FILTER_TYPE_RULE));
        }
        if object["interval"].as_u64().is_none() {
            return Err(MetricRejected::new("interval", INTERVAL_RULE));
        }

        let definition: MetricDefinition = serde_json::from_value(value)
            .map_err(|e| MetricRejected::new("metric", format!("{SHAPE_RULE}: {e}")))?;
        definition.check()?;
        Ok(definition)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Gauge Identity
// ----------------------------------------------------------------------------

/// Grouping key of one pushed gauge.
///
/// A content hash of `(metric, dn, attribute)`: no counters, no process state,
/// so a restarted poller computes the same ids and can diff against the ids
/// stored by its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GaugeId(String);

impl GaugeId {
    pub fn compute(metric: &str, dn: &str, attribute: &str) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(metric.as_bytes());
        hasher.update(&[GAUGE_ID_SEPARATOR]);
        hasher.update(dn.as_bytes());
        hasher.update(&[GAUGE_ID_SEPARATOR]);
        hasher.update(attribute.as_bytes());
        Self(format!("{:032x}", hasher.digest128()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for GaugeId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for GaugeId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl Display for GaugeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of gauge ids published for one metric
pub type GaugeIdSet = BTreeSet<GaugeId>;

// ----------------------------------------------------------------------------
// 3.4 Managed Object
// ----------------------------------------------------------------------------

/// Attributes of one inventory object, as returned by a class query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagedObject {
    attributes: JsonMap<String, JsonValue>,
}

impl ManagedObject {
    pub fn from_attributes(attributes: JsonMap<String, JsonValue>) -> Self {
        Self { attributes }
    }

    /// Build from `(attribute, value)` string pairs.
    pub fn with_attributes<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let attributes = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), JsonValue::String(v.to_string())))
            .collect();
        Self { attributes }
    }

    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name)
    }

    /// Distinguished name of the object
    pub fn identifier(&self, class_name: &str) -> ExtractionResult<&str> {
        self.attributes
            .get(DN_ATTRIBUTE)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ExtractionError::MissingIdentifier {
                class_name: class_name.to_string(),
            })
    }

    /// Numeric value of an attribute; the inventory reports numbers as strings.
    pub fn numeric(&self, dn: &str, attribute: &str) -> ExtractionResult<f64> {
        let value = self
            .attributes
            .get(attribute)
            .ok_or_else(|| ExtractionError::MissingAttribute {
                dn: dn.to_string(),
                attribute: attribute.to_string(),
            })?;

        let parsed = match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        parsed.ok_or_else(|| ExtractionError::NotNumeric {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value: value.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 3.5 Gauge Sample
// ----------------------------------------------------------------------------

/// One attribute value of one object, ready to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeSample {
    pub id: GaugeId,
    pub metric: String,
    pub class_name: String,
    pub dn: String,
    pub attribute: String,
    pub value: f64,
}

impl GaugeSample {
    pub fn new(metric: &str, class_name: &str, dn: &str, attribute: &str, value: f64) -> Self {
        Self {
            id: GaugeId::compute(metric, dn, attribute),
            metric: metric.to_string(),
            class_name: class_name.to_string(),
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value,
        }
    }

    /// Prometheus-safe metric name
    pub fn gauge_name(&self) -> String {
        sanitize_metric_name(&self.metric)
    }

    /// Value of the `dn` label
    pub fn dn_label(&self) -> &str {
        strip_class_suffix(&self.class_name, &self.dn)
    }
}

static INVALID_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]+").expect("invalid name chars pattern"));

/// Make a metric name acceptable to Prometheus.
///
/// Names must start with a letter or `_`; other characters collapse to `_`.
pub fn sanitize_metric_name(name: &str) -> String {
    let prefixed = match name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => Cow::Borrowed(name),
        _ => Cow::Owned(format!("X_{name}")),
    };
    INVALID_NAME_CHARS.replace_all(&prefixed, "_").into_owned()
}

/// Drop a trailing class name from a dn, if present.
pub fn strip_class_suffix<'a>(class_name: &str, dn: &'a str) -> &'a str {
    dn.strip_suffix(class_name).unwrap_or(dn)
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type per collaborator, all convertible into `PollerError`.
// Sampler and scheduler failures are logged where they happen; these types
// carry enough context (metric, class, key, status) to make the log useful.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Poller Errors
// ----------------------------------------------------------------------------

/// The main error type for the poller.
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query filter error: {0}")]
    Filter(#[from] FilterSyntaxError),

    #[error("Metric rejected: {0}")]
    Rejected(#[from] MetricRejected),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Sampling error: {0}")]
    Sample(#[from] SampleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PollerError {
    /// Check if this error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            PollerError::Config(_) => false,
            PollerError::Filter(_) => false,
            PollerError::Rejected(_) => false,
            PollerError::Catalog(e) => matches!(e, CatalogError::Store(_)),
            PollerError::Inventory(e) => e.is_recoverable(),
            PollerError::Extraction(_) => true,
            PollerError::Sample(_) => true,
            PollerError::Store(e) => e.is_recoverable(),
            PollerError::Gateway(e) => e.is_recoverable(),
            PollerError::Io(_) => true,
            PollerError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PollerError::Config(_) => "config",
            PollerError::Filter(_) => "filter",
            PollerError::Rejected(_) => "rejected",
            PollerError::Catalog(_) => "catalog",
            PollerError::Inventory(_) => "inventory",
            PollerError::Extraction(_) => "extraction",
            PollerError::Sample(_) => "sample",
            PollerError::Store(_) => "store",
            PollerError::Gateway(_) => "gateway",
            PollerError::Io(_) => "io",
            PollerError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field} (or environment variable {env})")]
    MissingField { field: String, env: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>, env: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
            env: env.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 User Input Errors
// ----------------------------------------------------------------------------

/// A query filter that does not follow the grammar. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid query filter (parsing stopped at offset {offset})")]
pub struct FilterSyntaxError {
    /// Byte offset where parsing stopped
    pub offset: usize,
}

/// A metric definition that breaks one of the definition rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct MetricRejected {
    /// Offending field, in API naming
    pub field: String,
    /// Rule that failed
    pub message: String,
}

impl MetricRejected {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Pick the first failing field in declaration order.
    pub fn from_validation(errors: &ValidationErrors) -> Self {
        let by_field = errors.field_errors();
        for (rust_name, api_name) in METRIC_FIELDS {
            let failures = by_field.get(rust_name).or_else(|| by_field.get(api_name));
            if let Some(first) = failures.and_then(|list| list.first()) {
                let message = first
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| first.code.to_string());
                return Self::new(api_name, message);
            }
        }
        Self::new("metric", errors.to_string())
    }
}

/// Errors of the configuration-collaborator operations
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    Rejected(#[from] MetricRejected),

    #[error("metric with that name already exists")]
    Duplicate { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ----------------------------------------------------------------------------
// 4.4 Inventory Errors
// ----------------------------------------------------------------------------

/// Errors talking to the inventory (APIC)
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Login to '{url}' failed: {message}")]
    Login { url: String, message: String },

    #[error("error while querying \"{class_name}\": HTTP {status}: {body}")]
    Query { class_name: String, status: u16, body: String },

    #[error("Invalid inventory response: {message}")]
    Decode { message: String },

    #[error("Invalid inventory URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Inventory request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl InventoryError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, InventoryError::InvalidUrl { .. })
    }

    pub fn decode(message: impl Into<String>) -> Self {
        InventoryError::Decode {
            message: message.into(),
        }
    }
}

/// Malformed or missing attribute on a matched object.
/// Handled exactly like a failed query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("object without 'dn' in class '{class_name}'")]
    MissingIdentifier { class_name: String },

    #[error("object '{dn}' has no attribute '{attribute}'")]
    MissingAttribute { dn: String, attribute: String },

    #[error("attribute '{attribute}' of '{dn}' is not numeric: {value}")]
    NotNumeric { dn: String, attribute: String, value: String },
}

/// Why a sampling pass was aborted
#[derive(Error, Debug)]
pub enum SampleError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

// ----------------------------------------------------------------------------
// 4.5 Store Errors
// ----------------------------------------------------------------------------

/// Errors from the key-value store holding definitions and bookkeeping
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Corrupt value under key '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Corrupt { .. })
    }

    pub fn corrupt(key: impl Into<String>, message: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Gateway Errors
// ----------------------------------------------------------------------------

/// Errors from the metrics gateway (Pushgateway)
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gateway rejected {operation}: HTTP {status}: {body}")]
    Rejected { operation: &'static str, status: u16, body: String },

    #[error("Failed to encode gauge: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Invalid gateway URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

impl GatewayError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500,
            GatewayError::Encode(_) => false,
            GatewayError::InvalidUrl { .. } => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Result Aliases
// ----------------------------------------------------------------------------

pub type PollerResult<T> = Result<T, PollerError>;
pub type InventoryResult<T> = Result<T, InventoryError>;
pub type ExtractionResult<T> = Result<T, ExtractionError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - built-in defaults
// - optional TOML file
// - plain deployment variables (DB_REDIS_URL, ACI_URL, ...)
// - ACI_POLLER_<SECTION>__<KEY> overrides
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Prefix of the structured environment overrides
pub const ENV_PREFIX: &str = "ACI_POLLER_";

/// Default configuration file, used when present
pub const DEFAULT_CONFIG_PATH: &str = "aci-poller.toml";

/// Plain environment variables understood for compatibility, with the
/// configuration path each one feeds.
pub const LEGACY_ENV_VARS: [(&str, &str); 6] = [
    ("DB_REDIS_URL", "store.redis_url"),
    ("ACI_URL", "inventory.url"),
    ("ACI_USERNAME", "inventory.username"),
    ("ACI_PASSWORD", "inventory.password"),
    ("PROMETHEUS_PUSHGATEWAY_URL", "gateway.url"),
    ("LOG_LEVEL", "logging.level"),
];

/// Root configuration for the poller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Inventory (APIC) connection
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Key-value store holding definitions and bookkeeping
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics gateway (Pushgateway)
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Poll loop tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Health / configuration API
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PollerConfig {
    /// Load configuration with environment overrides and validate it
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path)?
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Provider chain without extraction, lowest precedence first
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment
            .merge(legacy_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load from string (for testing)
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.store.redis_url, "store.redis_url", "DB_REDIS_URL"),
            (&self.inventory.url, "inventory.url", "ACI_URL"),
            (&self.inventory.username, "inventory.username", "ACI_USERNAME"),
            (&self.inventory.password, "inventory.password", "ACI_PASSWORD"),
            (&self.gateway.url, "gateway.url", "PROMETHEUS_PUSHGATEWAY_URL"),
        ];
        for (value, field, env) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::missing_field(field, env));
            }
        }

        if self.gateway.job.trim().is_empty() {
            return Err(ConfigError::invalid_value("gateway.job", "job name cannot be empty"));
        }

        let non_zero = [
            (self.scheduler.debounce, "scheduler.debounce"),
            (self.scheduler.session_retry, "scheduler.session_retry"),
            (self.scheduler.sample_timeout, "scheduler.sample_timeout"),
            (self.inventory.login_timeout, "inventory.login_timeout"),
            (self.inventory.query_timeout, "inventory.query_timeout"),
            (self.gateway.timeout, "gateway.timeout"),
            (self.store.op_timeout, "store.op_timeout"),
        ];
        for (duration, field) in non_zero {
            if duration.is_zero() {
                return Err(ConfigError::invalid_value(field, "duration must be greater than zero"));
            }
        }

        if self.scheduler.push_concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "scheduler.push_concurrency",
                "at least one push must be allowed in flight",
            ));
        }

        if self.http.enabled {
            self.http.listen_addr()?;
        }

        Ok(())
    }

    /// Render the defaults as a TOML document
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })
    }
}

/// Environment provider mapping the legacy variable names onto config paths.
fn legacy_env() -> Env {
    let names: Vec<&str> = LEGACY_ENV_VARS.iter().map(|(env, _)| *env).collect();
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV_VARS
            .iter()
            .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
            .map(|(_, path)| (*path).into())
            .unwrap_or_else(|| key.into())
    })
}

// ----------------------------------------------------------------------------
// 5.2 Inventory Configuration
// ----------------------------------------------------------------------------

/// APIC connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Base URL of the APIC, e.g. https://apic.example.net
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Verify the controller certificate
    #[serde(default)]
    pub verify_tls: bool,

    /// Timeout of the login request
    #[serde(default = "default_login_timeout", with = "humantime_serde")]
    pub login_timeout: Duration,

    /// Timeout of a class query
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            verify_tls: false,
            login_timeout: default_login_timeout(),
            query_timeout: default_query_timeout(),
        }
    }
}

fn default_login_timeout() -> Duration {
    Duration::from_secs(DEFAULT_LOGIN_TIMEOUT_SECS)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Store Configuration
// ----------------------------------------------------------------------------

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL, e.g. redis://localhost:6379/0
    #[serde(default)]
    pub redis_url: String,

    /// Deadline of a single store operation
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            op_timeout: default_store_timeout(),
        }
    }
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.4 Gateway Configuration
// ----------------------------------------------------------------------------

/// Pushgateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the Pushgateway, e.g. http://pushgateway:9091
    #[serde(default)]
    pub url: String,

    /// Job label every gauge is pushed under
    #[serde(default = "default_job")]
    pub job: String,

    /// Timeout of a push or delete request
    #[serde(default = "default_gateway_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            job: default_job(),
            timeout: default_gateway_timeout(),
        }
    }
}

fn default_job() -> String {
    DEFAULT_GATEWAY_JOB.into()
}

fn default_gateway_timeout() -> Duration {
    Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Scheduler Configuration
// ----------------------------------------------------------------------------

/// Poll loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause before every cycle
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    /// Delay between inventory login attempts
    #[serde(default = "default_session_retry", with = "humantime_serde")]
    pub session_retry: Duration,

    /// Deadline of one sampling pass
    #[serde(default = "default_sample_timeout", with = "humantime_serde")]
    pub sample_timeout: Duration,

    /// A failed metric is due again after min(failure_backoff, interval).
    /// Zero retries it on the next cycle.
    #[serde(default = "default_failure_backoff", with = "humantime_serde")]
    pub failure_backoff: Duration,

    /// Pushes in flight per sampling pass
    #[serde(default = "default_push_concurrency")]
    pub push_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            session_retry: default_session_retry(),
            sample_timeout: default_sample_timeout(),
            failure_backoff: default_failure_backoff(),
            push_concurrency: default_push_concurrency(),
        }
    }
}

fn default_debounce() -> Duration {
    Duration::from_millis(DEFAULT_DEBOUNCE_MS)
}

fn default_session_retry() -> Duration {
    Duration::from_millis(DEFAULT_SESSION_RETRY_MS)
}

fn default_sample_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SAMPLE_TIMEOUT_SECS)
}

fn default_failure_backoff() -> Duration {
    Duration::from_secs(DEFAULT_FAILURE_BACKOFF_SECS)
}

fn default_push_concurrency() -> usize {
    DEFAULT_PUSH_CONCURRENCY
}

// ----------------------------------------------------------------------------
// 5.6 HTTP API Configuration
// ----------------------------------------------------------------------------

/// Health and configuration API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Serve the API next to the poll loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::invalid_value("http.listen", format!("{}: {e}", self.listen)))
    }
}

fn default_listen() -> String {
    DEFAULT_HTTP_LISTEN.into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Every sampler event carries the
// metric name, class name and filter so a failing metric can be diagnosed
// from the log alone.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> PollerResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PollerError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PollerError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PollerError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "aci_poller::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: QUERY FILTER GRAMMAR
// ============================================================================
// Validates the filter language scoping the objects a metric targets:
//
//   segment    := comparison | combinator
//   comparison := FUNC "(" FIELD "," STRING ")"
//   FUNC       := eq | le | lt | ge | gt | ne | wcard
//   FIELD      := ident ("." ident)*          ident = [A-Za-z0-9_]+
//   STRING     := double-quoted, \" allowed inside
//   combinator := (and | or) "(" segment ("," segment)* ")"
//
// Whitespace may surround any token. The empty filter matches everything.
// The parser walks a byte cursor over the input and must consume all of it.
// ============================================================================

const COMPARISON_FUNCTIONS: [&str; 7] = ["eq", "le", "lt", "ge", "gt", "ne", "wcard"];
const COMBINATOR_FUNCTIONS: [&str; 2] = ["and", "or"];

/// Check a filter against the grammar without touching the inventory.
pub fn validate_query_filter(filter: &str) -> Result<(), FilterSyntaxError> {
    if filter.is_empty() {
        return Ok(());
    }

    let mut cursor = FilterCursor::new(filter);
    cursor.segment()?;

    if !cursor.at_end() {
        return Err(cursor.error());
    }
    Ok(())
}

/// Recursive-descent state: the input and a byte offset into it.
struct FilterCursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> FilterCursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn error(&self) -> FilterSyntaxError {
        FilterSyntaxError { offset: self.pos }
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    /// Consume `c` if it is the next character.
    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Consume the first keyword of `keywords` that prefixes the input.
    fn eat_keyword(&mut self, keywords: &[&str]) -> bool {
        match keywords.iter().find(|k| self.rest().starts_with(**k)) {
            Some(keyword) => {
                self.pos += keyword.len();
                true
            }
            None => false,
        }
    }

    fn eat_identifier(&mut self) -> bool {
        let len = self
            .rest()
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        self.pos += len;
        len > 0
    }

    fn segment(&mut self) -> Result<(), FilterSyntaxError> {
        let start = self.pos;
        if self.comparison() {
            return Ok(());
        }
        self.pos = start;
        self.combinator()
    }

    /// `FUNC ( FIELD , STRING )` followed by optional whitespace.
    /// Leaves the cursor anywhere on failure; the caller rewinds.
    fn comparison(&mut self) -> bool {
        self.skip_whitespace();
        if !self.eat_keyword(&COMPARISON_FUNCTIONS) {
            return false;
        }
        self.skip_whitespace();
        if !self.eat('(') {
            return false;
        }
        self.skip_whitespace();
        if !self.field() {
            return false;
        }
        self.skip_whitespace();
        if !self.eat(',') {
            return false;
        }
        self.skip_whitespace();
        self.string_then_close()
    }

    fn field(&mut self) -> bool {
        if !self.eat_identifier() {
            return false;
        }
        loop {
            let checkpoint = self.pos;
            if !(self.eat('.') && self.eat_identifier()) {
                self.pos = checkpoint;
                return true;
            }
        }
    }

    /// A quoted string, then `)`.
    ///
    /// A quote preceded by a backslash may either end the string or be part
    /// of it: the earliest quote after which `)` follows wins, and a later
    /// candidate is only tried when the quote was escaped.
    fn string_then_close(&mut self) -> bool {
        let open = self.pos;
        if !self.eat('"') {
            return false;
        }

        let bytes = self.input.as_bytes();
        let mut index = self.pos;
        while index < bytes.len() {
            if bytes[index] == b'"' {
                self.pos = index + 1;
                self.skip_whitespace();
                if self.eat(')') {
                    self.skip_whitespace();
                    return true;
                }
                let escaped = index > open + 1 && bytes[index - 1] == b'\\';
                if !escaped {
                    return false;
                }
            }
            index += 1;
        }
        false
    }

    /// `and|or ( segment (, segment)* )` followed by optional whitespace.
    fn combinator(&mut self) -> Result<(), FilterSyntaxError> {
        self.skip_whitespace();
        if !self.eat_keyword(&COMBINATOR_FUNCTIONS) {
            return Err(self.error());
        }
        self.skip_whitespace();
        if !self.eat('(') {
            return Err(self.error());
        }

        self.segment()?;
        loop {
            self.skip_whitespace();
            if self.eat(')') {
                self.skip_whitespace();
                return Ok(());
            }
            if !self.eat(',') {
                return Err(self.error());
            }
            self.segment()?;
        }
    }
}

// ============================================================================
// SECTION 8: PHASE 1 TESTS - TYPES, CONFIGURATION & FILTER GRAMMAR
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(""; "empty filter")]
    #[test_case(r#"eq(abc.def, "12")"#; "comparison")]
    #[test_case(r#"  eq ( abc.def ,  "12" )  "#; "whitespace around tokens")]
    #[test_case(r#"and(eq(a,"1"))"#; "single argument combinator")]
    #[test_case(r#"or(eq(a,"1"), ne(b.c, "2"), wcard(d, "x"))"#; "three arguments")]
    #[test_case(r#"and(or(gt(a,"1"),lt(a,"5")),ge(fvTenant.name,"0"))"#; "nested combinators")]
    #[test_case(r#"eq(a, "say \"hi\"")"#; "escaped quotes")]
    #[test_case(r#"eq(a, "x\")"#; "backslash before closing quote")]
    #[test_case(r#"le(a_1.b_2.c_3, "")"#; "empty string literal")]
    fn accepts_valid_filters(filter: &str) {
        assert_eq!(validate_query_filter(filter), Ok(()));
    }

    #[test_case(r#"eq(abc.def, "12")x"#; "trailing garbage")]
    #[test_case(r#"eq(a,"1") eq(b,"2")"#; "two top level segments")]
    #[test_case(r#"and("10")"#; "string argument to combinator")]
    #[test_case("abc.def"; "bare field")]
    #[test_case(r#"eq("12", 12)"#; "swapped arguments")]
    #[test_case(r#"ew("12", 12)"#; "unknown function")]
    #[test_case(r#"and(ew(15, "15"))"#; "unknown nested function")]
    #[test_case(r#"EQ(a, "1")"#; "keywords are case sensitive")]
    #[test_case("and()"; "empty combinator")]
    #[test_case(r#"and(eq(a,"1"),)"#; "dangling comma")]
    #[test_case(r#"and(eq(a,"1")"#; "unclosed combinator")]
    #[test_case(r#"eq(a., "1")"#; "dangling dot")]
    #[test_case(r#"eq(a, "1""#; "unclosed comparison")]
    #[test_case(r#"eq(a, "unterminated)"#; "unterminated string")]
    #[test_case("   "; "whitespace only")]
    fn rejects_invalid_filters(filter: &str) {
        assert!(validate_query_filter(filter).is_err(), "{filter:?} should be rejected");
    }

    #[test]
    fn reports_offset_of_leftover_input() {
        let err = validate_query_filter(r#"eq(abc.def, "12")x"#).unwrap_err();
        assert_eq!(err.offset, 17);
    }

    #[test]
    fn test_metric_definition_round_trip() {
        let metric = MetricDefinition::new("tenant_health", "fvTenant", ["healthScore"], "", 1000);
        let json = serde_json::to_value(&metric).unwrap();

        assert_eq!(json["className"], "fvTenant");
        assert_eq!(json["queryFilter"], "");
        assert_eq!(MetricDefinition::from_json(json).unwrap(), metric);
    }

    #[test_case(json!({"name": "$&#*akdod"}), "name can contain should start with letter or digit and may contain _"; "bad name")]
    #[test_case(json!({"name": "_name"}), "name can contain should start with letter or digit and may contain _"; "leading underscore")]
    #[test_case(json!({"name": 123}), "name can contain should start with letter or digit and may contain _"; "numeric name")]
    #[test_case(json!({"className": ""}), "metric should have class name"; "empty class")]
    #[test_case(json!({"className": null}), "metric should have class name"; "null class")]
    #[test_case(json!({"attributes": ["sss", 13]}), "metric should have string attributes"; "mixed attributes")]
    #[test_case(json!({"attributes": "name"}), "metric should have string attributes"; "string attributes")]
    #[test_case(json!({"attributes": []}), "metric should have at least one monitored attribute"; "no attributes")]
    #[test_case(json!({"queryFilter": [""]}), "metric should have a query filter"; "list filter")]
    #[test_case(json!({"queryFilter": "abc.def"}), "invalid query filter"; "bad filter")]
    #[test_case(json!({"interval": 499}), "metric should have interval >= 500"; "short interval")]
    #[test_case(json!({"interval": "1000"}), "metric should have interval >= 500"; "string interval")]
    #[test_case(json!({"extra": true}), "invalid metric shape"; "unknown key")]
    fn rejects_invalid_definitions(patch: JsonValue, expected: &str) {
        let mut document = json!({
            "name": "tenant_health",
            "className": "fvTenant",
            "attributes": ["healthScore"],
            "queryFilter": r#"eq(fvTenant.name, "prod")"#,
            "interval": 1000,
        });
        if let (Some(target), Some(changes)) = (document.as_object_mut(), patch.as_object()) {
            for (key, value) in changes {
                target.insert(key.clone(), value.clone());
            }
        }

        let rejected = MetricDefinition::from_json(document).unwrap_err();
        assert_eq!(rejected.message, expected);
    }

    #[test]
    fn rejects_non_object_definition() {
        let rejected = MetricDefinition::from_json(json!([1, 2])).unwrap_err();
        assert_eq!(rejected.message, "metric should be a dictionary");
    }

    #[test]
    fn test_gauge_id_is_pure() {
        let a = GaugeId::compute("health", "uni/tn-prod", "healthScore");
        let b = GaugeId::compute("health", "uni/tn-prod", "healthScore");
        let c = GaugeId::compute("health", "uni/tn-prod", "childAction");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_gauge_id_is_stable_across_processes() {
        // Ids stored by an earlier process must still match after a restart
        assert_eq!(
            GaugeId::compute("tenants", "uni/tn-a", "healthScore").as_str(),
            "602c7d51648b2407a82dd17e0a121461"
        );
    }

    #[test]
    fn test_gauge_id_separates_parts() {
        assert_ne!(GaugeId::compute("ab", "c", "d"), GaugeId::compute("a", "bc", "d"));
    }

    #[test_case("health", "health")]
    #[test_case("1health", "X_1health")]
    #[test_case("cpu-usage.total", "cpu_usage_total")]
    #[test_case("_private", "_private")]
    fn sanitizes_metric_names(name: &str, expected: &str) {
        assert_eq!(sanitize_metric_name(name), expected);
    }

    #[test]
    fn test_strip_class_suffix() {
        assert_eq!(strip_class_suffix("fvTenant", "uni/tn-prodfvTenant"), "uni/tn-prod");
        assert_eq!(strip_class_suffix("fvTenant", "uni/tn-prod"), "uni/tn-prod");
    }

    #[test]
    fn test_managed_object_extraction() {
        let object = ManagedObject::with_attributes([("dn", "uni/tn-a"), ("healthScore", " 97 "), ("name", "a")]);

        assert_eq!(object.identifier("fvTenant").unwrap(), "uni/tn-a");
        assert_eq!(object.numeric("uni/tn-a", "healthScore").unwrap(), 97.0);
        assert!(matches!(
            object.numeric("uni/tn-a", "name"),
            Err(ExtractionError::NotNumeric { .. })
        ));
        assert!(matches!(
            object.numeric("uni/tn-a", "missing"),
            Err(ExtractionError::MissingAttribute { .. })
        ));
        assert!(ManagedObject::default().identifier("fvTenant").is_err());
    }

    #[test]
    fn test_timestamp_ordering() {
        let earlier = Timestamp::from_millis(1_000);
        let later = Timestamp::from_millis(2_500);

        assert_eq!(later.millis_since(earlier), 1_500);
        assert_eq!(later.sub_millis(500), Timestamp::from_millis(2_000));
        assert!(Timestamp::now() > Timestamp::EPOCH);
    }

    #[test]
    fn test_config_defaults() {
        let config = PollerConfig::default();

        assert_eq!(config.scheduler.debounce, Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        assert_eq!(config.gateway.job, DEFAULT_GATEWAY_JOB);
        assert!(config.http.enabled);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_config_from_toml() {
        let config = PollerConfig::from_toml(
            r#"
            [inventory]
            url = "https://apic.local"
            username = "admin"
            password = "secret"

            [store]
            redis_url = "redis://localhost:6379/0"

            [gateway]
            url = "http://pushgateway:9091"

            [scheduler]
            debounce = "250ms"
            failure_backoff = "0s"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.debounce, Duration::from_millis(250));
        assert_eq!(config.scheduler.failure_backoff, Duration::ZERO);
        assert_eq!(config.inventory.query_timeout, Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS));
    }

    #[test]
    fn test_config_rejects_zero_debounce() {
        let result = PollerConfig::from_toml(
            r#"
            inventory = { url = "https://apic", username = "u", password = "p" }
            store = { redis_url = "redis://localhost" }
            gateway = { url = "http://gw:9091" }
            scheduler = { debounce = "0s" }
            "#,
        );

        assert!(matches!(result, Err(ConfigError::InvalidValue { field, .. }) if field == "scheduler.debounce"));
    }

    #[test]
    fn test_config_reads_legacy_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DB_REDIS_URL", "redis://cache:6379");
            jail.set_env("ACI_URL", "https://apic.lab");
            jail.set_env("ACI_USERNAME", "monitor");
            jail.set_env("ACI_PASSWORD", "s3cret");
            jail.set_env("PROMETHEUS_PUSHGATEWAY_URL", "http://gw:9091");
            jail.set_env("LOG_LEVEL", "debug");
            jail.set_env("ACI_POLLER_SCHEDULER__PUSH_CONCURRENCY", "2");

            let config = PollerConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.store.redis_url, "redis://cache:6379");
            assert_eq!(config.inventory.url, "https://apic.lab");
            assert_eq!(config.inventory.username, "monitor");
            assert_eq!(config.gateway.url, "http://gw:9091");
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.scheduler.push_concurrency, 2);
            Ok(())
        });
    }

    #[test]
    fn test_config_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.toml");
        std::fs::write(
            &path,
            r#"
            [inventory]
            url = "https://apic.file"
            username = "u"
            password = "p"
            [store]
            redis_url = "redis://file"
            [gateway]
            url = "http://gw.file:9091"
            job = "lab"
            "#,
        )
        .unwrap();

        let config = PollerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.job, "lab");
        assert!(matches!(
            PollerConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_generate_default_config_parses_back() {
        let rendered = PollerConfig::generate_default_config().unwrap();
        let parsed: PollerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.scheduler.session_retry, Duration::from_millis(DEFAULT_SESSION_RETRY_MS));
    }
}

// ============================================================================
// SECTION 9: KEY-VALUE STORE BACKENDS
// ============================================================================
// The shared store holding metric definitions and per-metric bookkeeping.
// Only plain string get/set/delete/scan is needed; no transactions.
//
// - `RedisKv`: production backend over a reconnecting connection manager
// - `MemoryKv`: in-process map for tests and dry runs
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 KeyValueStore Trait
// ----------------------------------------------------------------------------

/// String key-value operations used by the metric store accessor.
///
/// Implementations must be safe to share between concurrent sampler tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value under `key`, `None` when absent.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Values of several keys, in request order.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove keys; absent keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Every key starting with `prefix`, unordered.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;
}

// ----------------------------------------------------------------------------
// 9.2 Redis Backend
// ----------------------------------------------------------------------------

/// Redis backend. The connection is established on first use and retried
/// on every later call until it succeeds, so an unreachable server only
/// fails individual operations. Once up, the connection manager reconnects
/// on its own and is cheap to clone, so every call works on its own handle.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    conn: Arc<tokio::sync::OnceCell<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisKv {
    /// Parse the URL without touching the network.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            conn: Arc::new(tokio::sync::OnceCell::new()),
            op_timeout: config.op_timeout,
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .conn
            .get_or_try_init(|| async {
                let manager = tokio::time::timeout(self.op_timeout, ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|_| StoreError::Timeout {
                        operation: "connect",
                        timeout_ms: self.op_timeout.as_millis() as u64,
                    })??;
                debug!(target: "aci_poller::store", "Connected to Redis");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    async fn run<T: FromRedisValue>(&self, operation: &'static str, cmd: redis::Cmd) -> StoreResult<T> {
        let mut conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, cmd.query_async::<_, T>(&mut conn)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("get", cmd).await
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        self.run("mget", cmd).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.run("set", cmd).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        let _removed: u64 = self.run("delete", cmd).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);
            let (next, batch): (u64, Vec<String>) = self.run("scan", cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let _pong: String = self.run("ping", redis::cmd("PING")).await?;
        Ok(())
    }
}

/// Escape the glob metacharacters of a SCAN MATCH pattern.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ----------------------------------------------------------------------------
// 9.3 In-Memory Backend
// ----------------------------------------------------------------------------

/// Process-local store. Contents are lost on exit.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        Ok(keys
            .iter()
            .map(|k| self.entries.get(k).map(|v| v.value().clone()))
            .collect())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ============================================================================
// SECTION 10: METRIC STORE ACCESSOR
// ============================================================================
// Typed access to the key layout shared with the configuration API:
//
//   metrics              JSON list of metric definitions
//   processed-<name>     last processing time, integer milliseconds
//   mos-<name>           JSON list of gauge ids published for the metric
//
// Every key except `metrics` is written by exactly one sampler task, so
// concurrent passes for different metrics never touch the same key.
// ============================================================================

/// Metric definitions and bookkeeping on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct MetricStore {
    kv: Arc<dyn KeyValueStore>,
}

impl MetricStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Store backed by the Redis instance named in the configuration.
    /// Fails only on a malformed URL; the server is contacted on first use.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        Ok(Self::new(Arc::new(RedisKv::open(config)?)))
    }

    pub fn processed_key(name: &str) -> String {
        format!("{PROCESSED_KEY_PREFIX}{name}")
    }

    pub fn related_ids_key(name: &str) -> String {
        format!("{RELATED_IDS_KEY_PREFIX}{name}")
    }

    // ------------------------------------------------------------------------
    // 10.1 Poller operations
    // ------------------------------------------------------------------------

    /// Current metric definitions, in store order. Absent key means none.
    pub async fn list_metrics(&self) -> StoreResult<Vec<MetricDefinition>> {
        match self.kv.get(METRICS_KEY).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(METRICS_KEY, e))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Last processing time of each name; missing or unreadable markers read as 0.
    pub async fn last_processed_times(&self, names: &[String]) -> StoreResult<HashMap<String, Timestamp>> {
        let keys: Vec<String> = names.iter().map(|n| Self::processed_key(n)).collect();
        let values = self.kv.mget(&keys).await?;

        Ok(names
            .iter()
            .cloned()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(name, raw)| {
                let millis = raw
                    .as_deref()
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .unwrap_or_default();
                (name, Timestamp::from_millis(millis))
            })
            .collect())
    }

    pub async fn mark_processed(&self, name: &str, at: Timestamp) -> StoreResult<()> {
        self.kv
            .set(&Self::processed_key(name), &at.as_millis().to_string())
            .await
    }

    /// Gauge ids published for the metric as of its last successful pass.
    pub async fn related_ids(&self, name: &str) -> StoreResult<GaugeIdSet> {
        let key = Self::related_ids_key(name);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(key, e)),
            None => Ok(GaugeIdSet::new()),
        }
    }

    pub async fn save_related_ids(&self, name: &str, ids: &GaugeIdSet) -> StoreResult<()> {
        let encoded = serde_json::to_string(ids)?;
        self.kv.set(&Self::related_ids_key(name), &encoded).await
    }

    /// Remove the processing marker and the related-id set.
    pub async fn delete_bookkeeping(&self, name: &str) -> StoreResult<()> {
        self.kv
            .delete(&[Self::processed_key(name), Self::related_ids_key(name)])
            .await
    }

    /// Names that currently have a processing marker.
    pub async fn processed_metric_names(&self) -> StoreResult<BTreeSet<String>> {
        let keys = self.kv.scan_prefix(PROCESSED_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(PROCESSED_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.kv.ping().await
    }

    // ------------------------------------------------------------------------
    // 10.2 Configuration operations
    // ------------------------------------------------------------------------

    pub async fn save_metrics(&self, metrics: &[MetricDefinition]) -> StoreResult<()> {
        let encoded = serde_json::to_string(metrics)?;
        self.kv.set(METRICS_KEY, &encoded).await
    }

    /// Append a checked definition. Names are unique.
    pub async fn add_metric(&self, metric: MetricDefinition) -> Result<Vec<MetricDefinition>, CatalogError> {
        metric.check()?;

        let mut metrics = self.list_metrics().await?;
        if metrics.iter().any(|m| m.name == metric.name) {
            return Err(CatalogError::Duplicate { name: metric.name });
        }

        info!(target: "aci_poller::catalog",
            metric = %metric.name, class_name = %metric.class_name, filter = %metric.query_filter,
            interval_ms = metric.interval, "Adding metric");
        metrics.push(metric);
        self.save_metrics(&metrics).await?;
        Ok(metrics)
    }

    /// Remove a definition by name. Unknown names leave the list untouched.
    ///
    /// Gauges and bookkeeping are left for the poller, which reaps them on
    /// its next cycle.
    pub async fn delete_metric(&self, name: &str) -> StoreResult<Vec<MetricDefinition>> {
        let mut metrics = self.list_metrics().await?;
        let before = metrics.len();
        metrics.retain(|m| m.name != name);

        if metrics.len() != before {
            info!(target: "aci_poller::catalog", metric = %name, "Deleting metric");
            self.save_metrics(&metrics).await?;
        }
        Ok(metrics)
    }
}

// ============================================================================
// SECTION 11: INVENTORY QUERY ADAPTER
// ============================================================================
// The engine only needs `query(class, filter) -> objects`. The APIC
// implementation logs in once, keeps the session token and sends it as a
// cookie on every class query.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Inventory Traits
// ----------------------------------------------------------------------------

/// A logged-in inventory session, shared read-only by concurrent samplers.
#[async_trait]
pub trait InventorySession: Send + Sync {
    /// Every object of `class_name` matching `filter` (empty filter matches all).
    async fn query(&self, class_name: &str, filter: &str) -> InventoryResult<Vec<ManagedObject>>;
}

/// Establishes inventory sessions.
#[async_trait]
pub trait InventoryConnector: Send + Sync {
    async fn connect(&self) -> InventoryResult<Arc<dyn InventorySession>>;
}

// ----------------------------------------------------------------------------
// 11.2 APIC Connector
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApicConnector {
    client: HttpClient,
    base_url: Url,
    username: String,
    password: String,
    login_timeout: Duration,
    query_timeout: Duration,
}

impl ApicConnector {
    pub fn new(config: &InventoryConfig) -> InventoryResult<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| InventoryError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(InventoryError::InvalidUrl {
                url: config.url.clone(),
                message: "URL cannot carry a path".into(),
            });
        }

        // Controllers commonly run with self-signed certificates
        let client = HttpClient::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            login_timeout: config.login_timeout,
            query_timeout: config.query_timeout,
        })
    }

    async fn login(&self) -> InventoryResult<String> {
        let url = endpoint_url(&self.base_url, &["api", "aaaLogin.json"]);
        let payload = serde_json::json!({
            "aaaUser": {
                "attributes": { "name": self.username, "pwd": self.password }
            }
        });

        let response = self
            .client
            .post(url.clone())
            .timeout(self.login_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| InventoryError::Login {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(InventoryError::Login {
                url: url.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        let document: JsonValue = serde_json::from_str(&body)
            .map_err(|e| InventoryError::decode(format!("login response: {e}")))?;
        let token = document
            .pointer("/imdata/0/aaaLogin/attributes/token")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| InventoryError::decode("login response carries no token"))?;

        debug!(target: "aci_poller::inventory", url = %self.base_url, "APIC login succeeded");
        Ok(token.to_string())
    }
}

#[async_trait]
impl InventoryConnector for ApicConnector {
    async fn connect(&self) -> InventoryResult<Arc<dyn InventorySession>> {
        let token = self.login().await?;
        Ok(Arc::new(ApicSession {
            connector: self.clone(),
            token: RwLock::new(token),
        }))
    }
}

// ----------------------------------------------------------------------------
// 11.3 APIC Session
// ----------------------------------------------------------------------------

pub struct ApicSession {
    connector: ApicConnector,
    token: RwLock<String>,
}

/// Outcome of one class query attempt
enum QueryAttempt {
    Done(Vec<ManagedObject>),
    Unauthorized,
}

impl ApicSession {
    fn class_url(&self, class_name: &str, filter: &str) -> Url {
        let mut url = endpoint_url(
            &self.connector.base_url,
            &["api", "node", "class", &format!("{class_name}.json")],
        );
        let query = if filter.is_empty() {
            "rsp-subtree-include=health".to_string()
        } else {
            format!(
                "query-target-filter={}&rsp-subtree-include=health",
                encode_query_value(filter)
            )
        };
        url.set_query(Some(&query));
        url
    }

    async fn attempt(&self, class_name: &str, url: &Url) -> InventoryResult<QueryAttempt> {
        let cookie = format!("{}={}", APIC_COOKIE_NAME, self.token.read());
        let response = self
            .connector
            .client
            .get(url.clone())
            .timeout(self.connector.query_timeout)
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(QueryAttempt::Unauthorized);
        }

        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(InventoryError::Query {
                class_name: class_name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        parse_class_response(class_name, &body).map(QueryAttempt::Done)
    }
}

#[async_trait]
impl InventorySession for ApicSession {
    async fn query(&self, class_name: &str, filter: &str) -> InventoryResult<Vec<ManagedObject>> {
        let url = self.class_url(class_name, filter);

        if let QueryAttempt::Done(objects) = self.attempt(class_name, &url).await? {
            return Ok(objects);
        }

        // Token expired: log in again and retry once
        debug!(target: "aci_poller::inventory", class_name, "APIC token rejected, logging in again");
        let token = self.connector.login().await?;
        *self.token.write() = token;

        match self.attempt(class_name, &url).await? {
            QueryAttempt::Done(objects) => Ok(objects),
            QueryAttempt::Unauthorized => Err(InventoryError::Query {
                class_name: class_name.to_string(),
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body: "session rejected after re-login".into(),
            }),
        }
    }
}

/// Unwrap `imdata[*].<class>.attributes` from a class query answer.
fn parse_class_response(class_name: &str, body: &str) -> InventoryResult<Vec<ManagedObject>> {
    let document: JsonValue =
        serde_json::from_str(body).map_err(|e| InventoryError::decode(format!("class query response: {e}")))?;
    let items = document
        .get("imdata")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| InventoryError::decode("class query response has no 'imdata' list"))?;

    items
        .iter()
        .map(|item| {
            item.get(class_name)
                .and_then(|mo| mo.get("attributes"))
                .and_then(JsonValue::as_object)
                .map(|attributes| ManagedObject::from_attributes(attributes.clone()))
                .ok_or_else(|| {
                    InventoryError::decode(format!("item without '{class_name}' attributes"))
                })
        })
        .collect()
}

/// `base` with `segments` appended to its path, each segment percent-encoded.
fn endpoint_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Characters escaped in a query value: everything but unreserved
/// characters and `/`.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

fn encode_query_value(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_VALUE).to_string()
}

// ============================================================================
// SECTION 12: GAUGE GATEWAY
// ============================================================================
// Publishes samples to a Prometheus Pushgateway, one group per gauge:
//
//   PUT    /metrics/job/<job>/id/<gauge id>    push one gauge
//   DELETE /metrics/job/<job>/id/<gauge id>    delete one gauge
//   DELETE /metrics/job/<job>                  wipe the job
//
// Each push renders a throwaway registry holding a single gauge, so pushes
// from different metrics or cycles never share collector state.
// ============================================================================

/// Push and delete primitives of the metrics gateway.
#[async_trait]
pub trait GaugeGateway: Send + Sync {
    /// Publish `sample` under its gauge id, replacing any previous value.
    async fn push(&self, sample: &GaugeSample) -> GatewayResult<()>;

    /// Delete the gauge group addressed by `id`.
    async fn delete(&self, id: &GaugeId) -> GatewayResult<()>;

    /// Delete every gauge of the job.
    async fn delete_all(&self) -> GatewayResult<()>;
}

pub struct Pushgateway {
    client: HttpClient,
    base_url: Url,
    job: String,
    pool_size: usize,
}

impl Pushgateway {
    /// `push_concurrency` sizes the idle connection pool to the pushes a
    /// sampling pass keeps in flight.
    pub fn new(config: &GatewayConfig, push_concurrency: usize) -> GatewayResult<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| GatewayError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl {
                url: config.url.clone(),
                message: "URL cannot carry a path".into(),
            });
        }

        let pool_size = push_concurrency.max(1);
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(pool_size)
            .build()?;

        Ok(Self {
            client,
            base_url,
            job: config.job.clone(),
            pool_size,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn job_url(&self) -> Url {
        endpoint_url(&self.base_url, &["metrics", "job", &self.job])
    }

    pub fn gauge_url(&self, id: &GaugeId) -> Url {
        endpoint_url(
            &self.base_url,
            &["metrics", "job", &self.job, GROUPING_KEY_LABEL, id.as_str()],
        )
    }

    async fn send_delete(&self, operation: &'static str, url: Url) -> GatewayResult<()> {
        let response = self.client.delete(url).send().await?;
        check_status(operation, response).await
    }
}

/// Render one sample in the text exposition format.
///
/// Returns the body and its content type.
pub fn encode_sample(sample: &GaugeSample) -> GatewayResult<(Vec<u8>, String)> {
    let registry = PrometheusRegistry::new();
    let opts = Opts::new(
        sample.gauge_name(),
        format!("{} attributes polled from ACI", sample.class_name),
    );
    let gauge = GaugeVec::new(opts, &[DN_LABEL, ATTRIBUTE_LABEL])?;
    registry.register(Box::new(gauge.clone()))?;
    gauge
        .with_label_values(&[sample.dn_label(), sample.attribute.as_str()])
        .set(sample.value);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

async fn check_status(operation: &'static str, response: reqwest::Response) -> GatewayResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Rejected {
        operation,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl GaugeGateway for Pushgateway {
    async fn push(&self, sample: &GaugeSample) -> GatewayResult<()> {
        let (body, content_type) = encode_sample(sample)?;
        trace!(target: "aci_poller::gateway",
            metric = %sample.metric, dn = %sample.dn, attribute = %sample.attribute,
            id = %sample.id, "Pushing gauge");

        let response = self
            .client
            .put(self.gauge_url(&sample.id))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        check_status("push", response).await
    }

    async fn delete(&self, id: &GaugeId) -> GatewayResult<()> {
        trace!(target: "aci_poller::gateway", id = %id, "Deleting gauge");
        self.send_delete("delete", self.gauge_url(id)).await
    }

    async fn delete_all(&self) -> GatewayResult<()> {
        info!(target: "aci_poller::gateway", job = %self.job, "Deleting every gauge of the job");
        self.send_delete("delete_all", self.job_url()).await
    }
}

// ============================================================================
// SECTION 13: PHASE 2 TESTS - STORE, INVENTORY & GATEWAY ADAPTERS
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    pub fn tenant(dn: &str, health: &str) -> ManagedObject {
        ManagedObject::with_attributes([("dn", dn), ("healthScore", health), ("childAction", "0")])
    }

    pub fn tenant_metric(name: &str) -> MetricDefinition {
        MetricDefinition::new(name, "fvTenant", ["healthScore"], "", 1000)
    }

    pub fn memory_store() -> (MetricStore, MemoryKv) {
        let kv = MemoryKv::new();
        (MetricStore::new(Arc::new(kv.clone())), kv)
    }

    /// Inventory answering from canned objects per class.
    #[derive(Default)]
    pub struct FakeInventory {
        objects: Mutex<HashMap<String, Vec<ManagedObject>>>,
        failing: Mutex<bool>,
        delay: Mutex<Option<Duration>>,
        queries: Mutex<Vec<(String, String)>>,
    }

    impl FakeInventory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_objects(&self, class_name: &str, objects: Vec<ManagedObject>) {
            self.objects.lock().insert(class_name.to_string(), objects);
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock() = failing;
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        pub fn queries(&self) -> Vec<(String, String)> {
            self.queries.lock().clone()
        }
    }

    #[async_trait]
    impl InventorySession for FakeInventory {
        async fn query(&self, class_name: &str, filter: &str) -> InventoryResult<Vec<ManagedObject>> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            self.queries.lock().push((class_name.to_string(), filter.to_string()));

            if *self.failing.lock() {
                return Err(InventoryError::Query {
                    class_name: class_name.to_string(),
                    status: 500,
                    body: "inventory unavailable".into(),
                });
            }
            Ok(self.objects.lock().get(class_name).cloned().unwrap_or_default())
        }
    }

    /// Connector failing a fixed number of times before handing out a session.
    pub struct FakeConnector {
        session: Arc<FakeInventory>,
        failures_left: AtomicUsize,
        pub attempts: AtomicUsize,
    }

    impl FakeConnector {
        pub fn new(session: Arc<FakeInventory>, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                session,
                failures_left: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InventoryConnector for FakeConnector {
        async fn connect(&self) -> InventoryResult<Arc<dyn InventorySession>> {
            self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
            let left = self.failures_left.load(AtomicOrdering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, AtomicOrdering::SeqCst);
                return Err(InventoryError::Login {
                    url: "https://apic.test".into(),
                    message: "connection refused".into(),
                });
            }
            Ok(self.session.clone() as Arc<dyn InventorySession>)
        }
    }

    /// Gateway recording every call, with per-dn push and per-id delete failures.
    #[derive(Default)]
    pub struct RecordingGateway {
        pushed: Mutex<Vec<GaugeSample>>,
        deleted: Mutex<Vec<GaugeId>>,
        wipes: AtomicUsize,
        failing_dns: Mutex<HashSet<String>>,
        failing_deletes: Mutex<HashSet<GaugeId>>,
    }

    impl RecordingGateway {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn pushed(&self) -> Vec<GaugeSample> {
            self.pushed.lock().clone()
        }

        pub fn pushed_ids(&self) -> GaugeIdSet {
            self.pushed.lock().iter().map(|s| s.id.clone()).collect()
        }

        pub fn deleted_ids(&self) -> GaugeIdSet {
            self.deleted.lock().iter().cloned().collect()
        }

        pub fn delete_calls(&self) -> usize {
            self.deleted.lock().len()
        }

        pub fn wipes(&self) -> usize {
            self.wipes.load(AtomicOrdering::SeqCst)
        }

        pub fn fail_push_for(&self, dn: &str) {
            self.failing_dns.lock().insert(dn.to_string());
        }

        pub fn fail_delete_of(&self, id: &GaugeId) {
            self.failing_deletes.lock().insert(id.clone());
        }

        pub fn heal(&self) {
            self.failing_dns.lock().clear();
            self.failing_deletes.lock().clear();
        }

        pub fn reset(&self) {
            self.pushed.lock().clear();
            self.deleted.lock().clear();
        }
    }

    #[async_trait]
    impl GaugeGateway for RecordingGateway {
        async fn push(&self, sample: &GaugeSample) -> GatewayResult<()> {
            if self.failing_dns.lock().contains(&sample.dn) {
                return Err(GatewayError::Rejected {
                    operation: "push",
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.pushed.lock().push(sample.clone());
            Ok(())
        }

        async fn delete(&self, id: &GaugeId) -> GatewayResult<()> {
            if self.failing_deletes.lock().contains(id) {
                return Err(GatewayError::Rejected {
                    operation: "delete",
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.deleted.lock().push(id.clone());
            Ok(())
        }

        async fn delete_all(&self) -> GatewayResult<()> {
            self.wipes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    /// Store whose every operation times out.
    pub struct FailingKv;

    fn unavailable(operation: &'static str) -> StoreError {
        StoreError::Timeout {
            operation,
            timeout_ms: 0,
        }
    }

    #[async_trait]
    impl KeyValueStore for FailingKv {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(unavailable("get"))
        }

        async fn mget(&self, _keys: &[String]) -> StoreResult<Vec<Option<String>>> {
            Err(unavailable("mget"))
        }

        async fn set(&self, _key: &str, _value: &str) -> StoreResult<()> {
            Err(unavailable("set"))
        }

        async fn delete(&self, _keys: &[String]) -> StoreResult<()> {
            Err(unavailable("delete"))
        }

        async fn scan_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            Err(unavailable("scan"))
        }

        async fn ping(&self) -> StoreResult<()> {
            Err(unavailable("ping"))
        }
    }

    /// Serve `router` on an ephemeral local port, returning its base URL.
    pub async fn spawn_server(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}


// ============================================================================
// SECTION 14: SAMPLER
// ============================================================================
// One sampling pass for one metric:
//
//   1. query the inventory for the metric's class and filter
//   2. extract every configured attribute of every matched object
//   3. push one gauge per (object, attribute)
//   4. record the processing time
//   5. delete gauges published last time that are no longer produced
//   6. store the new gauge id set when it changed
//
// A failed query or extraction deletes the metric's published gauges and
// leaves a retry marker; nothing is pushed from a partial object set.
// ============================================================================

/// Summary of a successful sampling pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleReport {
    /// Objects returned by the inventory
    pub objects: usize,
    /// Gauges pushed
    pub pushed: usize,
    /// Pushes the gateway refused or never answered
    pub push_failures: usize,
    /// Gauges deleted because they are no longer produced
    pub obsolete_deleted: usize,
    /// Obsolete gauges that could not be deleted, kept for the next pass
    pub obsolete_failed: usize,
    /// Whether the related-id set was written
    pub related_ids_saved: bool,
}

/// Everything a sampling pass needs. Cheap to clone into a task.
#[derive(Clone)]
pub struct Sampler {
    store: MetricStore,
    session: Arc<dyn InventorySession>,
    gateway: Arc<dyn GaugeGateway>,
    stats: Arc<PollerStats>,
    push_concurrency: usize,
    failure_backoff: Duration,
}

impl Sampler {
    pub fn new(
        store: MetricStore,
        session: Arc<dyn InventorySession>,
        gateway: Arc<dyn GaugeGateway>,
        stats: Arc<PollerStats>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            session,
            gateway,
            stats,
            push_concurrency: config.push_concurrency.max(1),
            failure_backoff: config.failure_backoff,
        }
    }

    /// Run one pass. Failures are logged here; the error is returned for
    /// accounting only.
    pub async fn sample(&self, metric: &MetricDefinition) -> Result<SampleReport, SampleError> {
        let started = Instant::now();

        let samples = match self.collect(metric).await {
            Ok(samples) => samples,
            Err(err) => {
                error!(target: "aci_poller::sampler",
                    metric = %metric.name, class_name = %metric.class_name,
                    filter = %metric.query_filter, error = %err,
                    "Sampling pass failed");
                self.withdraw_published(metric).await;
                self.record_failure(metric).await;
                self.stats.record_sample(SampleOutcome::Failed);
                return Err(err);
            }
        };

        let mut report = SampleReport {
            objects: samples
                .iter()
                .map(|s| s.dn.as_str())
                .collect::<HashSet<_>>()
                .len(),
            ..SampleReport::default()
        };
        let current: GaugeIdSet = samples.iter().map(|s| s.id.clone()).collect();

        let failures = self.publish(metric, &samples).await;
        report.pushed = samples.len() - failures;
        report.push_failures = failures;

        if let Err(err) = self.store.mark_processed(&metric.name, Timestamp::now()).await {
            error!(target: "aci_poller::sampler",
                metric = %metric.name, error = %err,
                "Failed to mark metric as processed");
        }

        self.reconcile(metric, current, &mut report).await;

        self.stats.record_sample(SampleOutcome::Succeeded);
        debug!(target: "aci_poller::sampler",
            metric = %metric.name, class_name = %metric.class_name,
            objects = report.objects, pushed = report.pushed,
            push_failures = report.push_failures,
            obsolete_deleted = report.obsolete_deleted,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sampling pass complete");
        Ok(report)
    }

    /// Query the inventory and turn the answer into samples.
    async fn collect(&self, metric: &MetricDefinition) -> Result<Vec<GaugeSample>, SampleError> {
        trace!(target: "aci_poller::sampler",
            metric = %metric.name, class_name = %metric.class_name,
            filter = %metric.query_filter, "Querying inventory");

        let objects = self
            .session
            .query(&metric.class_name, &metric.query_filter)
            .await?;
        Ok(extract_samples(metric, &objects)?)
    }

    /// Push every sample, returning how many pushes failed.
    async fn publish(&self, metric: &MetricDefinition, samples: &[GaugeSample]) -> usize {
        let results: Vec<(GaugeSample, GatewayResult<()>)> = stream::iter(samples.iter().cloned())
            .map(|sample| {
                let gateway = Arc::clone(&self.gateway);
                async move {
                    let result = gateway.push(&sample).await;
                    (sample, result)
                }
            })
            .buffer_unordered(self.push_concurrency)
            .collect()
            .await;

        let mut failures = 0;
        for (sample, result) in results {
            match result {
                Ok(()) => self.stats.gauges_pushed.inc(),
                Err(err) => {
                    failures += 1;
                    self.stats.push_failures.inc();
                    warn!(target: "aci_poller::sampler",
                        metric = %metric.name, dn = %sample.dn,
                        attribute = %sample.attribute, error = %err,
                        "Failed to push gauge");
                }
            }
        }
        failures
    }

    /// Delete what is no longer produced and store the new id set.
    async fn reconcile(&self, metric: &MetricDefinition, current: GaugeIdSet, report: &mut SampleReport) {
        let previous = match self.store.related_ids(&metric.name).await {
            Ok(previous) => previous,
            Err(err) => {
                error!(target: "aci_poller::sampler",
                    metric = %metric.name, error = %err,
                    "Failed to load related ids, skipping obsolete gauge cleanup");
                return;
            }
        };

        let obsolete: Vec<GaugeId> = previous.difference(&current).cloned().collect();
        if !obsolete.is_empty() {
            debug!(target: "aci_poller::sampler",
                metric = %metric.name, count = obsolete.len(),
                "Deleting obsolete gauges");
        }
        let undeleted =
            delete_gauges(&self.gateway, &self.stats, &metric.name, &obsolete, self.push_concurrency).await;
        report.obsolete_deleted = obsolete.len() - undeleted.len();
        report.obsolete_failed = undeleted.len();

        // Undeleted gauges stay tracked so the next pass retries them
        let next: GaugeIdSet = current.into_iter().chain(undeleted).collect();
        if next == previous {
            return;
        }
        match self.store.save_related_ids(&metric.name, &next).await {
            Ok(()) => report.related_ids_saved = true,
            Err(err) => error!(target: "aci_poller::sampler",
                metric = %metric.name, error = %err,
                "Failed to save related ids"),
        }
    }

    /// Best-effort removal of every gauge recorded for the metric.
    pub(crate) async fn withdraw_published(&self, metric: &MetricDefinition) {
        match self.store.related_ids(&metric.name).await {
            Ok(ids) => {
                let ids: Vec<GaugeId> = ids.into_iter().collect();
                let undeleted =
                    delete_gauges(&self.gateway, &self.stats, &metric.name, &ids, self.push_concurrency)
                        .await;
                if !undeleted.is_empty() {
                    warn!(target: "aci_poller::sampler",
                        metric = %metric.name, count = undeleted.len(),
                        "Some gauges of a failed metric could not be deleted");
                }
            }
            Err(err) => error!(target: "aci_poller::sampler",
                metric = %metric.name, error = %err,
                "Failed to load related ids of a failed metric"),
        }
    }

    /// Write a marker that makes the metric due again after
    /// `min(failure_backoff, interval)`.
    pub async fn record_failure(&self, metric: &MetricDefinition) {
        let marker = failure_marker(Timestamp::now(), metric.interval, self.failure_backoff);
        if let Err(err) = self.store.mark_processed(&metric.name, marker).await {
            error!(target: "aci_poller::sampler",
                metric = %metric.name, error = %err,
                "Failed to record retry marker");
        }
    }
}

/// One sample per (object, attribute). Any missing or non-numeric value
/// rejects the whole set.
pub fn extract_samples(metric: &MetricDefinition, objects: &[ManagedObject]) -> ExtractionResult<Vec<GaugeSample>> {
    let mut samples = Vec::with_capacity(objects.len() * metric.attributes.len());
    for object in objects {
        let dn = object.identifier(&metric.class_name)?;
        for attribute in &metric.attributes {
            let value = object.numeric(dn, attribute)?;
            samples.push(GaugeSample::new(&metric.name, &metric.class_name, dn, attribute, value));
        }
    }
    Ok(samples)
}

/// Processing marker for a failed pass at `now`.
pub fn failure_marker(now: Timestamp, interval_ms: u64, backoff: Duration) -> Timestamp {
    let backoff_ms = (backoff.as_millis() as u64).min(interval_ms);
    now.sub_millis(interval_ms - backoff_ms)
}

/// Delete gauges with bounded concurrency, returning the ids that failed.
pub async fn delete_gauges(
    gateway: &Arc<dyn GaugeGateway>,
    stats: &PollerStats,
    metric: &str,
    ids: &[GaugeId],
    concurrency: usize,
) -> Vec<GaugeId> {
    let results: Vec<(GaugeId, GatewayResult<()>)> = stream::iter(ids.iter().cloned())
        .map(|id| {
            let gateway = Arc::clone(gateway);
            async move {
                let result = gateway.delete(&id).await;
                (id, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut undeleted = Vec::new();
    for (id, result) in results {
        match result {
            Ok(()) => stats.gauges_deleted.inc(),
            Err(err) => {
                stats.delete_failures.inc();
                warn!(target: "aci_poller::gateway",
                    metric, id = %id, error = %err, "Failed to delete gauge");
                undeleted.push(id);
            }
        }
    }
    undeleted
}

// ============================================================================
// SECTION 15: SCHEDULER / POLL LOOP
// ============================================================================
// Two states while the process lives:
//
//   AcquiringSession  retry the inventory login every `session_retry`
//   Polling           debounce, sample due metrics, reap removed metrics
//
// Every due metric is sampled in its own task; the cycle waits for all of
// them before reconciling, so one metric never has two passes in flight.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Due Set
// ----------------------------------------------------------------------------

/// Whether a metric last processed at `last` is due at `now`.
#[inline]
pub fn is_due(last: Timestamp, interval_ms: u64, now: Timestamp) -> bool {
    last == Timestamp::EPOCH || now.millis_since(last) >= interval_ms.min(i64::MAX as u64) as i64
}

/// Metrics due at `now`. Names without a marker are always due.
pub fn due_metrics<'a>(
    metrics: &'a [MetricDefinition],
    last_processed: &HashMap<String, Timestamp>,
    now: Timestamp,
) -> Vec<&'a MetricDefinition> {
    metrics
        .iter()
        .filter(|m| {
            let last = last_processed.get(&m.name).copied().unwrap_or(Timestamp::EPOCH);
            is_due(last, m.interval, now)
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 15.2 Cycle Report
// ----------------------------------------------------------------------------

/// What one poll cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Metric definitions loaded
    pub metrics: usize,
    /// Metrics sampled this cycle
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Passes cut off by the sample deadline or lost to a panic
    pub aborted: usize,
    /// Removed metrics whose gauges and bookkeeping were deleted
    pub reaped: usize,
}

/// Outcome of one sampler task
enum TaskOutcome {
    Finished(Result<SampleReport, SampleError>),
    TimedOut,
}

// ----------------------------------------------------------------------------
// 15.3 Poller
// ----------------------------------------------------------------------------

/// The poll loop and its collaborators.
pub struct Poller {
    store: MetricStore,
    connector: Arc<dyn InventoryConnector>,
    gateway: Arc<dyn GaugeGateway>,
    stats: Arc<PollerStats>,
    config: SchedulerConfig,
}

impl Poller {
    pub fn new(
        store: MetricStore,
        connector: Arc<dyn InventoryConnector>,
        gateway: Arc<dyn GaugeGateway>,
        stats: Arc<PollerStats>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            connector,
            gateway,
            stats,
            config,
        }
    }

    pub fn stats(&self) -> &Arc<PollerStats> {
        &self.stats
    }

    /// Log in to the inventory, retrying forever. Returns `None` only when
    /// cancelled.
    pub async fn acquire_session(&self, cancel: &CancellationToken) -> Option<Arc<dyn InventorySession>> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            self.stats.session_attempts.inc();

            match self.connector.connect().await {
                Ok(session) => {
                    info!(target: "aci_poller::scheduler", attempt, "Inventory session established");
                    return Some(session);
                }
                Err(err) => {
                    error!(target: "aci_poller::scheduler",
                        attempt, error = %err,
                        retry_ms = self.config.session_retry.as_millis() as u64,
                        "Failed to obtain inventory session");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(self.config.session_retry) => {}
            }
        }
    }

    /// Acquire a session, then poll until `cancel` fires. A running cycle
    /// is allowed to finish.
    pub async fn run(&self, cancel: CancellationToken) -> PollerResult<()> {
        info!(target: "aci_poller::scheduler",
            debounce_ms = self.config.debounce.as_millis() as u64,
            "Starting poll loop");

        let session = match self.acquire_session(&cancel).await {
            Some(session) => session,
            None => {
                info!(target: "aci_poller::scheduler", "Cancelled before a session was obtained");
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.debounce) => {}
            }

            let report = self.run_cycle(&session).await;
            if report.due > 0 || report.reaped > 0 {
                debug!(target: "aci_poller::scheduler",
                    metrics = report.metrics, due = report.due,
                    succeeded = report.succeeded, failed = report.failed,
                    aborted = report.aborted, reaped = report.reaped,
                    "Poll cycle complete");
            }
        }

        info!(target: "aci_poller::scheduler", "Poll loop stopped");
        Ok(())
    }

    /// One cycle: load definitions, sample what is due, reap removed metrics.
    pub async fn run_cycle(&self, session: &Arc<dyn InventorySession>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        let metrics = match self.store.list_metrics().await {
            Ok(metrics) => metrics,
            Err(err) => {
                // Without the list nothing can be told apart from a removed metric
                error!(target: "aci_poller::scheduler", error = %err, "Failed to load metric definitions");
                self.stats.observe_cycle(started.elapsed());
                return report;
            }
        };
        report.metrics = metrics.len();
        let names: Vec<String> = metrics.iter().map(|m| m.name.clone()).collect();

        match self.store.last_processed_times(&names).await {
            Ok(last_processed) => {
                let due = due_metrics(&metrics, &last_processed, Timestamp::now());
                report.due = due.len();
                self.sample_all(session, due, &mut report).await;
            }
            Err(err) => error!(target: "aci_poller::scheduler",
                error = %err, "Failed to load processing times, skipping sampling"),
        }

        let active: BTreeSet<String> = names.into_iter().collect();
        report.reaped = self.reap_obsolete(&active).await;

        self.stats.observe_cycle(started.elapsed());
        report
    }

    /// Fan out one task per due metric and wait for all of them.
    async fn sample_all(
        &self,
        session: &Arc<dyn InventorySession>,
        due: Vec<&MetricDefinition>,
        report: &mut CycleReport,
    ) {
        if due.is_empty() {
            return;
        }

        let sampler = Sampler::new(
            self.store.clone(),
            Arc::clone(session),
            Arc::clone(&self.gateway),
            Arc::clone(&self.stats),
            &self.config,
        );
        let deadline = self.config.sample_timeout;

        let mut join_set = JoinSet::new();
        for metric in due {
            let sampler = sampler.clone();
            let metric = metric.clone();
            join_set.spawn(async move {
                let outcome = match timeout(deadline, sampler.sample(&metric)).await {
                    Ok(result) => TaskOutcome::Finished(result),
                    Err(_) => {
                        sampler.withdraw_published(&metric).await;
                        sampler.record_failure(&metric).await;
                        TaskOutcome::TimedOut
                    }
                };
                (metric.name, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, TaskOutcome::Finished(Ok(_)))) => report.succeeded += 1,
                Ok((_, TaskOutcome::Finished(Err(_)))) => report.failed += 1,
                Ok((name, TaskOutcome::TimedOut)) => {
                    report.aborted += 1;
                    self.stats.record_sample(SampleOutcome::TimedOut);
                    warn!(target: "aci_poller::scheduler",
                        metric = %name, deadline_ms = deadline.as_millis() as u64,
                        "Sampling pass exceeded its deadline");
                }
                Err(err) => {
                    report.aborted += 1;
                    self.stats.record_sample(SampleOutcome::Panicked);
                    error!(target: "aci_poller::scheduler", error = %err, "Sampler task failed");
                }
            }
        }
    }

    /// Delete gauges and bookkeeping of metrics no longer configured.
    /// Returns how many were fully removed.
    pub async fn reap_obsolete(&self, active: &BTreeSet<String>) -> usize {
        let processed = match self.store.processed_metric_names().await {
            Ok(processed) => processed,
            Err(err) => {
                error!(target: "aci_poller::scheduler", error = %err, "Failed to list processed metrics");
                return 0;
            }
        };

        let mut reaped = 0;
        for name in processed.difference(active) {
            debug!(target: "aci_poller::scheduler", metric = %name, "Deleting obsolete metric");
            if self.reap_metric(name).await {
                reaped += 1;
                self.stats.metrics_reaped.inc();
            }
        }
        reaped
    }

    async fn reap_metric(&self, name: &str) -> bool {
        let ids: Vec<GaugeId> = match self.store.related_ids(name).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) if !err.is_recoverable() => {
                // Unreadable set: the gauges cannot be found anymore
                warn!(target: "aci_poller::scheduler",
                    metric = %name, error = %err,
                    "Dropping unreadable related ids of obsolete metric");
                Vec::new()
            }
            Err(err) => {
                error!(target: "aci_poller::scheduler",
                    metric = %name, error = %err,
                    "Failed to load related ids of obsolete metric");
                return false;
            }
        };

        let undeleted =
            delete_gauges(&self.gateway, &self.stats, name, &ids, self.config.push_concurrency).await;

        if !undeleted.is_empty() {
            // Keep the leftovers so the next cycle retries them
            warn!(target: "aci_poller::scheduler",
                metric = %name, remaining = undeleted.len(),
                "Obsolete metric keeps gauges that could not be deleted");
            let remaining: GaugeIdSet = undeleted.into_iter().collect();
            if let Err(err) = self.store.save_related_ids(name, &remaining).await {
                error!(target: "aci_poller::scheduler",
                    metric = %name, error = %err,
                    "Failed to save remaining related ids of obsolete metric");
            }
            return false;
        }

        match self.store.delete_bookkeeping(name).await {
            Ok(()) => true,
            Err(err) => {
                error!(target: "aci_poller::scheduler",
                    metric = %name, error = %err,
                    "Failed to delete bookkeeping of obsolete metric");
                false
            }
        }
    }

    /// Delete every gauge of the job and all bookkeeping.
    pub async fn purge(&self) -> PollerResult<usize> {
        self.gateway.delete_all().await?;

        let names = self.store.processed_metric_names().await?;
        for name in &names {
            self.store.delete_bookkeeping(name).await?;
        }
        info!(target: "aci_poller::scheduler", metrics = names.len(), "Purged gauges and bookkeeping");
        Ok(names.len())
    }
}

// ============================================================================
// SECTION 16: SELF-MONITORING
// ============================================================================
// Counters about the poller itself, kept in a private registry and exposed
// in the text format at /meta/metrics. They are never pushed to the gateway.
// ============================================================================

/// Result of one sampling pass, as counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Panicked,
}

impl SampleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleOutcome::Succeeded => "success",
            SampleOutcome::Failed => "failure",
            SampleOutcome::TimedOut => "timeout",
            SampleOutcome::Panicked => "panic",
        }
    }
}

/// Poller counters
pub struct PollerStats {
    registry: PrometheusRegistry,
    pub cycles: IntCounter,
    pub samples: IntCounterVec,
    pub gauges_pushed: IntCounter,
    pub gauges_deleted: IntCounter,
    pub push_failures: IntCounter,
    pub delete_failures: IntCounter,
    pub session_attempts: IntCounter,
    pub metrics_reaped: IntCounter,
    pub cycle_duration: Histogram,
}

impl PollerStats {
    pub fn new() -> PollerResult<Self> {
        Self::build().map_err(|e| PollerError::Internal(format!("Failed to register poller metrics: {e}")))
    }

    fn build() -> Result<Self, prometheus::Error> {
        let registry = PrometheusRegistry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(STATS_NAMESPACE);

        let cycles = IntCounter::with_opts(opts("cycles_total", "Poll cycles run"))?;
        let samples = IntCounterVec::new(opts("samples_total", "Sampling passes by outcome"), &["outcome"])?;
        let gauges_pushed = IntCounter::with_opts(opts("gauges_pushed_total", "Gauges pushed to the gateway"))?;
        let gauges_deleted = IntCounter::with_opts(opts("gauges_deleted_total", "Gauges deleted from the gateway"))?;
        let push_failures = IntCounter::with_opts(opts("push_failures_total", "Gauge pushes that failed"))?;
        let delete_failures = IntCounter::with_opts(opts("delete_failures_total", "Gauge deletions that failed"))?;
        let session_attempts =
            IntCounter::with_opts(opts("session_attempts_total", "Inventory login attempts"))?;
        let metrics_reaped =
            IntCounter::with_opts(opts("metrics_reaped_total", "Removed metrics cleaned up"))?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Duration of a poll cycle")
                .namespace(STATS_NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(gauges_pushed.clone()))?;
        registry.register(Box::new(gauges_deleted.clone()))?;
        registry.register(Box::new(push_failures.clone()))?;
        registry.register(Box::new(delete_failures.clone()))?;
        registry.register(Box::new(session_attempts.clone()))?;
        registry.register(Box::new(metrics_reaped.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            registry,
            cycles,
            samples,
            gauges_pushed,
            gauges_deleted,
            push_failures,
            delete_failures,
            session_attempts,
            metrics_reaped,
            cycle_duration,
        })
    }

    pub fn record_sample(&self, outcome: SampleOutcome) {
        self.samples.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn sample_count(&self, outcome: SampleOutcome) -> u64 {
        self.samples.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn observe_cycle(&self, elapsed: Duration) {
        self.cycles.inc();
        self.cycle_duration.observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every counter
    pub fn render(&self) -> PollerResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PollerError::Internal(format!("Failed to encode poller metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| PollerError::Internal(e.to_string()))
    }
}

// ============================================================================
// SECTION 17: PHASE 3 TESTS - SAMPLER & SCHEDULER
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const HEALTH: &str = "healthScore";

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(10),
            session_retry: Duration::from_millis(10),
            sample_timeout: Duration::from_secs(2),
            failure_backoff: Duration::from_secs(5),
            push_concurrency: 4,
        }
    }

    fn id(metric: &str, dn: &str) -> GaugeId {
        GaugeId::compute(metric, dn, HEALTH)
    }

    fn ids(metric: &str, tenants: &[&str]) -> GaugeIdSet {
        tenants
            .iter()
            .map(|t| id(metric, &format!("uni/tn-{t}")))
            .collect()
    }

    fn tenants(names: &[&str]) -> Vec<ManagedObject> {
        names
            .iter()
            .map(|t| tenant(&format!("uni/tn-{t}"), "90"))
            .collect()
    }

    struct Harness {
        store: MetricStore,
        kv: MemoryKv,
        inventory: Arc<FakeInventory>,
        gateway: Arc<RecordingGateway>,
        stats: Arc<PollerStats>,
    }

    impl Harness {
        fn new() -> Self {
            let (store, kv) = memory_store();
            Self {
                store,
                kv,
                inventory: FakeInventory::new(),
                gateway: RecordingGateway::new(),
                stats: Arc::new(PollerStats::new().unwrap()),
            }
        }

        fn session(&self) -> Arc<dyn InventorySession> {
            self.inventory.clone()
        }

        fn sampler(&self) -> Sampler {
            Sampler::new(
                self.store.clone(),
                self.session(),
                self.gateway.clone(),
                self.stats.clone(),
                &scheduler_config(),
            )
        }

        fn poller_with(&self, connector: Arc<dyn InventoryConnector>, config: SchedulerConfig) -> Poller {
            Poller::new(self.store.clone(), connector, self.gateway.clone(), self.stats.clone(), config)
        }

        fn poller(&self) -> Poller {
            self.poller_with(FakeConnector::new(self.inventory.clone(), 0), scheduler_config())
        }

        async fn last_processed(&self, name: &str) -> Timestamp {
            let times = self.store.last_processed_times(&[name.to_string()]).await.unwrap();
            times[name]
        }
    }

    // ------------------------------------------------------------------------
    // Sampler
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_sample_publishes_every_object_attribute() {
        let h = Harness::new();
        h.inventory.set_objects("fvTenant", vec![tenant("uni/tn-a", "100"), tenant("uni/tn-b", "87")]);
        let filter = r#"eq(fvTenant.name, "a")"#;
        let metric = MetricDefinition::new("tenants", "fvTenant", [HEALTH, "childAction"], filter, 1000);

        let before = Timestamp::now();
        let report = h.sampler().sample(&metric).await.unwrap();

        assert_eq!(report.objects, 2);
        assert_eq!(report.pushed, 4);
        assert_eq!(report.push_failures, 0);
        assert!(report.related_ids_saved);
        assert_eq!(h.inventory.queries(), vec![("fvTenant".to_string(), filter.to_string())]);

        let pushed = h.gateway.pushed();
        let a_health = pushed
            .iter()
            .find(|s| s.dn == "uni/tn-a" && s.attribute == HEALTH)
            .unwrap();
        assert_eq!(a_health.value, 100.0);
        assert_eq!(a_health.id, id("tenants", "uni/tn-a"));

        assert_eq!(h.store.related_ids("tenants").await.unwrap(), h.gateway.pushed_ids());
        assert_eq!(h.gateway.pushed_ids().len(), 4);
        assert!(h.last_processed("tenants").await >= before);
        assert_eq!(h.stats.sample_count(SampleOutcome::Succeeded), 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let h = Harness::new();
        h.inventory.set_objects("fvTenant", tenants(&["a", "b"]));
        let metric = tenant_metric("tenants");

        h.sampler().sample(&metric).await.unwrap();
        let first = h.store.related_ids("tenants").await.unwrap();

        let report = h.sampler().sample(&metric).await.unwrap();
        assert_eq!(report.obsolete_deleted, 0);
        assert!(!report.related_ids_saved);
        assert_eq!(h.gateway.delete_calls(), 0);
        assert_eq!(h.store.related_ids("tenants").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_only_vanished_gauges_are_deleted() {
        let h = Harness::new();
        h.store
            .save_related_ids("tenants", &ids("tenants", &["a", "b", "c"]))
            .await
            .unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["b", "c", "d"]));

        let report = h.sampler().sample(&tenant_metric("tenants")).await.unwrap();

        assert_eq!(h.gateway.deleted_ids(), ids("tenants", &["a"]));
        assert_eq!(report.obsolete_deleted, 1);
        assert_eq!(
            h.store.related_ids("tenants").await.unwrap(),
            ids("tenants", &["b", "c", "d"])
        );
    }

    #[tokio::test]
    async fn test_query_failure_withdraws_gauges_and_backs_off() {
        let h = Harness::new();
        let previous = ids("tenants", &["a", "b"]);
        h.store.save_related_ids("tenants", &previous).await.unwrap();
        h.inventory.set_failing(true);
        let metric = MetricDefinition::new("tenants", "fvTenant", [HEALTH], "", 60_000);

        let before = Timestamp::now();
        let err = h.sampler().sample(&metric).await.unwrap_err();
        let after = Timestamp::now();

        assert!(matches!(err, SampleError::Inventory(InventoryError::Query { .. })));
        assert!(h.gateway.pushed().is_empty());
        assert_eq!(h.gateway.deleted_ids(), previous);
        assert_eq!(h.store.related_ids("tenants").await.unwrap(), previous);

        // Due again five seconds after the failure, not a full interval
        let marker = h.last_processed("tenants").await;
        assert!(marker >= before.sub_millis(55_000));
        assert!(marker <= after.sub_millis(55_000));
        assert_eq!(h.stats.sample_count(SampleOutcome::Failed), 1);
    }

    #[tokio::test]
    async fn test_extraction_failure_aborts_pass() {
        let h = Harness::new();
        h.inventory.set_objects(
            "fvTenant",
            vec![tenant("uni/tn-a", "100"), tenant("uni/tn-b", "n/a")],
        );

        let err = h.sampler().sample(&tenant_metric("tenants")).await.unwrap_err();

        assert!(matches!(err, SampleError::Extraction(ExtractionError::NotNumeric { .. })));
        assert!(h.gateway.pushed().is_empty());
        assert!(h.store.related_ids("tenants").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_object_without_dn_aborts_pass() {
        let h = Harness::new();
        h.inventory
            .set_objects("fvTenant", vec![ManagedObject::with_attributes([(HEALTH, "1")])]);

        let err = h.sampler().sample(&tenant_metric("tenants")).await.unwrap_err();
        assert!(matches!(err, SampleError::Extraction(ExtractionError::MissingIdentifier { .. })));
    }

    #[tokio::test]
    async fn test_push_failure_does_not_abort_pass() {
        let h = Harness::new();
        h.inventory.set_objects("fvTenant", tenants(&["a", "b", "c"]));
        h.gateway.fail_push_for("uni/tn-b");

        let before = Timestamp::now();
        let report = h.sampler().sample(&tenant_metric("tenants")).await.unwrap();

        assert_eq!(report.pushed, 2);
        assert_eq!(report.push_failures, 1);
        assert_eq!(h.stats.push_failures.get(), 1);
        assert_eq!(
            h.store.related_ids("tenants").await.unwrap(),
            ids("tenants", &["a", "b", "c"])
        );
        assert!(h.last_processed("tenants").await >= before);
    }

    #[tokio::test]
    async fn test_failed_obsolete_delete_is_retried() {
        let h = Harness::new();
        h.store
            .save_related_ids("tenants", &ids("tenants", &["a", "b"]))
            .await
            .unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["b"]));
        let a = id("tenants", "uni/tn-a");
        h.gateway.fail_delete_of(&a);

        let report = h.sampler().sample(&tenant_metric("tenants")).await.unwrap();
        assert_eq!(report.obsolete_failed, 1);
        assert_eq!(
            h.store.related_ids("tenants").await.unwrap(),
            ids("tenants", &["a", "b"])
        );

        h.gateway.heal();
        let report = h.sampler().sample(&tenant_metric("tenants")).await.unwrap();
        assert_eq!(report.obsolete_deleted, 1);
        assert!(h.gateway.deleted_ids().contains(&a));
        assert_eq!(h.store.related_ids("tenants").await.unwrap(), ids("tenants", &["b"]));
    }

    #[tokio::test]
    async fn test_unreadable_related_ids_skip_cleanup() {
        let h = Harness::new();
        h.kv.set("mos-tenants", "oops").await.unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["a"]));

        let report = h.sampler().sample(&tenant_metric("tenants")).await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(!report.related_ids_saved);
        assert_eq!(h.gateway.delete_calls(), 0);
        assert_eq!(h.kv.get("mos-tenants").await.unwrap().as_deref(), Some("oops"));
    }

    #[test]
    fn test_failure_marker() {
        let now = Timestamp::from_millis(100_000);

        let marker = failure_marker(now, 60_000, Duration::from_secs(5));
        assert_eq!(marker, Timestamp::from_millis(45_000));
        assert!(!is_due(marker, 60_000, Timestamp::from_millis(104_999)));
        assert!(is_due(marker, 60_000, Timestamp::from_millis(105_000)));

        // Zero backoff: due on the next tick
        let marker = failure_marker(now, 60_000, Duration::ZERO);
        assert!(is_due(marker, 60_000, now));

        // Backoff longer than the interval: the interval wins
        let marker = failure_marker(now, 1_000, Duration::from_secs(5));
        assert_eq!(marker, now);
        assert!(is_due(marker, 1_000, Timestamp::from_millis(101_000)));
    }

    // ------------------------------------------------------------------------
    // Due set
    // ------------------------------------------------------------------------

    #[test_case(0, 1_000, 5, true; "never processed")]
    #[test_case(10_000, 1_000, 11_000, true; "exactly one interval")]
    #[test_case(10_000, 1_000, 10_999, false; "just before the interval")]
    #[test_case(10_000, 500, 9_000, false; "marker in the future")]
    fn due_when_interval_elapsed(last: i64, interval: u64, now: i64, expected: bool) {
        assert_eq!(
            is_due(Timestamp::from_millis(last), interval, Timestamp::from_millis(now)),
            expected
        );
    }

    #[test]
    fn test_due_metrics_selection() {
        let metrics = vec![
            MetricDefinition::new("fresh", "fvTenant", [HEALTH], "", 1_000),
            MetricDefinition::new("stale", "fvTenant", [HEALTH], "", 1_000),
            MetricDefinition::new("new", "fvTenant", [HEALTH], "", 1_000),
        ];
        let last: HashMap<String, Timestamp> = [
            ("fresh".to_string(), Timestamp::from_millis(9_500)),
            ("stale".to_string(), Timestamp::from_millis(8_000)),
        ]
        .into_iter()
        .collect();

        let due: Vec<&str> = due_metrics(&metrics, &last, Timestamp::from_millis(10_000))
            .into_iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(due, vec!["stale", "new"]);
    }

    // ------------------------------------------------------------------------
    // Poll cycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cycle_reaps_removed_metric() {
        let h = Harness::new();
        h.store.save_metrics(&[tenant_metric("kept")]).await.unwrap();
        h.store.mark_processed("gone", Timestamp::from_millis(1)).await.unwrap();
        h.store.save_related_ids("gone", &ids("gone", &["x", "y"])).await.unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["a"]));

        let report = h.poller().run_cycle(&h.session()).await;

        assert_eq!(report.metrics, 1);
        assert_eq!(report.due, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.reaped, 1);
        assert_eq!(h.gateway.deleted_ids(), ids("gone", &["x", "y"]));
        assert_eq!(h.kv.get("processed-gone").await.unwrap(), None);
        assert_eq!(h.kv.get("mos-gone").await.unwrap(), None);

        let names: Vec<String> = h.store.processed_metric_names().await.unwrap().into_iter().collect();
        assert_eq!(names, vec!["kept"]);
        assert_eq!(h.stats.cycles.get(), 1);
    }

    #[tokio::test]
    async fn test_reaping_keeps_undeleted_gauges() {
        let h = Harness::new();
        h.store.mark_processed("gone", Timestamp::from_millis(1)).await.unwrap();
        h.store.save_related_ids("gone", &ids("gone", &["x", "y"])).await.unwrap();
        let x = id("gone", "uni/tn-x");
        h.gateway.fail_delete_of(&x);
        let poller = h.poller();

        let report = poller.run_cycle(&h.session()).await;
        let remaining: GaugeIdSet = [x.clone()].into_iter().collect();
        assert_eq!(report.reaped, 0);
        assert_eq!(h.store.related_ids("gone").await.unwrap(), remaining);
        assert!(h.kv.get("processed-gone").await.unwrap().is_some());

        h.gateway.heal();
        let report = poller.run_cycle(&h.session()).await;
        assert_eq!(report.reaped, 1);
        assert!(h.gateway.deleted_ids().contains(&x));
        assert!(h.kv.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_skips_metrics_not_due() {
        let h = Harness::new();
        let metric = MetricDefinition::new("tenants", "fvTenant", [HEALTH], "", 60_000);
        h.store.save_metrics(&[metric]).await.unwrap();
        h.store.mark_processed("tenants", Timestamp::now()).await.unwrap();

        let report = h.poller().run_cycle(&h.session()).await;

        assert_eq!(report.due, 0);
        assert!(h.inventory.queries().is_empty());
        assert_eq!(report.reaped, 0);
    }

    #[tokio::test]
    async fn test_cycle_survives_store_outage() {
        let h = Harness::new();
        let poller = Poller::new(
            MetricStore::new(Arc::new(FailingKv)),
            FakeConnector::new(h.inventory.clone(), 0),
            h.gateway.clone(),
            h.stats.clone(),
            scheduler_config(),
        );

        let report = poller.run_cycle(&h.session()).await;

        assert_eq!(report, CycleReport::default());
        assert_eq!(h.gateway.delete_calls(), 0);
        assert_eq!(h.stats.cycles.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_matches_sequential_passes() {
        let metrics: Vec<MetricDefinition> = (0..6)
            .map(|i| MetricDefinition::new(format!("m{i}"), "fvTenant", [HEALTH], "", 1_000))
            .collect();

        let concurrent = Harness::new();
        concurrent.inventory.set_objects("fvTenant", tenants(&["a", "b", "c"]));
        concurrent.store.save_metrics(&metrics).await.unwrap();
        let report = concurrent.poller().run_cycle(&concurrent.session()).await;
        assert_eq!(report.succeeded, metrics.len());

        let sequential = Harness::new();
        sequential.inventory.set_objects("fvTenant", tenants(&["a", "b", "c"]));
        for metric in metrics.iter().rev() {
            sequential.sampler().sample(metric).await.unwrap();
        }

        for metric in &metrics {
            assert_eq!(
                concurrent.store.related_ids(&metric.name).await.unwrap(),
                sequential.store.related_ids(&metric.name).await.unwrap()
            );
        }
        assert_eq!(concurrent.gateway.pushed_ids(), sequential.gateway.pushed_ids());
        assert_eq!(concurrent.kv.keys(), {
            let mut keys = sequential.kv.keys();
            keys.push("metrics".to_string());
            keys.sort();
            keys
        });
    }

    #[tokio::test]
    async fn test_slow_sampler_hits_deadline() {
        let h = Harness::new();
        h.store.save_metrics(&[tenant_metric("tenants")]).await.unwrap();
        h.store.save_related_ids("tenants", &ids("tenants", &["x", "y"])).await.unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["a"]));
        h.inventory.set_delay(Duration::from_millis(500));
        let config = SchedulerConfig {
            sample_timeout: Duration::from_millis(20),
            ..scheduler_config()
        };
        let poller = h.poller_with(FakeConnector::new(h.inventory.clone(), 0), config);

        let report = poller.run_cycle(&h.session()).await;

        assert_eq!(report.aborted, 1);
        assert!(h.gateway.pushed().is_empty());
        // Gauges published before the stall are withdrawn like any failure
        assert_eq!(h.gateway.deleted_ids(), ids("tenants", &["x", "y"]));
        assert_ne!(h.last_processed("tenants").await, Timestamp::EPOCH);
        assert_eq!(h.stats.sample_count(SampleOutcome::TimedOut), 1);
    }

    // ------------------------------------------------------------------------
    // Session acquisition and the loop
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_session_acquisition_retries_until_success() {
        let h = Harness::new();
        let connector = FakeConnector::new(h.inventory.clone(), 2);
        let poller = h.poller_with(connector.clone(), scheduler_config());

        let session = poller.acquire_session(&CancellationToken::new()).await;

        assert!(session.is_some());
        assert_eq!(connector.attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(h.stats.session_attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_session_acquisition_is_cancellable() {
        let h = Harness::new();
        let poller = h.poller_with(FakeConnector::new(h.inventory.clone(), usize::MAX), scheduler_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(poller.acquire_session(&cancel).await.is_none());
        assert!(poller.run(cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_polls_until_cancelled() {
        let h = Harness::new();
        h.store.save_metrics(&[tenant_metric("tenants")]).await.unwrap();
        h.inventory.set_objects("fvTenant", tenants(&["a", "b"]));
        let poller = h.poller();
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            async move {
                sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            }
        };
        let (result, ()) = tokio::join!(poller.run(cancel.clone()), stopper);

        result.unwrap();
        assert!(h.stats.cycles.get() >= 1);
        assert_eq!(h.gateway.pushed_ids(), ids("tenants", &["a", "b"]));
    }

    #[tokio::test]
    async fn test_purge_wipes_job_and_bookkeeping() {
        let h = Harness::new();
        h.store.save_metrics(&[tenant_metric("tenants")]).await.unwrap();
        for name in ["tenants", "epgs"] {
            h.store.mark_processed(name, Timestamp::now()).await.unwrap();
            h.store.save_related_ids(name, &ids(name, &["a"])).await.unwrap();
        }

        let purged = h.poller().purge().await.unwrap();

        assert_eq!(purged, 2);
        assert_eq!(h.gateway.wipes(), 1);
        assert_eq!(h.kv.keys(), vec!["metrics".to_string()]);
    }
}

// ============================================================================
// SECTION 18: HTTP API
// ============================================================================
// Health check and metric configuration endpoints, served next to the poll
// loop:
//
//   GET    /meta/health      204 when the store answers, 500 otherwise
//   GET    /meta/metrics     poller counters, text format
//   GET    /metrics          current metric definitions
//   POST   /metrics          add a definition, 400 {"error": ...} on rejection
//   DELETE /metrics/:name    remove a definition
// ============================================================================

#[cfg(feature = "http-api")]
pub mod api {
    use super::*;
    use axum::{
        body::Bytes,
        extract::{Path as UrlPath, State},
        http::{header, StatusCode as HttpStatus},
        response::{IntoResponse, Response},
        routing::{delete, get},
        Json, Router,
    };
    use tower_http::trace::TraceLayer;

    /// Shared handler state
    #[derive(Clone)]
    pub struct ApiState {
        pub store: MetricStore,
        pub stats: Arc<PollerStats>,
    }

    /// API failure, rendered as `{"error": message}`
    #[derive(Debug)]
    pub enum ApiError {
        BadRequest(String),
        Store(StoreError),
        Internal(String),
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            let (status, message) = match self {
                ApiError::BadRequest(message) => (HttpStatus::BAD_REQUEST, message),
                ApiError::Store(err) => {
                    error!(target: "aci_poller::api", error = %err, "Store failure while serving request");
                    (HttpStatus::INTERNAL_SERVER_ERROR, err.to_string())
                }
                ApiError::Internal(message) => (HttpStatus::INTERNAL_SERVER_ERROR, message),
            };
            (status, Json(json!({ "error": message }))).into_response()
        }
    }

    impl From<StoreError> for ApiError {
        fn from(err: StoreError) -> Self {
            ApiError::Store(err)
        }
    }

    impl From<CatalogError> for ApiError {
        fn from(err: CatalogError) -> Self {
            match err {
                CatalogError::Store(err) => ApiError::Store(err),
                rejected => ApiError::BadRequest(rejected.to_string()),
            }
        }
    }

    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/meta/health", get(health))
            .route("/meta/metrics", get(poller_metrics))
            .route("/metrics", get(list_metrics).post(add_metric))
            .route("/metrics/:name", delete(delete_metric))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    async fn health(State(state): State<ApiState>) -> HttpStatus {
        match state.store.ping().await {
            Ok(()) => HttpStatus::NO_CONTENT,
            Err(err) => {
                warn!(target: "aci_poller::api", error = %err, "Health check failed");
                HttpStatus::INTERNAL_SERVER_ERROR
            }
        }
    }

    async fn poller_metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
        let body = state
            .stats
            .render()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
    }

    async fn list_metrics(State(state): State<ApiState>) -> Result<Json<Vec<MetricDefinition>>, ApiError> {
        Ok(Json(state.store.list_metrics().await?))
    }

    async fn add_metric(
        State(state): State<ApiState>,
        body: Bytes,
    ) -> Result<Json<Vec<MetricDefinition>>, ApiError> {
        let document: JsonValue = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("metric should be a dictionary".into()))?;
        let metric = MetricDefinition::from_json(document).map_err(|r| ApiError::BadRequest(r.message))?;
        Ok(Json(state.store.add_metric(metric).await?))
    }

    async fn delete_metric(
        State(state): State<ApiState>,
        UrlPath(name): UrlPath<String>,
    ) -> Result<Json<Vec<MetricDefinition>>, ApiError> {
        Ok(Json(state.store.delete_metric(&name).await?))
    }

    /// Serve the API until `cancel` fires.
    pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> PollerResult<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(target: "aci_poller::api", addr = %listener.local_addr()?, "HTTP API listening");

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!(target: "aci_poller::api", "HTTP API stopped");
        Ok(())
    }

}

// ============================================================================
// SECTION 19: COMMAND LINE INTERFACE
// ============================================================================
// `run` is the default. The other subcommands are operator tools that reuse
// the same configuration layering.
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// ACI metric poller CLI
#[derive(Parser, Debug)]
#[command(
    name = "aci-poller",
    author = "AIOps Team",
    version,
    about = "Polls ACI managed objects and publishes their attributes to a Pushgateway",
    long_about = "Reads metric definitions from Redis, samples the configured attributes \
                  of matching APIC managed objects at each metric's interval, pushes them \
                  as gauges to a Prometheus Pushgateway and deletes gauges of objects or \
                  metrics that disappeared."
)]
pub struct Cli {
    /// Configuration file path (aci-poller.toml is used when present)
    #[arg(short, long, env = "ACI_POLLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "ACI_POLLER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "ACI_POLLER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the poller (default)
    Run,

    /// Validate configuration
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a query filter against the grammar
    CheckFilter {
        /// Filter expression, e.g. 'eq(fvTenant.name, "prod")'
        filter: String,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ping the metric store
    Health,

    /// Delete every pushed gauge of the job and all bookkeeping
    Purge,

    /// Show version and build info
    Version,
}

/// The file to load: the explicit one, else the default file when present.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then_some(default)
        }
    }
}

// ----------------------------------------------------------------------------
// 19.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> PollerResult<()> {
    match config_path {
        Some(path) => println!("Validating configuration file: {}", path.display()),
        None => println!("Validating configuration from defaults and environment"),
    }

    match PollerConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • APIC: {}", config.inventory.url);
            println!("  • Pushgateway: {} (job {})", config.gateway.url, config.gateway.job);
            println!("  • Debounce: {}", humantime::format_duration(config.scheduler.debounce));
            println!("  • Failure backoff: {}", humantime::format_duration(config.scheduler.failure_backoff));
            println!("  • Push concurrency: {}", config.scheduler.push_concurrency);
            if config.http.enabled {
                println!("  • HTTP API: {}", config.http.listen);
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(PollerError::Config(e))
        }
    }
}

/// Handle the check-filter subcommand
fn handle_check_filter(filter: &str) -> PollerResult<()> {
    match validate_query_filter(filter) {
        Ok(()) => {
            println!("✅ Filter is valid");
            Ok(())
        }
        Err(e) => {
            println!("❌ Filter is invalid");
            println!("  {}", filter);
            println!("  {}^", " ".repeat(filter[..e.offset.min(filter.len())].chars().count()));
            Err(PollerError::Filter(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> PollerResult<()> {
    let config_str = PollerConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", POLLER_FULL_NAME, POLLER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Interval-driven sampling of APIC managed objects");
    println!("  • Pushgateway publishing with stale gauge cleanup");
    if cfg!(feature = "http-api") {
        println!("  • Health and metric configuration API");
    }
}

/// Handle the health subcommand
async fn handle_health(config: &PollerConfig) -> PollerResult<()> {
    let store = MetricStore::open(&config.store)?;
    match store.ping().await {
        Ok(()) => {
            println!("✅ Metric store is reachable");
            Ok(())
        }
        Err(e) => {
            println!("❌ Metric store is unreachable: {}", e);
            Err(PollerError::Store(e))
        }
    }
}

/// Handle the purge subcommand
async fn handle_purge(config: &PollerConfig) -> PollerResult<()> {
    let poller = build_poller(config)?;
    let purged = poller.purge().await?;
    println!("✅ Deleted all gauges of job '{}' and bookkeeping of {} metrics", config.gateway.job, purged);
    Ok(())
}

/// Wire the poller from configuration.
fn build_poller(config: &PollerConfig) -> PollerResult<Poller> {
    let store = MetricStore::open(&config.store)?;
    let connector = Arc::new(ApicConnector::new(&config.inventory)?);
    let gateway = Arc::new(Pushgateway::new(&config.gateway, config.scheduler.push_concurrency)?);
    let stats = Arc::new(PollerStats::new()?);

    Ok(Poller::new(store, connector, gateway, stats, config.scheduler.clone()))
}

/// Handle the run subcommand
async fn handle_run(config: PollerConfig) -> PollerResult<()> {
    let poller = build_poller(&config)?;
    let cancel = CancellationToken::new();

    // Store errors are never fatal: cycles fail and log until Redis answers
    if let Err(e) = poller.store.ping().await {
        warn!(target: "aci_poller::main", error = %e, "Metric store unreachable at startup, continuing");
    }

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    #[cfg(feature = "http-api")]
    let api_task = if config.http.enabled {
        let state = api::ApiState {
            store: poller.store.clone(),
            stats: Arc::clone(poller.stats()),
        };
        let addr = config.http.listen_addr()?;
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, token.clone()).await {
                error!(target: "aci_poller::api", error = %e, "HTTP API failed");
                token.cancel();
            }
        }))
    } else {
        None
    };

    poller.run(cancel.clone()).await?;

    #[cfg(feature = "http-api")]
    {
        cancel.cancel();
        if let Some(task) = api_task {
            if let Err(e) = task.await {
                error!(target: "aci_poller::api", error = %e, "HTTP API task failed");
            }
        }
    }

    info!(target: "aci_poller::main", "Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to ctrl-c"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c");
}

// ============================================================================
// SECTION 20: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the poller
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(config_path.as_deref(), *verbose)?;
            return Ok(());
        }
        Some(Commands::CheckFilter { filter }) => {
            handle_check_filter(filter)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config = PollerConfig::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    info!("{} v{}", POLLER_FULL_NAME, POLLER_VERSION);

    match cli.command {
        Some(Commands::Health) => handle_health(&config).await?,
        Some(Commands::Purge) => handle_purge(&config).await?,
        _ => handle_run(config).await?,
    }

    Ok(())
}
