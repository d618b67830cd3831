//! # Kafka MSK Shim - Managed-Streaming Entity Synthesis for Self-Managed Kafka
//!
//! Turns raw per-broker and per-topic Kafka telemetry (JMX beans and Admin-API
//! offsets, collected elsewhere) into the cluster → broker → topic entity model
//! used by managed-streaming (MSK) dashboards and alert policies.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              KAFKA MSK SHIM                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  COLLECTOR → TRANSFORMER (+ CORRELATOR, LAG) → ENTITY CACHE → AGGREGATOR    │
//! │                         ↑ FALLBACK GENERATOR          ↓ FLUSH → PUBLISHER   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Stable identity**: deterministic entity GUIDs in the managed-schema format
//! - **Metric-aware rollups**: health metrics by MAX, throughput by SUM, counts by COUNT
//! - **Host correlation**: CPU, memory and data/log disk usage joined by hostname
//! - **Consumer lag**: per topic and consumer group, clamped at zero
//! - **Enhanced mode**: continuous synthetic series when brokers stop reporting
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing & Encoding
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHasher};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Synthetic Data
// ----------------------------------------------------------------------------
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{CommandFactory, Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults mirror the environment-driven settings of the collector this shim
// plugs into, so an unconfigured deployment still produces valid entities.
// ============================================================================

/// Shim version - follows semantic versioning
pub const SHIM_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SHIM_NAME: &str = "kafka-msk-shim";
pub const SHIM_FULL_NAME: &str = "Kafka MSK Shim";

// ----------------------------------------------------------------------------
// Identity Defaults
// ----------------------------------------------------------------------------

/// Placeholder AWS account used when none is configured
pub const DEFAULT_ACCOUNT_ID: &str = "123456789012";

pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_CLUSTER_NAME: &str = "default-kafka-cluster";

pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Value of `tags.provider` on every record
pub const PROVIDER_TAG: &str = "AWS";

/// Value of `tags.messageQueueType` on every record
pub const MESSAGE_QUEUE_TYPE: &str = "Kafka";

// ----------------------------------------------------------------------------
// Storage Classification
// ----------------------------------------------------------------------------

/// Mount paths holding Kafka data logs
pub const DEFAULT_DISK_MOUNT_REGEX: &str = "data|kafka";

/// Mount paths holding Kafka application logs (checked before the data pattern)
pub const DEFAULT_LOG_MOUNT_REGEX: &str = "logs|kafka-logs";

// ----------------------------------------------------------------------------
// Publishing
// ----------------------------------------------------------------------------

pub const DEFAULT_BATCH_SIZE: usize = 1000;

pub const MAX_BATCH_SIZE: usize = 100_000;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Flushes slower than this are logged at warn level
pub const FLUSH_WARN_THRESHOLD_MS: u64 = 250;

// ----------------------------------------------------------------------------
// Enhanced Mode
// ----------------------------------------------------------------------------

/// Consecutive empty cycles tolerated before synthetic output starts
pub const DEFAULT_EMPTY_CYCLE_THRESHOLD: u32 = 5;

/// Lower bound of the per-cycle relative drift of synthetic values
pub const DEFAULT_JITTER_MIN: f64 = 0.05;

/// Upper bound of the per-cycle relative drift of synthetic values
pub const DEFAULT_JITTER_MAX: f64 = 0.20;

// ----------------------------------------------------------------------------
// Limits & Thresholds
// ----------------------------------------------------------------------------

/// Number of shards in the entity cache (power of 2)
pub const ENTITY_CACHE_SHARDS: usize = 64;

/// Lag above this many messages is logged as a warning
pub const CONSUMER_LAG_WARN_THRESHOLD: i64 = 1_000_000;

// ----------------------------------------------------------------------------
// Configuration Sources
// ----------------------------------------------------------------------------

/// Prefix of environment overrides (`MSK_SHIM_FALLBACK__FORCED=true`)
pub const ENV_PREFIX: &str = "MSK_SHIM_";

pub const DEFAULT_CONFIG_PATH: &str = "msk-shim.toml";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data types flowing between collector, transformer and publisher:
// - timestamps and entity kinds
// - raw samples as the collector hands them over
// - canonical metric values as the publisher receives them
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.9f UTC"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Entity Types - Cluster, Broker, Topic
// ----------------------------------------------------------------------------

/// The three entity kinds of the managed-streaming schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "AWSMSKCLUSTER")]
    Cluster,
    #[serde(rename = "AWSMSKBROKER")]
    Broker,
    #[serde(rename = "AWSMSKTOPIC")]
    Topic,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Cluster, EntityType::Broker, EntityType::Topic];

    /// Schema name used inside GUIDs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Cluster => "AWSMSKCLUSTER",
            EntityType::Broker => "AWSMSKBROKER",
            EntityType::Topic => "AWSMSKTOPIC",
        }
    }

    /// Event type carried by published records
    pub fn event_type(&self) -> &'static str {
        match self {
            EntityType::Cluster => "AwsMskClusterSample",
            EntityType::Broker => "AwsMskBrokerSample",
            EntityType::Topic => "AwsMskTopicSample",
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TransformError::UnknownEntityType { value: s.to_string() })
    }
}

// ----------------------------------------------------------------------------
// 3.3 Raw Values - What the Collector Hands Over
// ----------------------------------------------------------------------------

/// A single value of a raw JMX / Admin-API sample.
///
/// Collectors are loose about types: rates arrive as floats, counters as
/// integers, and some bridges stringify everything. Accessors normalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Numeric view. Non-finite numbers and unparseable strings yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            RawValue::Null => return None,
            RawValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            RawValue::Int(i) => *i as f64,
            RawValue::Float(f) => *f,
            RawValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            RawValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| self.as_f64().map(|f| f.round() as i64)),
            _ => self.as_f64().map(|f| f.round() as i64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            RawValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => self.as_f64().map(|f| f != 0.0),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue::Int(v as i64)
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

impl From<&str> for RawValue {
    fn from(v: &str) -> Self {
        RawValue::Text(v.to_string())
    }
}

impl From<String> for RawValue {
    fn from(v: String) -> Self {
        RawValue::Text(v)
    }
}

/// One entity's raw sample map for one collection cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSample {
    values: AHashMap<String, RawValue>,
}

impl RawSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RawValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// An empty map means "no data at all", as opposed to partial data
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First present string value among `keys`
    pub fn first_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.values.get(*k))
            .find_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RawValue)> {
        self.values.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for RawSample
where
    K: Into<String>,
    V: Into<RawValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Values - Canonical Output Values
// ----------------------------------------------------------------------------

/// A canonical attribute or metric value on an entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(CompactString),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            MetricValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            MetricValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(i) => Some(*i),
            MetricValue::Float(f) => Some(f.round() as i64),
            MetricValue::Bool(b) => Some(*b as i64),
            MetricValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

// ----------------------------------------------------------------------------
// 3.5 Data Source - Real vs Synthetic
// ----------------------------------------------------------------------------

/// Whether a record carries collected or synthesized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Real,
    Synthetic,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Real => "real",
            DataSource::Synthetic => "synthetic",
        }
    }
}

impl Display for DataSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the shim:
// - configuration problems are fatal at construction
// - transform errors reject a single call
// - enrichment errors are logged, counted and skipped
// - publish errors surface from flush
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Shim Errors
// ----------------------------------------------------------------------------

/// The main error type for the shim.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Enrichment error: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShimError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ShimError::Config(_) => false,
            ShimError::Transform(_) => true,
            ShimError::Enrichment(_) => true,
            ShimError::Publish(e) => e.is_recoverable(),
            ShimError::Io(_) => true,
            ShimError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ShimError::Config(_) => "config",
            ShimError::Transform(_) => "transform",
            ShimError::Enrichment(_) => "enrichment",
            ShimError::Publish(_) => "publish",
            ShimError::Io(_) => "io",
            ShimError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ShimError::Config(_) => RecoveryHint::FixConfiguration,
            ShimError::Transform(_) => RecoveryHint::Skip,
            ShimError::Enrichment(_) => RecoveryHint::Skip,
            ShimError::Publish(e) if e.is_recoverable() => RecoveryHint::RetryWithBackoff,
            ShimError::Publish(_) => RecoveryHint::AlertOperator,
            ShimError::Io(_) => RecoveryHint::RetryWithBackoff,
            ShimError::Internal(_) => RecoveryHint::None,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
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

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("No configuration supplied")]
    MissingConfig,

    #[error("Shim is disabled (set `enabled = true`)")]
    Disabled,
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Transform Errors
// ----------------------------------------------------------------------------

/// Errors that reject a single transform call. Missing or malformed fields are
/// never errors; they only leave the field unset.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Broker id {broker_id} is negative")]
    InvalidBrokerId { broker_id: i32 },

    #[error("Topic name is empty")]
    EmptyTopicName,

    #[error("Consumer group name is empty for topic '{topic}'")]
    EmptyGroupName { topic: String },

    #[error("Unknown entity type '{value}'")]
    UnknownEntityType { value: String },
}

// ----------------------------------------------------------------------------
// 4.4 Enrichment Errors
// ----------------------------------------------------------------------------

/// Failures of the optional enrichment paths (host correlation, consumer lag).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrichmentError {
    #[error("Admin API unavailable: {message}")]
    AdminApiUnavailable { message: String },

    #[error("Host sample lookup for '{hostname}' failed: {message}")]
    HostLookupFailed { hostname: String, message: String },

    #[error("Offsets for topic '{topic}' are unusable: {message}")]
    InvalidOffsets { topic: String, message: String },
}

impl EnrichmentError {
    pub fn admin_api(message: impl Into<String>) -> Self {
        EnrichmentError::AdminApiUnavailable {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Publish Errors
// ----------------------------------------------------------------------------

/// Errors from the publisher sink
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to serialize record '{guid}': {message}")]
    Serialization { guid: String, message: String },

    #[error("Publisher write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend rejected batch of {count} records: {message}")]
    Rejected { count: usize, message: String },
}

impl PublishError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            PublishError::Serialization { .. } => false,
            PublishError::Io(_) => true,
            PublishError::Rejected { .. } => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for shim operations
pub type ShimResult<T> = Result<T, ShimError>;

pub type EnrichmentResult<T> = Result<T, EnrichmentError>;

pub type PublishResult<T> = Result<T, PublishError>;

// ----------------------------------------------------------------------------
// 4.7 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    /// Recoverable vs non-recoverable
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &ShimError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Get total error count
    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    /// Get error count by category
    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.by_category.clear();
        self.recoverable_count.store(0, AtomicOrdering::Relaxed);
        self.non_recoverable_count.store(0, AtomicOrdering::Relaxed);
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// One validated configuration struct built once at startup:
// - TOML file parsing
// - Environment variable overrides (MSK_SHIM_*)
// - Validation that rejects unknown or malformed values up front
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the shim
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShimConfig {
    /// Gates all transformation; a disabled shim cannot be constructed
    #[serde(default)]
    pub enabled: bool,

    /// Cluster identity component
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Managed-schema cluster ARN, derived from region/account/name when absent
    #[serde(default)]
    pub cluster_arn: Option<String>,

    #[serde(default = "default_account_id")]
    pub account_id: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Value of `tags.environment`
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Regex classifying host mounts as Kafka data storage
    #[serde(default = "default_disk_mount_regex")]
    pub disk_mount_regex: String,

    /// Regex classifying host mounts as Kafka application-log storage
    #[serde(default = "default_log_mount_regex")]
    pub log_mount_regex: String,

    /// Attach Admin-API consumer lag to topic and cluster records
    #[serde(default)]
    pub consumer_lag_enrichment: bool,

    /// Records per publisher call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cycle length used by the replay runner
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Evict entities not seen for this many cycles; 0 keeps them forever
    #[serde(default)]
    pub entity_ttl_cycles: u64,

    /// Per-metric rule overrides for the cluster rollup (metric name → rule)
    #[serde(default)]
    pub aggregation_overrides: BTreeMap<String, AggregationRule>,

    /// Enhanced (synthetic) mode settings
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cluster_name: default_cluster_name(),
            cluster_arn: None,
            account_id: default_account_id(),
            region: default_region(),
            environment: default_environment(),
            disk_mount_regex: default_disk_mount_regex(),
            log_mount_regex: default_log_mount_regex(),
            consumer_lag_enrichment: false,
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            entity_ttl_cycles: 0,
            aggregation_overrides: BTreeMap::new(),
            fallback: FallbackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ShimConfig {
    /// Enabled configuration for one cluster with every other value defaulted
    pub fn for_cluster(cluster_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new().merge(Toml::file(path)).merge(
            Env::prefixed(ENV_PREFIX)
                .split("__")
                .ignore(&["config", "log_level", "debug"]),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. `enabled` is not checked here so a disabled
    /// file can still be validated offline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::missing_field("cluster_name"));
        }

        if self.account_id.trim().is_empty() {
            return Err(ConfigError::missing_field("account_id"));
        }
        // '|' separates GUID segments
        if self.account_id.contains('|') {
            return Err(ConfigError::invalid_value(
                "account_id",
                "must not contain '|'",
            ));
        }

        if self.region.trim().is_empty() {
            return Err(ConfigError::missing_field("region"));
        }

        self.storage_patterns()?;

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid_value(
                "batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }

        if self.flush_interval < MIN_FLUSH_INTERVAL {
            return Err(ConfigError::invalid_value(
                "flush_interval",
                format!("must be at least {}ms", MIN_FLUSH_INTERVAL.as_millis()),
            ));
        }

        for (name, rule) in &self.aggregation_overrides {
            let metric = ClusterMetric::from_name(name).ok_or_else(|| {
                ConfigError::invalid_value(
                    format!("aggregation_overrides.{}", name),
                    "unknown cluster metric",
                )
            })?;
            if metric.is_health() && *rule != AggregationRule::Max {
                return Err(ConfigError::invalid_value(
                    format!("aggregation_overrides.{}", name),
                    format!("health metrics aggregate by max, not {}", rule),
                ));
            }
        }

        self.fallback.validate()?;
        Ok(())
    }

    /// Compile the mount classification patterns
    pub fn storage_patterns(&self) -> Result<StoragePatterns, ConfigError> {
        let data = Regex::new(&self.disk_mount_regex)
            .map_err(|e| ConfigError::invalid_value("disk_mount_regex", e.to_string()))?;
        let log = Regex::new(&self.log_mount_regex)
            .map_err(|e| ConfigError::invalid_value("log_mount_regex", e.to_string()))?;
        Ok(StoragePatterns { data, log })
    }

    /// Configured ARN or the deterministic one for this cluster
    pub fn effective_cluster_arn(&self) -> String {
        self.cluster_arn
            .clone()
            .filter(|arn| !arn.trim().is_empty())
            .unwrap_or_else(|| generate_cluster_arn(&self.region, &self.account_id, &self.cluster_name))
    }

    /// Effective rule for a cluster metric after overrides
    pub fn aggregation_rule(&self, metric: ClusterMetric) -> AggregationRule {
        self.aggregation_overrides
            .get(metric.name())
            .copied()
            .unwrap_or_else(|| metric.default_rule())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// `arn:aws:kafka:{region}:{account}:cluster/{name}/{uuid}` with a UUID derived
/// from the cluster name.
pub fn generate_cluster_arn(region: &str, account_id: &str, cluster_name: &str) -> String {
    let uuid = Uuid::from_u128(xxh3_128(cluster_name.as_bytes()));
    format!(
        "arn:aws:kafka:{}:{}:cluster/{}/{}",
        region, account_id, cluster_name, uuid
    )
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.into()
}

fn default_account_id() -> String {
    DEFAULT_ACCOUNT_ID.into()
}

fn default_region() -> String {
    DEFAULT_REGION.into()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.into()
}

fn default_disk_mount_regex() -> String {
    DEFAULT_DISK_MOUNT_REGEX.into()
}

fn default_log_mount_regex() -> String {
    DEFAULT_LOG_MOUNT_REGEX.into()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_true() -> bool {
    true
}

/// Compiled mount classification patterns
#[derive(Debug, Clone)]
pub struct StoragePatterns {
    pub data: Regex,
    pub log: Regex,
}

// ----------------------------------------------------------------------------
// 5.2 Fallback (Enhanced Mode) Configuration
// ----------------------------------------------------------------------------

/// Enhanced-mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    /// Emit synthetic data regardless of the empty-cycle count
    #[serde(default)]
    pub forced: bool,

    #[serde(default = "default_empty_cycle_threshold")]
    pub empty_cycle_threshold: u32,

    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,

    /// Fixed seed for reproducible synthetic series
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            forced: false,
            empty_cycle_threshold: default_empty_cycle_threshold(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            seed: None,
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.empty_cycle_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "fallback.empty_cycle_threshold",
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_min) || !(0.0..1.0).contains(&self.jitter_max) {
            return Err(ConfigError::invalid_value(
                "fallback.jitter",
                "jitter bounds must be within [0, 1)",
            ));
        }
        if self.jitter_min > self.jitter_max {
            return Err(ConfigError::invalid_value(
                "fallback.jitter_min",
                "must not exceed jitter_max",
            ));
        }
        Ok(())
    }
}

fn default_empty_cycle_threshold() -> u32 {
    DEFAULT_EMPTY_CYCLE_THRESHOLD
}

fn default_jitter_min() -> f64 {
    DEFAULT_JITTER_MIN
}

fn default_jitter_max() -> f64 {
    DEFAULT_JITTER_MAX
}

// ----------------------------------------------------------------------------
// 5.3 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
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
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`:
// - env-filter driven levels (RUST_LOG overrides the configured level)
// - pretty, compact and JSON output
// - per-subsystem targets (msk_shim::transform, ::aggregate, ::fallback, ...)
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ShimResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    // stdout is reserved for records in dry-run mode
    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ShimError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ShimError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ShimError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "msk_shim::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Logging Macros for Shim Components
// ----------------------------------------------------------------------------

/// Log a per-entity transform event
#[macro_export]
macro_rules! log_entity {
    ($entity_type:expr, $name:expr, $event:expr) => {
        tracing::debug!(
            target: "msk_shim::transform",
            entity_type = %$entity_type,
            entity = %$name,
            event = $event,
            "Entity event"
        )
    };
    ($entity_type:expr, $name:expr, $event:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "msk_shim::transform",
            entity_type = %$entity_type,
            entity = %$name,
            event = $event,
            $($field)*,
            "Entity event"
        )
    };
}

/// Log a field that was present but unusable
#[macro_export]
macro_rules! log_malformed {
    ($entity:expr, $key:expr, $value:expr) => {
        tracing::warn!(
            target: "msk_shim::transform",
            entity = %$entity,
            key = $key,
            value = ?$value,
            "Malformed raw value, field left unset"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// A simple timer for measuring operation duration
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "msk_shim::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "msk_shim::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: CONCURRENCY PRIMITIVES & SHARDED STORAGE
// ============================================================================
// Transforms for different brokers and topics may arrive concurrently within
// a cycle. Shared state is split so unrelated entities never contend:
// - sharded map, one RwLock per shard
// - cache-padded counters for statistics
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Atomic Counter - High-Performance Counter
// ----------------------------------------------------------------------------

/// A cache-padded atomic counter.
#[derive(Debug)]
pub struct AtomicCounter {
    value: CachePadded<AtomicU64>,
}

impl AtomicCounter {
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Increment by 1, returning the previous value.
    #[inline]
    pub fn inc(&self) -> u64 {
        self.value.fetch_add(1, AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(AtomicOrdering::Relaxed)
    }

    /// Reset to 0 and return previous value.
    #[inline]
    pub fn reset(&self) -> u64 {
        self.value.swap(0, AtomicOrdering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Sharded Map - Reduced Contention Through Sharding
// ----------------------------------------------------------------------------

/// A sharded concurrent hash map that distributes entries across multiple shards
/// to reduce lock contention. Each shard is protected by its own RwLock.
pub struct ShardedMap<K, V, const SHARDS: usize = ENTITY_CACHE_SHARDS> {
    shards: Box<[RwLock<AHashMap<K, V>>]>,
    len: AtomicUsize,
}

impl<K, V, const SHARDS: usize> ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        let shards = (0..SHARDS.max(1))
            .map(|_| RwLock::new(AHashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            len: AtomicUsize::new(0),
        }
    }

    /// Get the shard index for a key.
    #[inline]
    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let shard = self.shards[self.shard_index(key)].read();
        shard.get(key).cloned()
    }

    /// Return the existing value, or insert the one built by `make`.
    /// `make` runs at most once and only under the shard's write lock.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let idx = self.shard_index(&key);
        if let Some(existing) = self.shards[idx].read().get(&key) {
            return existing.clone();
        }

        let mut shard = self.shards[idx].write();
        match shard.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.get().clone(),
            std::collections::hash_map::Entry::Vacant(e) => {
                self.len.fetch_add(1, AtomicOrdering::Relaxed);
                e.insert(make()).clone()
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut shard = self.shards[self.shard_index(key)].write();
        let removed = shard.remove(key);
        if removed.is_some() {
            self.len.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        removed
    }

    /// Keep only entries for which `keep` returns true; returns the removed entries.
    pub fn retain<F>(&self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let doomed: Vec<K> = shard
                .iter()
                .filter(|(k, v)| !keep(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(value) = shard.remove(&key) {
                    removed.push((key, value));
                }
            }
        }
        self.len.fetch_sub(removed.len(), AtomicOrdering::Relaxed);
        removed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out all values (collects from all shards).
    pub fn values(&self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            values.extend(shard.read().values().cloned());
        }
        values
    }
}

impl<K, V, const SHARDS: usize> Default for ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const SHARDS: usize> Debug for ShardedMap<K, V, SHARDS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("len", &self.len.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

// ============================================================================
// SECTION 8: IDENTITY RESOLVER
// ============================================================================
// GUID format of the managed-streaming schema:
//
//     {accountId}|INFRA|{ENTITY_TYPE}|base64({cluster}:{account}[:{localId}])
//
// Components are escaped before joining ('\' → '\\', ':' → '\:') so that
// distinct identity tuples never produce the same identifier.
// ============================================================================

/// A deterministic, stable entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityGuid(String);

impl EntityGuid {
    /// Resolve the GUID for an identity tuple. Pure: no clock, no randomness.
    pub fn resolve(
        entity_type: EntityType,
        account_id: &str,
        cluster_name: &str,
        local_id: Option<&str>,
    ) -> Self {
        let mut identifier = String::with_capacity(
            cluster_name.len() + account_id.len() + local_id.map_or(0, str::len) + 2,
        );
        identifier.push_str(&escape_component(cluster_name));
        identifier.push(':');
        identifier.push_str(&escape_component(account_id));
        if let Some(local) = local_id {
            identifier.push(':');
            identifier.push_str(&escape_component(local));
        }

        Self(format!(
            "{}|INFRA|{}|{}",
            account_id,
            entity_type.as_str(),
            BASE64.encode(identifier.as_bytes())
        ))
    }

    pub fn cluster(account_id: &str, cluster_name: &str) -> Self {
        Self::resolve(EntityType::Cluster, account_id, cluster_name, None)
    }

    pub fn broker(account_id: &str, cluster_name: &str, broker_id: i32) -> Self {
        let id = broker_id.to_string();
        Self::resolve(EntityType::Broker, account_id, cluster_name, Some(&id))
    }

    pub fn topic(account_id: &str, cluster_name: &str, topic: &str) -> Self {
        Self::resolve(EntityType::Topic, account_id, cluster_name, Some(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Account segment of the GUID
    pub fn account_id(&self) -> &str {
        self.0.split('|').next().unwrap_or_default()
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        self.0.split('|').nth(2).and_then(|s| s.parse().ok())
    }

    /// Decoded (still escaped) identifier segment
    pub fn identifier(&self) -> Option<String> {
        let encoded = self.0.rsplit('|').next()?;
        let bytes = BASE64.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl Display for EntityGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityGuid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn escape_component(component: &str) -> Cow<'_, str> {
    if !component.contains(['\\', ':']) {
        return Cow::Borrowed(component);
    }
    let mut escaped = String::with_capacity(component.len() + 4);
    for ch in component.chars() {
        if ch == '\\' || ch == ':' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    Cow::Owned(escaped)
}

// ============================================================================
// SECTION 9: ENTITY MODEL & ENTITY CACHE
// ============================================================================
// One live entity per (type, GUID) for the lifetime of the shim. Repeated
// cycles update the same entity instead of creating duplicates.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Entity - A Live Cluster, Broker or Topic
// ----------------------------------------------------------------------------

/// A live entity. Identity attributes survive across cycles; metrics are
/// cleared when the first transform of a new cycle touches the entity.
#[derive(Debug, Clone)]
pub struct Entity {
    pub guid: EntityGuid,
    pub entity_type: EntityType,
    pub name: CompactString,
    attributes: BTreeMap<CompactString, MetricValue>,
    metrics: BTreeMap<CompactString, MetricValue>,
    pub data_source: DataSource,
    pub created_at: Timestamp,
    pub last_seen_at: Timestamp,
    current_cycle: Option<u64>,
}

impl Entity {
    pub fn new(entity_type: EntityType, guid: EntityGuid, name: impl Into<CompactString>) -> Self {
        let now = Timestamp::now();
        Self {
            guid,
            entity_type,
            name: name.into(),
            attributes: BTreeMap::new(),
            metrics: BTreeMap::new(),
            data_source: DataSource::Real,
            created_at: now,
            last_seen_at: now,
            current_cycle: None,
        }
    }

    /// Start `cycle` for this entity. Returns true when the entity had not been
    /// touched in this cycle yet (metrics were cleared).
    pub fn begin_cycle(&mut self, cycle: u64) -> bool {
        if self.current_cycle == Some(cycle) {
            return false;
        }
        self.clear_metrics();
        self.current_cycle = Some(cycle);
        true
    }

    /// Drop all metric values and mark the entity real again
    pub fn clear_metrics(&mut self) {
        self.metrics.clear();
        self.data_source = DataSource::Real;
    }

    /// Cycle in which the entity was last transformed
    pub fn last_seen_cycle(&self) -> Option<u64> {
        self.current_cycle
    }

    pub fn touch(&mut self) {
        self.last_seen_at = Timestamp::now();
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.attributes.insert(CompactString::from(key), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&MetricValue> {
        self.attributes.get(key)
    }

    pub fn set_metric(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.metrics.insert(CompactString::from(key), value.into());
    }

    /// Add to a numeric metric, creating it when unset.
    pub fn add_metric(&mut self, key: &str, value: MetricValue) {
        let merged = match self.metrics.get(key) {
            Some(MetricValue::Int(a)) if matches!(value, MetricValue::Int(_)) => {
                MetricValue::Int(a.saturating_add(value.as_i64().unwrap_or(0)))
            }
            Some(existing) => match (existing.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) => MetricValue::Float(a + b),
                _ => value,
            },
            None => value,
        };
        self.metrics.insert(CompactString::from(key), merged);
    }

    /// Keep the larger of the current and new value.
    pub fn max_metric(&mut self, key: &str, value: MetricValue) {
        let keep = match (self.metrics.get(key).and_then(MetricValue::as_f64), value.as_f64()) {
            (Some(current), Some(new)) => current >= new,
            _ => false,
        };
        if !keep {
            self.metrics.insert(CompactString::from(key), value);
        }
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(MetricValue::as_f64)
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Snapshot for publishing
    pub fn to_record(&self) -> EntityRecord {
        let mut fields = BTreeMap::new();
        for (k, v) in self.attributes.iter().chain(self.metrics.iter()) {
            fields.insert(k.to_string(), v.clone());
        }
        EntityRecord {
            guid: self.guid.clone(),
            entity_type: self.entity_type,
            entity_name: self.name.to_string(),
            event_type: self.entity_type.event_type().to_string(),
            data_source: self.data_source,
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            fields,
        }
    }
}

/// Shared, lockable entity
pub type EntityHandle = Arc<Mutex<Entity>>;

// ----------------------------------------------------------------------------
// 9.2 Entity Record - Published Snapshot
// ----------------------------------------------------------------------------

/// Immutable snapshot of an entity as handed to the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub guid: EntityGuid,
    pub entity_type: EntityType,
    pub entity_name: String,
    pub event_type: String,
    pub data_source: DataSource,
    pub created_at: Timestamp,
    pub last_seen_at: Timestamp,
    #[serde(flatten)]
    pub fields: BTreeMap<String, MetricValue>,
}

impl EntityRecord {
    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.fields.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(MetricValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(MetricValue::as_i64)
    }

    pub fn is_synthetic(&self) -> bool {
        self.data_source == DataSource::Synthetic
    }

    /// Numeric broker id; `None` for clusters and topics
    pub fn broker_id(&self) -> Option<i64> {
        self.get_i64("provider.brokerId")
    }
}

// ----------------------------------------------------------------------------
// 9.3 Entity Cache
// ----------------------------------------------------------------------------

/// Cache key: entity type plus GUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub guid: EntityGuid,
}

/// Process-lifetime store of live entities. Nothing is removed implicitly;
/// `evict_stale` is the only removal path and runs at the flush boundary.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: ShardedMap<EntityKey, EntityHandle>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing handle for (type, guid), or a freshly registered one.
    pub fn get_or_create(&self, entity_type: EntityType, guid: &EntityGuid, name: &str) -> EntityHandle {
        let key = EntityKey {
            entity_type,
            guid: guid.clone(),
        };
        self.entries.get_or_insert_with(key, || {
            log_entity!(entity_type, name, "created", guid = %guid);
            Arc::new(Mutex::new(Entity::new(entity_type, guid.clone(), name)))
        })
    }

    pub fn get(&self, entity_type: EntityType, guid: &EntityGuid) -> Option<EntityHandle> {
        self.entries.get(&EntityKey {
            entity_type,
            guid: guid.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> Vec<EntityHandle> {
        self.entries.values()
    }

    /// Handles of one entity type
    pub fn handles_of(&self, entity_type: EntityType) -> Vec<EntityHandle> {
        self.entries
            .values()
            .into_iter()
            .filter(|h| h.lock().entity_type == entity_type)
            .collect()
    }

    /// Snapshot of every cached entity: cluster first, then brokers, then topics.
    pub fn records(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .entries
            .values()
            .iter()
            .map(|h| h.lock().to_record())
            .collect();
        records.sort_by(|a, b| {
            a.entity_type
                .cmp(&b.entity_type)
                .then_with(|| a.broker_id().cmp(&b.broker_id()))
                .then_with(|| a.entity_name.cmp(&b.entity_name))
        });
        records
    }

    /// Remove brokers and topics not seen for `ttl_cycles` cycles as of
    /// `current_cycle`. The cluster entity is never evicted.
    pub fn evict_stale(&self, current_cycle: u64, ttl_cycles: u64) -> Vec<EntityGuid> {
        if ttl_cycles == 0 {
            return Vec::new();
        }
        self.entries
            .retain(|key, handle| {
                if key.entity_type == EntityType::Cluster {
                    return true;
                }
                match handle.lock().last_seen_cycle() {
                    Some(seen) => seen.saturating_add(ttl_cycles) > current_cycle,
                    None => true,
                }
            })
            .into_iter()
            .map(|(key, _)| key.guid)
            .collect()
    }
}

// ============================================================================
// SECTION 10: METRIC TRANSFORMER
// ============================================================================
// Maps one broker's or one topic's raw sample map onto managed-schema fields.
// Each canonical field lists the raw keys it may come from (first present
// wins), a unit conversion and an optional documented default. A missing
// field without a default stays unset, which is distinguishable from zero.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Field Mapping Tables
// ----------------------------------------------------------------------------

/// Unit conversion applied to a raw value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    None,
    /// Idle ratios in [0, 1] become percentages; values above 1 pass through
    FractionToPercent,
    BytesToMegabytes,
}

impl Conversion {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            Conversion::None => value,
            Conversion::FractionToPercent if value <= 1.0 => value * 100.0,
            Conversion::FractionToPercent => value,
            Conversion::BytesToMegabytes => value / (1024.0 * 1024.0),
        }
    }
}

/// Output representation of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Gauge,
    Integer,
}

/// How repeated contributions within one cycle combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Replace,
    Sum,
    /// Topic-wide counts every broker reports in full
    Max,
}

/// One canonical field and where it comes from.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub target: &'static str,
    pub sources: &'static [&'static str],
    pub kind: FieldKind,
    pub conversion: Conversion,
    pub default: Option<f64>,
    pub merge: Merge,
}

impl FieldMapping {
    pub const fn gauge(target: &'static str, sources: &'static [&'static str]) -> Self {
        Self {
            target,
            sources,
            kind: FieldKind::Gauge,
            conversion: Conversion::None,
            default: None,
            merge: Merge::Replace,
        }
    }

    pub const fn integer(target: &'static str, sources: &'static [&'static str]) -> Self {
        Self {
            target,
            sources,
            kind: FieldKind::Integer,
            conversion: Conversion::None,
            default: None,
            merge: Merge::Replace,
        }
    }

    pub const fn or_default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn converted(mut self, conversion: Conversion) -> Self {
        self.conversion = conversion;
        self
    }

    pub const fn summed(mut self) -> Self {
        self.merge = Merge::Sum;
        self
    }

    pub const fn maxed(mut self) -> Self {
        self.merge = Merge::Max;
        self
    }

    fn to_value(&self, value: f64) -> MetricValue {
        match self.kind {
            FieldKind::Gauge => MetricValue::Float(value),
            FieldKind::Integer => MetricValue::Int(value.round() as i64),
        }
    }
}

// Broker fields whose values feed the cluster rollup
pub const BROKER_BYTES_IN: &str = "provider.bytesInPerSec.Average";
pub const BROKER_BYTES_OUT: &str = "provider.bytesOutPerSec.Average";
pub const BROKER_MESSAGES_IN: &str = "provider.messagesInPerSec.Average";
pub const BROKER_PARTITION_COUNT: &str = "provider.partitionCount";
pub const BROKER_UNDER_REPLICATED: &str = "provider.underReplicatedPartitions.Maximum";
pub const BROKER_ACTIVE_CONTROLLER: &str = "provider.activeControllerCount.Sum";
pub const BROKER_OFFLINE_PARTITIONS: &str = "provider.offlinePartitionsCount.Sum";
pub const BROKER_UNDER_MIN_ISR: &str = "provider.underMinIsrPartitionCount.Maximum";

// Host resource fields, set from raw samples or by the system correlator
pub const HOST_CPU_USER: &str = "provider.cpuUser.Average";
pub const HOST_CPU_SYSTEM: &str = "provider.cpuSystem.Average";
pub const HOST_CPU_IDLE: &str = "provider.cpuIdle.Average";
pub const HOST_MEMORY_USED: &str = "provider.memoryUsed.Average";
pub const HOST_MEMORY_FREE: &str = "provider.memoryFree.Average";
pub const HOST_DATA_DISK_USED: &str = "provider.kafkaDataLogsDiskUsed.Average";
pub const HOST_LOG_DISK_USED: &str = "provider.kafkaAppLogsDiskUsed.Average";
pub const HOST_ROOT_DISK_USED: &str = "provider.rootDiskUsed.Average";

pub const TOPIC_MESSAGES_IN: &str = "provider.messagesInPerSec.Sum";

pub static BROKER_FIELDS: &[FieldMapping] = &[
    // Throughput
    FieldMapping::gauge(BROKER_BYTES_IN, &["broker.bytesInPerSecond", "bytesInPerSecond"]),
    FieldMapping::gauge(BROKER_BYTES_OUT, &["broker.bytesOutPerSecond", "bytesOutPerSecond"]),
    FieldMapping::gauge(BROKER_MESSAGES_IN, &["broker.messagesInPerSecond", "messagesInPerSecond"]),
    FieldMapping::gauge("provider.bytesRejectedPerSec.Average", &["broker.bytesRejectedPerSecond"])
        .or_default(0.0),
    FieldMapping::gauge(
        "provider.fetchConsumerRequestsPerSec.Average",
        &["request.fetchConsumerRequestsPerSecond", "broker.totalFetchRequestsPerSecond"],
    ),
    FieldMapping::gauge(
        "provider.produceRequestsPerSec.Average",
        &["request.produceRequestsPerSecond", "broker.totalProduceRequestsPerSecond"],
    ),
    FieldMapping::gauge(
        "provider.produceMessageConversionsPerSec.Average",
        &["broker.produceMessageConversionsPerSecond"],
    )
    .or_default(0.0),
    FieldMapping::gauge(
        "provider.fetchMessageConversionsPerSec.Average",
        &["broker.fetchMessageConversionsPerSecond"],
    )
    .or_default(0.0),
    // Request latency
    FieldMapping::gauge(
        "provider.fetchConsumerLocalTimeMsMean.Average",
        &["request.fetchConsumerLocalTimeMs", "broker.fetchConsumerLocalTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.fetchConsumerRequestQueueTimeMsMean.Average",
        &["request.fetchConsumerRequestQueueTimeMs", "broker.fetchConsumerRequestQueueTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.fetchConsumerResponseSendTimeMsMean.Average",
        &["request.fetchConsumerResponseSendTimeMs", "broker.fetchConsumerResponseSendTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.fetchConsumerTotalTimeMsMean.Average",
        &["request.avgTimeFetch", "broker.fetchConsumerTotalTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.produceLocalTimeMsMean.Average",
        &["request.produceLocalTimeMs", "broker.produceLocalTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.produceRequestQueueTimeMsMean.Average",
        &["request.produceRequestQueueTimeMs", "broker.produceRequestQueueTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.produceResponseSendTimeMsMean.Average",
        &["request.produceResponseSendTimeMs", "broker.produceResponseSendTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.produceTotalTimeMsMean.Average",
        &["request.avgTimeProduceRequest", "broker.produceTotalTimeMs"],
    ),
    // Partitions & replication
    FieldMapping::integer(BROKER_PARTITION_COUNT, &["broker.partitionCount", "partitionCount"]),
    FieldMapping::integer("provider.leaderCount", &["broker.leaderCount", "leaderCount"]),
    FieldMapping::integer(
        BROKER_UNDER_REPLICATED,
        &["broker.underReplicatedPartitions", "replication.unreplicatedPartitions"],
    ),
    FieldMapping::gauge(
        "provider.isrShrinksPerSec.Average",
        &["replication.isrShrinksPerSecond", "broker.isrShrinksPerSecond"],
    ),
    FieldMapping::gauge(
        "provider.isrExpandsPerSec.Average",
        &["replication.isrExpandsPerSecond", "broker.isrExpandsPerSecond"],
    ),
    FieldMapping::gauge(
        "provider.leaderElectionRateAndTimeMsMean.Average",
        &["replication.leaderElectionPerSecond", "broker.leaderElectionRateAndTimeMs"],
    ),
    FieldMapping::gauge(
        "provider.uncleanLeaderElectionsPerSec.Average",
        &["replication.uncleanLeaderElectionPerSecond", "broker.uncleanLeaderElectionsPerSecond"],
    ),
    // Controller view
    FieldMapping::integer(
        BROKER_ACTIVE_CONTROLLER,
        &["broker.ActiveControllerCount", "broker.activeControllerCount", "broker.isController"],
    ),
    FieldMapping::integer(
        BROKER_OFFLINE_PARTITIONS,
        &["cluster.offlinePartitionsCount", "broker.offlinePartitionsCount"],
    ),
    FieldMapping::integer(
        BROKER_UNDER_MIN_ISR,
        &["cluster.underMinIsrPartitionCount", "broker.underMinIsrPartitionCount"],
    ),
    // Thread pools
    FieldMapping::gauge(
        "provider.requestHandlerAvgIdlePercent.Average",
        &["broker.requestHandlerAvgIdlePercent"],
    )
    .converted(Conversion::FractionToPercent),
    FieldMapping::gauge(
        "provider.networkProcessorAvgIdlePercent.Average",
        &["broker.networkProcessorAvgIdlePercent"],
    )
    .converted(Conversion::FractionToPercent),
    // Throttling
    FieldMapping::gauge("provider.produceThrottleTime.Average", &["broker.produceThrottleTime"]),
    FieldMapping::gauge("provider.fetchThrottleTime.Average", &["broker.fetchThrottleTime"]),
    FieldMapping::gauge("provider.requestThrottleTime.Average", &["broker.requestThrottleTime"]),
    // Host resources reported alongside JMX
    FieldMapping::gauge(HOST_CPU_USER, &["broker.cpuUser", "cpuUserPercent"]),
    FieldMapping::gauge(HOST_CPU_SYSTEM, &["broker.cpuSystem", "cpuSystemPercent"]),
    FieldMapping::gauge(HOST_CPU_IDLE, &["broker.cpuIdle", "cpuIdlePercent"]),
    FieldMapping::gauge(HOST_MEMORY_USED, &["broker.memoryUsed", "memoryUsedPercent"]),
    FieldMapping::gauge(HOST_MEMORY_FREE, &["broker.memoryFree", "memoryFreePercent"]),
    FieldMapping::gauge(HOST_DATA_DISK_USED, &["broker.kafkaDataLogsDiskUsed"]),
    FieldMapping::gauge(HOST_LOG_DISK_USED, &["broker.kafkaAppLogsDiskUsed"]),
    FieldMapping::gauge(HOST_ROOT_DISK_USED, &["broker.rootDiskUsed"]),
    // Network
    FieldMapping::gauge("provider.networkRxPackets.Average", &["broker.networkRx", "network.rxPackets"]),
    FieldMapping::gauge("provider.networkTxPackets.Average", &["broker.networkTx", "network.txPackets"]),
    FieldMapping::gauge("provider.networkRxDropped.Sum", &["network.rxDropped"]).or_default(0.0),
    FieldMapping::gauge("provider.networkTxDropped.Sum", &["network.txDropped"]).or_default(0.0),
];

pub static TOPIC_FIELDS: &[FieldMapping] = &[
    FieldMapping::gauge("provider.bytesInPerSec.Sum", &["topic.bytesInPerSecond", "bytesInPerSecond"]).summed(),
    FieldMapping::gauge("provider.bytesOutPerSec.Sum", &["topic.bytesOutPerSecond", "bytesOutPerSecond"]).summed(),
    FieldMapping::gauge(TOPIC_MESSAGES_IN, &["topic.messagesInPerSecond", "messagesInPerSecond"]).summed(),
    FieldMapping::gauge("provider.bytesRejectedPerSec.Sum", &["topic.bytesRejectedPerSecond"])
        .or_default(0.0)
        .summed(),
    FieldMapping::gauge("provider.fetchRequestsPerSec.Sum", &["topic.fetchRequestsPerSecond"]).summed(),
    FieldMapping::gauge("provider.produceRequestsPerSec.Sum", &["topic.produceRequestsPerSecond"]).summed(),
    FieldMapping::integer(
        "provider.underReplicatedPartitions.Sum",
        &["topic.underReplicatedPartitions"],
    )
    .maxed(),
    FieldMapping::gauge("provider.sizeInBytes.Sum", &["topic.sizeInBytes", "topic.diskSize"]).summed(),
    FieldMapping::gauge("provider.sizeInMB.Sum", &["topic.sizeInBytes", "topic.diskSize"])
        .converted(Conversion::BytesToMegabytes)
        .summed(),
    FieldMapping::integer("provider.partitionCount", &["topic.partitionCount", "partitionCount"]),
    FieldMapping::integer("provider.replicationFactor", &["topic.replicationFactor", "replicationFactor"]),
    FieldMapping::integer("provider.minInSyncReplicas", &["topic.minInSyncReplicas", "minInSyncReplicas"]),
];

/// Raw keys that may carry a broker's hostname
pub const HOSTNAME_KEYS: &[&str] = &["broker.host", "host", "hostname", "broker.hostname"];

// ----------------------------------------------------------------------------
// 10.2 Field Extraction
// ----------------------------------------------------------------------------

/// Outcome of reading one canonical field from a raw sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRead {
    Value(f64),
    Defaulted(f64),
    Missing,
    Malformed,
}

impl FieldMapping {
    /// Read the first present source key, converting units. Values that are
    /// non-numeric, non-finite or negative are malformed.
    pub fn read(&self, raw: &RawSample, entity: &str) -> FieldRead {
        let mut malformed = false;
        for key in self.sources {
            let Some(value) = raw.get(key) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match value.as_f64() {
                Some(v) if v >= 0.0 => return FieldRead::Value(self.conversion.apply(v)),
                _ => {
                    log_malformed!(entity, *key, value);
                    malformed = true;
                }
            }
        }
        if malformed {
            return FieldRead::Malformed;
        }
        match self.default {
            Some(default) => FieldRead::Defaulted(default),
            None => FieldRead::Missing,
        }
    }
}

// ----------------------------------------------------------------------------
// 10.3 Contributions - What the Aggregator Receives
// ----------------------------------------------------------------------------

/// Transformed values of one broker or topic for the cluster rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub entity_type: EntityType,
    pub local_id: CompactString,
    pub values: BTreeMap<&'static str, f64>,
    pub synthetic: bool,
}

impl Contribution {
    pub fn new(entity_type: EntityType, local_id: impl Into<CompactString>) -> Self {
        Self {
            entity_type,
            local_id: local_id.into(),
            values: BTreeMap::new(),
            synthetic: false,
        }
    }

    pub fn with_value(mut self, field: &'static str, value: f64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }
}

// ----------------------------------------------------------------------------
// 10.4 Transformer
// ----------------------------------------------------------------------------

/// Stateless mapper from raw samples to entity fields.
#[derive(Debug, Clone)]
pub struct Transformer {
    account_id: String,
    cluster_name: String,
    region: String,
    environment: String,
    cluster_arn: String,
}

impl Transformer {
    pub fn new(config: &ShimConfig) -> Self {
        Self {
            account_id: config.account_id.clone(),
            cluster_name: config.cluster_name.clone(),
            region: config.region.clone(),
            environment: config.environment.clone(),
            cluster_arn: config.effective_cluster_arn(),
        }
    }

    /// Entity name in the managed-schema form `{account}:{region}:{cluster}[:suffix]`
    pub fn entity_name(&self, entity_type: EntityType, local_id: &str) -> String {
        match entity_type {
            EntityType::Cluster => format!("{}:{}:{}", self.account_id, self.region, self.cluster_name),
            EntityType::Broker => format!(
                "{}:{}:{}:broker-{}",
                self.account_id, self.region, self.cluster_name, local_id
            ),
            EntityType::Topic => format!(
                "{}:{}:{}:topic-{}",
                self.account_id, self.region, self.cluster_name, local_id
            ),
        }
    }

    /// Identity and tag attributes shared by every record
    pub fn apply_identity(&self, entity: &mut Entity) {
        entity.set_attribute("provider.clusterName", self.cluster_name.as_str());
        entity.set_attribute("provider.accountId", self.account_id.as_str());
        entity.set_attribute("provider.awsRegion", self.region.as_str());
        entity.set_attribute("tags.accountId", self.account_id.as_str());
        entity.set_attribute("tags.provider", PROVIDER_TAG);
        entity.set_attribute("tags.messageQueueType", MESSAGE_QUEUE_TYPE);
        entity.set_attribute("tags.environment", self.environment.as_str());
        if entity.entity_type == EntityType::Cluster {
            entity.set_attribute("provider.clusterArn", self.cluster_arn.as_str());
        }
    }

    /// Apply a broker's raw sample to its entity and return its rollup contribution.
    pub fn transform_broker(&self, entity: &mut Entity, broker_id: i32, raw: &RawSample) -> Contribution {
        self.apply_identity(entity);
        entity.set_attribute("provider.brokerId", broker_id as i64);

        // Defaults fill gaps in a partial sample; an empty map stays unset
        let defaults = !raw.is_empty();
        let name = entity.name.clone();
        let mut applied = 0usize;
        for field in BROKER_FIELDS {
            match field.read(raw, &name) {
                FieldRead::Value(v) => {
                    entity.set_metric(field.target, field.to_value(v));
                    applied += 1;
                }
                FieldRead::Defaulted(v) if defaults => {
                    entity.set_metric(field.target, field.to_value(v));
                    applied += 1;
                }
                FieldRead::Defaulted(_) | FieldRead::Missing | FieldRead::Malformed => {}
            }
        }

        if let Some(host) = self.hostname(raw) {
            entity.set_attribute("provider.brokerHost", host);
        }

        self.check_broker_health(entity, broker_id);
        log_entity!(EntityType::Broker, name, "transformed", fields = applied);

        self.broker_contribution(entity, broker_id, false)
    }

    /// Contribution built from whatever the broker entity currently holds
    pub fn broker_contribution(&self, entity: &Entity, broker_id: i32, synthetic: bool) -> Contribution {
        let mut contribution = Contribution::new(EntityType::Broker, broker_id.to_string());
        contribution.synthetic = synthetic;
        for metric in ClusterMetric::ALL {
            if let MetricSource::Broker(field) = metric.source() {
                if let Some(v) = entity.metric_f64(field) {
                    contribution.values.insert(field, v);
                }
            }
        }
        contribution
    }

    /// Apply one broker's view of a topic. Rate fields from several brokers in
    /// the same cycle are summed, topic-wide counts take the maximum and
    /// descriptive fields take the latest value.
    pub fn transform_topic(&self, entity: &mut Entity, topic: &str, raw: &RawSample) -> Contribution {
        self.apply_identity(entity);
        entity.set_attribute("provider.topic", topic);
        entity.set_attribute("displayName", topic);

        let defaults = !raw.is_empty();
        let name = entity.name.clone();
        let mut applied = 0usize;
        for field in TOPIC_FIELDS {
            let value = match field.read(raw, &name) {
                FieldRead::Value(v) => v,
                FieldRead::Defaulted(v) if defaults => v,
                FieldRead::Defaulted(_) | FieldRead::Missing | FieldRead::Malformed => continue,
            };
            match field.merge {
                Merge::Sum => entity.add_metric(field.target, field.to_value(value)),
                Merge::Max => entity.max_metric(field.target, field.to_value(value)),
                Merge::Replace => entity.set_metric(field.target, field.to_value(value)),
            }
            applied += 1;
        }

        log_entity!(EntityType::Topic, name, "transformed", fields = applied);
        Contribution::new(EntityType::Topic, topic)
    }

    /// Hostname to correlate host resources with
    pub fn hostname<'a>(&self, raw: &'a RawSample) -> Option<&'a str> {
        raw.first_str(HOSTNAME_KEYS)
    }

    fn check_broker_health(&self, entity: &Entity, broker_id: i32) {
        if let Some(count) = entity.metric(BROKER_ACTIVE_CONTROLLER).and_then(MetricValue::as_i64) {
            if count != 0 && count != 1 {
                warn!(
                    target: "msk_shim::transform",
                    broker_id,
                    active_controller_count = count,
                    "Broker reports an active controller count other than 0 or 1"
                );
            }
        }
        if let Some(offline) = entity.metric(BROKER_OFFLINE_PARTITIONS).and_then(MetricValue::as_i64) {
            if offline > 0 {
                error!(
                    target: "msk_shim::transform",
                    broker_id,
                    offline_partitions = offline,
                    "Offline partitions detected"
                );
            }
        }
    }
}

// ============================================================================
// SECTION 11: CLUSTER AGGREGATOR
// ============================================================================
// Accumulates broker and topic contributions across a cycle and rolls them up
// into cluster metrics. The rule is chosen per metric:
//
//   health (under-replicated, controller, offline, under-min-ISR)  MAX
//   throughput (bytes in/out, messages in)                         SUM
//   globalPartitionCount                                           SUM of broker partition counts
//   globalTopicCount, brokerCount                                  COUNT of distinct entities
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Aggregation Rules
// ----------------------------------------------------------------------------

/// How values from several entities combine into one cluster value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationRule {
    Max,
    Sum,
    Count,
    Average,
}

impl AggregationRule {
    /// Apply this rule to a slice of values. No values means no result, except
    /// for COUNT which is zero.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return match self {
                AggregationRule::Count => Some(0.0),
                _ => None,
            };
        }

        let result = match self {
            AggregationRule::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggregationRule::Sum => values.iter().sum(),
            AggregationRule::Count => values.len() as f64,
            AggregationRule::Average => values.iter().sum::<f64>() / values.len() as f64,
        };
        Some(result)
    }

    /// Managed-schema statistic suffix
    pub fn suffix(&self) -> &'static str {
        match self {
            AggregationRule::Max => ".Maximum",
            AggregationRule::Sum => ".Sum",
            AggregationRule::Count => "",
            AggregationRule::Average => ".Average",
        }
    }
}

impl Display for AggregationRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AggregationRule::Max => write!(f, "max"),
            AggregationRule::Sum => write!(f, "sum"),
            AggregationRule::Count => write!(f, "count"),
            AggregationRule::Average => write!(f, "average"),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Cluster Metrics
// ----------------------------------------------------------------------------

/// Where a cluster metric's input values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSource {
    /// One value per broker that reported this field
    Broker(&'static str),
    /// One value per distinct topic
    DistinctTopics,
    /// One value per distinct broker
    DistinctBrokers,
}

/// Metrics on the cluster record, each with its own default rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterMetric {
    ActiveControllerCount,
    OfflinePartitionsCount,
    UnderReplicatedPartitions,
    UnderMinIsrPartitionCount,
    BytesInPerSec,
    BytesOutPerSec,
    MessagesInPerSec,
    GlobalPartitionCount,
    GlobalTopicCount,
    BrokerCount,
}

impl ClusterMetric {
    pub const ALL: [ClusterMetric; 10] = [
        ClusterMetric::ActiveControllerCount,
        ClusterMetric::OfflinePartitionsCount,
        ClusterMetric::UnderReplicatedPartitions,
        ClusterMetric::UnderMinIsrPartitionCount,
        ClusterMetric::BytesInPerSec,
        ClusterMetric::BytesOutPerSec,
        ClusterMetric::MessagesInPerSec,
        ClusterMetric::GlobalPartitionCount,
        ClusterMetric::GlobalTopicCount,
        ClusterMetric::BrokerCount,
    ];

    /// Metric name as used in `aggregation_overrides`
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMetric::ActiveControllerCount => "activeControllerCount",
            ClusterMetric::OfflinePartitionsCount => "offlinePartitionsCount",
            ClusterMetric::UnderReplicatedPartitions => "underReplicatedPartitions",
            ClusterMetric::UnderMinIsrPartitionCount => "underMinIsrPartitionCount",
            ClusterMetric::BytesInPerSec => "bytesInPerSec",
            ClusterMetric::BytesOutPerSec => "bytesOutPerSec",
            ClusterMetric::MessagesInPerSec => "messagesInPerSec",
            ClusterMetric::GlobalPartitionCount => "globalPartitionCount",
            ClusterMetric::GlobalTopicCount => "globalTopicCount",
            ClusterMetric::BrokerCount => "brokerCount",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ClusterMetric::ALL.into_iter().find(|m| m.name() == name)
    }

    /// A single unhealthy broker must dominate these
    pub fn is_health(&self) -> bool {
        matches!(
            self,
            ClusterMetric::ActiveControllerCount
                | ClusterMetric::OfflinePartitionsCount
                | ClusterMetric::UnderReplicatedPartitions
                | ClusterMetric::UnderMinIsrPartitionCount
        )
    }

    /// Counts of things are published without a statistic suffix
    fn is_count(&self) -> bool {
        matches!(
            self,
            ClusterMetric::GlobalPartitionCount | ClusterMetric::GlobalTopicCount | ClusterMetric::BrokerCount
        )
    }

    pub fn default_rule(&self) -> AggregationRule {
        match self {
            _ if self.is_health() => AggregationRule::Max,
            ClusterMetric::BytesInPerSec | ClusterMetric::BytesOutPerSec | ClusterMetric::MessagesInPerSec => {
                AggregationRule::Sum
            }
            ClusterMetric::GlobalPartitionCount => AggregationRule::Sum,
            _ => AggregationRule::Count,
        }
    }

    pub fn source(&self) -> MetricSource {
        match self {
            ClusterMetric::ActiveControllerCount => MetricSource::Broker(BROKER_ACTIVE_CONTROLLER),
            ClusterMetric::OfflinePartitionsCount => MetricSource::Broker(BROKER_OFFLINE_PARTITIONS),
            ClusterMetric::UnderReplicatedPartitions => MetricSource::Broker(BROKER_UNDER_REPLICATED),
            ClusterMetric::UnderMinIsrPartitionCount => MetricSource::Broker(BROKER_UNDER_MIN_ISR),
            ClusterMetric::BytesInPerSec => MetricSource::Broker(BROKER_BYTES_IN),
            ClusterMetric::BytesOutPerSec => MetricSource::Broker(BROKER_BYTES_OUT),
            ClusterMetric::MessagesInPerSec => MetricSource::Broker(BROKER_MESSAGES_IN),
            ClusterMetric::GlobalPartitionCount => MetricSource::Broker(BROKER_PARTITION_COUNT),
            ClusterMetric::GlobalTopicCount => MetricSource::DistinctTopics,
            ClusterMetric::BrokerCount => MetricSource::DistinctBrokers,
        }
    }

    /// Field name on the cluster record, e.g. `provider.bytesInPerSec.Sum`
    pub fn output_field(&self, rule: AggregationRule) -> String {
        if self.is_count() {
            format!("provider.{}", self.name())
        } else {
            format!("provider.{}{}", self.name(), rule.suffix())
        }
    }

    /// Integer-valued metrics are published as integers
    fn is_integral(&self) -> bool {
        !matches!(
            self,
            ClusterMetric::BytesInPerSec | ClusterMetric::BytesOutPerSec | ClusterMetric::MessagesInPerSec
        )
    }
}

/// One rolled-up cluster value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolledUp {
    pub rule: AggregationRule,
    pub value: f64,
}

/// Result of a cycle's rollup
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMetrics {
    pub values: BTreeMap<ClusterMetric, RolledUp>,
    pub broker_count: usize,
    pub topic_count: usize,
    /// At least one contribution this cycle was synthetic
    pub synthetic: bool,
    /// Brokers claiming to be the active controller
    pub controller_claims: usize,
}

impl ClusterMetrics {
    pub fn get(&self, metric: ClusterMetric) -> Option<f64> {
        self.values.get(&metric).map(|r| r.value)
    }

    /// Write the rolled-up values onto the cluster entity
    pub fn apply_to(&self, entity: &mut Entity) {
        for (metric, rolled) in &self.values {
            let field = metric.output_field(rolled.rule);
            if metric.is_integral() && rolled.rule != AggregationRule::Average {
                entity.set_metric(&field, rolled.value.round() as i64);
            } else {
                entity.set_metric(&field, rolled.value);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Aggregator
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AggregatorState {
    /// Latest contribution per broker id; a repeat within the cycle replaces
    brokers: BTreeMap<CompactString, Contribution>,
    /// Topic name → (contributions, any synthetic)
    topics: BTreeMap<CompactString, (u32, bool)>,
    accumulated: u64,
}

/// Per-cycle accumulation behind one coarse lock.
#[derive(Debug)]
pub struct Aggregator {
    state: Mutex<AggregatorState>,
    rules: BTreeMap<ClusterMetric, AggregationRule>,
}

impl Aggregator {
    pub fn new(config: &ShimConfig) -> Self {
        let rules = ClusterMetric::ALL
            .into_iter()
            .map(|m| (m, config.aggregation_rule(m)))
            .collect();
        Self {
            state: Mutex::new(AggregatorState::default()),
            rules,
        }
    }

    /// Aggregator with every metric on its default rule
    pub fn with_default_rules() -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            rules: ClusterMetric::ALL.into_iter().map(|m| (m, m.default_rule())).collect(),
        }
    }

    pub fn rule(&self, metric: ClusterMetric) -> AggregationRule {
        self.rules.get(&metric).copied().unwrap_or_else(|| metric.default_rule())
    }

    pub fn accumulate(&self, contribution: Contribution) {
        let mut state = self.state.lock();
        match contribution.entity_type {
            EntityType::Broker => {
                state.brokers.insert(contribution.local_id.clone(), contribution);
            }
            EntityType::Topic => {
                let entry = state
                    .topics
                    .entry(contribution.local_id.clone())
                    .or_insert((0, false));
                entry.0 += 1;
                entry.1 |= contribution.synthetic;
            }
            EntityType::Cluster => {
                warn!(
                    target: "msk_shim::aggregate",
                    "Ignoring cluster contribution; the cluster is derived state"
                );
                return;
            }
        }
        state.accumulated += 1;
    }

    /// Cluster rollup of everything accumulated since the last reset, or
    /// `None` when nothing was accumulated.
    pub fn rollup(&self) -> Option<ClusterMetrics> {
        let state = self.state.lock();
        if state.accumulated == 0 {
            return None;
        }

        let mut values = BTreeMap::new();
        for metric in ClusterMetric::ALL {
            let inputs: SmallVec<[f64; 16]> = match metric.source() {
                MetricSource::Broker(field) => state.brokers.values().filter_map(|c| c.value(field)).collect(),
                MetricSource::DistinctTopics => state.topics.keys().map(|_| 1.0).collect(),
                MetricSource::DistinctBrokers => state.brokers.keys().map(|_| 1.0).collect(),
            };
            let rule = self.rule(metric);
            if let Some(value) = rule.apply(&inputs) {
                values.insert(metric, RolledUp { rule, value });
            }
        }

        let controller_claims = state
            .brokers
            .values()
            .filter(|c| c.value(BROKER_ACTIVE_CONTROLLER).map_or(false, |v| v >= 1.0))
            .count();
        if !state.brokers.is_empty() && controller_claims != 1 {
            warn!(
                target: "msk_shim::aggregate",
                controller_claims,
                brokers = state.brokers.len(),
                "Cluster does not have exactly one active controller"
            );
        }

        let synthetic = state.brokers.values().any(|c| c.synthetic)
            || state.topics.values().any(|(_, synthetic)| *synthetic);

        debug!(
            target: "msk_shim::aggregate",
            brokers = state.brokers.len(),
            topics = state.topics.len(),
            contributions = state.accumulated,
            "Cluster rollup computed"
        );

        Some(ClusterMetrics {
            values,
            broker_count: state.brokers.len(),
            topic_count: state.topics.len(),
            synthetic,
            controller_claims,
        })
    }

    /// Clear accumulated state for the next cycle
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.brokers.clear();
        state.topics.clear();
        state.accumulated = 0;
    }

    pub fn accumulated(&self) -> u64 {
        self.state.lock().accumulated
    }
}

// ============================================================================
// SECTION 12: SYSTEM CORRELATOR
// ============================================================================
// Joins host resource samples onto broker entities by hostname. Purely
// additive: a missing or failing host lookup leaves the host fields as the
// raw sample set them and never aborts the broker transform.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Host Samples
// ----------------------------------------------------------------------------

/// Usage of one mounted filesystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub mount_point: String,
    pub used_percent: f64,
}

impl DiskUsage {
    pub fn new(mount_point: impl Into<String>, used_percent: f64) -> Self {
        Self {
            mount_point: mount_point.into(),
            used_percent,
        }
    }
}

/// Resource usage of one host at one point in time (percentages).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSample {
    pub hostname: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub cpu_user_percent: Option<f64>,
    #[serde(default)]
    pub cpu_system_percent: Option<f64>,
    #[serde(default)]
    pub cpu_idle_percent: Option<f64>,
    #[serde(default)]
    pub memory_used_percent: Option<f64>,
    #[serde(default)]
    pub memory_free_percent: Option<f64>,
    #[serde(default)]
    pub disks: Vec<DiskUsage>,
}

impl HostSample {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            timestamp: Timestamp::now(),
            ..Self::default()
        }
    }
}

/// Source of the most recent host sample per hostname.
pub trait SystemSampleSource: Send + Sync + Debug {
    fn latest_sample(&self, hostname: &str) -> EnrichmentResult<Option<HostSample>>;
}

/// In-memory host sample store fed by the collector. Keeps the newest sample
/// per hostname; hostnames compare case-insensitively.
#[derive(Debug, Default)]
pub struct HostSampleStore {
    samples: DashMap<String, HostSample>,
}

impl HostSampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: HostSample) {
        let key = sample.hostname.to_ascii_lowercase();
        match self.samples.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if sample.timestamp >= e.get().timestamp {
                    e.insert(sample);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(sample);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

impl SystemSampleSource for HostSampleStore {
    fn latest_sample(&self, hostname: &str) -> EnrichmentResult<Option<HostSample>> {
        Ok(self
            .samples
            .get(&hostname.to_ascii_lowercase())
            .map(|s| s.value().clone()))
    }
}

// ----------------------------------------------------------------------------
// 12.2 Disk Classification
// ----------------------------------------------------------------------------

/// Highest used-percent per storage class
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskClassification {
    pub root: Option<f64>,
    pub data: Option<f64>,
    pub log: Option<f64>,
}

impl StoragePatterns {
    /// `/` is root; the log pattern is checked before the data pattern so a
    /// log mount never counts as data.
    pub fn classify(&self, disks: &[DiskUsage]) -> DiskClassification {
        let mut out = DiskClassification::default();
        for disk in disks {
            if !disk.used_percent.is_finite() {
                continue;
            }
            let slot = if disk.mount_point == "/" {
                &mut out.root
            } else if self.log.is_match(&disk.mount_point) {
                &mut out.log
            } else if self.data.is_match(&disk.mount_point) {
                &mut out.data
            } else {
                continue;
            };
            *slot = Some(slot.map_or(disk.used_percent, |v: f64| v.max(disk.used_percent)));
        }
        out
    }
}

// ----------------------------------------------------------------------------
// 12.3 Correlator
// ----------------------------------------------------------------------------

/// What a correlation attempt did
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    Applied,
    NoSample,
    NoSource,
    Failed(EnrichmentError),
}

#[derive(Debug, Clone)]
pub struct SystemCorrelator {
    source: Option<Arc<dyn SystemSampleSource>>,
    patterns: StoragePatterns,
}

impl SystemCorrelator {
    pub fn new(source: Option<Arc<dyn SystemSampleSource>>, patterns: StoragePatterns) -> Self {
        Self { source, patterns }
    }

    pub fn correlate(&self, entity: &mut Entity, hostname: &str) -> Correlation {
        let Some(source) = &self.source else {
            return Correlation::NoSource;
        };

        let sample = match source.latest_sample(hostname) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                trace!(target: "msk_shim::enrich", hostname, "No host sample for broker");
                return Correlation::NoSample;
            }
            Err(e) => return Correlation::Failed(e),
        };

        let pairs = [
            (HOST_CPU_USER, sample.cpu_user_percent),
            (HOST_CPU_SYSTEM, sample.cpu_system_percent),
            (HOST_CPU_IDLE, sample.cpu_idle_percent),
            (HOST_MEMORY_USED, sample.memory_used_percent),
            (HOST_MEMORY_FREE, sample.memory_free_percent),
        ];
        for (field, value) in pairs {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                entity.set_metric(field, v);
            }
        }

        let disks = self.patterns.classify(&sample.disks);
        if let Some(v) = disks.data {
            entity.set_metric(HOST_DATA_DISK_USED, v);
        }
        if let Some(v) = disks.log {
            entity.set_metric(HOST_LOG_DISK_USED, v);
        }
        if let Some(v) = disks.root {
            entity.set_metric(HOST_ROOT_DISK_USED, v);
        }

        debug!(
            target: "msk_shim::enrich",
            hostname,
            entity = %entity.name,
            "Host resources correlated"
        );
        Correlation::Applied
    }
}

// ============================================================================
// SECTION 13: CONSUMER-LAG ENRICHER
// ============================================================================
// Per partition, lag = latest − committed, clamped at zero (a committed offset
// ahead of latest is a stale Admin-API read, not negative lag). Lag is summed
// per (topic, group) and applied to topic and cluster records at flush.
// ============================================================================

/// Offsets of one partition as reported by the Admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionOffset {
    pub partition: i32,
    pub latest_offset: i64,
    /// `None` (or negative) when the group has not committed on this partition
    #[serde(default)]
    pub committed_offset: Option<i64>,
}

impl PartitionOffset {
    pub fn new(partition: i32, latest_offset: i64, committed_offset: i64) -> Self {
        Self {
            partition,
            latest_offset,
            committed_offset: Some(committed_offset),
        }
    }

    /// Non-negative lag, or `None` without a committed offset
    pub fn lag(&self) -> Option<i64> {
        let committed = self.committed_offset.filter(|c| *c >= 0)?;
        Some(self.latest_offset.saturating_sub(committed).max(0))
    }
}

/// Lag of one consumer group on one topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLag {
    pub total_lag: i64,
    pub max_partition_lag: i64,
    pub partitions: usize,
    pub uncommitted_partitions: usize,
}

impl GroupLag {
    pub fn from_offsets(offsets: &[PartitionOffset]) -> Self {
        let mut lag = GroupLag::default();
        for offset in offsets {
            match offset.lag() {
                Some(l) => {
                    lag.total_lag = lag.total_lag.saturating_add(l);
                    lag.max_partition_lag = lag.max_partition_lag.max(l);
                    lag.partitions += 1;
                }
                None => lag.uncommitted_partitions += 1,
            }
        }
        lag
    }
}

/// Lag summary of one topic across groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicLag {
    /// Summed lag of the worst group
    pub consumer_lag: i64,
    /// Lag summed over every group
    pub sum_lag: i64,
    pub max_partition_lag: i64,
    pub groups: usize,
}

pub const TOPIC_CONSUMER_LAG: &str = "provider.consumerLag";
pub const TOPIC_SUM_OFFSET_LAG: &str = "provider.sumOffsetLag.Sum";
pub const TOPIC_MAX_OFFSET_LAG: &str = "provider.maxOffsetLag.Maximum";
pub const TOPIC_CONSUMER_GROUPS: &str = "provider.consumerGroupCount";
pub const TOPIC_LAG_SECONDS: &str = "provider.consumerLagSeconds";

/// Per-cycle consumer lag state, gated by `consumer_lag_enrichment`.
#[derive(Debug)]
pub struct ConsumerLagEnricher {
    enabled: bool,
    groups: Mutex<BTreeMap<CompactString, BTreeMap<CompactString, GroupLag>>>,
}

impl ConsumerLagEnricher {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            groups: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record one group's offsets for a topic; a repeat within the cycle replaces.
    pub fn record(&self, topic: &str, group: &str, offsets: &[PartitionOffset]) -> GroupLag {
        let lag = GroupLag::from_offsets(offsets);
        if lag.max_partition_lag > CONSUMER_LAG_WARN_THRESHOLD {
            warn!(
                target: "msk_shim::enrich",
                topic,
                group,
                max_partition_lag = lag.max_partition_lag,
                "Consumer group is far behind"
            );
        }
        self.groups
            .lock()
            .entry(CompactString::from(topic))
            .or_default()
            .insert(CompactString::from(group), lag);
        lag
    }

    pub fn topic_lag(&self, topic: &str) -> Option<TopicLag> {
        let groups = self.groups.lock();
        let per_group = groups.get(topic)?;
        Some(Self::summarize(per_group))
    }

    fn summarize(per_group: &BTreeMap<CompactString, GroupLag>) -> TopicLag {
        per_group.values().fold(
            TopicLag {
                groups: per_group.len(),
                ..TopicLag::default()
            },
            |acc, g| TopicLag {
                consumer_lag: acc.consumer_lag.max(g.total_lag),
                sum_lag: acc.sum_lag.saturating_add(g.total_lag),
                max_partition_lag: acc.max_partition_lag.max(g.max_partition_lag),
                groups: acc.groups,
            },
        )
    }

    /// Topics with recorded lag this cycle
    pub fn topics(&self) -> Vec<CompactString> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Set lag fields on a topic entity. Returns false when no lag is known.
    pub fn enrich_topic(&self, entity: &mut Entity, topic: &str) -> bool {
        let Some(lag) = self.topic_lag(topic) else {
            return false;
        };
        entity.set_metric(TOPIC_CONSUMER_LAG, lag.consumer_lag);
        entity.set_metric(TOPIC_SUM_OFFSET_LAG, lag.sum_lag);
        entity.set_metric(TOPIC_MAX_OFFSET_LAG, lag.max_partition_lag);
        entity.set_metric(TOPIC_CONSUMER_GROUPS, lag.groups);
        if let Some(rate) = entity.metric_f64(TOPIC_MESSAGES_IN).filter(|r| *r > 0.0) {
            entity.set_metric(TOPIC_LAG_SECONDS, lag.consumer_lag as f64 / rate);
        }
        true
    }

    /// (max partition lag, summed lag) across all topics
    pub fn cluster_totals(&self) -> Option<(i64, i64)> {
        let groups = self.groups.lock();
        if groups.is_empty() {
            return None;
        }
        Some(groups.values().map(Self::summarize).fold((0, 0), |(max, sum), t| {
            (max.max(t.max_partition_lag), sum.saturating_add(t.sum_lag))
        }))
    }

    pub fn reset(&self) {
        self.groups.lock().clear();
    }
}

// ============================================================================
// SECTION 14: FALLBACK GENERATOR
// ============================================================================
// Per-entity state machine. An entity whose transforms keep receiving empty
// raw maps switches to enhanced mode and emits a continuous synthetic series
// instead of nothing; the first real sample switches it back.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Synthetic Field Table
// ----------------------------------------------------------------------------

/// Whether an entity is emitting real or synthetic values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    #[default]
    Normal,
    Enhanced,
}

impl Display for CollectionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CollectionMode::Normal => write!(f, "normal"),
            CollectionMode::Enhanced => write!(f, "enhanced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    /// Gauge drawn once inside the range, then jittered each cycle
    Jitter { min: f64, max: f64 },
    /// Integer drawn once and held
    Held { min: i64, max: i64 },
    Zero,
    /// 1 for the designated controller broker, 0 otherwise
    Controller,
}

#[derive(Debug, Clone, Copy)]
struct SyntheticField {
    target: &'static str,
    shape: Shape,
}

const fn jitter(target: &'static str, min: f64, max: f64) -> SyntheticField {
    SyntheticField {
        target,
        shape: Shape::Jitter { min, max },
    }
}

const fn held(target: &'static str, min: i64, max: i64) -> SyntheticField {
    SyntheticField {
        target,
        shape: Shape::Held { min, max },
    }
}

const fn zero(target: &'static str) -> SyntheticField {
    SyntheticField {
        target,
        shape: Shape::Zero,
    }
}

static SYNTHETIC_BROKER_FIELDS: &[SyntheticField] = &[
    jitter(BROKER_BYTES_IN, 50_000.0, 150_000.0),
    jitter(BROKER_BYTES_OUT, 45_000.0, 135_000.0),
    jitter(BROKER_MESSAGES_IN, 100.0, 300.0),
    jitter(HOST_CPU_USER, 15.0, 40.0),
    jitter(HOST_CPU_SYSTEM, 5.0, 15.0),
    jitter(HOST_MEMORY_USED, 30.0, 60.0),
    jitter(HOST_DATA_DISK_USED, 20.0, 60.0),
    jitter("provider.requestHandlerAvgIdlePercent.Average", 85.0, 95.0),
    jitter("provider.networkProcessorAvgIdlePercent.Average", 85.0, 95.0),
    jitter("provider.fetchConsumerTotalTimeMsMean.Average", 5.0, 20.0),
    jitter("provider.produceTotalTimeMsMean.Average", 3.0, 13.0),
    held(BROKER_PARTITION_COUNT, 10, 50),
    zero(BROKER_UNDER_REPLICATED),
    zero(BROKER_OFFLINE_PARTITIONS),
    zero(BROKER_UNDER_MIN_ISR),
    zero("provider.bytesRejectedPerSec.Average"),
    SyntheticField {
        target: BROKER_ACTIVE_CONTROLLER,
        shape: Shape::Controller,
    },
];

static SYNTHETIC_TOPIC_FIELDS: &[SyntheticField] = &[
    jitter("provider.bytesInPerSec.Sum", 10_000.0, 50_000.0),
    jitter("provider.bytesOutPerSec.Sum", 9_000.0, 45_000.0),
    jitter(TOPIC_MESSAGES_IN, 20.0, 100.0),
    held("provider.partitionCount", 3, 3),
    held("provider.replicationFactor", 3, 3),
    held("provider.minInSyncReplicas", 2, 2),
    zero("provider.underReplicatedPartitions.Sum"),
    zero("provider.bytesRejectedPerSec.Sum"),
];

fn synthetic_fields(entity_type: EntityType) -> &'static [SyntheticField] {
    match entity_type {
        EntityType::Broker => SYNTHETIC_BROKER_FIELDS,
        EntityType::Topic => SYNTHETIC_TOPIC_FIELDS,
        EntityType::Cluster => &[],
    }
}

// ----------------------------------------------------------------------------
// 14.2 Generator
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct FallbackState {
    consecutive_empty: u32,
    mode: CollectionMode,
    last_counted_cycle: Option<u64>,
    /// Cycle whose synthetic values are in `previous`
    synthesized_cycle: Option<u64>,
    previous: BTreeMap<&'static str, MetricValue>,
    rng: StdRng,
}

#[derive(Debug, Default)]
struct FallbackInner {
    entities: AHashMap<EntityGuid, FallbackState>,
    controller: Option<EntityGuid>,
}

/// Tracks empty cycles per entity and produces synthetic series.
#[derive(Debug)]
pub struct FallbackGenerator {
    config: FallbackConfig,
    inner: Mutex<FallbackInner>,
}

impl FallbackGenerator {
    pub fn new(config: FallbackConfig) -> Self {
        if config.forced {
            info!(target: "msk_shim::fallback", "Enhanced mode forced by configuration");
        }
        Self {
            config,
            inner: Mutex::new(FallbackInner::default()),
        }
    }

    fn new_state(&self, guid: &EntityGuid) -> FallbackState {
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ xxh3_64(guid.as_str().as_bytes())),
            None => StdRng::from_entropy(),
        };
        FallbackState {
            consecutive_empty: 0,
            mode: CollectionMode::Normal,
            last_counted_cycle: None,
            synthesized_cycle: None,
            previous: BTreeMap::new(),
            rng,
        }
    }

    /// Record one transform of `guid` in `cycle` and return the mode to emit
    /// in. An empty raw map counts at most once per cycle; a non-empty map
    /// ends enhanced mode immediately.
    pub fn observe(&self, guid: &EntityGuid, cycle: u64, is_empty: bool) -> CollectionMode {
        let mut inner = self.inner.lock();
        if !inner.entities.contains_key(guid) {
            let state = self.new_state(guid);
            inner.entities.insert(guid.clone(), state);
        }
        let FallbackInner { entities, controller } = &mut *inner;
        let Some(state) = entities.get_mut(guid) else {
            return CollectionMode::Normal;
        };

        if self.config.forced {
            state.mode = CollectionMode::Enhanced;
            return CollectionMode::Enhanced;
        }

        if !is_empty {
            state.consecutive_empty = 0;
            state.last_counted_cycle = Some(cycle);
            if state.mode == CollectionMode::Enhanced {
                info!(target: "msk_shim::fallback", guid = %guid, "Switching back to real metrics mode");
                state.mode = CollectionMode::Normal;
                state.previous.clear();
                state.synthesized_cycle = None;
                if controller.as_ref() == Some(guid) {
                    *controller = None;
                }
            }
            return CollectionMode::Normal;
        }

        if state.last_counted_cycle != Some(cycle) {
            state.last_counted_cycle = Some(cycle);
            state.consecutive_empty = state.consecutive_empty.saturating_add(1);
        }

        if state.mode == CollectionMode::Normal && state.consecutive_empty > self.config.empty_cycle_threshold {
            warn!(
                target: "msk_shim::fallback",
                guid = %guid,
                empty_cycles = state.consecutive_empty,
                "No metrics received; switching to enhanced mode with synthetic values"
            );
            state.mode = CollectionMode::Enhanced;
        }
        state.mode
    }

    /// Synthetic field values for `guid` in `cycle`. Repeated calls within one
    /// cycle return the same values.
    pub fn synthesize(&self, guid: &EntityGuid, entity_type: EntityType, cycle: u64) -> Vec<(&'static str, MetricValue)> {
        let mut inner = self.inner.lock();
        if !inner.entities.contains_key(guid) {
            let state = self.new_state(guid);
            inner.entities.insert(guid.clone(), state);
        }
        let FallbackInner { entities, controller } = &mut *inner;
        let Some(state) = entities.get_mut(guid) else {
            return Vec::new();
        };

        if state.synthesized_cycle == Some(cycle) {
            return synthetic_fields(entity_type)
                .iter()
                .filter_map(|field| state.previous.get(field.target).map(|v| (field.target, v.clone())))
                .collect();
        }

        let (jitter_min, jitter_max) = (self.config.jitter_min, self.config.jitter_max);
        let mut values = Vec::with_capacity(synthetic_fields(entity_type).len());
        for field in synthetic_fields(entity_type) {
            let value = match field.shape {
                Shape::Jitter { min, max } => {
                    let next = match state.previous.get(field.target).and_then(MetricValue::as_f64) {
                        Some(prev) => jitter_step(&mut state.rng, prev, min, max, jitter_min, jitter_max),
                        None => state.rng.gen_range(min..=max),
                    };
                    MetricValue::Float(next)
                }
                Shape::Held { min, max } => match state.previous.get(field.target) {
                    Some(prev) => prev.clone(),
                    None => MetricValue::Int(state.rng.gen_range(min..=max)),
                },
                Shape::Zero => MetricValue::Int(0),
                Shape::Controller => {
                    if controller.is_none() {
                        debug!(target: "msk_shim::fallback", guid = %guid, "Designated synthetic active controller");
                        *controller = Some(guid.clone());
                    }
                    MetricValue::Int(i64::from(controller.as_ref() == Some(guid)))
                }
            };
            state.previous.insert(field.target, value.clone());
            values.push((field.target, value));
        }
        state.synthesized_cycle = Some(cycle);

        trace!(
            target: "msk_shim::fallback",
            guid = %guid,
            fields = values.len(),
            "Synthetic values generated"
        );
        values
    }

    pub fn mode(&self, guid: &EntityGuid) -> CollectionMode {
        self.inner
            .lock()
            .entities
            .get(guid)
            .map_or(CollectionMode::Normal, |s| s.mode)
    }

    /// Drop all state of an evicted entity
    pub fn forget(&self, guid: &EntityGuid) {
        let mut inner = self.inner.lock();
        inner.entities.remove(guid);
        if inner.controller.as_ref() == Some(guid) {
            inner.controller = None;
        }
    }

    pub fn enhanced_count(&self) -> usize {
        self.inner
            .lock()
            .entities
            .values()
            .filter(|s| s.mode == CollectionMode::Enhanced)
            .count()
    }
}

/// Perturb `prev` by a random fraction in `[jitter_min, jitter_max]` of random
/// sign. A step leaving `[min, max]` is reflected, then clamped.
fn jitter_step(rng: &mut StdRng, prev: f64, min: f64, max: f64, jitter_min: f64, jitter_max: f64) -> f64 {
    let fraction = if jitter_max > jitter_min {
        rng.gen_range(jitter_min..=jitter_max)
    } else {
        jitter_min
    };
    let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    let mut next = prev * (1.0 + sign * fraction);
    if next < min || next > max {
        next = prev * (1.0 - sign * fraction);
    }
    next.clamp(min, max)
}

// ============================================================================
// SECTION 15: PUBLISHERS
// ============================================================================
// Where flushed records go. The shim hands records over in `batch_size`
// chunks; a publisher either accepts a whole batch or reports an error.
// ============================================================================

/// Downstream sink for flushed entity records.
pub trait EntityPublisher: Send + Sync + Debug {
    fn publish(&self, batch: &[EntityRecord]) -> PublishResult<()>;

    fn name(&self) -> &'static str;
}

/// Keeps every published batch in memory
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    batches: Mutex<Vec<Vec<EntityRecord>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<EntityRecord>> {
        self.batches.lock().clone()
    }

    /// All published records in publish order
    pub fn records(&self) -> Vec<EntityRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

impl EntityPublisher for MemoryPublisher {
    fn publish(&self, batch: &[EntityRecord]) -> PublishResult<()> {
        self.batches.lock().push(batch.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Writes one JSON object per record per line
pub struct JsonLinesPublisher<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Debug for JsonLinesPublisher<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesPublisher").finish_non_exhaustive()
    }
}

impl<W: Write + Send> EntityPublisher for JsonLinesPublisher<W> {
    fn publish(&self, batch: &[EntityRecord]) -> PublishResult<()> {
        let mut writer = self.writer.lock();
        for record in batch {
            let line = serde_json::to_string(record).map_err(|e| PublishError::Serialization {
                guid: record.guid.to_string(),
                message: e.to_string(),
            })?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-lines"
    }
}

/// Default publisher: one debug event per record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EntityPublisher for TracingPublisher {
    fn publish(&self, batch: &[EntityRecord]) -> PublishResult<()> {
        for record in batch {
            debug!(
                target: "msk_shim::publish",
                guid = %record.guid,
                entity = %record.entity_name,
                event_type = %record.event_type,
                data_source = %record.data_source,
                fields = record.fields.len(),
                "Entity record"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

// ============================================================================
// SECTION 16: SHIM
// ============================================================================
// Entry point owning every component. Transforms may be called concurrently;
// `flush` is the cycle barrier and must not overlap with transforms.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ShimStats {
    pub brokers_transformed: AtomicCounter,
    pub topics_transformed: AtomicCounter,
    pub synthetic_records: AtomicCounter,
    pub correlations_applied: AtomicCounter,
    pub enrichment_failures: AtomicCounter,
    pub offsets_processed: AtomicCounter,
    pub flushes: AtomicCounter,
    pub records_published: AtomicCounter,
    pub publish_failures: AtomicCounter,
}

impl ShimStats {
    pub fn snapshot(&self) -> ShimStatsSnapshot {
        ShimStatsSnapshot {
            brokers_transformed: self.brokers_transformed.get(),
            topics_transformed: self.topics_transformed.get(),
            synthetic_records: self.synthetic_records.get(),
            correlations_applied: self.correlations_applied.get(),
            enrichment_failures: self.enrichment_failures.get(),
            offsets_processed: self.offsets_processed.get(),
            flushes: self.flushes.get(),
            records_published: self.records_published.get(),
            publish_failures: self.publish_failures.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimStatsSnapshot {
    pub brokers_transformed: u64,
    pub topics_transformed: u64,
    pub synthetic_records: u64,
    pub correlations_applied: u64,
    pub enrichment_failures: u64,
    pub offsets_processed: u64,
    pub flushes: u64,
    pub records_published: u64,
    pub publish_failures: u64,
}

/// What one flush did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Cycle that was closed
    pub cycle: u64,
    /// A new cluster rollup was written
    pub cluster_updated: bool,
    pub published: usize,
    pub batches: usize,
    pub evicted: usize,
    pub elapsed_ms: u64,
}

// ----------------------------------------------------------------------------
// 16.2 Builder
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ShimBuilder {
    config: Option<ShimConfig>,
    publisher: Option<Arc<dyn EntityPublisher>>,
    system_source: Option<Arc<dyn SystemSampleSource>>,
}

impl ShimBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ShimConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EntityPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn system_source(mut self, source: Arc<dyn SystemSampleSource>) -> Self {
        self.system_source = Some(source);
        self
    }

    /// Fails on a missing, disabled or invalid configuration.
    pub fn build(self) -> ShimResult<MskShim> {
        let config = self.config.ok_or(ConfigError::MissingConfig)?;
        if !config.enabled {
            return Err(ConfigError::Disabled.into());
        }
        config.validate()?;

        let patterns = config.storage_patterns()?;
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(TracingPublisher) as Arc<dyn EntityPublisher>);

        let shim = MskShim {
            cluster_guid: EntityGuid::cluster(&config.account_id, &config.cluster_name),
            cache: EntityCache::new(),
            transformer: Transformer::new(&config),
            aggregator: Aggregator::new(&config),
            correlator: SystemCorrelator::new(self.system_source, patterns),
            lag: ConsumerLagEnricher::new(config.consumer_lag_enrichment),
            fallback: FallbackGenerator::new(config.fallback.clone()),
            publisher,
            cycle: AtomicU64::new(0),
            stats: ShimStats::default(),
            errors: ErrorStats::new(),
            config: Arc::new(config),
        };

        info!(
            cluster = %shim.config.cluster_name,
            account_id = %shim.config.account_id,
            region = %shim.config.region,
            publisher = shim.publisher.name(),
            consumer_lag = shim.config.consumer_lag_enrichment,
            "{} v{} initialized",
            SHIM_FULL_NAME,
            SHIM_VERSION
        );
        Ok(shim)
    }
}

// ----------------------------------------------------------------------------
// 16.3 MskShim
// ----------------------------------------------------------------------------

pub struct MskShim {
    config: Arc<ShimConfig>,
    cluster_guid: EntityGuid,
    cache: EntityCache,
    transformer: Transformer,
    aggregator: Aggregator,
    correlator: SystemCorrelator,
    lag: ConsumerLagEnricher,
    fallback: FallbackGenerator,
    publisher: Arc<dyn EntityPublisher>,
    cycle: AtomicU64,
    stats: ShimStats,
    errors: ErrorStats,
}

impl Debug for MskShim {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MskShim")
            .field("cluster", &self.config.cluster_name)
            .field("cluster_guid", &self.cluster_guid)
            .field("cycle", &self.cycle())
            .field("entities", &self.cache.len())
            .field("publisher", &self.publisher.name())
            .finish()
    }
}

impl MskShim {
    pub fn builder() -> ShimBuilder {
        ShimBuilder::new()
    }

    pub fn new(config: ShimConfig, publisher: Arc<dyn EntityPublisher>) -> ShimResult<Self> {
        ShimBuilder::new().config(config).publisher(publisher).build()
    }

    /// Transform one broker's raw sample for the current cycle.
    pub fn transform_broker_metrics(&self, broker_id: i32, raw: &RawSample) -> ShimResult<EntityRecord> {
        if broker_id < 0 {
            return Err(self.fail(TransformError::InvalidBrokerId { broker_id }.into()));
        }

        let cycle = self.cycle();
        let guid = EntityGuid::broker(&self.config.account_id, &self.config.cluster_name, broker_id);
        let name = self.transformer.entity_name(EntityType::Broker, &broker_id.to_string());
        let handle = self.cache.get_or_create(EntityType::Broker, &guid, &name);
        let mode = self.fallback.observe(&guid, cycle, raw.is_empty());

        let (record, contribution) = {
            let mut entity = handle.lock();
            entity.begin_cycle(cycle);
            let contribution = match mode {
                CollectionMode::Enhanced => {
                    self.transformer.apply_identity(&mut entity);
                    entity.set_attribute("provider.brokerId", broker_id as i64);
                    for (field, value) in self.fallback.synthesize(&guid, EntityType::Broker, cycle) {
                        entity.set_metric(field, value);
                    }
                    entity.data_source = DataSource::Synthetic;
                    self.stats.synthetic_records.inc();
                    self.transformer.broker_contribution(&entity, broker_id, true)
                }
                CollectionMode::Normal => {
                    if entity.data_source == DataSource::Synthetic {
                        entity.clear_metrics();
                    }
                    let contribution = self.transformer.transform_broker(&mut entity, broker_id, raw);
                    if let Some(hostname) = self.transformer.hostname(raw) {
                        self.correlate(&mut entity, hostname);
                    }
                    contribution
                }
            };
            entity.touch();
            (entity.to_record(), contribution)
        };

        self.aggregator.accumulate(contribution);
        self.stats.brokers_transformed.inc();
        Ok(record)
    }

    /// Transform one broker's view of a topic for the current cycle. Several
    /// brokers may report the same topic; their rate fields are summed.
    pub fn transform_topic_metrics(&self, topic: &str, raw: &RawSample) -> ShimResult<EntityRecord> {
        if topic.trim().is_empty() {
            return Err(self.fail(TransformError::EmptyTopicName.into()));
        }

        let cycle = self.cycle();
        let guid = EntityGuid::topic(&self.config.account_id, &self.config.cluster_name, topic);
        let name = self.transformer.entity_name(EntityType::Topic, topic);
        let handle = self.cache.get_or_create(EntityType::Topic, &guid, &name);
        let mode = self.fallback.observe(&guid, cycle, raw.is_empty());

        let (record, contribution) = {
            let mut entity = handle.lock();
            entity.begin_cycle(cycle);
            let contribution = match mode {
                CollectionMode::Enhanced => {
                    self.transformer.apply_identity(&mut entity);
                    entity.set_attribute("provider.topic", topic);
                    entity.set_attribute("displayName", topic);
                    for (field, value) in self.fallback.synthesize(&guid, EntityType::Topic, cycle) {
                        entity.set_metric(field, value);
                    }
                    entity.data_source = DataSource::Synthetic;
                    self.stats.synthetic_records.inc();
                    let mut contribution = Contribution::new(EntityType::Topic, topic);
                    contribution.synthetic = true;
                    contribution
                }
                CollectionMode::Normal => {
                    if entity.data_source == DataSource::Synthetic {
                        entity.clear_metrics();
                    }
                    self.transformer.transform_topic(&mut entity, topic, raw)
                }
            };
            entity.touch();
            (entity.to_record(), contribution)
        };

        self.aggregator.accumulate(contribution);
        self.stats.topics_transformed.inc();
        Ok(record)
    }

    /// Record one consumer group's Admin-API offsets for a topic. A failed
    /// lookup is logged and counted; the topic record is still emitted
    /// without lag fields. Returns the group's lag when it was recorded.
    pub fn process_consumer_offset(
        &self,
        topic: &str,
        group: &str,
        offsets: Result<&[PartitionOffset], EnrichmentError>,
    ) -> ShimResult<Option<GroupLag>> {
        if !self.lag.is_enabled() {
            return Ok(None);
        }
        if topic.trim().is_empty() {
            return Err(self.fail(TransformError::EmptyTopicName.into()));
        }
        if group.trim().is_empty() {
            return Err(self.fail(
                TransformError::EmptyGroupName {
                    topic: topic.to_string(),
                }
                .into(),
            ));
        }

        match offsets {
            Ok(offsets) => {
                let lag = self.lag.record(topic, group, offsets);
                self.stats.offsets_processed.inc();
                Ok(Some(lag))
            }
            Err(e) => {
                warn!(
                    target: "msk_shim::enrich",
                    topic,
                    group,
                    error = %e,
                    "Consumer offsets unavailable; topic emitted without lag"
                );
                self.stats.enrichment_failures.inc();
                self.errors.record(&e.into());
                Ok(None)
            }
        }
    }

    /// Roll up everything accumulated this cycle onto the cluster entity.
    /// Returns `None` when nothing was accumulated since the last flush.
    pub fn create_cluster_entity(&self) -> Option<EntityRecord> {
        let metrics = self.aggregator.rollup()?;
        let name = self.transformer.entity_name(EntityType::Cluster, "");
        let handle = self.cache.get_or_create(EntityType::Cluster, &self.cluster_guid, &name);

        let mut entity = handle.lock();
        entity.begin_cycle(self.cycle());
        self.transformer.apply_identity(&mut entity);
        metrics.apply_to(&mut entity);
        if self.lag.is_enabled() {
            if let Some((max_lag, sum_lag)) = self.lag.cluster_totals() {
                entity.set_metric(TOPIC_MAX_OFFSET_LAG, max_lag);
                entity.set_metric(TOPIC_SUM_OFFSET_LAG, sum_lag);
            }
        }
        if metrics.synthetic {
            entity.data_source = DataSource::Synthetic;
        }
        entity.touch();

        debug!(
            target: "msk_shim::flush",
            cluster = %entity.name,
            brokers = metrics.broker_count,
            topics = metrics.topic_count,
            synthetic = metrics.synthetic,
            "Cluster entity updated"
        );
        Some(entity.to_record())
    }

    /// Close the current cycle: attach lag, roll up the cluster, evict stale
    /// entities, publish every cached entity and reset per-cycle state.
    /// Publish errors are returned after the state has been reset.
    pub fn flush(&self) -> ShimResult<FlushReport> {
        let timer = PerfTimer::with_threshold("flush", FLUSH_WARN_THRESHOLD_MS);
        let cycle = self.cycle();

        if self.lag.is_enabled() {
            self.apply_topic_lag(cycle);
        }

        let cluster = self.create_cluster_entity();

        let evicted = self.cache.evict_stale(cycle, self.config.entity_ttl_cycles);
        for guid in &evicted {
            debug!(target: "msk_shim::flush", guid = %guid, "Evicted stale entity");
            self.fallback.forget(guid);
        }

        let records = self.cache.records();
        self.aggregator.reset();
        self.lag.reset();
        self.cycle.fetch_add(1, AtomicOrdering::SeqCst);
        self.stats.flushes.inc();

        let mut published = 0usize;
        let mut batches = 0usize;
        let mut failure: Option<ShimError> = None;
        for batch in records.chunks(self.config.batch_size.max(1)) {
            match self.publisher.publish(batch) {
                Ok(()) => {
                    published += batch.len();
                    batches += 1;
                }
                Err(e) => {
                    error!(
                        target: "msk_shim::flush",
                        publisher = self.publisher.name(),
                        records = batch.len(),
                        error = %e,
                        "Failed to publish batch"
                    );
                    self.stats.publish_failures.inc();
                    let err = self.fail(e.into());
                    failure.get_or_insert(err);
                }
            }
        }
        self.stats.records_published.add(published as u64);

        let elapsed_ms = timer.stop();
        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            target: "msk_shim::flush",
            cycle,
            cluster_updated = cluster.is_some(),
            published,
            batches,
            evicted = evicted.len(),
            elapsed_ms,
            "Flush complete"
        );

        Ok(FlushReport {
            cycle,
            cluster_updated: cluster.is_some(),
            published,
            batches,
            evicted: evicted.len(),
            elapsed_ms,
        })
    }

    fn apply_topic_lag(&self, cycle: u64) {
        for topic in self.lag.topics() {
            let guid = EntityGuid::topic(&self.config.account_id, &self.config.cluster_name, &topic);
            let Some(handle) = self.cache.get(EntityType::Topic, &guid) else {
                debug!(target: "msk_shim::enrich", topic = %topic, "Offsets for a topic with no metrics this cycle");
                continue;
            };
            let mut entity = handle.lock();
            if entity.last_seen_cycle() == Some(cycle) {
                self.lag.enrich_topic(&mut entity, &topic);
            }
        }
    }

    fn correlate(&self, entity: &mut Entity, hostname: &str) {
        match self.correlator.correlate(entity, hostname) {
            Correlation::Applied => {
                self.stats.correlations_applied.inc();
            }
            Correlation::Failed(e) => {
                warn!(
                    target: "msk_shim::enrich",
                    hostname,
                    error = %e,
                    "Host correlation failed; broker emitted without host data"
                );
                self.stats.enrichment_failures.inc();
                self.errors.record(&e.into());
            }
            Correlation::NoSample | Correlation::NoSource => {}
        }
    }

    fn fail(&self, error: ShimError) -> ShimError {
        self.errors.record(&error);
        error
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn cycle(&self) -> u64 {
        self.cycle.load(AtomicOrdering::SeqCst)
    }

    pub fn cluster_guid(&self) -> &EntityGuid {
        &self.cluster_guid
    }

    pub fn stats(&self) -> ShimStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.errors
    }

    pub fn cached_entities(&self) -> usize {
        self.cache.len()
    }

    pub fn collection_mode(&self, guid: &EntityGuid) -> CollectionMode {
        self.fallback.mode(guid)
    }

    /// Current snapshot of a cached entity
    pub fn record(&self, entity_type: EntityType, guid: &EntityGuid) -> Option<EntityRecord> {
        self.cache.get(entity_type, guid).map(|h| h.lock().to_record())
    }

    pub fn broker_record(&self, broker_id: i32) -> Option<EntityRecord> {
        let guid = EntityGuid::broker(&self.config.account_id, &self.config.cluster_name, broker_id);
        self.record(EntityType::Broker, &guid)
    }

    pub fn topic_record(&self, topic: &str) -> Option<EntityRecord> {
        let guid = EntityGuid::topic(&self.config.account_id, &self.config.cluster_name, topic);
        self.record(EntityType::Topic, &guid)
    }

    pub fn cluster_record(&self) -> Option<EntityRecord> {
        self.record(EntityType::Cluster, &self.cluster_guid)
    }
}

// ============================================================================
// SECTION 17: REPLAY FIXTURES & RUNNER
// ============================================================================
// Recorded collector cycles (brokers, topics, hosts, offsets) replayed through
// the shim. Drives `dry-run` and `run`; the collector proper lives elsewhere.
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSample {
    pub id: i32,
    #[serde(default)]
    pub metrics: RawSample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSample {
    pub name: String,
    #[serde(default)]
    pub metrics: RawSample,
}

/// Admin-API result for one (topic, group); `error` replays a failed lookup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetSample {
    pub topic: String,
    pub group: String,
    #[serde(default)]
    pub partitions: Vec<PartitionOffset>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything the collector delivered in one cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureCycle {
    #[serde(default)]
    pub brokers: Vec<BrokerSample>,
    #[serde(default)]
    pub topics: Vec<TopicSample>,
    #[serde(default)]
    pub hosts: Vec<HostSample>,
    #[serde(default)]
    pub offsets: Vec<OffsetSample>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFixture {
    pub cycles: Vec<FixtureCycle>,
}

impl ReplayFixture {
    pub fn load<P: AsRef<Path>>(path: P) -> ShimResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let fixture: Self = serde_json::from_str(&content)
            .map_err(|e| ShimError::Internal(format!("Invalid fixture {}: {}", path.display(), e)))?;
        if fixture.cycles.is_empty() {
            return Err(ShimError::Internal(format!("Fixture {} has no cycles", path.display())));
        }
        Ok(fixture)
    }

    /// Single-broker sample used when no fixture is given
    pub fn builtin() -> Self {
        let broker = RawSample::new()
            .with("broker.bytesInPerSecond", 1024.5)
            .with("broker.bytesOutPerSecond", 2048.0)
            .with("broker.messagesInPerSecond", 12.0)
            .with("broker.requestHandlerAvgIdlePercent", 0.85)
            .with("broker.ActiveControllerCount", 1)
            .with("broker.partitionCount", 3)
            .with("broker.underReplicatedPartitions", 0)
            .with("broker.host", "kafka-broker-1");
        let topic = RawSample::new()
            .with("topic.bytesInPerSecond", 1024.5)
            .with("topic.messagesInPerSecond", 12.0)
            .with("topic.partitionCount", 3)
            .with("topic.replicationFactor", 1);

        Self {
            cycles: vec![FixtureCycle {
                brokers: vec![BrokerSample { id: 1, metrics: broker }],
                topics: vec![TopicSample {
                    name: "orders".into(),
                    metrics: topic,
                }],
                hosts: Vec::new(),
                offsets: Vec::new(),
            }],
        }
    }
}

/// Feed one recorded cycle through the shim and flush it. Per-entity errors
/// are logged and skipped; only flush errors are returned.
pub fn replay_cycle(shim: &MskShim, cycle: &FixtureCycle, hosts: &HostSampleStore) -> ShimResult<FlushReport> {
    for host in &cycle.hosts {
        hosts.record(host.clone());
    }

    for broker in &cycle.brokers {
        if let Err(e) = shim.transform_broker_metrics(broker.id, &broker.metrics) {
            warn!(broker_id = broker.id, error = %e, "Skipping broker sample");
        }
    }

    for topic in &cycle.topics {
        if let Err(e) = shim.transform_topic_metrics(&topic.name, &topic.metrics) {
            warn!(topic = %topic.name, error = %e, "Skipping topic sample");
        }
    }

    for offsets in &cycle.offsets {
        let result = match &offsets.error {
            Some(message) => Err(EnrichmentError::admin_api(message.clone())),
            None => Ok(offsets.partitions.as_slice()),
        };
        if let Err(e) = shim.process_consumer_offset(&offsets.topic, &offsets.group, result) {
            warn!(topic = %offsets.topic, group = %offsets.group, error = %e, "Skipping consumer offsets");
        }
    }

    shim.flush()
}

/// Replay the fixture once per flush interval, looping over its cycles, until
/// `max_cycles` is reached or Ctrl-C. Returns the number of cycles flushed.
pub async fn run_replay(
    shim: Arc<MskShim>,
    fixture: ReplayFixture,
    hosts: Arc<HostSampleStore>,
    max_cycles: Option<usize>,
) -> ShimResult<usize> {
    if fixture.cycles.is_empty() {
        return Err(ShimError::Internal("Fixture has no cycles".into()));
    }

    let mut ticker = interval(shim.config().flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        cluster = %shim.config().cluster_name,
        interval = %humantime::format_duration(shim.config().flush_interval),
        cycles = fixture.cycles.len(),
        "Replay started"
    );

    let mut completed = 0usize;
    loop {
        if max_cycles.map_or(false, |max| completed >= max) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let cycle = &fixture.cycles[completed % fixture.cycles.len()];
                match replay_cycle(&shim, cycle, &hosts) {
                    Ok(report) => trace!(cycle = report.cycle, published = report.published, "Replay tick"),
                    Err(e) if e.is_recoverable() => warn!(error = %e, "Flush failed, continuing"),
                    Err(e) => return Err(e),
                }
                completed += 1;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let stats = shim.stats();
    info!(
        cycles = completed,
        records_published = stats.records_published,
        synthetic_records = stats.synthetic_records,
        errors = shim.error_stats().total_errors(),
        "Replay finished"
    );
    Ok(completed)
}

// ============================================================================
// SECTION 18: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Kafka MSK Shim CLI
#[derive(Parser, Debug)]
#[command(
    name = "msk-shim",
    author = "AIOps Team",
    version,
    about = "Transforms self-managed Kafka telemetry into managed-streaming (MSK) entities",
    long_about = "Kafka MSK Shim maps raw broker and topic metrics onto the managed-streaming \
                  entity schema, rolls them up into a cluster entity and keeps dashboards \
                  populated with synthetic values when brokers stop reporting."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "MSK_SHIM_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "MSK_SHIM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "MSK_SHIM_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a recorded fixture on the flush interval until Ctrl-C
    Run {
        /// Fixture file (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<usize>,
    },

    /// Transform a fixture (or a built-in sample) and print records as JSON lines
    DryRun {
        /// Fixture file (JSON); the built-in sample when omitted
        #[arg(short, long)]
        fixture: Option<PathBuf>,

        /// Number of cycles to replay
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 18.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> ShimResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ShimConfig::load(config_path) {
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
            println!("  • Enabled: {}", config.enabled);
            println!("  • Cluster: {}", config.cluster_name);
            println!("  • Cluster ARN: {}", config.effective_cluster_arn());
            println!("  • Account / region: {} / {}", config.account_id, config.region);
            println!(
                "  • Batch size: {} every {}",
                config.batch_size,
                humantime::format_duration(config.flush_interval)
            );
            println!("  • Consumer lag enrichment: {}", config.consumer_lag_enrichment);
            println!(
                "  • Enhanced mode: {} (after {} empty cycles)",
                if config.fallback.forced { "forced" } else { "automatic" },
                config.fallback.empty_cycle_threshold
            );
            if config.entity_ttl_cycles > 0 {
                println!("  • Entity TTL: {} cycles", config.entity_ttl_cycles);
            }
            if !config.aggregation_overrides.is_empty() {
                println!("  • Aggregation overrides:");
                for (metric, rule) in &config.aggregation_overrides {
                    println!("    - {}: {}", metric, rule);
                }
            }
            if !config.enabled {
                println!("\n⚠️  enabled = false: the shim will refuse to start");
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ShimError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ShimResult<()> {
    let config_str = ShimConfig::generate_default_config();

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
    println!("📡 {} v{}", SHIM_FULL_NAME, SHIM_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Managed-schema cluster, broker and topic entities");
    println!("  • Metric-aware cluster rollups");
    println!("  • Host resource correlation");
    println!("  • Consumer lag enrichment");
    println!("  • Enhanced mode with synthetic series");
    println!();
    println!("License: MIT");
}

/// Handle the dry-run subcommand. Records go to stdout, everything else to stderr.
fn handle_dry_run(config: ShimConfig, fixture: Option<&Path>, cycles: usize) -> ShimResult<()> {
    let fixture = match fixture {
        Some(path) => ReplayFixture::load(path)?,
        None => ReplayFixture::builtin(),
    };

    let mut config = config;
    config.enabled = true;

    let hosts = Arc::new(HostSampleStore::new());
    let shim = MskShim::builder()
        .config(config)
        .publisher(Arc::new(JsonLinesPublisher::new(io::stdout())))
        .system_source(hosts.clone())
        .build()?;

    for i in 0..cycles.max(1) {
        let cycle = &fixture.cycles[i % fixture.cycles.len()];
        let report = replay_cycle(&shim, cycle, &hosts)?;
        eprintln!(
            "🔁 cycle {}: {} records in {} batches{}",
            report.cycle,
            report.published,
            report.batches,
            if report.cluster_updated { "" } else { " (cluster unchanged)" }
        );
    }

    let stats = shim.stats();
    eprintln!(
        "✅ Dry run complete: {} brokers, {} topics, {} synthetic records",
        stats.brokers_transformed, stats.topics_transformed, stats.synthetic_records
    );
    Ok(())
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the shim
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a shim
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
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        None => {
            Cli::command().print_help()?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        ShimConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        eprintln!("Config file not found at {}, using defaults", cli.config.display());
        ShimConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("📡 {} v{}", SHIM_FULL_NAME, SHIM_VERSION);

    match cli.command {
        Some(Commands::DryRun { fixture, cycles }) => {
            handle_dry_run(config, fixture.as_deref(), cycles)?;
        }
        Some(Commands::Run { fixture, cycles }) => {
            let fixture = ReplayFixture::load(&fixture)
                .with_context(|| format!("Failed to load fixture {}", fixture.display()))?;
            let hosts = Arc::new(HostSampleStore::new());
            let shim = MskShim::builder()
                .config(config)
                .system_source(hosts.clone())
                .build()
                .context("Failed to start shim")?;
            run_replay(Arc::new(shim), fixture, hosts, cycles).await?;
        }
        _ => unreachable!(),
    }

    Ok(())
}

// ============================================================================
// SECTION 20: TESTS
// ============================================================================


// ============================================================================
// SECTION 21: PIPELINE TESTS
// ============================================================================

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transformer() -> Transformer {
        let mut config = ShimConfig::for_cluster("prod");
        config.account_id = "123".into();
        Transformer::new(&config)
    }

    fn broker_entity(id: i32) -> Entity {
        let guid = EntityGuid::broker("123", "prod", id);
        let mut entity = Entity::new(EntityType::Broker, guid, format!("broker-{}", id));
        entity.begin_cycle(0);
        entity
    }

    fn topic_entity(name: &str) -> Entity {
        let guid = EntityGuid::topic("123", "prod", name);
        let mut entity = Entity::new(EntityType::Topic, guid, name);
        entity.begin_cycle(0);
        entity
    }

    fn broker_contribution(id: &str, field: &'static str, value: f64) -> Contribution {
        Contribution::new(EntityType::Broker, id).with_value(field, value)
    }

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < 1e-9)
    }

    // ------------------------------------------------------------------------
    // Aggregator
    // ------------------------------------------------------------------------

    #[test]
    fn test_health_metric_rolls_up_by_max() {
        let aggregator = Aggregator::with_default_rules();
        aggregator.accumulate(broker_contribution("1", BROKER_UNDER_REPLICATED, 2.0));
        aggregator.accumulate(broker_contribution("2", BROKER_UNDER_REPLICATED, 5.0));
        aggregator.accumulate(broker_contribution("3", BROKER_UNDER_REPLICATED, 0.0));

        let metrics = aggregator.rollup().unwrap();
        assert_eq!(metrics.get(ClusterMetric::UnderReplicatedPartitions), Some(5.0));
        assert_eq!(metrics.get(ClusterMetric::BrokerCount), Some(3.0));
    }

    #[test]
    fn test_throughput_rolls_up_by_sum() {
        let aggregator = Aggregator::with_default_rules();
        for (id, value) in [("1", 1000.0), ("2", 2000.0), ("3", 3000.0)] {
            aggregator.accumulate(broker_contribution(id, BROKER_BYTES_IN, value));
        }

        let metrics = aggregator.rollup().unwrap();
        assert_eq!(metrics.get(ClusterMetric::BytesInPerSec), Some(6000.0));
        // No broker reported bytes out
        assert_eq!(metrics.get(ClusterMetric::BytesOutPerSec), None);
    }

    #[test]
    fn test_rollup_without_accumulation_is_none() {
        let aggregator = Aggregator::with_default_rules();
        assert!(aggregator.rollup().is_none());

        aggregator.accumulate(broker_contribution("1", BROKER_BYTES_IN, 1.0));
        assert!(aggregator.rollup().is_some());

        aggregator.reset();
        assert_eq!(aggregator.accumulated(), 0);
        assert!(aggregator.rollup().is_none());
    }

    #[test]
    fn test_repeated_broker_replaces_contribution() {
        let aggregator = Aggregator::with_default_rules();
        aggregator.accumulate(broker_contribution("1", BROKER_BYTES_IN, 1000.0));
        aggregator.accumulate(broker_contribution("1", BROKER_BYTES_IN, 1500.0));

        let metrics = aggregator.rollup().unwrap();
        assert_eq!(metrics.get(ClusterMetric::BytesInPerSec), Some(1500.0));
        assert_eq!(metrics.broker_count, 1);
    }

    #[test]
    fn test_topic_count_is_distinct() {
        let aggregator = Aggregator::with_default_rules();
        for topic in ["orders", "orders", "payments"] {
            aggregator.accumulate(Contribution::new(EntityType::Topic, topic));
        }

        let metrics = aggregator.rollup().unwrap();
        assert_eq!(metrics.get(ClusterMetric::GlobalTopicCount), Some(2.0));
        assert_eq!(metrics.get(ClusterMetric::BrokerCount), Some(0.0));
        assert!(!metrics.synthetic);
    }

    #[test]
    fn test_cluster_contribution_is_ignored() {
        let aggregator = Aggregator::with_default_rules();
        aggregator.accumulate(Contribution::new(EntityType::Cluster, "prod"));
        assert!(aggregator.rollup().is_none());
    }

    #[test]
    fn test_rollup_applies_typed_fields() {
        let aggregator = Aggregator::with_default_rules();
        aggregator.accumulate(
            broker_contribution("1", BROKER_BYTES_IN, 10.5).with_value(BROKER_ACTIVE_CONTROLLER, 1.0),
        );
        aggregator.accumulate(
            broker_contribution("2", BROKER_BYTES_IN, 20.0).with_value(BROKER_ACTIVE_CONTROLLER, 0.0),
        );

        let metrics = aggregator.rollup().unwrap();
        assert_eq!(metrics.controller_claims, 1);

        let mut cluster = Entity::new(EntityType::Cluster, EntityGuid::cluster("123", "prod"), "prod");
        metrics.apply_to(&mut cluster);

        assert_eq!(cluster.metric("provider.bytesInPerSec.Sum"), Some(&MetricValue::Float(30.5)));
        assert_eq!(cluster.metric("provider.brokerCount"), Some(&MetricValue::Int(2)));
        assert_eq!(
            cluster.metric("provider.activeControllerCount.Maximum"),
            Some(&MetricValue::Int(1))
        );
    }

    #[test]
    fn test_average_override() {
        let mut config = ShimConfig::for_cluster("prod");
        config
            .aggregation_overrides
            .insert("bytesInPerSec".into(), AggregationRule::Average);
        let aggregator = Aggregator::new(&config);
        aggregator.accumulate(broker_contribution("1", BROKER_BYTES_IN, 100.0));
        aggregator.accumulate(broker_contribution("2", BROKER_BYTES_IN, 300.0));

        let metrics = aggregator.rollup().unwrap();
        let mut cluster = Entity::new(EntityType::Cluster, EntityGuid::cluster("123", "prod"), "prod");
        metrics.apply_to(&mut cluster);
        assert_eq!(cluster.metric_f64("provider.bytesInPerSec.Average"), Some(200.0));
    }

    // ------------------------------------------------------------------------
    // Transformer
    // ------------------------------------------------------------------------

    #[test]
    fn test_default_applies_only_to_documented_fields() {
        let mut entity = broker_entity(1);
        let raw = RawSample::new().with("broker.bytesInPerSecond", 1024.5);

        let contribution = transformer().transform_broker(&mut entity, 1, &raw);

        assert_eq!(
            entity.metric("provider.bytesRejectedPerSec.Average"),
            Some(&MetricValue::Float(0.0))
        );
        assert_eq!(entity.metric(HOST_CPU_USER), None);
        assert_eq!(entity.metric(BROKER_UNDER_REPLICATED), None);
        assert_eq!(contribution.value(BROKER_BYTES_IN), Some(1024.5));
        assert_eq!(contribution.value(BROKER_UNDER_REPLICATED), None);
    }

    #[test]
    fn test_idle_fraction_becomes_percent() {
        let mut entity = broker_entity(1);
        let raw = RawSample::new()
            .with("broker.requestHandlerAvgIdlePercent", 0.85)
            .with("broker.networkProcessorAvgIdlePercent", 92.0);

        transformer().transform_broker(&mut entity, 1, &raw);

        assert!(approx(
            entity.metric_f64("provider.requestHandlerAvgIdlePercent.Average"),
            85.0
        ));
        assert!(approx(
            entity.metric_f64("provider.networkProcessorAvgIdlePercent.Average"),
            92.0
        ));
    }

    #[test]
    fn test_malformed_values_leave_field_unset() {
        let mut entity = broker_entity(1);
        let raw = RawSample::new()
            .with("broker.bytesInPerSecond", "not-a-number")
            .with("broker.bytesOutPerSecond", -5.0)
            .with("broker.bytesRejectedPerSecond", "garbage")
            .with("broker.messagesInPerSecond", "42");

        transformer().transform_broker(&mut entity, 1, &raw);

        assert_eq!(entity.metric(BROKER_BYTES_IN), None);
        assert_eq!(entity.metric(BROKER_BYTES_OUT), None);
        assert_eq!(entity.metric("provider.bytesRejectedPerSec.Average"), None);
        assert_eq!(entity.metric_f64(BROKER_MESSAGES_IN), Some(42.0));
    }

    #[test]
    fn test_broker_identity_attributes() {
        let mut entity = broker_entity(7);
        let raw = RawSample::new()
            .with("broker.partitionCount", 12)
            .with("broker.host", "kafka-7.internal");

        transformer().transform_broker(&mut entity, 7, &raw);
        let record = entity.to_record();

        assert_eq!(record.get_i64("provider.brokerId"), Some(7));
        assert_eq!(record.get("provider.brokerHost"), Some(&MetricValue::from("kafka-7.internal")));
        assert_eq!(record.get("provider.clusterName"), Some(&MetricValue::from("prod")));
        assert_eq!(record.get("tags.provider"), Some(&MetricValue::from("AWS")));
        assert_eq!(record.get(BROKER_PARTITION_COUNT), Some(&MetricValue::Int(12)));
        assert_eq!(record.event_type, "AwsMskBrokerSample");
    }

    #[test]
    fn test_entity_names() {
        let t = transformer();
        assert_eq!(t.entity_name(EntityType::Cluster, ""), "123:us-east-1:prod");
        assert_eq!(t.entity_name(EntityType::Broker, "1"), "123:us-east-1:prod:broker-1");
        assert_eq!(t.entity_name(EntityType::Topic, "orders"), "123:us-east-1:prod:topic-orders");
    }

    #[test]
    fn test_topic_rates_sum_across_brokers() {
        let t = transformer();
        let mut entity = topic_entity("orders");

        let view_a = RawSample::new()
            .with("topic.bytesInPerSecond", 100.0)
            .with("topic.partitionCount", 3)
            .with("topic.sizeInBytes", 1_048_576.0);
        let view_b = RawSample::new()
            .with("topic.bytesInPerSecond", 250.0)
            .with("topic.partitionCount", 3)
            .with("topic.sizeInBytes", 1_048_576.0);

        t.transform_topic(&mut entity, "orders", &view_a);
        t.transform_topic(&mut entity, "orders", &view_b);

        assert_eq!(entity.metric_f64("provider.bytesInPerSec.Sum"), Some(350.0));
        assert_eq!(entity.metric("provider.partitionCount"), Some(&MetricValue::Int(3)));
        assert!(approx(entity.metric_f64("provider.sizeInMB.Sum"), 2.0));
        assert_eq!(entity.metric_f64("provider.bytesRejectedPerSec.Sum"), Some(0.0));
        assert_eq!(entity.attribute("displayName"), Some(&MetricValue::from("orders")));
    }

    #[test]
    fn test_topic_under_replicated_takes_max_across_brokers() {
        let t = transformer();
        let mut entity = topic_entity("orders");

        t.transform_topic(&mut entity, "orders", &RawSample::new().with("topic.underReplicatedPartitions", 2));
        t.transform_topic(&mut entity, "orders", &RawSample::new().with("topic.underReplicatedPartitions", 3));
        t.transform_topic(&mut entity, "orders", &RawSample::new().with("topic.underReplicatedPartitions", 1));

        assert_eq!(
            entity.metric("provider.underReplicatedPartitions.Sum"),
            Some(&MetricValue::Int(3))
        );
    }

    #[test]
    fn test_huge_topic_counts_do_not_overflow() {
        let t = transformer();
        let mut entity = topic_entity("orders");
        let raw = RawSample::new().with("topic.underReplicatedPartitions", 9.0e18);

        t.transform_topic(&mut entity, "orders", &raw);
        t.transform_topic(&mut entity, "orders", &raw);

        let under_replicated = entity.metric_f64("provider.underReplicatedPartitions.Sum").unwrap();
        assert!(under_replicated >= 9.0e18);

        entity.set_metric("provider.count", i64::MAX - 1);
        entity.add_metric("provider.count", MetricValue::Int(10));
        assert_eq!(entity.metric("provider.count"), Some(&MetricValue::Int(i64::MAX)));
    }

    #[test]
    fn test_empty_sample_gets_no_defaults() {
        let t = transformer();

        let mut broker = broker_entity(1);
        t.transform_broker(&mut broker, 1, &RawSample::new());
        assert_eq!(broker.metric("provider.bytesRejectedPerSec.Average"), None);
        assert_eq!(broker.metric("provider.networkRxDropped.Sum"), None);
        assert_eq!(broker.metric("provider.networkTxDropped.Sum"), None);
        assert_eq!(broker.metric_count(), 0);
        assert_eq!(broker.attribute("provider.brokerId"), Some(&MetricValue::Int(1)));

        let mut topic = topic_entity("orders");
        t.transform_topic(&mut topic, "orders", &RawSample::new());
        assert_eq!(topic.metric("provider.bytesRejectedPerSec.Sum"), None);
        assert_eq!(topic.metric_count(), 0);
        assert_eq!(topic.attribute("provider.topic"), Some(&MetricValue::from("orders")));
    }

    // ------------------------------------------------------------------------
    // System correlator
    // ------------------------------------------------------------------------

    fn host_sample(hostname: &str) -> HostSample {
        HostSample {
            cpu_user_percent: Some(22.0),
            memory_used_percent: Some(41.5),
            disks: vec![
                DiskUsage::new("/", 50.0),
                DiskUsage::new("/var/lib/kafka/data", 75.0),
                DiskUsage::new("/var/log/kafka-logs", 30.0),
                DiskUsage::new("/tmp", 10.0),
                DiskUsage::new("/mnt/kafka-data", 80.0),
            ],
            ..HostSample::new(hostname)
        }
    }

    #[test]
    fn test_disk_classification() {
        let patterns = ShimConfig::default().storage_patterns().unwrap();
        let classified = patterns.classify(&host_sample("h").disks);

        assert_eq!(classified.root, Some(50.0));
        assert_eq!(classified.data, Some(80.0));
        assert_eq!(classified.log, Some(30.0));
    }

    #[test]
    fn test_correlator_sets_host_fields() {
        let store = Arc::new(HostSampleStore::new());
        store.record(host_sample("KAFKA-1"));
        let correlator = SystemCorrelator::new(
            Some(store as Arc<dyn SystemSampleSource>),
            ShimConfig::default().storage_patterns().unwrap(),
        );

        let mut entity = broker_entity(1);
        assert_eq!(correlator.correlate(&mut entity, "kafka-1"), Correlation::Applied);

        assert_eq!(entity.metric_f64(HOST_CPU_USER), Some(22.0));
        assert_eq!(entity.metric_f64(HOST_MEMORY_USED), Some(41.5));
        assert_eq!(entity.metric_f64(HOST_ROOT_DISK_USED), Some(50.0));
        assert_eq!(entity.metric_f64(HOST_DATA_DISK_USED), Some(80.0));
        assert_eq!(entity.metric_f64(HOST_LOG_DISK_USED), Some(30.0));
        assert_eq!(entity.metric(HOST_CPU_IDLE), None);

        assert_eq!(correlator.correlate(&mut entity, "kafka-2"), Correlation::NoSample);
    }

    #[test]
    fn test_correlator_without_source() {
        let correlator = SystemCorrelator::new(None, ShimConfig::default().storage_patterns().unwrap());
        let mut entity = broker_entity(1);
        assert_eq!(correlator.correlate(&mut entity, "kafka-1"), Correlation::NoSource);
        assert_eq!(entity.metric_count(), 0);
    }

    #[test]
    fn test_host_store_keeps_newest_sample() {
        let store = HostSampleStore::new();
        let mut newer = host_sample("kafka-1");
        newer.timestamp = Timestamp::from_millis(2_000);
        newer.cpu_user_percent = Some(30.0);
        let mut older = host_sample("kafka-1");
        older.timestamp = Timestamp::from_millis(1_000);

        store.record(newer);
        store.record(older);

        let latest = store.latest_sample("kafka-1").unwrap().unwrap();
        assert_eq!(latest.cpu_user_percent, Some(30.0));
        assert_eq!(store.len(), 1);
    }

    // ------------------------------------------------------------------------
    // Consumer lag
    // ------------------------------------------------------------------------

    #[test]
    fn test_lag_is_clamped_at_zero() {
        assert_eq!(PartitionOffset::new(0, 100, 120).lag(), Some(0));
        assert_eq!(PartitionOffset::new(0, 500, 400).lag(), Some(100));

        let uncommitted = PartitionOffset {
            partition: 2,
            latest_offset: 10,
            committed_offset: None,
        };
        assert_eq!(uncommitted.lag(), None);

        let lag = GroupLag::from_offsets(&[
            PartitionOffset::new(0, 100, 120),
            PartitionOffset::new(1, 500, 400),
            uncommitted,
        ]);
        assert_eq!(lag.total_lag, 100);
        assert_eq!(lag.max_partition_lag, 100);
        assert_eq!(lag.partitions, 2);
        assert_eq!(lag.uncommitted_partitions, 1);
    }

    #[test]
    fn test_lag_seconds_from_message_rate() {
        let enricher = ConsumerLagEnricher::new(true);
        enricher.record("orders", "billing", &[PartitionOffset::new(0, 6_000, 1_000)]);

        let mut entity = topic_entity("orders");
        entity.set_metric(TOPIC_MESSAGES_IN, 1000.0);
        assert!(enricher.enrich_topic(&mut entity, "orders"));

        assert_eq!(entity.metric(TOPIC_CONSUMER_LAG), Some(&MetricValue::Int(5000)));
        assert_eq!(entity.metric_f64(TOPIC_LAG_SECONDS), Some(5.0));
    }

    #[test]
    fn test_topic_lag_reports_worst_group() {
        let enricher = ConsumerLagEnricher::new(true);
        enricher.record("orders", "billing", &[PartitionOffset::new(0, 6_000, 1_000)]);
        enricher.record("orders", "audit", &[
            PartitionOffset::new(0, 300, 200),
            PartitionOffset::new(1, 300, 200),
        ]);
        enricher.record("payments", "billing", &[PartitionOffset::new(0, 50, 20)]);

        let lag = enricher.topic_lag("orders").unwrap();
        assert_eq!(lag.consumer_lag, 5000);
        assert_eq!(lag.sum_lag, 5200);
        assert_eq!(lag.max_partition_lag, 5000);
        assert_eq!(lag.groups, 2);

        // No message rate: lag seconds stays unset
        let mut entity = topic_entity("orders");
        enricher.enrich_topic(&mut entity, "orders");
        assert_eq!(entity.metric(TOPIC_LAG_SECONDS), None);

        assert_eq!(enricher.cluster_totals(), Some((5000, 5230)));
        enricher.reset();
        assert_eq!(enricher.cluster_totals(), None);
        assert!(enricher.topic_lag("orders").is_none());
    }

    // ------------------------------------------------------------------------
    // Fallback generator
    // ------------------------------------------------------------------------

    fn seeded(seed: u64) -> FallbackGenerator {
        FallbackGenerator::new(FallbackConfig {
            seed: Some(seed),
            ..FallbackConfig::default()
        })
    }

    #[test]
    fn test_enhanced_after_threshold_empty_cycles() {
        let fallback = seeded(7);
        let guid = EntityGuid::broker("123", "prod", 1);

        for cycle in 0..5 {
            assert_eq!(fallback.observe(&guid, cycle, true), CollectionMode::Normal, "cycle {}", cycle);
        }
        assert_eq!(fallback.observe(&guid, 5, true), CollectionMode::Enhanced);
        assert_eq!(fallback.mode(&guid), CollectionMode::Enhanced);
        assert_eq!(fallback.enhanced_count(), 1);
    }

    #[test]
    fn test_empty_map_counts_once_per_cycle() {
        let fallback = seeded(7);
        let guid = EntityGuid::topic("123", "prod", "orders");

        for _ in 0..20 {
            assert_eq!(fallback.observe(&guid, 0, true), CollectionMode::Normal);
        }
    }

    #[test]
    fn test_synthetic_values_stay_in_range_with_bounded_jitter() {
        let fallback = seeded(11);
        let guid = EntityGuid::broker("123", "prod", 1);

        let mut previous: Option<f64> = None;
        for cycle in 0..200 {
            let values: BTreeMap<_, _> = fallback
                .synthesize(&guid, EntityType::Broker, cycle)
                .into_iter()
                .collect();
            let bytes_in = values[BROKER_BYTES_IN].as_f64().unwrap();
            assert!((50_000.0..=150_000.0).contains(&bytes_in), "bytes in {}", bytes_in);

            let idle = values["provider.requestHandlerAvgIdlePercent.Average"].as_f64().unwrap();
            assert!((85.0..=95.0).contains(&idle));

            if let Some(prev) = previous {
                let change = (bytes_in - prev).abs() / prev;
                assert!(change <= DEFAULT_JITTER_MAX + 1e-9, "change {}", change);
            }
            previous = Some(bytes_in);

            assert_eq!(values[BROKER_UNDER_REPLICATED], MetricValue::Int(0));
            assert_eq!(values[BROKER_OFFLINE_PARTITIONS], MetricValue::Int(0));
        }
    }

    #[test]
    fn test_synthesize_is_stable_within_a_cycle() {
        let fallback = seeded(3);
        let guid = EntityGuid::topic("123", "prod", "orders");

        let first = fallback.synthesize(&guid, EntityType::Topic, 4);
        let again = fallback.synthesize(&guid, EntityType::Topic, 4);
        assert_eq!(first, again);

        let values: BTreeMap<_, _> = first.into_iter().collect();
        assert_eq!(values["provider.partitionCount"], MetricValue::Int(3));
        assert_eq!(values["provider.replicationFactor"], MetricValue::Int(3));
        assert_eq!(values["provider.minInSyncReplicas"], MetricValue::Int(2));

        let next: BTreeMap<_, _> = fallback
            .synthesize(&guid, EntityType::Topic, 5)
            .into_iter()
            .collect();
        assert_eq!(next["provider.partitionCount"], MetricValue::Int(3));
    }

    #[test]
    fn test_held_integers_do_not_drift() {
        let fallback = seeded(5);
        let guid = EntityGuid::broker("123", "prod", 1);

        let partitions: Vec<MetricValue> = (0..10)
            .map(|cycle| {
                fallback
                    .synthesize(&guid, EntityType::Broker, cycle)
                    .into_iter()
                    .find(|(field, _)| *field == BROKER_PARTITION_COUNT)
                    .map(|(_, v)| v)
                    .unwrap()
            })
            .collect();
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_first_real_sample_ends_enhanced_mode() {
        let fallback = FallbackGenerator::new(FallbackConfig {
            empty_cycle_threshold: 1,
            seed: Some(1),
            ..FallbackConfig::default()
        });
        let guid = EntityGuid::broker("123", "prod", 1);

        fallback.observe(&guid, 0, true);
        assert_eq!(fallback.observe(&guid, 1, true), CollectionMode::Enhanced);
        assert_eq!(fallback.observe(&guid, 2, false), CollectionMode::Normal);
        assert_eq!(fallback.enhanced_count(), 0);

        // The count starts over
        assert_eq!(fallback.observe(&guid, 3, true), CollectionMode::Normal);
        assert_eq!(fallback.observe(&guid, 4, true), CollectionMode::Enhanced);
    }

    #[test]
    fn test_forced_mode() {
        let fallback = FallbackGenerator::new(FallbackConfig {
            forced: true,
            ..FallbackConfig::default()
        });
        let guid = EntityGuid::broker("123", "prod", 1);
        assert_eq!(fallback.observe(&guid, 0, false), CollectionMode::Enhanced);
    }

    #[test]
    fn test_seeded_series_are_reproducible() {
        let guid = EntityGuid::broker("123", "prod", 1);
        let series = |fallback: &FallbackGenerator| -> Vec<Vec<(&'static str, MetricValue)>> {
            (0..5).map(|c| fallback.synthesize(&guid, EntityType::Broker, c)).collect()
        };

        assert_eq!(series(&seeded(99)), series(&seeded(99)));
        assert_ne!(series(&seeded(99)), series(&seeded(100)));
    }

    #[test]
    fn test_single_synthetic_controller() {
        let fallback = seeded(2);
        let controllers: i64 = (1..=3)
            .map(|id| {
                let guid = EntityGuid::broker("123", "prod", id);
                fallback
                    .synthesize(&guid, EntityType::Broker, 0)
                    .into_iter()
                    .find(|(field, _)| *field == BROKER_ACTIVE_CONTROLLER)
                    .and_then(|(_, v)| v.as_i64())
                    .unwrap()
            })
            .sum();
        assert_eq!(controllers, 1);

        // Releasing the controller lets another broker take over
        fallback.forget(&EntityGuid::broker("123", "prod", 1));
        let guid = EntityGuid::broker("123", "prod", 2);
        let claim = fallback
            .synthesize(&guid, EntityType::Broker, 1)
            .into_iter()
            .find(|(field, _)| *field == BROKER_ACTIVE_CONTROLLER)
            .and_then(|(_, v)| v.as_i64());
        assert_eq!(claim, Some(1));
    }
}

// ============================================================================
// SECTION 22: SHIM TESTS
// ============================================================================

#[cfg(test)]
mod shim_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config() -> ShimConfig {
        let mut config = ShimConfig::for_cluster("prod");
        config.account_id = "123".into();
        config.fallback.seed = Some(42);
        config
    }

    fn shim_with(config: ShimConfig) -> (MskShim, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let shim = MskShim::new(config, publisher.clone()).unwrap();
        (shim, publisher)
    }

    fn broker_raw(bytes_in: f64, under_replicated: i64, controller: i64) -> RawSample {
        RawSample::new()
            .with("broker.bytesInPerSecond", bytes_in)
            .with("broker.underReplicatedPartitions", under_replicated)
            .with("broker.ActiveControllerCount", controller)
            .with("broker.partitionCount", 4)
    }

    fn topic_raw(bytes_in: f64, messages_in: f64) -> RawSample {
        RawSample::new()
            .with("topic.bytesInPerSecond", bytes_in)
            .with("topic.messagesInPerSecond", messages_in)
    }

    #[test]
    fn test_construction_fails_fast() {
        let missing = ShimBuilder::new().build();
        assert!(matches!(missing, Err(ShimError::Config(ConfigError::MissingConfig))));

        let disabled = ShimBuilder::new().config(ShimConfig::default()).build();
        assert!(matches!(disabled, Err(ShimError::Config(ConfigError::Disabled))));

        let mut invalid = test_config();
        invalid.log_mount_regex = "(unclosed".into();
        let invalid = ShimBuilder::new().config(invalid).build();
        assert!(matches!(invalid, Err(ShimError::Config(ConfigError::InvalidValue { .. }))));

        assert!(ShimBuilder::new().config(test_config()).build().is_ok());
    }

    #[test]
    fn test_end_to_end_cycle() {
        let (shim, publisher) = shim_with(test_config());

        shim.transform_broker_metrics(1, &broker_raw(1000.0, 2, 1)).unwrap();
        shim.transform_broker_metrics(2, &broker_raw(2000.0, 5, 0)).unwrap();
        shim.transform_broker_metrics(3, &broker_raw(3000.0, 0, 0)).unwrap();
        shim.transform_topic_metrics("orders", &topic_raw(10.0, 1.0)).unwrap();
        shim.transform_topic_metrics("payments", &topic_raw(20.0, 2.0)).unwrap();

        let report = shim.flush().unwrap();
        assert_eq!(report.cycle, 0);
        assert!(report.cluster_updated);
        assert_eq!(report.published, 6);
        assert_eq!(report.batches, 1);
        assert_eq!(shim.cycle(), 1);

        let records = publisher.records();
        assert_eq!(records.len(), 6);

        let cluster = &records[0];
        assert_eq!(cluster.entity_type, EntityType::Cluster);
        assert_eq!(cluster.guid.as_str(), "123|INFRA|AWSMSKCLUSTER|cHJvZDoxMjM=");
        assert_eq!(cluster.entity_name, "123:us-east-1:prod");
        assert_eq!(cluster.event_type, "AwsMskClusterSample");
        assert_eq!(cluster.get_f64("provider.bytesInPerSec.Sum"), Some(6000.0));
        assert_eq!(cluster.get_i64("provider.underReplicatedPartitions.Maximum"), Some(5));
        assert_eq!(cluster.get_i64("provider.activeControllerCount.Maximum"), Some(1));
        assert_eq!(cluster.get_i64("provider.brokerCount"), Some(3));
        assert_eq!(cluster.get_i64("provider.globalTopicCount"), Some(2));
        assert_eq!(cluster.get_i64("provider.globalPartitionCount"), Some(12));
        assert!(cluster.get("provider.clusterArn").is_some());
        assert!(!cluster.is_synthetic());

        let brokers: Vec<_> = records.iter().filter(|r| r.entity_type == EntityType::Broker).collect();
        let topics: Vec<_> = records.iter().filter(|r| r.entity_type == EntityType::Topic).collect();
        assert_eq!(brokers.len(), 3);
        assert_eq!(topics.len(), 2);

        let stats = shim.stats();
        assert_eq!(stats.brokers_transformed, 3);
        assert_eq!(stats.topics_transformed, 2);
        assert_eq!(stats.records_published, 6);
        assert_eq!(stats.flushes, 1);
    }

    #[test]
    fn test_flush_without_transforms_leaves_cluster_unchanged() {
        let (shim, publisher) = shim_with(test_config());
        shim.transform_broker_metrics(1, &broker_raw(1000.0, 0, 1)).unwrap();

        let first = shim.flush().unwrap();
        assert!(first.cluster_updated);
        let cluster_before = shim.cluster_record().unwrap();

        let second = shim.flush().unwrap();
        assert!(!second.cluster_updated);
        assert_eq!(second.cycle, 1);
        assert_eq!(shim.cluster_record().unwrap(), cluster_before);

        // Both flushes published the same cluster snapshot
        let clusters: Vec<_> = publisher
            .records()
            .into_iter()
            .filter(|r| r.entity_type == EntityType::Cluster)
            .collect();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], clusters[1]);
    }

    #[test]
    fn test_flush_before_any_transform() {
        let (shim, publisher) = shim_with(test_config());
        let report = shim.flush().unwrap();

        assert!(!report.cluster_updated);
        assert_eq!(report.published, 0);
        assert!(shim.cluster_record().is_none());
        assert!(publisher.batches().is_empty());
    }

    #[test]
    fn test_records_are_published_in_batches() {
        let mut config = test_config();
        config.batch_size = 2;
        let (shim, publisher) = shim_with(config);

        shim.transform_broker_metrics(1, &broker_raw(1.0, 0, 1)).unwrap();
        shim.transform_topic_metrics("a", &topic_raw(1.0, 1.0)).unwrap();
        shim.transform_topic_metrics("b", &topic_raw(1.0, 1.0)).unwrap();
        shim.transform_topic_metrics("c", &topic_raw(1.0, 1.0)).unwrap();

        let report = shim.flush().unwrap();
        assert_eq!(report.published, 5);
        assert_eq!(report.batches, 3);

        let sizes: Vec<usize> = publisher.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_concurrent_transforms() {
        let (shim, _publisher) = shim_with(test_config());

        std::thread::scope(|scope| {
            for broker_id in 0..8 {
                let shim = &shim;
                scope.spawn(move || {
                    shim.transform_broker_metrics(broker_id, &broker_raw(100.0, 0, i64::from(broker_id == 0)))
                        .unwrap();
                    shim.transform_topic_metrics("orders", &topic_raw(10.0, 1.0)).unwrap();
                });
            }
        });

        assert_eq!(shim.cached_entities(), 9);
        let topic = shim.topic_record("orders").unwrap();
        assert_eq!(topic.get_f64("provider.bytesInPerSec.Sum"), Some(80.0));

        shim.flush().unwrap();
        let cluster = shim.cluster_record().unwrap();
        assert_eq!(cluster.get_i64("provider.brokerCount"), Some(8));
        assert_eq!(cluster.get_f64("provider.bytesInPerSec.Sum"), Some(800.0));
        assert_eq!(cluster.get_i64("provider.globalTopicCount"), Some(1));
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let (shim, _publisher) = shim_with(test_config());

        let broker = shim.transform_broker_metrics(-1, &RawSample::new());
        assert!(matches!(
            broker,
            Err(ShimError::Transform(TransformError::InvalidBrokerId { broker_id: -1 }))
        ));

        let topic = shim.transform_topic_metrics(" ", &RawSample::new());
        assert!(matches!(topic, Err(ShimError::Transform(TransformError::EmptyTopicName))));

        assert_eq!(shim.error_stats().count_by_category("transform"), 2);
        assert_eq!(shim.cached_entities(), 0);
    }

    #[test]
    fn test_stale_entities_are_evicted() {
        let mut config = test_config();
        config.entity_ttl_cycles = 1;
        let (shim, _publisher) = shim_with(config);

        shim.transform_broker_metrics(1, &broker_raw(1.0, 0, 1)).unwrap();
        shim.transform_broker_metrics(2, &broker_raw(1.0, 0, 0)).unwrap();
        assert_eq!(shim.flush().unwrap().evicted, 0);

        shim.transform_broker_metrics(1, &broker_raw(1.0, 0, 1)).unwrap();
        let report = shim.flush().unwrap();

        assert_eq!(report.evicted, 1);
        assert!(shim.broker_record(1).is_some());
        assert!(shim.broker_record(2).is_none());
        // The cluster survives even when nothing reports
        shim.flush().unwrap();
        shim.flush().unwrap();
        assert!(shim.cluster_record().is_some());
    }

    #[test]
    fn test_evicted_enhanced_broker_starts_over() {
        let mut config = test_config();
        config.entity_ttl_cycles = 1;
        let (shim, _publisher) = shim_with(config);
        let quiet = EntityGuid::broker("123", "prod", 1);
        let recovering = EntityGuid::broker("123", "prod", 3);

        for _ in 0..6 {
            shim.transform_broker_metrics(1, &RawSample::new()).unwrap();
            shim.transform_broker_metrics(3, &RawSample::new()).unwrap();
            shim.transform_broker_metrics(2, &broker_raw(1.0, 0, 1)).unwrap();
            shim.flush().unwrap();
        }
        assert_eq!(shim.collection_mode(&quiet), CollectionMode::Enhanced);
        assert_eq!(shim.collection_mode(&recovering), CollectionMode::Enhanced);

        shim.transform_broker_metrics(2, &broker_raw(1.0, 0, 1)).unwrap();
        assert_eq!(shim.flush().unwrap().evicted, 2);
        assert!(shim.broker_record(1).is_none());
        assert_eq!(shim.collection_mode(&quiet), CollectionMode::Normal);
        assert_eq!(shim.collection_mode(&recovering), CollectionMode::Normal);

        let record = shim.transform_broker_metrics(3, &broker_raw(700.0, 0, 0)).unwrap();
        assert!(!record.is_synthetic());
        assert_eq!(record.get_f64(BROKER_BYTES_IN), Some(700.0));
        assert_eq!(record.get(HOST_CPU_USER), None);

        // The empty-cycle count restarts from zero
        for _ in 0..5 {
            let record = shim.transform_broker_metrics(1, &RawSample::new()).unwrap();
            assert!(!record.is_synthetic());
            assert_eq!(record.get("provider.bytesRejectedPerSec.Average"), None);
            shim.transform_broker_metrics(2, &broker_raw(1.0, 0, 1)).unwrap();
            shim.transform_broker_metrics(3, &broker_raw(700.0, 0, 0)).unwrap();
            shim.flush().unwrap();
            assert_eq!(shim.collection_mode(&quiet), CollectionMode::Normal);
        }
        let record = shim.transform_broker_metrics(1, &RawSample::new()).unwrap();
        assert!(record.is_synthetic());
        assert_eq!(record.get_i64(BROKER_ACTIVE_CONTROLLER), Some(1));
    }

    #[test]
    fn test_brokers_published_in_numeric_order() {
        let (shim, publisher) = shim_with(test_config());
        for id in [10, 2, 1] {
            shim.transform_broker_metrics(id, &broker_raw(1.0, 0, 0)).unwrap();
        }
        shim.transform_topic_metrics("orders", &topic_raw(1.0, 1.0)).unwrap();
        shim.flush().unwrap();

        let order: Vec<(EntityType, Option<i64>)> = publisher
            .records()
            .iter()
            .map(|r| (r.entity_type, r.broker_id()))
            .collect();
        assert_eq!(
            order,
            vec![
                (EntityType::Cluster, None),
                (EntityType::Broker, Some(1)),
                (EntityType::Broker, Some(2)),
                (EntityType::Broker, Some(10)),
                (EntityType::Topic, None),
            ]
        );
    }

    #[test]
    fn test_consumer_lag_disabled_is_noop() {
        let (shim, publisher) = shim_with(test_config());
        shim.transform_topic_metrics("orders", &topic_raw(10.0, 1000.0)).unwrap();

        let offsets = [PartitionOffset::new(0, 6_000, 1_000)];
        assert_eq!(shim.process_consumer_offset("orders", "billing", Ok(&offsets)).unwrap(), None);

        shim.flush().unwrap();
        let topic = shim.topic_record("orders").unwrap();
        assert!(topic.get(TOPIC_CONSUMER_LAG).is_none());
        assert_eq!(shim.stats().offsets_processed, 0);
        assert_eq!(publisher.records().len(), 2);
    }

    #[test]
    fn test_consumer_lag_enrichment() {
        let mut config = test_config();
        config.consumer_lag_enrichment = true;
        let (shim, _publisher) = shim_with(config);

        shim.transform_topic_metrics("orders", &topic_raw(10.0, 1000.0)).unwrap();
        let offsets = [PartitionOffset::new(0, 6_000, 1_000), PartitionOffset::new(1, 100, 120)];
        let lag = shim
            .process_consumer_offset("orders", "billing", Ok(&offsets))
            .unwrap()
            .unwrap();
        assert_eq!(lag.total_lag, 5000);

        shim.flush().unwrap();

        let topic = shim.topic_record("orders").unwrap();
        assert_eq!(topic.get_i64(TOPIC_CONSUMER_LAG), Some(5000));
        assert_eq!(topic.get_f64(TOPIC_LAG_SECONDS), Some(5.0));
        assert_eq!(topic.get_i64(TOPIC_CONSUMER_GROUPS), Some(1));

        let cluster = shim.cluster_record().unwrap();
        assert_eq!(cluster.get_i64(TOPIC_MAX_OFFSET_LAG), Some(5000));
        assert_eq!(cluster.get_i64(TOPIC_SUM_OFFSET_LAG), Some(5000));
    }

    #[test]
    fn test_enrichment_failure_still_emits_topic() {
        let mut config = test_config();
        config.consumer_lag_enrichment = true;
        let (shim, publisher) = shim_with(config);

        shim.transform_topic_metrics("orders", &topic_raw(10.0, 1000.0)).unwrap();
        let result = shim.process_consumer_offset(
            "orders",
            "billing",
            Err(EnrichmentError::admin_api("request timed out")),
        );
        assert_eq!(result.unwrap(), None);

        shim.flush().unwrap();
        let topic = publisher
            .records()
            .into_iter()
            .find(|r| r.entity_type == EntityType::Topic)
            .unwrap();
        assert!(topic.get(TOPIC_CONSUMER_LAG).is_none());
        assert_eq!(topic.get_f64("provider.bytesInPerSec.Sum"), Some(10.0));

        assert_eq!(shim.stats().enrichment_failures, 1);
        assert_eq!(shim.error_stats().count_by_category("enrichment"), 1);
    }

    #[test]
    fn test_empty_group_name_is_rejected() {
        let mut config = test_config();
        config.consumer_lag_enrichment = true;
        let (shim, _publisher) = shim_with(config);

        let result = shim.process_consumer_offset("orders", "", Ok(&[]));
        assert!(matches!(
            result,
            Err(ShimError::Transform(TransformError::EmptyGroupName { .. }))
        ));
    }

    #[test]
    fn test_host_correlation_through_shim() {
        let hosts = Arc::new(HostSampleStore::new());
        hosts.record(HostSample {
            cpu_user_percent: Some(33.0),
            disks: vec![DiskUsage::new("/var/lib/kafka/data", 64.0)],
            ..HostSample::new("kafka-1")
        });
        let shim = MskShim::builder()
            .config(test_config())
            .publisher(Arc::new(MemoryPublisher::new()))
            .system_source(hosts)
            .build()
            .unwrap();

        let raw = broker_raw(1.0, 0, 1).with("broker.host", "kafka-1");
        let record = shim.transform_broker_metrics(1, &raw).unwrap();

        assert_eq!(record.get_f64(HOST_CPU_USER), Some(33.0));
        assert_eq!(record.get_f64(HOST_DATA_DISK_USED), Some(64.0));
        assert_eq!(shim.stats().correlations_applied, 1);
    }

    #[test]
    fn test_enhanced_mode_end_to_end() {
        let (shim, _publisher) = shim_with(test_config());
        let guid = EntityGuid::broker("123", "prod", 1);

        for _ in 0..5 {
            let record = shim.transform_broker_metrics(1, &RawSample::new()).unwrap();
            assert!(!record.is_synthetic());
            assert_eq!(record.get(BROKER_BYTES_IN), None);
            shim.flush().unwrap();
        }

        let record = shim.transform_broker_metrics(1, &RawSample::new()).unwrap();
        assert!(record.is_synthetic());
        assert_eq!(shim.collection_mode(&guid), CollectionMode::Enhanced);
        let bytes_in = record.get_f64(BROKER_BYTES_IN).unwrap();
        assert!((50_000.0..=150_000.0).contains(&bytes_in));
        assert_eq!(record.get_i64(BROKER_ACTIVE_CONTROLLER), Some(1));

        shim.flush().unwrap();
        let cluster = shim.cluster_record().unwrap();
        assert!(cluster.is_synthetic());
        assert_eq!(cluster.get_i64("provider.offlinePartitionsCount.Maximum"), Some(0));

        let record = shim.transform_broker_metrics(1, &broker_raw(512.0, 0, 1)).unwrap();
        assert!(!record.is_synthetic());
        assert_eq!(record.get_f64(BROKER_BYTES_IN), Some(512.0));
        assert_eq!(record.get("provider.cpuUser.Average"), None);
        assert_eq!(shim.collection_mode(&guid), CollectionMode::Normal);
        assert_eq!(shim.stats().synthetic_records, 1);
    }

    #[test]
    fn test_forced_enhanced_mode() {
        let mut config = test_config();
        config.fallback.forced = true;
        let (shim, _publisher) = shim_with(config);

        let broker = shim.transform_broker_metrics(1, &broker_raw(1.0, 0, 1)).unwrap();
        let topic = shim.transform_topic_metrics("orders", &topic_raw(1.0, 1.0)).unwrap();

        assert!(broker.is_synthetic());
        assert!(topic.is_synthetic());
        assert_eq!(topic.get_i64("provider.partitionCount"), Some(3));
        assert_eq!(topic.get("provider.topic"), Some(&MetricValue::from("orders")));
    }

    #[test]
    fn test_json_lines_publisher() {
        let (shim, _publisher) = shim_with(test_config());
        shim.transform_broker_metrics(1, &broker_raw(1024.5, 0, 1)).unwrap();
        let record = shim.broker_record(1).unwrap();

        let publisher = JsonLinesPublisher::new(Vec::new());
        publisher.publish(&[record.clone(), record]).unwrap();
        let output = String::from_utf8(publisher.into_inner()).unwrap();

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: JsonValue = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["eventType"], "AwsMskBrokerSample");
        assert_eq!(parsed["entityType"], "AWSMSKBROKER");
        assert_eq!(parsed["dataSource"], "real");
        assert_eq!(parsed["provider.bytesInPerSec.Average"], 1024.5);
        assert_eq!(parsed["provider.brokerId"], 1);

        let back: EntityRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.get_f64(BROKER_BYTES_IN), Some(1024.5));
    }

    #[test]
    fn test_builtin_fixture_replay() {
        let hosts = HostSampleStore::new();
        let (shim, publisher) = shim_with(test_config());
        let fixture = ReplayFixture::builtin();

        let report = replay_cycle(&shim, &fixture.cycles[0], &hosts).unwrap();
        assert_eq!(report.published, 3);

        let broker = shim.broker_record(1).unwrap();
        assert_eq!(broker.get_f64(BROKER_BYTES_IN), Some(1024.5));
        let idle = broker.get_f64("provider.requestHandlerAvgIdlePercent.Average").unwrap();
        assert!((idle - 85.0).abs() < 1e-9);
        assert_eq!(publisher.records()[0].entity_type, EntityType::Cluster);
    }

    #[test]
    fn test_fixture_file_replay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
  "cycles": [
    {{
      "brokers": [
        {{ "id": 1, "metrics": {{ "broker.bytesInPerSecond": 100, "broker.host": "kafka-1" }} }},
        {{ "id": -4, "metrics": {{}} }}
      ],
      "topics": [ {{ "name": "orders", "metrics": {{ "topic.messagesInPerSecond": 10 }} }} ],
      "hosts": [ {{ "hostname": "kafka-1", "cpuUserPercent": 12.5 }} ],
      "offsets": [
        {{ "topic": "orders", "group": "g1", "partitions": [ {{ "partition": 0, "latestOffset": 50, "committedOffset": 30 }} ] }},
        {{ "topic": "orders", "group": "g2", "error": "coordinator not available" }}
      ]
    }}
  ]
}}"#
        )
        .unwrap();

        let fixture = ReplayFixture::load(file.path()).unwrap();
        let mut config = test_config();
        config.consumer_lag_enrichment = true;
        let hosts = Arc::new(HostSampleStore::new());
        let shim = MskShim::builder()
            .config(config)
            .publisher(Arc::new(MemoryPublisher::new()))
            .system_source(hosts.clone())
            .build()
            .unwrap();

        let report = replay_cycle(&shim, &fixture.cycles[0], &hosts).unwrap();
        assert_eq!(report.published, 3);

        let broker = shim.broker_record(1).unwrap();
        assert_eq!(broker.get_f64(HOST_CPU_USER), Some(12.5));
        let topic = shim.topic_record("orders").unwrap();
        assert_eq!(topic.get_i64(TOPIC_CONSUMER_LAG), Some(20));
        assert_eq!(topic.get_f64(TOPIC_LAG_SECONDS), Some(2.0));

        let stats = shim.stats();
        assert_eq!(stats.enrichment_failures, 1);
        assert_eq!(shim.error_stats().count_by_category("transform"), 1);
    }

    #[tokio::test]
    async fn test_run_replay_stops_after_cycles() {
        let mut config = test_config();
        config.flush_interval = Duration::from_millis(100);
        let publisher = Arc::new(MemoryPublisher::new());
        let hosts = Arc::new(HostSampleStore::new());
        let shim = Arc::new(
            MskShim::builder()
                .config(config)
                .publisher(publisher.clone())
                .system_source(hosts.clone())
                .build()
                .unwrap(),
        );

        let completed = run_replay(shim.clone(), ReplayFixture::builtin(), hosts, Some(2))
            .await
            .unwrap();

        assert_eq!(completed, 2);
        assert_eq!(shim.cycle(), 2);
        assert_eq!(shim.stats().flushes, 2);
        assert_eq!(publisher.batches().len(), 2);
    }
}
