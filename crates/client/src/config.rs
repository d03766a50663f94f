//! Client configuration.
//!
//! Configuration is plain data: it derives `serde` for loading by an outer
//! layer and is validated at construction time via fallible `bon` builders.
//! Post-deserialization validation is available via
//! [`ClientConfig::validate`], which checks every section.
//!
//! Durations serialize in human-readable form (`"250ms"`, `"30s"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use url::Url;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation { message: message.into() }
}

// =========================================================================
// Node selection
// =========================================================================

/// How calls are spread across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeSelectionStrategy {
    /// Score every host by load and recent failures; pick the lowest.
    #[default]
    Balanced,
    /// Stick to one host until a call on it fails, optionally reshuffling
    /// on a fixed interval.
    PinUntilError,
    /// Like [`PinUntilError`](Self::PinUntilError) but never reshuffles.
    PinUntilErrorWithoutReshuffle,
}

impl std::fmt::Display for NodeSelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "BALANCED"),
            Self::PinUntilError => write!(f, "PIN_UNTIL_ERROR"),
            Self::PinUntilErrorWithoutReshuffle => write!(f, "PIN_UNTIL_ERROR_WITHOUT_RESHUFFLE"),
        }
    }
}

fn default_failure_half_life() -> Duration {
    Duration::from_secs(30)
}

fn default_overload_penalty() -> f64 {
    5.0
}

fn default_failure_penalty() -> f64 {
    10.0
}

/// Node selection configuration.
///
/// # Validation Rules
///
/// - `reshuffle_interval`, if set, must be > 0
/// - `failure_half_life` must be > 0
/// - penalties must be finite and >= 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSelectionConfig {
    /// Selection strategy.
    #[serde(default)]
    pub strategy: NodeSelectionStrategy,
    /// Periodic re-pin interval for [`NodeSelectionStrategy::PinUntilError`].
    #[serde(default, with = "humantime_serde::option")]
    pub reshuffle_interval: Option<Duration>,
    /// Seed for selection randomness. `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Half-life of the balanced failure penalty.
    #[serde(default = "default_failure_half_life", with = "humantime_serde")]
    pub failure_half_life: Duration,
    /// Penalty added for an overload response (429/503).
    #[serde(default = "default_overload_penalty")]
    pub overload_penalty: f64,
    /// Penalty added for a host-level failure.
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: f64,
}

#[bon::bon]
impl NodeSelectionConfig {
    /// Creates a new node selection configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default)] strategy: NodeSelectionStrategy,
        reshuffle_interval: Option<Duration>,
        seed: Option<u64>,
        #[builder(default = default_failure_half_life())] failure_half_life: Duration,
        #[builder(default = default_overload_penalty())] overload_penalty: f64,
        #[builder(default = default_failure_penalty())] failure_penalty: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            strategy,
            reshuffle_interval,
            seed,
            failure_half_life,
            overload_penalty,
            failure_penalty,
        };
        config.validate()?;
        Ok(config)
    }
}

impl NodeSelectionConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reshuffle_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(invalid("reshuffle_interval must be > 0 when set"));
        }
        if self.failure_half_life.is_zero() {
            return Err(invalid("failure_half_life must be > 0"));
        }
        for (name, value) in
            [("overload_penalty", self.overload_penalty), ("failure_penalty", self.failure_penalty)]
        {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{name} must be finite and >= 0, got {value}")));
            }
        }
        Ok(())
    }
}

impl Default for NodeSelectionConfig {
    fn default() -> Self {
        Self {
            strategy: NodeSelectionStrategy::default(),
            reshuffle_interval: None,
            seed: None,
            failure_half_life: default_failure_half_life(),
            overload_penalty: default_overload_penalty(),
            failure_penalty: default_failure_penalty(),
        }
    }
}

// =========================================================================
// Retry
// =========================================================================

fn default_max_retries() -> u32 {
    4
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

/// Retry configuration.
///
/// # Validation Rules
///
/// - `initial_backoff` must be <= `max_backoff`
/// - `multiplier` must be >= 1.0
/// - `jitter` must be in `[0.0, 1.0]`
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use dialogue_client::RetryConfig;
/// let config = RetryConfig::builder()
///     .max_retries(2)
///     .initial_backoff(Duration::from_millis(50))
///     .build()
///     .expect("valid retry config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before the first retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive backoffs.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Relative jitter applied to each backoff (±).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[bon::bon]
impl RetryConfig {
    /// Creates a new retry configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
        #[builder(default = default_multiplier())] multiplier: f64,
        #[builder(default = default_jitter())] jitter: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff, multiplier, jitter };
        config.validate()?;
        Ok(config)
    }
}

impl RetryConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff > self.max_backoff {
            return Err(invalid(format!(
                "initial_backoff ({:?}) must be <= max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid(format!("multiplier must be >= 1.0, got {}", self.multiplier)));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(format!("jitter must be in [0.0, 1.0], got {}", self.jitter)));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

// =========================================================================
// Concurrency limit
// =========================================================================

fn default_initial_limit() -> f64 {
    20.0
}

fn default_min_limit() -> f64 {
    1.0
}

fn default_max_limit() -> f64 {
    1000.0
}

fn default_backoff_ratio() -> f64 {
    0.9
}

fn default_latency_tolerance() -> f64 {
    2.0
}

/// Per-host adaptive concurrency limit configuration.
///
/// # Validation Rules
///
/// - `1.0 <= min_limit <= initial_limit <= max_limit`
/// - `backoff_ratio` must be in `(0.0, 1.0)`
/// - `latency_tolerance` must be >= 1.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimitConfig {
    /// Limit a new host starts with.
    #[serde(default = "default_initial_limit")]
    pub initial_limit: f64,
    /// Floor the limit never shrinks below.
    #[serde(default = "default_min_limit")]
    pub min_limit: f64,
    /// Ceiling the limit never grows above.
    #[serde(default = "default_max_limit")]
    pub max_limit: f64,
    /// Multiplicative decrease applied on overload or host failure.
    #[serde(default = "default_backoff_ratio")]
    pub backoff_ratio: f64,
    /// A success grows the limit only if its latency is within this factor
    /// of the observed minimum.
    #[serde(default = "default_latency_tolerance")]
    pub latency_tolerance: f64,
}

#[bon::bon]
impl ConcurrencyLimitConfig {
    /// Creates a new concurrency limit configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_initial_limit())] initial_limit: f64,
        #[builder(default = default_min_limit())] min_limit: f64,
        #[builder(default = default_max_limit())] max_limit: f64,
        #[builder(default = default_backoff_ratio())] backoff_ratio: f64,
        #[builder(default = default_latency_tolerance())] latency_tolerance: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self { initial_limit, min_limit, max_limit, backoff_ratio, latency_tolerance };
        config.validate()?;
        Ok(config)
    }
}

impl ConcurrencyLimitConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = 1.0 <= self.min_limit
            && self.min_limit <= self.initial_limit
            && self.initial_limit <= self.max_limit
            && self.max_limit.is_finite();
        if !ordered {
            return Err(invalid(format!(
                "limits must satisfy 1 <= min ({}) <= initial ({}) <= max ({})",
                self.min_limit, self.initial_limit, self.max_limit
            )));
        }
        if !(self.backoff_ratio > 0.0 && self.backoff_ratio < 1.0) {
            return Err(invalid(format!(
                "backoff_ratio must be in (0.0, 1.0), got {}",
                self.backoff_ratio
            )));
        }
        if !self.latency_tolerance.is_finite() || self.latency_tolerance < 1.0 {
            return Err(invalid(format!(
                "latency_tolerance must be >= 1.0, got {}",
                self.latency_tolerance
            )));
        }
        Ok(())
    }
}

impl Default for ConcurrencyLimitConfig {
    fn default() -> Self {
        Self {
            initial_limit: default_initial_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            backoff_ratio: default_backoff_ratio(),
            latency_tolerance: default_latency_tolerance(),
        }
    }
}

// =========================================================================
// Blacklist
// =========================================================================

fn default_cooldown() -> Duration {
    Duration::from_secs(2)
}

fn default_cooldown_jitter() -> f64 {
    0.5
}

fn default_overload_threshold() -> u32 {
    3
}

/// Host blacklist configuration.
///
/// # Validation Rules
///
/// - `cooldown` must be > 0
/// - `cooldown_jitter` must be in `[0.0, 1.0]`
/// - `overload_threshold` must be >= 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Base time a failing host is excluded.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Maximum extra fraction of `cooldown` added at random.
    #[serde(default = "default_cooldown_jitter")]
    pub cooldown_jitter: f64,
    /// Consecutive overload responses that blacklist a host.
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: u32,
}

#[bon::bon]
impl BlacklistConfig {
    /// Creates a new blacklist configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_cooldown())] cooldown: Duration,
        #[builder(default = default_cooldown_jitter())] cooldown_jitter: f64,
        #[builder(default = default_overload_threshold())] overload_threshold: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { cooldown, cooldown_jitter, overload_threshold };
        config.validate()?;
        Ok(config)
    }
}

impl BlacklistConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cooldown.is_zero() {
            return Err(invalid("cooldown must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.cooldown_jitter) {
            return Err(invalid(format!(
                "cooldown_jitter must be in [0.0, 1.0], got {}",
                self.cooldown_jitter
            )));
        }
        if self.overload_threshold == 0 {
            return Err(invalid("overload_threshold must be >= 1"));
        }
        Ok(())
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            cooldown_jitter: default_cooldown_jitter(),
            overload_threshold: default_overload_threshold(),
        }
    }
}

// =========================================================================
// DNS
// =========================================================================

fn default_dns_enabled() -> bool {
    true
}

fn default_dns_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_port() -> u16 {
    443
}

/// DNS resolution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolve hostnames in the background. When disabled, hosts are created
    /// without a resolved address and the transport resolves on its own.
    #[serde(default = "default_dns_enabled")]
    pub enabled: bool,
    /// Time between resolution rounds.
    #[serde(default = "default_dns_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Port used when a URI has none and its scheme has no default.
    #[serde(default = "default_port")]
    pub default_port: u16,
}

#[bon::bon]
impl DnsConfig {
    /// Creates a new DNS configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `refresh_interval` is zero.
    #[builder]
    pub fn new(
        #[builder(default = default_dns_enabled())] enabled: bool,
        #[builder(default = default_dns_refresh_interval())] refresh_interval: Duration,
        #[builder(default = default_port())] default_port: u16,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, refresh_interval, default_port };
        config.validate()?;
        Ok(config)
    }
}

impl DnsConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `refresh_interval` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(invalid("refresh_interval must be > 0"));
        }
        Ok(())
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_dns_enabled(),
            refresh_interval: default_dns_refresh_interval(),
            default_port: default_port(),
        }
    }
}

// =========================================================================
// Queue
// =========================================================================

/// Order in which queued calls are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueFairness {
    /// Strict arrival order.
    #[default]
    Fifo,
    /// One FIFO lane per endpoint, visited round-robin.
    RoundRobinByEndpoint,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_stall_retry_delay() -> Duration {
    Duration::from_millis(500)
}

/// Queue configuration.
///
/// # Validation Rules
///
/// - `capacity` must be >= 1
/// - `stall_retry_delay` must be > 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of waiting calls.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Dispatch order.
    #[serde(default)]
    pub fairness: QueueFairness,
    /// Delay before re-running a dispatch pass that stalled with nothing in
    /// flight.
    #[serde(default = "default_stall_retry_delay", with = "humantime_serde")]
    pub stall_retry_delay: Duration,
}

#[bon::bon]
impl QueueConfig {
    /// Creates a new queue configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_queue_capacity())] capacity: usize,
        #[builder(default)] fairness: QueueFairness,
        #[builder(default = default_stall_retry_delay())] stall_retry_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { capacity, fairness, stall_retry_delay };
        config.validate()?;
        Ok(config)
    }
}

impl QueueConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(invalid("queue capacity must be >= 1"));
        }
        if self.stall_retry_delay.is_zero() {
            return Err(invalid("stall_retry_delay must be > 0"));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            fairness: QueueFairness::default(),
            stall_retry_delay: default_stall_retry_delay(),
        }
    }
}

// =========================================================================
// Client
// =========================================================================

fn default_client_name() -> String {
    "dialogue".to_owned()
}

/// Complete pipeline configuration.
///
/// # Example
///
/// ```no_run
/// # use dialogue_client::{ClientConfig, NodeSelectionConfig, NodeSelectionStrategy};
/// let config = ClientConfig::builder()
///     .uris(vec!["https://a.example.com:8443".to_owned(), "https://b.example.com:8443".to_owned()])
///     .node_selection(
///         NodeSelectionConfig::builder()
///             .strategy(NodeSelectionStrategy::PinUntilError)
///             .build()
///             .expect("valid node selection config"),
///     )
///     .client_name("catalog-client")
///     .build()
///     .expect("valid client config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URIs of the upstream hosts.
    #[serde(default)]
    pub uris: Vec<String>,
    /// Node selection configuration.
    #[serde(default)]
    pub node_selection: NodeSelectionConfig,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-host concurrency limit configuration.
    #[serde(default)]
    pub concurrency: ConcurrencyLimitConfig,
    /// Blacklist configuration.
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    /// DNS resolution configuration.
    #[serde(default)]
    pub dns: DnsConfig,
    /// Queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Name used as the `client` metric label and in log events.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

#[bon::bon]
impl ClientConfig {
    /// Creates a new client configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a URI is not an absolute URL
    /// with a host, `client_name` is empty, or any section is invalid.
    #[builder]
    pub fn new(
        #[builder(default)] uris: Vec<String>,
        #[builder(default)] node_selection: NodeSelectionConfig,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] concurrency: ConcurrencyLimitConfig,
        #[builder(default)] blacklist: BlacklistConfig,
        #[builder(default)] dns: DnsConfig,
        #[builder(default)] queue: QueueConfig,
        #[builder(default = default_client_name(), into)] client_name: String,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { uris, node_selection, retry, concurrency, blacklist, dns, queue, client_name };
        config.validate()?;
        Ok(config)
    }
}

impl ClientConfig {
    /// Validates every section.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for uri in &self.uris {
            let parsed =
                Url::parse(uri).map_err(|e| invalid(format!("invalid uri {uri}: {e}")))?;
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err(invalid(format!("uri {uri} has no host")));
            }
        }
        if self.client_name.trim().is_empty() {
            return Err(invalid("client_name cannot be empty"));
        }
        self.node_selection.validate()?;
        self.retry.validate()?;
        self.concurrency.validate()?;
        self.blacklist.validate()?;
        self.dns.validate()?;
        self.queue.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            node_selection: NodeSelectionConfig::default(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyLimitConfig::default(),
            blacklist: BlacklistConfig::default(),
            dns: DnsConfig::default(),
            queue: QueueConfig::default(),
            client_name: default_client_name(),
        }
    }
}
