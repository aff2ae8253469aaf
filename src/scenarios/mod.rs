use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io::Error as IoError;
use std::time::{Duration, Instant};

use ring::error::Unspecified;
use serde_derive::{Deserialize, Serialize};

use crate::ble::error::{AdvertisementError, TransportError};
use crate::ble::transport::DEFAULT_REPLY_LIMIT;
use crate::u2f::error::Error as U2fError;

pub mod advertising;
pub mod transport;
pub mod u2f;

/// Failure of one conformance scenario.
#[derive(Debug)]
pub enum ScenarioError {
    Check(String),
    Transport(TransportError),
    U2f(U2fError),
    Advertisement(AdvertisementError),
    Rng,
}

impl From<TransportError> for ScenarioError {
    fn from(e: TransportError) -> Self {
        ScenarioError::Transport(e)
    }
}

impl From<U2fError> for ScenarioError {
    fn from(e: U2fError) -> Self {
        ScenarioError::U2f(e)
    }
}

impl From<AdvertisementError> for ScenarioError {
    fn from(e: AdvertisementError) -> Self {
        ScenarioError::Advertisement(e)
    }
}

impl From<IoError> for ScenarioError {
    fn from(e: IoError) -> Self {
        ScenarioError::Transport(TransportError::Io(e))
    }
}

impl From<Unspecified> for ScenarioError {
    fn from(_: Unspecified) -> Self {
        ScenarioError::Rng
    }
}

impl StdError for ScenarioError {}

impl Display for ScenarioError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        use ScenarioError::*;
        match self {
            Check(s) => write!(f, "{}", s),
            Transport(e) => e.fmt(f),
            U2f(e) => e.fmt(f),
            Advertisement(e) => e.fmt(f),
            Rng => write!(f, "Random generator failure"),
        }
    }
}

/// Fail the scenario unless two values compare equal.
#[macro_export]
macro_rules! check_eq {
    ($left:expr, $right:expr) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            return Err($crate::scenarios::ScenarioError::Check(format!(
                "{} != {} ({:?} vs {:?})",
                stringify!($left),
                stringify!($right),
                l,
                r
            )));
        }
    }};
}

/// Fail the scenario unless two values compare unequal.
#[macro_export]
macro_rules! check_ne {
    ($left:expr, $right:expr) => {{
        let (l, r) = (&$left, &$right);
        if l == r {
            return Err($crate::scenarios::ScenarioError::Check(format!(
                "{} == {} ({:?})",
                stringify!($left),
                stringify!($right),
                l
            )));
        }
    }};
}

/// Fail the scenario unless the condition holds.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {{
        if !$cond {
            return Err($crate::scenarios::ScenarioError::Check(format!(
                "check failed: {}",
                stringify!($cond)
            )));
        }
    }};
}

/// Log a mismatch, or fail the scenario when the configuration makes
/// warnings fatal. Used for checks the specification words loosely enough
/// that devices in the field get them wrong.
#[macro_export]
macro_rules! warn_eq {
    ($config:expr, $left:expr, $right:expr) => {{
        let (l, r) = (&$left, &$right);
        if l != r {
            if $config.fatal_warnings {
                return Err($crate::scenarios::ScenarioError::Check(format!(
                    "{} != {} ({:?} vs {:?})",
                    stringify!($left),
                    stringify!($right),
                    l,
                    r
                )));
            }
            log::warn!(
                "{} != {} ({:?} vs {:?})",
                stringify!($left),
                stringify!($right),
                l,
                r
            );
        }
    }};
}

/// Knobs shared by every scenario.
#[derive(Debug, Clone)]
pub struct ExerciserConfig {
    /// Per-exchange timeout; zero waits forever.
    pub timeout: Duration,
    /// Reply-buffer capacity handed to the transport.
    pub reply_limit: usize,
    /// Turn `warn_eq!` mismatches into scenario failures.
    pub fatal_warnings: bool,
    /// The device advertises permanently instead of per user action; the
    /// embedder sequences advertising snapshots accordingly.
    pub continuous_advertising: bool,
}

impl ExerciserConfig {
    pub fn builder() -> ExerciserConfigBuilder {
        ExerciserConfigBuilder::new()
    }
}

impl Default for ExerciserConfig {
    fn default() -> Self {
        ExerciserConfigBuilder::new().build()
    }
}

pub struct ExerciserConfigBuilder {
    timeout: Option<Duration>,
    reply_limit: Option<usize>,
    fatal_warnings: Option<bool>,
    continuous_advertising: Option<bool>,
}

impl ExerciserConfigBuilder {
    pub fn new() -> Self {
        ExerciserConfigBuilder {
            timeout: None,
            reply_limit: None,
            fatal_warnings: None,
            continuous_advertising: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn reply_limit(mut self, limit: usize) -> Self {
        self.reply_limit = Some(limit);
        self
    }

    pub fn fatal_warnings(mut self, fatal: bool) -> Self {
        self.fatal_warnings = Some(fatal);
        self
    }

    pub fn continuous_advertising(mut self, continuous: bool) -> Self {
        self.continuous_advertising = Some(continuous);
        self
    }

    pub fn build(self) -> ExerciserConfig {
        let ExerciserConfigBuilder {
            timeout,
            reply_limit,
            fatal_warnings,
            continuous_advertising,
        } = self;

        ExerciserConfig {
            timeout: timeout.unwrap_or_else(|| Duration::from_secs(10)),
            reply_limit: reply_limit.unwrap_or(DEFAULT_REPLY_LIMIT),
            fatal_warnings: fatal_warnings.unwrap_or(false),
            continuous_advertising: continuous_advertising.unwrap_or(false),
        }
    }
}

impl Default for ExerciserConfigBuilder {
    fn default() -> Self {
        ExerciserConfigBuilder::new()
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Accumulated scenario outcomes, serializable for machine consumption.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConformanceReport {
    pub outcomes: Vec<ScenarioOutcome>,
}

impl ConformanceReport {
    pub fn new() -> Self {
        ConformanceReport::default()
    }

    pub fn record(&mut self, name: &str, result: &Result<(), ScenarioError>, elapsed: Duration) {
        self.outcomes.push(ScenarioOutcome {
            name: name.to_string(),
            passed: result.is_ok(),
            detail: result.as_ref().err().map(|e| e.to_string()),
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Run one scenario body, time it, log the verdict and record it.
pub fn run<F>(report: &mut ConformanceReport, name: &str, body: F) -> bool
where
    F: FnOnce() -> Result<(), ScenarioError>,
{
    let start = Instant::now();
    let result = body();
    let elapsed = start.elapsed();

    match &result {
        Ok(()) => log::info!("{}: PASS ({:?})", name, elapsed),
        Err(e) => log::info!("{}: FAIL ({})", name, e),
    }

    report.record(name, &result, elapsed);
    result.is_ok()
}

#[test]
fn test_report_serialization() {
    let mut report = ConformanceReport::new();
    assert!(run(&mut report, "always passes", || Ok(())));
    assert!(!run(&mut report, "always fails", || {
        Err(ScenarioError::Check("expected".to_string()))
    }));

    assert_eq!(report.passed_count(), 1);
    assert!(!report.all_passed());

    let json = report.to_json().unwrap();
    let parsed: ConformanceReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.outcomes.len(), 2);
    assert!(parsed.outcomes[0].passed);
    assert_eq!(parsed.outcomes[1].detail.as_deref(), Some("expected"));
}

#[test]
fn test_config_builder_defaults() {
    let config = ExerciserConfig::builder().build();
    assert_eq!(config.timeout, Duration::from_secs(10));
    assert_eq!(config.reply_limit, DEFAULT_REPLY_LIMIT);
    assert!(!config.fatal_warnings);
    assert!(!config.continuous_advertising);

    let config = ExerciserConfig::builder()
        .timeout(Duration::from_secs(2))
        .reply_limit(256)
        .fatal_warnings(true)
        .build();
    assert_eq!(config.timeout, Duration::from_secs(2));
    assert_eq!(config.reply_limit, 256);
    assert!(config.fatal_warnings);
}
