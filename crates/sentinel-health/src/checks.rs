//! Health check registry and evaluation
//!
//! Two request shapes are served:
//!
//! - **Header mode**: each `X-ERIGON-HEALTHCHECK` value names a check from
//!   the [`CheckRegistry`], optionally followed by a numeric argument
//!   (`min_peer_count5`, `check_block100`, `max_seconds_behind60`, `synced`).
//! - **Body mode**: a JSON body `{min_peer_count?, known_block?}` with a fixed
//!   set of report keys.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{HealthError, HealthResult};

/// Fallback window when `max_seconds_behind` gets a negative argument
pub const DEFAULT_MAX_SECONDS_BEHIND: u64 = 600;

/// Node state the checks read
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    /// Connected peer count
    async fn peer_count(&self) -> HealthResult<usize>;

    /// Whether the node is still syncing
    async fn is_syncing(&self) -> HealthResult<bool>;

    /// Whether block `number` is known
    async fn has_block(&self, number: u64) -> HealthResult<bool>;

    /// Unix timestamp of the latest block
    async fn latest_block_timestamp(&self) -> HealthResult<u64>;
}

/// A parsed check with its argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Node is not syncing
    Synced,
    /// Block `n` is known
    CheckBlock(u64),
    /// At least `n` peers
    MinPeerCount(usize),
    /// Latest block is at most `n` seconds old
    MaxSecondsBehind(u64),
}

impl Check {
    /// Run the check against `source`; `now` is the current unix time
    pub async fn evaluate(&self, source: &dyn HealthSource, now: u64) -> HealthResult<()> {
        match *self {
            Check::Synced => match source.is_syncing().await? {
                false => Ok(()),
                true => Err(HealthError::NotSynced),
            },
            Check::CheckBlock(number) => match source.has_block(number).await? {
                true => Ok(()),
                false => Err(HealthError::BlockNotFound(number)),
            },
            Check::MinPeerCount(min) => {
                let have = source.peer_count().await?;
                if have < min {
                    return Err(HealthError::NotEnoughPeers { have, min });
                }
                Ok(())
            }
            Check::MaxSecondsBehind(seconds) => {
                let need = now.saturating_sub(seconds);
                let timestamp = source.latest_block_timestamp().await?;
                if timestamp < need {
                    return Err(HealthError::TooFarBehind { timestamp, need });
                }
                Ok(())
            }
        }
    }
}

type Parser = fn(&str) -> HealthResult<Check>;

/// A registered check: name prefix and argument parser
#[derive(Clone, Copy)]
pub struct CheckSpec {
    /// Name the header value starts with
    pub name: &'static str,
    parse: Parser,
}

impl fmt::Debug for CheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckSpec").field("name", &self.name).finish()
    }
}

fn parse_number<T: std::str::FromStr>(check: &'static str, arg: &str) -> HealthResult<T> {
    arg.parse().map_err(|_| HealthError::InvalidArgument {
        check,
        value: arg.to_string(),
    })
}

fn parse_synced(arg: &str) -> HealthResult<Check> {
    if !arg.is_empty() {
        return Err(HealthError::InvalidArgument {
            check: "synced",
            value: arg.to_string(),
        });
    }
    Ok(Check::Synced)
}

fn parse_check_block(arg: &str) -> HealthResult<Check> {
    parse_number("check_block", arg).map(Check::CheckBlock)
}

fn parse_min_peer_count(arg: &str) -> HealthResult<Check> {
    parse_number("min_peer_count", arg).map(Check::MinPeerCount)
}

fn parse_max_seconds_behind(arg: &str) -> HealthResult<Check> {
    let seconds: i64 = parse_number("max_seconds_behind", arg)?;
    Ok(Check::MaxSecondsBehind(
        u64::try_from(seconds).unwrap_or(DEFAULT_MAX_SECONDS_BEHIND),
    ))
}

/// Name → parser table for header mode
#[derive(Debug, Clone)]
pub struct CheckRegistry {
    specs: Vec<CheckSpec>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self {
            specs: vec![
                CheckSpec { name: "synced", parse: parse_synced },
                CheckSpec { name: "check_block", parse: parse_check_block },
                CheckSpec { name: "min_peer_count", parse: parse_min_peer_count },
                CheckSpec { name: "max_seconds_behind", parse: parse_max_seconds_behind },
            ],
        }
    }
}

impl CheckRegistry {
    /// Registered check names
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name)
    }

    /// Resolve a header value (case-insensitive) to its name and check
    ///
    /// An unknown name yields `(value, Err(UnknownCheck))` so the caller can
    /// still report it.
    pub fn resolve(&self, value: &str) -> (String, HealthResult<Check>) {
        let value = value.trim().to_ascii_lowercase();
        match self.specs.iter().find(|s| value.starts_with(s.name)) {
            Some(spec) => {
                let check = (spec.parse)(&value[spec.name.len()..]);
                (spec.name.to_string(), check)
            }
            None => (value, Err(HealthError::UnknownCheck)),
        }
    }
}

/// Result of one check as reported on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Check passed
    Healthy,
    /// Check not requested
    Disabled,
    /// Check failed
    Error(String),
}

impl CheckOutcome {
    fn from_result(result: HealthResult<()>) -> Self {
        match result {
            Ok(()) => Self::Healthy,
            Err(e) => Self::Error(e.to_string()),
        }
    }

    /// Whether this outcome fails the request
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("HEALTHY"),
            Self::Disabled => f.write_str("DISABLED"),
            Self::Error(msg) => write!(f, "ERROR: {}", msg),
        }
    }
}

impl Serialize for CheckOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Per-check outcomes of one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HealthReport {
    checks: BTreeMap<String, CheckOutcome>,
}

impl HealthReport {
    /// `true` unless some check failed
    pub fn is_healthy(&self) -> bool {
        !self.checks.values().any(CheckOutcome::is_error)
    }

    /// Outcome for `name`
    pub fn get(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.get(name)
    }

    /// Number of reported checks
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether nothing was reported
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    // a repeated check keeps its first failure
    fn record(&mut self, name: String, outcome: CheckOutcome) {
        match self.checks.get(&name) {
            Some(existing) if existing.is_error() => {}
            _ => {
                self.checks.insert(name, outcome);
            }
        }
    }
}

/// Evaluate header-mode checks
pub async fn evaluate_headers<'a, I>(
    registry: &CheckRegistry,
    values: I,
    source: &dyn HealthSource,
    now: u64,
) -> HealthReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = HealthReport::default();
    for value in values {
        let (name, check) = registry.resolve(value);
        let result = match check {
            Ok(check) => check.evaluate(source, now).await,
            Err(e) => Err(e),
        };
        report.record(name, CheckOutcome::from_result(result));
    }
    report
}

/// JSON body of a body-mode request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HealthQuery {
    /// Minimum peer count
    pub min_peer_count: Option<usize>,
    /// Block number that must be known
    pub known_block: Option<u64>,
}

impl HealthQuery {
    /// Parse a request body; the body must be a JSON object, `{}` at least
    pub fn parse(body: &[u8]) -> HealthResult<Self> {
        serde_json::from_slice(body).map_err(|e| HealthError::InvalidBody(e.to_string()))
    }
}

/// Report key for body parsing
pub const KEY_QUERY: &str = "healthcheck_query";
/// Report key for the peer count check
pub const KEY_MIN_PEER_COUNT: &str = "min_peer_count";
/// Report key for the known-block check
pub const KEY_CHECK_BLOCK: &str = "check_block";

/// Evaluate a body-mode request
pub async fn evaluate_body(body: &[u8], source: &dyn HealthSource, now: u64) -> HealthReport {
    let mut report = HealthReport::default();
    let query = match HealthQuery::parse(body) {
        Ok(query) => query,
        Err(e) => {
            tracing::warn!("Unable to process healthcheck request: {}", e);
            report.record(KEY_QUERY.into(), CheckOutcome::Error(e.to_string()));
            report.record(KEY_MIN_PEER_COUNT.into(), CheckOutcome::Disabled);
            report.record(KEY_CHECK_BLOCK.into(), CheckOutcome::Disabled);
            return report;
        }
    };
    report.record(KEY_QUERY.into(), CheckOutcome::Healthy);

    let peers = match query.min_peer_count {
        Some(min) => CheckOutcome::from_result(Check::MinPeerCount(min).evaluate(source, now).await),
        None => CheckOutcome::Disabled,
    };
    report.record(KEY_MIN_PEER_COUNT.into(), peers);

    let block = match query.known_block {
        Some(number) => {
            CheckOutcome::from_result(Check::CheckBlock(number).evaluate(source, now).await)
        }
        None => CheckOutcome::Disabled,
    };
    report.record(KEY_CHECK_BLOCK.into(), block);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        peers: usize,
        syncing: bool,
        latest: u64,
    }

    #[async_trait]
    impl HealthSource for Fixed {
        async fn peer_count(&self) -> HealthResult<usize> {
            Ok(self.peers)
        }

        async fn is_syncing(&self) -> HealthResult<bool> {
            Ok(self.syncing)
        }

        async fn has_block(&self, number: u64) -> HealthResult<bool> {
            Ok(number <= 10)
        }

        async fn latest_block_timestamp(&self) -> HealthResult<u64> {
            Ok(self.latest)
        }
    }

    fn source() -> Fixed {
        Fixed {
            peers: 3,
            syncing: false,
            latest: 1_000,
        }
    }

    #[test]
    fn test_resolve_known_checks() {
        let registry = CheckRegistry::default();
        assert_eq!(registry.resolve("synced").1.unwrap(), Check::Synced);
        assert_eq!(
            registry.resolve("MIN_PEER_COUNT5").1.unwrap(),
            Check::MinPeerCount(5)
        );
        assert_eq!(registry.resolve("check_block42").1.unwrap(), Check::CheckBlock(42));
        assert_eq!(
            registry.resolve("max_seconds_behind-1").1.unwrap(),
            Check::MaxSecondsBehind(DEFAULT_MAX_SECONDS_BEHIND)
        );
    }

    #[test]
    fn test_resolve_errors() {
        let registry = CheckRegistry::default();
        let (name, check) = registry.resolve("bogus");
        assert_eq!(name, "bogus");
        assert!(matches!(check, Err(HealthError::UnknownCheck)));

        let (name, check) = registry.resolve("check_blockx");
        assert_eq!(name, "check_block");
        assert!(matches!(check, Err(HealthError::InvalidArgument { .. })));

        assert!(registry.resolve("synced1").1.is_err());
    }

    #[test]
    fn test_registry_names() {
        let names: Vec<_> = CheckRegistry::default().names().collect();
        assert_eq!(
            names,
            vec!["synced", "check_block", "min_peer_count", "max_seconds_behind"]
        );
    }

    #[tokio::test]
    async fn test_max_seconds_behind() {
        let source = source();
        assert!(Check::MaxSecondsBehind(10).evaluate(&source, 1_005).await.is_ok());
        let err = Check::MaxSecondsBehind(10)
            .evaluate(&source, 1_020)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "got ts: 1000, need: 1010");
        // window larger than the clock never underflows
        assert!(Check::MaxSecondsBehind(u64::MAX).evaluate(&source, 5).await.is_ok());
    }

    #[tokio::test]
    async fn test_header_report_keeps_first_failure() {
        let registry = CheckRegistry::default();
        let report = evaluate_headers(
            &registry,
            ["min_peer_count5", "min_peer_count1", "synced"],
            &source(),
            0,
        )
        .await;
        assert!(!report.is_healthy());
        assert_eq!(report.len(), 2);
        assert_eq!(
            report.get("min_peer_count"),
            Some(&CheckOutcome::Error("not enough peers: 3 (minimum 5)".into()))
        );
        assert_eq!(report.get("synced"), Some(&CheckOutcome::Healthy));
    }

    #[tokio::test]
    async fn test_body_report() {
        let report = evaluate_body(br#"{"min_peer_count":2,"known_block":11}"#, &source(), 0).await;
        assert_eq!(report.get(KEY_QUERY), Some(&CheckOutcome::Healthy));
        assert_eq!(report.get(KEY_MIN_PEER_COUNT), Some(&CheckOutcome::Healthy));
        assert!(report.get(KEY_CHECK_BLOCK).unwrap().is_error());
        assert!(!report.is_healthy());

        let report = evaluate_body(b"{}", &source(), 0).await;
        assert!(report.is_healthy());
        assert_eq!(report.get(KEY_CHECK_BLOCK), Some(&CheckOutcome::Disabled));

        let report = evaluate_body(b"", &source(), 0).await;
        assert!(report.get(KEY_QUERY).unwrap().is_error());
        assert_eq!(report.get(KEY_MIN_PEER_COUNT), Some(&CheckOutcome::Disabled));
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_outcome_serialization() {
        let mut report = HealthReport::default();
        report.record("a".into(), CheckOutcome::Healthy);
        report.record("b".into(), CheckOutcome::Disabled);
        report.record("c".into(), CheckOutcome::Error("boom".into()));
        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"a":"HEALTHY","b":"DISABLED","c":"ERROR: boom"}"#
        );
    }
}
