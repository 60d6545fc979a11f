//! Run configuration for datagen.
//!
//! The command line is parsed into [`Cli`] and then resolved into the
//! immutable [`Config`] that every other component reads. Resolution is the
//! only place validation happens.

use std::{
    fmt::{self, Display},
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use byte_unit::Byte;
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

/// Errors produced while resolving a [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The payload size was zero, which leaves nothing to emit.
    #[error("payload size must not be zero")]
    ZeroPayloadSize,
    /// The payload size cannot be allocated on this platform.
    #[error("payload size {0} bytes is too large for this platform")]
    PayloadSizeTooLarge(u64),
}

/// Where generated payloads go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SinkTarget {
    /// No file sink was configured.
    #[default]
    None,
    /// Append payloads to the file at this path, with `payloads.log` beside
    /// it.
    File(PathBuf),
    /// A descriptor datagen does not understand. Treated as [`SinkTarget::None`].
    Unsupported(String),
}

impl FromStr for SinkTarget {
    type Err = std::convert::Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Ok(Self::None);
        }
        Ok(match input.strip_prefix("file:") {
            Some(path) => Self::File(PathBuf::from(path)),
            None => Self::Unsupported(input.to_string()),
        })
    }
}

impl Display for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Unsupported(raw) => f.write_str(raw),
        }
    }
}

/// Labels applied to every exported metric, format `KEY=VAL,KEY2=VAL`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GlobalLabels {
    inner: FxHashMap<String, String>,
}

impl GlobalLabels {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    /// Consume the labels, returning the underlying map.
    #[must_use]
    pub fn into_inner(self) -> FxHashMap<String, String> {
        self.inner
    }
}

impl FromStr for GlobalLabels {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // Values may themselves contain ',' so pairs cannot be split on it.
        // Keys, followed by '=', are the delimiters instead; a value runs to
        // the start of the next key with trailing commas trimmed.
        static KEY: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"[[:alpha:]_]+=").expect("invalid label key pattern"));

        let keys: Vec<_> = KEY.find_iter(input).collect();
        let mut inner = FxHashMap::default();
        for (idx, key) in keys.iter().enumerate() {
            let end = keys.get(idx + 1).map_or(input.len(), regex::Match::start);
            let value = input[key.end()..end].trim_end_matches(',');
            inner.insert(
                key.as_str().trim_end_matches('=').to_string(),
                value.to_string(),
            );
        }

        Ok(Self { inner })
    }
}

/// Command line of the datagen binary.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Cli {
    /// approximate bytes per second to emit, e.g. 125000 or 125KB
    #[clap(long, default_value = "125000")]
    pub rate: Byte,
    /// bytes per record, e.g. 512 or 4KiB
    #[clap(long, default_value = "512")]
    pub payload_size: Byte,
    /// total run time, e.g. 30s or 5m; 0 runs until interrupted
    #[clap(long, default_value = "0")]
    pub duration: humantime::Duration,
    /// address to serve /metrics and /health on; ':PORT' binds all interfaces
    #[clap(long, default_value = ":9100")]
    pub metrics_addr: String,
    /// do not write raw payloads to stdout
    #[clap(long)]
    pub no_stdout: bool,
    /// sink target, supported: file:<path>
    #[clap(long, default_value = "")]
    pub sink: SinkTarget,
    /// write one audit line every N records
    #[clap(long, default_value_t = 1)]
    pub audit_every: u64,
    /// seed for payload generation; random when absent
    #[clap(long)]
    pub seed: Option<u64>,
    /// labels to apply to all exported metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    pub global_labels: Option<GlobalLabels>,
}

/// Immutable parameters of one datagen run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Target bytes emitted per second.
    pub bytes_per_second: u64,
    /// Bytes in each record.
    pub payload_size: NonZeroUsize,
    /// How long to run, `None` runs until interrupted.
    pub duration: Option<Duration>,
    /// Listen address of the metrics server as given, resolved only when the
    /// server starts.
    pub metrics_addr: String,
    /// Suppress payload writes to stdout.
    pub no_stdout: bool,
    /// Output target.
    pub sink: SinkTarget,
    /// Write one audit line per this many records.
    pub audit_every: NonZeroU64,
    /// Seed for the payload RNG.
    pub seed: Option<u64>,
    /// Labels applied to every exported metric.
    pub global_labels: FxHashMap<String, String>,
}

impl TryFrom<Cli> for Config {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let payload_size = cli.payload_size.as_u64();
        let payload_size = usize::try_from(payload_size)
            .map_err(|_| Error::PayloadSizeTooLarge(payload_size))?;
        let payload_size = NonZeroUsize::new(payload_size).ok_or(Error::ZeroPayloadSize)?;

        let duration = Duration::from(cli.duration);

        Ok(Self {
            bytes_per_second: cli.rate.as_u64(),
            payload_size,
            duration: (!duration.is_zero()).then_some(duration),
            metrics_addr: cli.metrics_addr,
            no_stdout: cli.no_stdout,
            sink: cli.sink,
            audit_every: NonZeroU64::new(cli.audit_every).unwrap_or(NonZeroU64::MIN),
            seed: cli.seed,
            global_labels: cli.global_labels.unwrap_or_default().into_inner(),
        })
    }
}

#[cfg(test)]
impl Config {
    /// A quiet, seeded configuration bound to an ephemeral loopback port.
    pub(crate) fn for_tests(bytes_per_second: u64, payload_size: usize) -> Self {
        Self {
            bytes_per_second,
            payload_size: NonZeroUsize::new(payload_size).expect("non-zero payload"),
            duration: None,
            metrics_addr: "127.0.0.1:0".to_string(),
            no_stdout: true,
            sink: SinkTarget::None,
            audit_every: NonZeroU64::MIN,
            seed: Some(42),
            global_labels: FxHashMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> Result<Config, Error> {
        let mut argv = vec!["datagen"];
        argv.extend_from_slice(args);
        Config::try_from(Cli::parse_from(argv))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = resolve(&[]).expect("defaults must resolve");

        assert_eq!(config.bytes_per_second, 125_000);
        assert_eq!(config.payload_size.get(), 512);
        assert_eq!(config.duration, None);
        assert_eq!(config.metrics_addr, ":9100");
        assert!(!config.no_stdout);
        assert_eq!(config.sink, SinkTarget::None);
        assert_eq!(config.audit_every.get(), 1);
        assert_eq!(config.seed, None);
        assert!(config.global_labels.is_empty());
    }

    #[test]
    fn all_flags_resolve() {
        let config = resolve(&[
            "--rate",
            "1KB",
            "--payload-size",
            "500",
            "--duration",
            "90s",
            "--metrics-addr",
            "127.0.0.1:9200",
            "--no-stdout",
            "--sink",
            "file:/tmp/out/payloads.bin",
            "--audit-every",
            "10",
            "--seed",
            "7",
            "--global-labels",
            "env=test,team=ingest",
        ])
        .expect("flags must resolve");

        assert_eq!(config.bytes_per_second, 1000);
        assert_eq!(config.payload_size.get(), 500);
        assert_eq!(config.duration, Some(Duration::from_secs(90)));
        assert_eq!(config.metrics_addr, "127.0.0.1:9200");
        assert!(config.no_stdout);
        assert_eq!(
            config.sink,
            SinkTarget::File(PathBuf::from("/tmp/out/payloads.bin"))
        );
        assert_eq!(config.audit_every.get(), 10);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.global_labels.get("env").map(String::as_str), Some("test"));
        assert_eq!(config.global_labels.get("team").map(String::as_str), Some("ingest"));
    }

    #[test]
    fn zero_payload_size_is_rejected() {
        let err = resolve(&["--payload-size", "0"]).expect_err("zero payload must fail");
        assert!(matches!(err, Error::ZeroPayloadSize));
    }

    #[test]
    fn zero_audit_every_means_every_record() {
        let config = resolve(&["--audit-every", "0"]).expect("must resolve");
        assert_eq!(config.audit_every.get(), 1);
    }

    #[test]
    fn negative_rate_is_a_usage_error() {
        assert!(Cli::try_parse_from(["datagen", "--rate", "-5"]).is_err());
    }

    #[test]
    fn unresolvable_metrics_addr_is_left_to_the_server() {
        for addr in ["bogus", "localhost:notaport", ""] {
            let config = resolve(&["--metrics-addr", addr]).expect("must resolve");
            assert_eq!(config.metrics_addr, addr);
        }
    }

    #[test]
    fn sink_descriptors() {
        assert_eq!(SinkTarget::from_str("").ok(), Some(SinkTarget::None));
        assert_eq!(
            SinkTarget::from_str("file:data/out.bin").ok(),
            Some(SinkTarget::File(PathBuf::from("data/out.bin")))
        );
        assert_eq!(
            SinkTarget::from_str("kafka:topic").ok(),
            Some(SinkTarget::Unsupported("kafka:topic".to_string()))
        );
        assert_eq!(
            SinkTarget::File(PathBuf::from("a/b")).to_string(),
            "file:a/b"
        );
    }

    #[test]
    fn global_labels_empty_string_is_empty_set() {
        let labels = GlobalLabels::from_str("").expect("must parse");
        assert!(labels.into_inner().is_empty());
    }

    #[test]
    fn global_labels_trailing_comma() {
        let labels = GlobalLabels::from_str("first=one,").expect("must parse");
        assert_eq!(labels.get("first"), Some("one"));
    }

    #[test]
    fn global_labels_values_may_contain_commas() {
        let labels = GlobalLabels::from_str("DD_API_KEY=00000001,DD_TAGS=uqhwd:b2xiyw,hf9gy:uwcy04")
            .expect("must parse");
        assert_eq!(labels.get("DD_API_KEY"), Some("00000001"));
        assert_eq!(labels.get("DD_TAGS"), Some("uqhwd:b2xiyw,hf9gy:uwcy04"));
    }
}
