//! Configuration for scpctl

use crate::reader::ReaderVersion;
use anyhow::{bail, Context};
use clap::Args;
use scp_core::SecretKey;
use scp_net::{NetConfig, PollConfig, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Relay, identity and network settings shared by every command
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Read relay; also receives every write. `ws://`/`wss://` relays use a
    /// stream connection, anything else HTTP.
    #[arg(long, env = "SCP_READ_RELAY")]
    pub read_relay: Option<String>,

    /// Additional write relays (comma-separated)
    #[arg(long, env = "SCP_RELAYS", value_delimiter = ',')]
    pub write_relays: Vec<String>,

    /// Account secret key (hex)
    #[arg(long, env = "SCP_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// File holding the account secret key (hex)
    #[arg(long, env = "SCP_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Gatekeeper used when a community names none
    #[arg(long, env = "SCP_GATEKEEPER_URL")]
    pub gatekeeper_url: Option<String>,

    /// Reader strategy
    #[arg(long, value_enum, default_value = "1")]
    pub reader_version: ReaderVersion,

    /// How long identical reads share one result
    #[arg(long, default_value = "1000")]
    pub cache_ttl_ms: u64,

    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    #[arg(long, default_value = "100")]
    pub initial_delay_ms: u64,

    #[arg(long, default_value = "1000")]
    pub max_delay_ms: u64,

    #[arg(long, default_value = "2.0")]
    pub backoff_factor: f64,

    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,

    #[arg(long, default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Polls of a deferred HTTP result before giving up
    #[arg(long, default_value = "120")]
    pub max_poll_attempts: u32,

    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

fn check_url(label: &str, raw: &str, schemes: &[&str]) -> anyhow::Result<()> {
    let url = Url::parse(raw).with_context(|| format!("{label} is not a valid URL: {raw}"))?;
    if !schemes.contains(&url.scheme()) {
        bail!("{label} must use one of {schemes:?}, got {raw}");
    }
    Ok(())
}

const RELAY_SCHEMES: &[&str] = &["ws", "wss", "http", "https"];

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(relay) = &self.read_relay {
            check_url("read relay", relay, RELAY_SCHEMES)?;
        }
        for relay in &self.write_relays {
            check_url("write relay", relay, RELAY_SCHEMES)?;
        }
        if let Some(gatekeeper) = &self.gatekeeper_url {
            check_url("gatekeeper", gatekeeper, &["http", "https"])?;
        }
        if self.private_key.is_some() && self.key_file.is_some() {
            bail!("give either --private-key or --key-file, not both");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            bail!("backoff factor must be a finite number of at least 1.0");
        }
        if self.max_delay_ms < self.initial_delay_ms {
            bail!("max delay must not be below the initial delay");
        }
        if self.max_poll_attempts == 0 {
            bail!("max poll attempts must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            bail!("log format must be json or pretty, got {}", self.log_format);
        }
        Ok(())
    }

    pub fn read_relay(&self) -> anyhow::Result<&str> {
        self.read_relay
            .as_deref()
            .context("this command needs a relay: set --read-relay or SCP_READ_RELAY")
    }

    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                factor: self.backoff_factor,
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            poll: PollConfig {
                max_attempts: self.max_poll_attempts,
                interval: Duration::from_millis(self.poll_interval_ms),
            },
        }
    }

    /// Account secret from `--private-key` or `--key-file`, if either is set
    pub fn load_secret(&self) -> anyhow::Result<Option<SecretKey>> {
        let hex_key = match (&self.private_key, &self.key_file) {
            (Some(key), _) => key.trim().to_string(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?
                .trim()
                .to_string(),
            (None, None) => return Ok(None),
        };
        let secret = SecretKey::from_hex(&hex_key).context("secret key must be 64 hex characters")?;
        Ok(Some(secret))
    }

    /// Like [`load_secret`](Self::load_secret), but the key is mandatory
    pub fn require_secret(&self) -> anyhow::Result<SecretKey> {
        self.load_secret()?
            .context("this command needs a key: set --private-key, --key-file or SCP_PRIVATE_KEY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["scpctl"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn test_defaults_match_net_defaults() {
        let config = parse(&["--read-relay", "wss://relay.example"]);
        config.validate().unwrap();
        assert_eq!(config.net_config(), NetConfig::default());
        assert_eq!(config.reader_version, ReaderVersion::V1);
        assert_eq!(config.read_relay().unwrap(), "wss://relay.example");

        let offline = parse(&[]);
        offline.validate().unwrap();
        assert!(offline.read_relay().is_err());
    }

    #[test]
    fn test_write_relays_and_reader_version() {
        let config = parse(&[
            "--read-relay",
            "https://relay.example",
            "--write-relays",
            "wss://a.example,wss://b.example",
            "--reader-version",
            "1.5",
        ]);
        assert_eq!(config.write_relays, ["wss://a.example", "wss://b.example"]);
        assert_eq!(config.reader_version, ReaderVersion::V1_5);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let bad_scheme = parse(&["--read-relay", "ftp://relay.example"]);
        assert!(bad_scheme.validate().is_err());

        let bad_gatekeeper = parse(&["--read-relay", "wss://r.example", "--gatekeeper-url", "wss://gk.example"]);
        assert!(bad_gatekeeper.validate().is_err());

        let bad_delays = parse(&[
            "--read-relay",
            "wss://r.example",
            "--initial-delay-ms",
            "500",
            "--max-delay-ms",
            "100",
        ]);
        assert!(bad_delays.validate().is_err());

        for factor in ["inf", "NaN", "0.5"] {
            let bad_factor = parse(&["--read-relay", "wss://r.example", "--backoff-factor", factor]);
            assert!(bad_factor.validate().is_err(), "factor {factor} accepted");
        }

        let bad_format = parse(&["--read-relay", "wss://r.example", "--log-format", "xml"]);
        assert!(bad_format.validate().is_err());
    }

    #[test]
    fn test_key_file() {
        let secret = SecretKey::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", secret.to_hex()).unwrap();

        let config = parse(&[
            "--read-relay",
            "wss://r.example",
            "--key-file",
            file.path().to_str().unwrap(),
        ]);
        let loaded = config.require_secret().unwrap();
        assert_eq!(loaded.to_hex(), secret.to_hex());

        let without = parse(&["--read-relay", "wss://r.example"]);
        assert!(without.load_secret().unwrap().is_none());
        assert!(without.require_secret().is_err());
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let config = parse(&["--read-relay", "wss://r.example", "--private-key", "abcd"]);
        assert!(config.load_secret().is_err());
    }
}
