use std::{fmt, fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, de};

/// Main (internal) configuration.
#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    /// TCP address & port to listen on. Defaults to `127.0.0.1:9292`.
    #[serde(default = "default_bind")]
    pub(crate) bind: SocketAddr,
    /// Number of workers, aka. how many connections can be processed at the
    /// same time. Others are queued. Defaults to 32.
    #[serde(default = "default_threads")]
    pub(crate) threads: usize,
    /// Time budget for a connection, from the moment a worker picks it up to
    /// the end of the response or of the tunnel. Given in seconds, fractions
    /// allowed. Defaults to 300s.
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_timeout"
    )]
    pub(crate) timeout: Duration,
    /// Identifier used in Via headers. Defaults to `1.1 ForwardProxy`.
    #[serde(default = "default_via")]
    pub(crate) via: String,
}

impl Config {
    /// Parses a file in YAML formatted str and converts it to a `Config`
    /// representation.
    pub(crate) fn from_str(input: &str) -> Result<Config> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a file in YAML file and converts it to a `Config` representation.
    pub(crate) fn from_file(path: PathBuf) -> Result<Config> {
        Self::from_str(&fs::read_to_string(&path).map_err(|e| {
            anyhow!(
                "Could not read configuration file '{}': {e}",
                path.display()
            )
        })?)
    }

    /// Sanity check the configuration.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.threads < 1 {
            bail!("At least one thread is needed");
        }
        if self.timeout.is_zero() {
            bail!("Timeout must be greater than 0");
        }
        if self.via.trim().is_empty() {
            bail!("Via identifier can't be empty");
        }
        if self.via.contains(['\r', '\n']) {
            bail!("Via identifier can't span multiple lines");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            threads: default_threads(),
            timeout: default_timeout(),
            via: default_via(),
        }
    }
}

/// Deserialize a number of seconds, integer or not, to a `Duration`.
fn deserialize_timeout<'a, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: de::Deserializer<'a>,
{
    struct TimeoutVisitor;

    impl<'a> de::Visitor<'a> for TimeoutVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a positive number of seconds")
        }

        fn visit_u64<E>(self, secs: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E>(self, secs: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative timeout ({secs})")))
        }

        fn visit_f64<E>(self, secs: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| E::custom(format!("invalid timeout ({secs}): {e}")))
        }
    }

    deserializer.deserialize_any(TimeoutVisitor)
}

// Default values.
fn default_bind() -> SocketAddr {
    "127.0.0.1:9292".parse().unwrap()
}
fn default_threads() -> usize {
    32
}
fn default_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_via() -> String {
    "1.1 ForwardProxy".to_string()
}
