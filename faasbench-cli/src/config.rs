//! Settings of the `faasbench` command line tool.
//!
//! Settings are loaded with the following precedence (highest to lowest):
//!
//! 1. Environment variables (prefixed with `FAASBENCH__`)
//! 2. YAML settings file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures. For example:
//!
//! - `FAASBENCH__BENCHMARK_CONFIG=configs/small.yaml` selects the benchmark config
//! - `FAASBENCH__SCRIPTS__AZURE=/opt/deployment/azure` moves the Azure deployment script
//! - `FAASBENCH__LOGGING__LEVEL=debug` increases the log level
//!
//! The same settings in YAML:
//!
//! ```yaml
//! benchmark_config: configs/small.yaml
//! scripts:
//!   azure: /opt/deployment/azure
//! logging:
//!   level: debug
//! ```
//!
//! These settings only control the tool itself. The workload and the benchmarked functions are
//! described by the benchmark and deploy configs the settings point to.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use faasbench_cloud::registry::ScriptDirs;
use faasbench_core::archive::DEFAULT_SHUTDOWN_GRACE;
use faasbench_core::config::ConfigSecret;
use faasbench_core::events::DEFAULT_CAPACITY;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::SecretBox;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all settings.
const ENV_PREFIX: &str = "FAASBENCH__";

/// Output of the progress events.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EventSettings {
    /// Number of pending events before new events are dropped. Zero is treated as one.
    ///
    /// Defaults to `1000`.
    pub capacity: usize,

    /// Whether event lines are colored.
    ///
    /// Defaults to `true`.
    pub colors: bool,

    /// Interval between progress reports during a benchmark run.
    ///
    /// Defaults to `10s`.
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            colors: true,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` if stderr is a terminal, otherwise `simplified`.
    Auto,
    /// Multi-line output with colors.
    Pretty,
    /// Compact single-line output.
    Simplified,
}

#[derive(Clone, Debug)]
pub struct LevelParseError(String);

impl fmt::Display for LevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as level: expected one of "off", "error", "warn", "info", "debug", "trace""#,
            self.0
        )
    }
}

impl std::error::Error for LevelParseError {}

mod level_filter {
    use std::borrow::Cow;

    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    use super::LevelParseError;

    pub fn serialize<S: Serializer>(value: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let s = <Cow<'de, str>>::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(LevelParseError(s.into_owned())))
    }
}

/// Logging of internal diagnostics to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum level of logged messages. `RUST_LOG` takes precedence if set.
    ///
    /// Defaults to `info`.
    #[serde(with = "level_filter")]
    pub level: LevelFilter,

    /// Defaults to `auto`.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting. Disabled unless a DSN is set.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name, such as `ci` or `local`.
    pub environment: Option<String>,

    /// Defaults to `1.0`.
    pub sample_rate: f32,
}

impl Sentry {
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
        }
    }
}

/// All settings of the tool.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Benchmark config used by `bench` unless `--config` is passed.
    ///
    /// Defaults to `configs/generated.yaml`.
    pub benchmark_config: PathBuf,

    /// Deploy config used by `deploy`, `generate` and `remove`.
    ///
    /// Defaults to `configs/deployment.yaml`.
    pub deploy_config: PathBuf,

    /// Output of `generate` unless `--output` is passed.
    ///
    /// Defaults to `configs/generated.yaml`.
    pub generated_config: PathBuf,

    /// Service account key used to sign identity tokens for GCP functions.
    ///
    /// Defaults to `credentials/gcp_service_account.json`.
    pub gcp_service_account: PathBuf,

    /// Directories of the provider deployment scripts.
    ///
    /// Default to `deployment/<provider>`.
    pub scripts: ScriptDirs,

    /// Time to wait after the result archives are flushed.
    ///
    /// Defaults to `5s`.
    #[serde(with = "humantime_serde")]
    pub archive_grace: Duration,

    pub events: EventSettings,

    pub logging: Logging,

    pub sentry: Sentry,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            benchmark_config: "configs/generated.yaml".into(),
            deploy_config: "configs/deployment.yaml".into(),
            generated_config: "configs/generated.yaml".into(),
            gcp_service_account: "credentials/gcp_service_account.json".into(),
            scripts: ScriptDirs::default(),
            archive_grace: DEFAULT_SHUTDOWN_GRACE,
            events: EventSettings::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let settings = Settings::load(None).unwrap();

            assert_eq!(settings.benchmark_config, Path::new("configs/generated.yaml"));
            assert_eq!(settings.scripts.aws, Path::new("deployment/aws"));
            assert_eq!(settings.events.progress_interval, Duration::from_secs(10));
            assert_eq!(settings.archive_grace, Duration::from_secs(5));
            assert!(!settings.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FAASBENCH__DEPLOY_CONFIG", "configs/eu.yaml");
            jail.set_env("FAASBENCH__SCRIPTS__AZURE", "/opt/azure");
            jail.set_env("FAASBENCH__EVENTS__PROGRESS_INTERVAL", "30s");
            jail.set_env("FAASBENCH__EVENTS__COLORS", "false");
            jail.set_env("FAASBENCH__LOGGING__LEVEL", "debug");
            jail.set_env("FAASBENCH__SENTRY__DSN", "abcde");

            let settings = Settings::load(None).unwrap();

            assert_eq!(settings.deploy_config, Path::new("configs/eu.yaml"));
            assert_eq!(settings.scripts.azure, Path::new("/opt/azure"));
            assert_eq!(settings.scripts.gcp, Path::new("deployment/gcp"));
            assert_eq!(settings.events.progress_interval, Duration::from_secs(30));
            assert!(!settings.events.colors);
            assert_eq!(settings.logging.level, LevelFilter::DEBUG);
            assert_eq!(
                settings.sentry.dsn.unwrap().expose_secret().as_str(),
                "abcde"
            );

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            benchmark_config: configs/small.yaml
            archive_grace: 1s
            logging:
                level: warn
                format: simplified
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("FAASBENCH__LOGGING__LEVEL", "trace");

            let settings = Settings::load(Some(tempfile.path())).unwrap();

            assert_eq!(settings.benchmark_config, Path::new("configs/small.yaml"));
            assert_eq!(settings.archive_grace, Duration::from_secs(1));
            assert_eq!(settings.logging.format, LogFormat::Simplified);
            // env overrides the file
            assert_eq!(settings.logging.level, LevelFilter::TRACE);

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_levels() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FAASBENCH__LOGGING__LEVEL", "loud");
            assert!(Settings::load(None).is_err());
            Ok(())
        });
    }
}
