//! Benchmark and deployment configuration files.
//!
//! Two YAML documents drive a benchmark campaign:
//!
//! - The *deployment* config lists the provider regions to deploy to, the benchmarks with their
//!   input parameter, and the memory sizes to include. It is consumed by `deploy`, `generate` and
//!   `remove`.
//! - The *benchmark* config lists the concrete function endpoints to load, usually generated
//!   from the deployment config by `generate`:
//!
//! ```yaml
//! workload:
//!   parallelRequests: 50
//!   totalRequests: 1000
//!   retriesPerRequest: 2
//!   resultFolder: results
//! functions:
//!   - name: aws-gemm-512
//!     provider: aws
//!     region: eu-central-1
//!     memorySize: 512
//!     URL: https://example.execute-api.eu-central-1.amazonaws.com/gemm?parameter=100
//!     auth:
//!       key: x-api-key
//!       value: s3cr3t
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::Provider;

/// Errors raised while loading, validating or writing configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("failed to read config file `{}`", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid YAML for the expected document.
    #[error("failed to parse config file `{}`", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The file could not be written.
    #[error("failed to write config file `{}`", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The config could not be serialized to YAML.
    #[error("failed to serialize config to YAML")]
    Serialize(#[source] serde_yaml::Error),

    /// The workload section is invalid.
    #[error("invalid workload: {0}")]
    Workload(String),

    /// A benchmark config without any function.
    #[error("at least one function must be specified")]
    NoFunctions,

    /// A function entry is invalid.
    #[error("function[{index}]: {reason}")]
    Function { index: usize, reason: String },

    /// A deployment entry is invalid.
    #[error("deployment[{index}]: {reason}")]
    Deployment { index: usize, reason: String },
}

/// Newtype around `String` that protects against accidental logging of secrets in the
/// configuration structs. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl From<String> for ConfigSecret {
    fn from(string: String) -> Self {
        ConfigSecret(string)
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Shape of the load applied to every function target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadParameters {
    /// Number of concurrent workers per function target.
    pub parallel_requests: usize,
    /// Number of requests issued against each function target.
    pub total_requests: usize,
    /// Retries after a failed request, so each request is attempted up to `retries + 1` times.
    pub retries_per_request: u32,
    /// Root directory of the result archives.
    pub result_folder: PathBuf,
}

impl WorkloadParameters {
    /// Checks the invariants of the workload section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_requests == 0 {
            return Err(ConfigError::Workload(
                "parallelRequests must be greater than 0".into(),
            ));
        }
        if self.total_requests == 0 {
            return Err(ConfigError::Workload(
                "totalRequests must be greater than 0".into(),
            ));
        }
        if self.result_folder.as_os_str().is_empty() {
            return Err(ConfigError::Workload(
                "resultFolder must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// The optional auth header sent with every request to a function.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header name, see [`Provider::auth_header`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Header value, such as a function key or a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SecretBox<ConfigSecret>>,
}

impl AuthConfig {
    /// Creates an auth config with both header name and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut auth = Self {
            key: Some(key.into()),
            value: None,
        };
        auth.set_value(value);
        auth
    }

    /// Replaces the header value.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(SecretBox::new(Box::new(ConfigSecret::from(value.into()))));
    }

    /// Returns the header to attach, if both name and value are non-empty.
    pub fn header(&self) -> Option<(&str, &str)> {
        let key = self.key.as_deref().filter(|key| !key.is_empty())?;
        let value = self
            .value
            .as_ref()
            .map(|value| value.expose_secret().as_str())
            .filter(|value| !value.is_empty())?;
        Some((key, value))
    }
}

/// A single function target under benchmark.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkFunctionConfig {
    pub name: String,
    pub provider: Provider,
    pub region: String,
    /// Configured memory of the function in MB.
    pub memory_size: u32,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl BenchmarkFunctionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.region.is_empty() {
            return Err("region must not be empty".into());
        }
        if self.memory_size == 0 {
            return Err("memorySize must be > 0".into());
        }
        if self.url.is_empty() {
            return Err("URL must not be empty".into());
        }

        let key = self.auth.key.as_deref().unwrap_or_default();
        if key.is_empty() {
            if self.provider.allows_anonymous() {
                return Ok(());
            }
            return Err("auth.key must not be empty".into());
        }

        let expected = self.provider.auth_header();
        if key != expected {
            return Err(format!(
                "invalid auth.key for provider {}: expected '{expected}', got '{key}'",
                self.provider
            ));
        }

        Ok(())
    }
}

/// The benchmark config: a workload and the functions to run it against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub workload: WorkloadParameters,
    pub functions: Vec<BenchmarkFunctionConfig>,
}

impl BenchmarkConfig {
    /// Loads and validates a benchmark config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the workload and every function entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workload.validate()?;

        if self.functions.is_empty() {
            return Err(ConfigError::NoFunctions);
        }

        let mut seen = HashSet::new();
        for (index, function) in self.functions.iter().enumerate() {
            function
                .validate()
                .map_err(|reason| ConfigError::Function { index, reason })?;

            if !seen.insert((function.name.as_str(), function.region.as_str())) {
                return Err(ConfigError::Function {
                    index,
                    reason: format!(
                        "duplicate function name '{}' with region '{}'",
                        function.name, function.region
                    ),
                });
            }
        }

        Ok(())
    }

    /// Serializes the config to YAML at `path`, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self).map_err(ConfigError::Serialize)?;
        let write = |path: &Path| -> io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, yaml.as_bytes())
        };

        write(path).map_err(|source| ConfigError::Write {
            path: path.to_owned(),
            source,
        })
    }
}

/// A provider region to deploy the benchmark functions to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub provider: Provider,
    pub region: String,
}

impl DeploymentTarget {
    fn validate(&self) -> Result<(), String> {
        if self.region.is_empty() {
            return Err("region is required in deployment config".into());
        }
        if !self.provider.is_valid_region(&self.region) {
            return Err(format!(
                "invalid {} region: {}",
                self.provider, self.region
            ));
        }
        Ok(())
    }
}

/// The deployment config: where to deploy, and which benchmarks to generate configs for.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    /// Workload copied into generated benchmark configs.
    pub workload: WorkloadParameters,
    /// Benchmark name to input parameter. A parameter of `0` disables the benchmark.
    #[serde(default)]
    pub benchmarks: BTreeMap<String, u64>,
    /// Memory sizes to benchmark. `None` selects all deployed sizes.
    #[serde(default)]
    pub memory_sizes: Option<Vec<u32>>,
    #[serde(default)]
    pub deployments: Vec<DeploymentTarget>,
}

impl DeployConfig {
    /// Loads and validates a deployment config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = read_yaml(path)?;

        if config.benchmarks.is_empty() {
            tracing::warn!("no benchmarks defined, no functions will be selected");
        }
        if config.memory_sizes.as_ref().is_none_or(Vec::is_empty) {
            tracing::warn!("no memory sizes configured, using all memory sizes");
            config.memory_sizes = None;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the workload and every deployment target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workload.validate()?;

        for (index, target) in self.deployments.iter().enumerate() {
            target
                .validate()
                .map_err(|reason| ConfigError::Deployment { index, reason })?;
        }

        Ok(())
    }

    /// Returns the parameter of an enabled benchmark.
    pub fn benchmark_parameter(&self, benchmark: &str) -> Option<u64> {
        self.benchmarks
            .get(benchmark)
            .copied()
            .filter(|parameter| *parameter > 0)
    }

    /// Returns `true` if functions with this memory size should be benchmarked.
    pub fn includes_memory_size(&self, memory: u32) -> bool {
        self.memory_sizes
            .as_ref()
            .is_none_or(|sizes| sizes.contains(&memory))
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let file = fs::File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
