//! Deployment of the benchmark functions to a single provider region.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use faasbench_core::{Events, Provider};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::error::DeployError;

/// File name of the deployment script in every provider's script directory.
pub const SCRIPT_NAME: &str = "manage-deployment.sh";

/// A benchmark function reported by a deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedFunction {
    pub provider: Provider,
    pub url: String,
    /// Function key, if the provider requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Memory size in MB.
    pub memory: u32,
    pub benchmark: String,
    pub region: String,
}

/// A line printed by `get-urls`. The provider is taken from the deployer.
#[derive(Deserialize)]
struct FunctionRecord {
    url: String,
    #[serde(default)]
    auth: Option<String>,
    memory: u32,
    benchmark: String,
    region: String,
}

/// Manages the benchmark functions of one provider region.
#[async_trait]
pub trait Deployer: fmt::Debug + Send + Sync {
    fn provider(&self) -> Provider;

    fn region(&self) -> &str;

    /// Deploys all benchmark functions.
    async fn deploy(&self, events: &Events) -> Result<(), DeployError>;

    /// Lists the deployed functions, including their auth details.
    async fn load_deployed_functions(
        &self,
        events: &Events,
    ) -> Result<Vec<DeployedFunction>, DeployError>;

    /// Removes all deployed functions.
    async fn remove(&self, events: &Events) -> Result<(), DeployError>;
}

/// A [`Deployer`] driving the provider's deployment script.
///
/// The script is invoked as `bash ./manage-deployment.sh <command> <region>` from within the
/// script directory, with one of these commands:
///
/// - `deploy`: deploys all functions. Output is streamed into events.
/// - `get-urls`: prints one JSON object per deployed function on stdout.
/// - `delete`: removes all functions.
#[derive(Clone, Debug)]
pub struct ScriptDeployer {
    provider: Provider,
    region: String,
    script_dir: PathBuf,
}

impl ScriptDeployer {
    pub fn new(provider: Provider, region: impl Into<String>, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            region: region.into(),
            script_dir: script_dir.into(),
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    fn script(&self) -> PathBuf {
        self.script_dir.join(SCRIPT_NAME)
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg(format!("./{SCRIPT_NAME}"))
            .arg(command)
            .arg(&self.region)
            .current_dir(&self.script_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> DeployError {
        DeployError::Spawn {
            script: self.script(),
            region: self.region.clone(),
            source,
        }
    }

    /// Runs `command` to completion and captures its output.
    async fn run(&self, command: &'static str) -> Result<String, DeployError> {
        let output = self
            .command(command)
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DeployError::Script {
            script: self.script(),
            command,
            region: self.region.clone(),
            status: output.status,
            output: format!("{stdout}{stderr}"),
        })
    }

    fn parse_functions(&self, stdout: &str) -> Result<Vec<DeployedFunction>, DeployError> {
        let mut functions = Vec::new();

        for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let record: FunctionRecord =
                serde_json::from_str(line).map_err(|source| DeployError::Parse {
                    line: line.to_owned(),
                    source,
                })?;

            functions.push(DeployedFunction {
                provider: self.provider,
                url: record.url,
                auth: record.auth.filter(|auth| !auth.is_empty()),
                memory: record.memory,
                benchmark: record.benchmark,
                region: record.region,
            });
        }

        if functions.is_empty() {
            return Err(DeployError::NoFunctions);
        }
        Ok(functions)
    }
}

#[async_trait]
impl Deployer for ScriptDeployer {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn deploy(&self, events: &Events) -> Result<(), DeployError> {
        let kind = format!("deploy_{}", self.provider);
        events.info(&kind, "Starting deployment...");

        let mut child = self
            .command("deploy")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;

        let stdout_kind = format!("{kind}_stdout");
        let stderr_kind = format!("{kind}_stderr");
        let (_, _, status) = tokio::join!(
            stream(events, child.stdout.take(), &stdout_kind),
            stream(events, child.stderr.take(), &stderr_kind),
            child.wait(),
        );

        let status = status.map_err(|err| self.spawn_error(err))?;
        if !status.success() {
            return Err(DeployError::Script {
                script: self.script(),
                command: "deploy",
                region: self.region.clone(),
                status,
                output: String::new(),
            });
        }

        events.info(&kind, "deployment completed successfully");
        Ok(())
    }

    async fn load_deployed_functions(
        &self,
        events: &Events,
    ) -> Result<Vec<DeployedFunction>, DeployError> {
        events.info(
            format!("load_functions_{}", self.provider),
            "Fetching function URLs and keys for all function apps...",
        );

        let stdout = self.run("get-urls").await?;
        let functions = self.parse_functions(&stdout)?;

        events.info(
            format!("deploy_{}", self.provider),
            format!("parsed {} functions", functions.len()),
        );
        Ok(functions)
    }

    async fn remove(&self, events: &Events) -> Result<(), DeployError> {
        let kind = format!("remove_{}", self.provider);
        events.info(&kind, "Starting removal of deployment...");

        if let Err(err) = self.run("delete").await {
            events.error(&kind, format!("failed to remove deployment: {err}"));
            return Err(err);
        }

        events.info(&kind, "removal completed successfully");
        Ok(())
    }
}

async fn stream<R>(events: &Events, pipe: Option<R>, kind: &str)
where
    R: AsyncRead + Unpin,
{
    if let Some(pipe) = pipe {
        events.stream_lines(pipe, kind).await;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use faasbench_core::events::MemorySink;
    use faasbench_core::Severity;

    use super::*;

    /// Creates a script directory with a deployment script running `body`.
    fn script_dir(body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SCRIPT_NAME), body).unwrap();
        dir
    }

    const SCRIPT: &str = r#"
case "$1" in
  deploy)
    echo "deploying to $2"
    echo "warning: slow region" >&2
    ;;
  get-urls)
    echo '{"provider":"ignored","url":"https://fn.example.com/gemm","auth":"key-1","memory":512,"benchmark":"gemm","region":"'"$2"'"}'
    echo ''
    echo '{"url":"https://fn.example.com/gzip","memory":128,"benchmark":"gzip","region":"'"$2"'"}'
    ;;
  delete)
    echo "cannot delete $2"
    exit 3
    ;;
esac
"#;

    #[tokio::test]
    async fn deploy_streams_output() {
        let dir = script_dir(SCRIPT);
        let deployer = ScriptDeployer::new(Provider::Aws, "eu-central-1", dir.path());
        let sink = MemorySink::new();

        deployer.deploy(&sink.events()).await.unwrap();

        let stdout = sink.of_kind("deploy_aws_stdout");
        assert_eq!(stdout.len(), 1);
        assert_eq!(stdout[0].message, "deploying to eu-central-1");

        let stderr = sink.of_kind("deploy_aws_stderr");
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].message, "warning: slow region");

        let progress = sink.of_kind("deploy_aws");
        assert_eq!(
            progress.last().map(|event| event.message.as_str()),
            Some("deployment completed successfully")
        );
    }

    #[tokio::test]
    async fn parses_deployed_functions() {
        let dir = script_dir(SCRIPT);
        let deployer = ScriptDeployer::new(Provider::Azure, "westeurope", dir.path());
        let sink = MemorySink::new();

        let functions = deployer
            .load_deployed_functions(&sink.events())
            .await
            .unwrap();

        assert_eq!(
            functions,
            [
                DeployedFunction {
                    provider: Provider::Azure,
                    url: "https://fn.example.com/gemm".into(),
                    auth: Some("key-1".into()),
                    memory: 512,
                    benchmark: "gemm".into(),
                    region: "westeurope".into(),
                },
                DeployedFunction {
                    provider: Provider::Azure,
                    url: "https://fn.example.com/gzip".into(),
                    auth: None,
                    memory: 128,
                    benchmark: "gzip".into(),
                    region: "westeurope".into(),
                },
            ]
        );
        assert_eq!(sink.of_kind("load_functions_azure").len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_function_list() {
        let dir = script_dir("echo");
        let deployer = ScriptDeployer::new(Provider::Gcp, "europe-west3", dir.path());

        let err = deployer
            .load_deployed_functions(&MemorySink::new().events())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NoFunctions));
    }

    #[tokio::test]
    async fn rejects_malformed_lines() {
        let dir = script_dir("echo 'Deploying...'");
        let deployer = ScriptDeployer::new(Provider::Gcp, "europe-west3", dir.path());

        let err = deployer
            .load_deployed_functions(&MemorySink::new().events())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Parse { ref line, .. } if line == "Deploying..."));
    }

    #[tokio::test]
    async fn reports_failed_removal() {
        let dir = script_dir(SCRIPT);
        let deployer = ScriptDeployer::new(Provider::Alibaba, "cn-hangzhou", dir.path());
        let sink = MemorySink::new();

        let err = deployer.remove(&sink.events()).await.unwrap_err();
        let DeployError::Script {
            command, output, ..
        } = &err
        else {
            panic!("expected script error, got {err:?}");
        };
        assert_eq!(*command, "delete");
        assert!(output.contains("cannot delete cn-hangzhou"));

        let errors: Vec<_> = sink
            .of_kind("remove_alibaba")
            .into_iter()
            .filter(|event| event.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot delete cn-hangzhou"));
    }

    #[tokio::test]
    async fn reports_missing_script_directory() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = ScriptDeployer::new(Provider::Aws, "eu-central-1", dir.path().join("nope"));

        let err = deployer.deploy(&MemorySink::new().events()).await.unwrap_err();
        assert!(matches!(err, DeployError::Spawn { .. }));
    }
}
