//! The `deploy`, `generate` and `remove` commands.

use std::path::Path;

use anyhow::{Context, Result};
use faasbench_cloud::generate;
use faasbench_cloud::orchestrator::DeployOrchestrator;
use faasbench_cloud::registry::DeployerRegistry;
use faasbench_core::Events;
use faasbench_core::config::DeployConfig;

use crate::config::Settings;

fn load(settings: &Settings) -> Result<(DeployConfig, DeployOrchestrator)> {
    let path = &settings.deploy_config;
    let config = DeployConfig::load(path)
        .with_context(|| format!("failed to load deploy config {}", path.display()))?;

    let registry = DeployerRegistry::with_scripts(&settings.scripts);
    let orchestrator = DeployOrchestrator::new(&config, &registry)?;
    Ok((config, orchestrator))
}

/// Deploys the benchmark functions to every target of the deploy config.
pub async fn deploy(settings: &Settings, events: &Events) -> Result<()> {
    let (_, orchestrator) = load(settings)?;

    if let Err(err) = orchestrator.deploy_all(events).await {
        events.error("deploy", format!("Deployment failed: {err}"));
        return Err(err.into());
    }

    events.info("deploy", "All targets deployed");
    Ok(())
}

/// Writes a benchmark config for the deployed functions to `output`, or the configured path.
pub async fn generate(settings: &Settings, output: Option<&Path>, events: &Events) -> Result<()> {
    let (config, orchestrator) = load(settings)?;
    let output = output.unwrap_or(&settings.generated_config);

    let generated = match generate::benchmark_config(&orchestrator, &config, events).await {
        Ok(generated) => generated,
        Err(err) => {
            events.error(
                "generate_benchmark_config",
                format!("Failed to generate benchmark config: {err}"),
            );
            return Err(err.into());
        }
    };

    generated
        .write_to_file(output)
        .with_context(|| format!("failed to write benchmark config {}", output.display()))?;

    events.info(
        "generate_benchmark_config",
        format!(
            "Wrote {} functions to {}",
            generated.functions.len(),
            output.display()
        ),
    );
    Ok(())
}

/// Removes the benchmark functions from every target of the deploy config.
pub async fn remove(settings: &Settings, events: &Events) -> Result<()> {
    let (_, orchestrator) = load(settings)?;

    if let Err(err) = orchestrator.remove_all(events).await {
        events.error("remove", format!("Removal failed: {err}"));
        return Err(err.into());
    }

    events.info("remove", "All targets removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use faasbench_cloud::deployer::SCRIPT_NAME;
    use faasbench_core::Provider;
    use faasbench_core::config::BenchmarkConfig;
    use faasbench_core::events::MemorySink;

    use super::*;

    const DEPLOY_CONFIG: &str = r#"
workload:
  parallelRequests: 10
  totalRequests: 100
  retriesPerRequest: 2
  resultFolder: results
benchmarks:
  gemm: 300
  gzip: 0
memorySizes: [512]
deployments:
  - provider: aws
    region: eu-central-1
"#;

    const SCRIPT: &str = r#"
case "$1" in
  get-urls)
    echo '{"url":"https://fn.example.com/gemm","auth":"key","memory":512,"benchmark":"gemm","region":"'"$2"'"}'
    echo '{"url":"https://fn.example.com/gemm","auth":"key","memory":128,"benchmark":"gemm","region":"'"$2"'"}'
    ;;
  delete)
    exit 1
    ;;
esac
"#;

    fn settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.deploy_config = dir.join("deployment.yaml");
        settings.generated_config = dir.join("configs/generated.yaml");
        settings.scripts.aws = dir.join("aws");

        fs::write(&settings.deploy_config, DEPLOY_CONFIG).unwrap();
        fs::create_dir_all(&settings.scripts.aws).unwrap();
        fs::write(settings.scripts.aws.join(SCRIPT_NAME), SCRIPT).unwrap();
        settings
    }

    #[tokio::test]
    async fn generates_config_of_deployed_functions() {
        faasbench_test::tracing::init();
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let sink = MemorySink::new();

        generate(&settings, None, &sink.events()).await.unwrap();

        let generated = BenchmarkConfig::load(&settings.generated_config).unwrap();
        assert_eq!(generated.workload.total_requests, 100);
        assert_eq!(generated.functions.len(), 1);
        assert_eq!(generated.functions[0].name, "aws-gemm-512");
        assert_eq!(generated.functions[0].provider, Provider::Aws);
        assert_eq!(sink.of_kind("generate_benchmark_config").len(), 1);
    }

    #[tokio::test]
    async fn writes_to_explicit_output() {
        faasbench_test::tracing::init();
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let output = dir.path().join("elsewhere.yaml");

        generate(&settings, Some(output.as_path()), &MemorySink::new().events())
            .await
            .unwrap();

        assert!(output.exists());
        assert!(!settings.generated_config.exists());
    }

    #[tokio::test]
    async fn reports_failed_removal() {
        faasbench_test::tracing::init();
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let sink = MemorySink::new();

        remove(&settings, &sink.events()).await.unwrap_err();

        let final_events = sink.of_kind("remove");
        assert_eq!(final_events.len(), 1);
        assert!(final_events[0].message.starts_with("Removal failed"));
    }

    #[tokio::test]
    async fn rejects_missing_deploy_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.deploy_config = dir.path().join("missing.yaml");

        let err = deploy(&settings, &MemorySink::new().events())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }
}
