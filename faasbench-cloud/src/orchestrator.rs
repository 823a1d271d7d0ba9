//! Runs deployment operations against all configured targets in parallel.

use std::sync::{Arc, Mutex, PoisonError};

use faasbench_core::config::{BenchmarkFunctionConfig, DeployConfig};
use faasbench_core::timeline::{RunMode, Timeline, TimelineError};
use faasbench_core::{Events, Provider};

use crate::deployer::{DeployedFunction, Deployer};
use crate::error::DeployError;
use crate::registry::DeployerRegistry;

/// The deployer of one `(provider, region)` target.
#[derive(Clone, Debug)]
struct TargetClient {
    deployer: Arc<dyn Deployer>,
}

impl TargetClient {
    fn provider(&self) -> Provider {
        self.deployer.provider()
    }

    fn region(&self) -> &str {
        self.deployer.region()
    }

    fn step_name(&self) -> String {
        format!("{}:{}", self.provider(), self.region())
    }

    async fn deploy(self, events: Events) -> anyhow::Result<()> {
        let kind = format!("deploy_{}", self.provider());
        let region = self.region();
        events.info(&kind, format!("Starting deployment in {region} region"));

        if let Err(err) = self.deployer.deploy(&events).await {
            events.error(&kind, format!("Deployment failed in {region} region: {err}"));
            return Err(err.into());
        }

        events.info(&kind, format!("Deployment succeeded in {region} region"));
        Ok(())
    }

    async fn remove(self, events: Events) -> anyhow::Result<()> {
        let kind = format!("remove_{}", self.provider());
        let region = self.region();
        events.info(&kind, format!("Starting removal in {region} region"));

        if let Err(err) = self.deployer.remove(&events).await {
            events.error(&kind, format!("Removal failed in {region} region: {err}"));
            return Err(err.into());
        }

        events.info(&kind, format!("Removal succeeded in {region} region"));
        Ok(())
    }
}

/// Deploys, lists and removes the benchmark functions of every target in a deploy config.
#[derive(Debug)]
pub struct DeployOrchestrator {
    targets: Vec<TargetClient>,
}

impl DeployOrchestrator {
    /// Creates one deployer per distinct `(provider, region)` target of `config`.
    pub fn new(config: &DeployConfig, registry: &DeployerRegistry) -> Result<Self, DeployError> {
        let mut targets: Vec<TargetClient> = Vec::with_capacity(config.deployments.len());

        for target in &config.deployments {
            let duplicate = targets.iter().any(|client| {
                client.provider() == target.provider && client.region() == target.region
            });
            if duplicate {
                tracing::warn!(
                    provider = %target.provider,
                    region = %target.region,
                    "ignoring duplicate deployment target"
                );
                continue;
            }

            targets.push(TargetClient {
                deployer: registry.create(target)?,
            });
        }

        Ok(Self { targets })
    }

    /// Returns the `(provider, region)` pairs of all targets.
    pub fn targets(&self) -> impl Iterator<Item = (Provider, &str)> {
        self.targets
            .iter()
            .map(|client| (client.provider(), client.region()))
    }

    /// Deploys all targets in parallel.
    pub async fn deploy_all(&self, events: &Events) -> Result<(), TimelineError> {
        let mut timeline = Timeline::new("Deploy All Targets", RunMode::Parallel);
        for client in &self.targets {
            let client = client.clone();
            timeline = timeline.step(client.step_name(), move |events| client.deploy(events));
        }
        timeline.run(events).await
    }

    /// Removes all targets in parallel.
    pub async fn remove_all(&self, events: &Events) -> Result<(), TimelineError> {
        let mut timeline = Timeline::new("Remove All Targets", RunMode::Parallel);
        for client in &self.targets {
            let client = client.clone();
            timeline = timeline.step(client.step_name(), move |events| client.remove(events));
        }
        timeline.run(events).await
    }

    /// Lists the deployed functions of all targets and turns those passing `filter` into
    /// benchmark function configs.
    ///
    /// Fails if listing fails for any target. Results are sorted by name and region.
    pub async fn generate_benchmark_functions<F, T>(
        &self,
        events: &Events,
        filter: F,
        transform: T,
    ) -> Result<Vec<BenchmarkFunctionConfig>, TimelineError>
    where
        F: Fn(&DeployedFunction) -> bool + Send + Sync + 'static,
        T: Fn(&DeployedFunction) -> BenchmarkFunctionConfig + Send + Sync + 'static,
    {
        let filter = Arc::new(filter);
        let transform = Arc::new(transform);
        let collected = Arc::new(Mutex::new(Vec::new()));

        let mut timeline = Timeline::new("Get Deployed Functions", RunMode::Parallel);
        for client in &self.targets {
            let client = client.clone();
            let filter = Arc::clone(&filter);
            let transform = Arc::clone(&transform);
            let collected = Arc::clone(&collected);

            timeline = timeline.step(client.step_name(), move |events| async move {
                let kind = format!("get_functions_{}", client.provider());
                let (provider, region) = (client.provider(), client.region());

                let deployed = match client.deployer.load_deployed_functions(&events).await {
                    Ok(deployed) => deployed,
                    Err(err) => {
                        events.error(
                            &kind,
                            format!("Failed to load functions for {provider} in {region}: {err}"),
                        );
                        return Err(anyhow::Error::from(err));
                    }
                };

                let functions: Vec<_> = deployed
                    .iter()
                    .filter(|function| filter(function))
                    .map(|function| transform(function))
                    .collect();

                events.info(
                    &kind,
                    format!(
                        "Loaded {} functions for {provider} in {region}, {} passed filtering",
                        deployed.len(),
                        functions.len()
                    ),
                );

                collected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(functions);
                Ok(())
            });
        }

        timeline.run(events).await?;

        let mut functions =
            std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
        functions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.region.cmp(&b.region)));
        Ok(functions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use faasbench_core::config::{AuthConfig, DeploymentTarget, WorkloadParameters};
    use faasbench_core::events::MemorySink;

    use super::*;

    /// A deployer answering from memory, failing for the region `broken`.
    #[derive(Debug)]
    struct FakeDeployer {
        provider: Provider,
        region: String,
        calls: Arc<AtomicUsize>,
    }

    impl FakeDeployer {
        fn check(&self) -> Result<(), DeployError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.region == "broken" {
                return Err(DeployError::NoFunctions);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Deployer for FakeDeployer {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn region(&self) -> &str {
            &self.region
        }

        async fn deploy(&self, _events: &Events) -> Result<(), DeployError> {
            self.check()
        }

        async fn load_deployed_functions(
            &self,
            _events: &Events,
        ) -> Result<Vec<DeployedFunction>, DeployError> {
            self.check()?;
            Ok([128, 512]
                .into_iter()
                .map(|memory| DeployedFunction {
                    provider: self.provider,
                    url: format!("https://{}.example.com/gemm", self.region),
                    auth: None,
                    memory,
                    benchmark: "gemm".into(),
                    region: self.region.clone(),
                })
                .collect())
        }

        async fn remove(&self, _events: &Events) -> Result<(), DeployError> {
            self.check()
        }
    }

    fn to_config(function: &DeployedFunction) -> BenchmarkFunctionConfig {
        BenchmarkFunctionConfig {
            name: format!("{}-{}", function.provider, function.memory),
            provider: function.provider,
            region: function.region.clone(),
            memory_size: function.memory,
            url: function.url.clone(),
            auth: AuthConfig::default(),
        }
    }

    fn setup(targets: &[(Provider, &str)]) -> (DeployOrchestrator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = DeployerRegistry::new();
        for provider in Provider::ALL {
            let calls = Arc::clone(&calls);
            registry.register(provider, move |target| {
                Arc::new(FakeDeployer {
                    provider: target.provider,
                    region: target.region.clone(),
                    calls: Arc::clone(&calls),
                }) as Arc<dyn Deployer>
            });
        }

        let config = DeployConfig {
            workload: WorkloadParameters {
                parallel_requests: 1,
                total_requests: 1,
                retries_per_request: 0,
                result_folder: "results".into(),
            },
            benchmarks: Default::default(),
            memory_sizes: None,
            deployments: targets
                .iter()
                .map(|(provider, region)| DeploymentTarget {
                    provider: *provider,
                    region: (*region).into(),
                })
                .collect(),
        };

        let orchestrator = DeployOrchestrator::new(&config, &registry).unwrap();
        (orchestrator, calls)
    }

    #[tokio::test]
    async fn deduplicates_targets() {
        let (orchestrator, _) = setup(&[
            (Provider::Aws, "eu-central-1"),
            (Provider::Aws, "eu-central-1"),
            (Provider::Gcp, "eu-central-1"),
        ]);
        assert_eq!(orchestrator.targets().count(), 2);
    }

    #[tokio::test]
    async fn deploys_every_target() {
        let (orchestrator, calls) = setup(&[(Provider::Aws, "a"), (Provider::Azure, "b")]);
        let sink = MemorySink::new();

        orchestrator.deploy_all(&sink.events()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.of_kind("deploy_aws").len(), 2);
        assert_eq!(sink.of_kind("deploy_azure").len(), 2);
    }

    #[tokio::test]
    async fn removal_failures_do_not_stop_other_targets() {
        let (orchestrator, calls) = setup(&[(Provider::Aws, "broken"), (Provider::Aws, "fine")]);
        let sink = MemorySink::new();

        let err = orchestrator.remove_all(&sink.events()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.failed_steps(), ["aws:broken"]);
        assert!(
            sink.of_kind("remove_aws")
                .iter()
                .any(|event| event.message == "Removal succeeded in fine region")
        );
    }

    #[tokio::test]
    async fn collects_generated_functions() {
        let (orchestrator, _) = setup(&[(Provider::Gcp, "west"), (Provider::Aws, "east")]);
        let sink = MemorySink::new();

        let functions = orchestrator
            .generate_benchmark_functions(
                &sink.events(),
                |function| function.memory > 128,
                to_config,
            )
            .await
            .unwrap();

        let names: Vec<_> = functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["aws-512", "gcp-512"]);
        assert_eq!(sink.of_kind("get_functions_gcp").len(), 1);
    }

    #[tokio::test]
    async fn generation_fails_if_any_target_fails() {
        let (orchestrator, _) = setup(&[(Provider::Gcp, "broken"), (Provider::Aws, "east")]);
        let sink = MemorySink::new();

        let err = orchestrator
            .generate_benchmark_functions(&sink.events(), |_| true, to_config)
            .await;
        assert!(err.is_err());
        assert_eq!(sink.of_kind("get_functions_gcp").len(), 1);
    }
}
