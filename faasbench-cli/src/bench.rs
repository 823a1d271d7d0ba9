//! The `bench` command: runs the workload against every configured function in parallel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use faasbench_cloud::auth::{GcpIdentityTokens, IdentityTokenProvider};
use faasbench_core::config::BenchmarkConfig;
use faasbench_core::loadgen::{LoadGenerator, cap_parallelism};
use faasbench_core::timeline::{RunMode, Timeline};
use faasbench_core::{Events, Provider};

use crate::config::Settings;

/// A load generator and the unique name it reports progress under.
type NamedGenerator = (String, Arc<LoadGenerator>);

/// Loads the benchmark config and runs it.
pub async fn bench(settings: &Settings, config: Option<&Path>, events: &Events) -> Result<()> {
    let path = config.unwrap_or(&settings.benchmark_config);
    let config = BenchmarkConfig::load(path)
        .with_context(|| format!("failed to load benchmark config {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        functions = config.functions.len(),
        "loaded benchmark config"
    );

    let tokens = GcpIdentityTokens::new(&settings.gcp_service_account);
    run(settings, config, &tokens, events).await
}

/// Sets up one load generator per function and runs all of them as a parallel timeline.
///
/// GCP functions are invoked with an identity token from `tokens`. Setup failures abort the run
/// before any request is sent.
pub async fn run(
    settings: &Settings,
    config: BenchmarkConfig,
    tokens: &dyn IdentityTokenProvider,
    events: &Events,
) -> Result<()> {
    let BenchmarkConfig {
        mut workload,
        functions,
    } = config;
    let started_at = Local::now();

    let mut generators: Vec<NamedGenerator> = Vec::with_capacity(functions.len());
    for mut function in functions {
        if function.provider == Provider::Gcp {
            let token = tokens
                .identity_token(&function.url)
                .await
                .with_context(|| format!("failed to get identity token for {}", function.name))?;
            function.auth.set_value(format!("Bearer {token}"));
        }

        let name = format!(
            "{}-{}-{}-{}-{}",
            function.provider,
            function.region,
            function.name,
            function.memory_size,
            rand::random_range(0..1000)
        );
        events.info("executor_setup", format!("Setting up load generator {name}"));

        cap_parallelism(&mut workload, function.provider, events);
        let generator = LoadGenerator::builder(&workload, function)
            .started_at(started_at)
            .archive_grace(settings.archive_grace)
            .build()
            .with_context(|| format!("failed to set up load generator {name}"))?;

        generators.push((name, Arc::new(generator)));
    }

    let mut timeline = Timeline::new("Benchmark Timeline", RunMode::Parallel);
    for (name, generator) in &generators {
        let generator = Arc::clone(generator);
        timeline = timeline.step(name.clone(), move |events| async move {
            generator.run(&events).await.map_err(anyhow::Error::from)
        });
    }

    let progress = tokio::spawn(report_progress(
        generators,
        settings.events.progress_interval,
        events.clone(),
    ));
    let result = timeline.run(events).await;
    progress.abort();

    result?;
    Ok(())
}

/// Publishes the number of started tasks of every generator once per `period`.
///
/// A zero period disables the reports.
async fn report_progress(generators: Vec<NamedGenerator>, period: Duration, events: Events) {
    if period.is_zero() {
        return;
    }

    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        for (name, generator) in &generators {
            let state = generator.queue_state();
            events.info(
                "progress_update",
                format!("{name}: {}/{} tasks started.", state.dequeued(), state.total),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use faasbench_cloud::AuthError;
    use faasbench_core::config::{AuthConfig, BenchmarkFunctionConfig, WorkloadParameters};
    use faasbench_core::events::MemorySink;
    use faasbench_test::server::TestServer;

    use super::*;

    /// Hands out a fixed token and records the requested audiences.
    #[derive(Debug, Default)]
    struct StaticTokens {
        fail: bool,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IdentityTokenProvider for StaticTokens {
        async fn identity_token(&self, target_url: &str) -> Result<String, AuthError> {
            self.requested.lock().unwrap().push(target_url.to_owned());
            if self.fail {
                return Err(AuthError::MissingToken);
            }
            Ok("static-token".into())
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.archive_grace = Duration::ZERO;
        settings.events.progress_interval = Duration::from_millis(10);
        settings
    }

    fn function(name: &str, provider: Provider, url: String) -> BenchmarkFunctionConfig {
        BenchmarkFunctionConfig {
            name: name.into(),
            provider,
            region: "europe-west3".into(),
            memory_size: 256,
            url,
            auth: AuthConfig::new(provider.auth_header(), ""),
        }
    }

    fn config(result_folder: &Path, functions: Vec<BenchmarkFunctionConfig>) -> BenchmarkConfig {
        BenchmarkConfig {
            workload: WorkloadParameters {
                parallel_requests: 2,
                total_requests: 4,
                retries_per_request: 0,
                result_folder: result_folder.to_owned(),
            },
            functions,
        }
    }

    #[tokio::test]
    async fn runs_all_functions() {
        faasbench_test::tracing::init();
        let server = TestServer::new().await;
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let tokens = StaticTokens::default();

        let config = config(
            dir.path(),
            vec![
                function("gcp-gemm-256", Provider::Gcp, server.url("/ok?parameter=1")),
                function("aws-gemm-256", Provider::Aws, server.url("/ok?parameter=2")),
            ],
        );
        run(&settings(), config, &tokens, &sink.events())
            .await
            .unwrap();

        assert_eq!(server.hits("/ok"), 8);
        assert_eq!(
            *tokens.requested.lock().unwrap(),
            [server.url("/ok?parameter=1")]
        );
        assert_eq!(sink.of_kind("executor_setup").len(), 2);
        assert_eq!(sink.of_kind("function_finished").len(), 2);
        assert_eq!(sink.of_kind("finish_timeline").len(), 1);
    }

    #[tokio::test]
    async fn token_failures_abort_before_any_request() {
        faasbench_test::tracing::init();
        let server = TestServer::new().await;
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let tokens = StaticTokens {
            fail: true,
            ..Default::default()
        };

        let config = config(
            dir.path(),
            vec![
                function("aws-gemm-256", Provider::Aws, server.url("/ok")),
                function("gcp-gemm-256", Provider::Gcp, server.url("/ok")),
            ],
        );
        let err = run(&settings(), config, &tokens, &sink.events())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("gcp-gemm-256"));
        assert_eq!(server.hits("/ok"), 0);
        assert!(sink.of_kind("start_timeline").is_empty());
    }

    #[tokio::test]
    async fn failing_functions_do_not_fail_the_run() {
        faasbench_test::tracing::init();
        let server = TestServer::new().await;
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();

        let config = config(
            dir.path(),
            vec![function("aws-gemm-256", Provider::Aws, server.url("/fail"))],
        );
        run(&settings(), config, &StaticTokens::default(), &sink.events())
            .await
            .unwrap();

        assert_eq!(server.hits("/fail"), 4);
        assert_eq!(sink.of_kind("task_execution").len(), 4);
    }
}
