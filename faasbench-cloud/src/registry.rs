use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use faasbench_core::Provider;
use faasbench_core::config::DeploymentTarget;
use serde::{Deserialize, Serialize};

use crate::deployer::{Deployer, ScriptDeployer};
use crate::error::DeployError;

/// Creates the deployer for a deployment target.
pub type DeployerFactory = Box<dyn Fn(&DeploymentTarget) -> Arc<dyn Deployer> + Send + Sync>;

/// Directories holding each provider's deployment script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptDirs {
    pub gcp: PathBuf,
    pub aws: PathBuf,
    pub azure: PathBuf,
    pub alibaba: PathBuf,
}

impl Default for ScriptDirs {
    fn default() -> Self {
        Self {
            gcp: "deployment/gcp".into(),
            aws: "deployment/aws".into(),
            azure: "deployment/azure".into(),
            alibaba: "deployment/alibaba".into(),
        }
    }
}

impl ScriptDirs {
    pub fn get(&self, provider: Provider) -> &Path {
        match provider {
            Provider::Gcp => &self.gcp,
            Provider::Aws => &self.aws,
            Provider::Azure => &self.azure,
            Provider::Alibaba => &self.alibaba,
        }
    }
}

/// Maps providers to the factory of their [`Deployer`].
#[derive(Default)]
pub struct DeployerRegistry {
    factories: HashMap<Provider, DeployerFactory>,
}

impl fmt::Debug for DeployerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.factories.keys().collect();
        providers.sort();
        f.debug_struct("DeployerRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl DeployerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers [`ScriptDeployer`]s for all providers.
    pub fn with_scripts(dirs: &ScriptDirs) -> Self {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            let dir = dirs.get(provider).to_owned();
            registry.register(provider, move |target| {
                Arc::new(ScriptDeployer::new(provider, &target.region, &dir)) as Arc<dyn Deployer>
            });
        }
        registry
    }

    /// Registers the factory for `provider`, replacing any previous one.
    pub fn register<F>(&mut self, provider: Provider, factory: F)
    where
        F: Fn(&DeploymentTarget) -> Arc<dyn Deployer> + Send + Sync + 'static,
    {
        self.factories.insert(provider, Box::new(factory));
    }

    /// Creates the deployer for `target`.
    pub fn create(&self, target: &DeploymentTarget) -> Result<Arc<dyn Deployer>, DeployError> {
        let factory = self
            .factories
            .get(&target.provider)
            .ok_or(DeployError::UnknownProvider(target.provider))?;
        Ok(factory(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(provider: Provider, region: &str) -> DeploymentTarget {
        DeploymentTarget {
            provider,
            region: region.into(),
        }
    }

    #[test]
    fn creates_script_deployers() {
        let registry = DeployerRegistry::with_scripts(&ScriptDirs::default());

        for provider in Provider::ALL {
            let deployer = registry.create(&target(provider, "somewhere")).unwrap();
            assert_eq!(deployer.provider(), provider);
            assert_eq!(deployer.region(), "somewhere");
        }
    }

    #[test]
    fn rejects_unregistered_providers() {
        let registry = DeployerRegistry::new();
        let err = registry
            .create(&target(Provider::Aws, "eu-central-1"))
            .unwrap_err();
        assert!(matches!(err, DeployError::UnknownProvider(Provider::Aws)));
    }

    #[test]
    fn script_dirs_default_per_provider() {
        let dirs = ScriptDirs::default();
        assert_eq!(dirs.get(Provider::Azure), Path::new("deployment/azure"));
        assert_eq!(dirs.get(Provider::Alibaba), Path::new("deployment/alibaba"));
    }
}
