//! Kubernetes client wrapper

use std::path::Path;

use anyhow::{Context, Result, bail};
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubernetes client wrapper
pub struct KubeClient {
    /// `None` when no kubeconfig could be read; connections then use in-cluster config
    kubeconfig: Option<Kubeconfig>,
    current_context: Option<String>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig, if there is one
    pub fn new() -> Self {
        let kubeconfig = match Kubeconfig::read() {
            Ok(kubeconfig) => Some(kubeconfig),
            Err(e) => {
                tracing::debug!(error = %e, "no kubeconfig, will try in-cluster config");
                None
            }
        };

        Self::from_kubeconfig(kubeconfig)
    }

    /// Load the kubeconfig at `path` instead of the default locations
    pub fn from_path(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .context(format!("Failed to read kubeconfig {}", path.display()))?;
        Ok(Self::from_kubeconfig(Some(kubeconfig)))
    }

    fn from_kubeconfig(kubeconfig: Option<Kubeconfig>) -> Self {
        let current_context = kubeconfig
            .as_ref()
            .and_then(|k| k.current_context.clone());

        Self {
            kubeconfig,
            current_context,
        }
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Create a kube::Client for `context`, or for the current context when `None`
    pub async fn connect(&self, context: Option<&str>) -> Result<kube::Client> {
        let config = match &self.kubeconfig {
            Some(kubeconfig) => {
                if let Some(name) = context {
                    if !kubeconfig.contexts.iter().any(|c| c.name == name) {
                        bail!("Context '{}' not found in kubeconfig", name);
                    }
                }

                kube::Config::from_custom_kubeconfig(
                    kubeconfig.clone(),
                    &KubeConfigOptions {
                        context: context.map(str::to_string),
                        ..Default::default()
                    },
                )
                .await
                .context(format!(
                    "Failed to create config for context: {}",
                    context.or(self.current_context()).unwrap_or("<current>")
                ))?
            }
            None => {
                if let Some(name) = context {
                    bail!("Context '{}' requested but no kubeconfig is available", name);
                }
                kube::Config::incluster()
                    .context("No kubeconfig found and in-cluster configuration is unavailable")?
            }
        };

        kube::Client::try_from(config).context("Failed to create Kubernetes client")
    }

    /// Validate that the client can make API calls
    pub async fn validate_client(&self, client: &kube::Client) -> Result<()> {
        let ns: Api<Namespace> = Api::all(client.clone());
        // Just try to list with limit 1 to validate auth
        ns.list(&ListParams::default().limit(1))
            .await
            .context("Cluster API is not reachable")?;
        Ok(())
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}
