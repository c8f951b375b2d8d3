//! Settings, registry and manager wiring shared by all commands

use anyhow::{Context, Result};
use meshvpn_common::PeerRegistry;
use meshvpn_mesh::{Manager, MeshSettings, ProviderRegistry};
use meshvpn_remote::{ConnectionManager, SshHealthChecker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Everything a command needs, loaded once per invocation
pub struct MeshContext {
    settings: MeshSettings,
    config_path: PathBuf,
    registry: Arc<PeerRegistry>,
}

impl MeshContext {
    pub fn load(config_path: &Path) -> Result<Self> {
        let settings = MeshSettings::load(config_path)?;
        Self::from_settings(settings, config_path)
    }

    pub fn from_settings(settings: MeshSettings, config_path: &Path) -> Result<Self> {
        let registry = PeerRegistry::open(&settings.data_dir)
            .with_context(|| format!("opening peer registry at {}", settings.data_dir.display()))?;
        debug!(
            "Loaded {} (stack {}, {} nodes)",
            config_path.display(),
            settings.stack,
            settings.nodes.len()
        );
        Ok(Self {
            settings,
            config_path: config_path.to_path_buf(),
            registry: Arc::new(registry),
        })
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn stack(&self) -> &str {
        &self.settings.stack
    }

    /// Build a manager talking SSH to the configured nodes
    pub async fn manager(&self) -> Result<Manager> {
        let connector = ConnectionManager::from_key_file(&self.settings.ssh_key_path)
            .await
            .with_context(|| format!("loading SSH key {}", self.settings.ssh_key_path.display()))?
            .with_retry_policy(self.settings.retry);

        let provider = ProviderRegistry::with_defaults()
            .resolve(Some(&self.settings.provider_config()))
            .context("configuring VPN provider")?;

        Ok(Manager::new(
            self.settings.manager_settings(),
            Arc::new(connector),
            Arc::new(SshHealthChecker::default()),
            provider,
            self.registry.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_context_opens_registry_from_settings() {
        let dir = TempDir::new().unwrap();
        let mut settings = MeshSettings::default();
        settings.data_dir = dir.path().join("peers");
        settings.stack = "staging".to_string();

        let ctx = MeshContext::from_settings(settings, &dir.path().join("config.toml")).unwrap();
        assert_eq!(ctx.stack(), "staging");
        assert!(ctx.registry().root().exists());
    }

    #[tokio::test]
    async fn test_manager_needs_ssh_key() {
        let dir = TempDir::new().unwrap();
        let mut settings = MeshSettings::default();
        settings.data_dir = dir.path().join("peers");
        settings.ssh_key_path = dir.path().join("missing_key");

        let ctx = MeshContext::from_settings(settings, &dir.path().join("config.toml")).unwrap();
        let err = ctx.manager().await.err().unwrap();
        assert!(err.to_string().contains("loading SSH key"));
    }
}
