use crate::{ControlResult, validate_runner_image_ref};
use std::time::Duration;

/// Environment variables consumed by the control plane.
pub mod env_keys {
    pub const CLONE_BASE: &str = "GYRE_CLONE_BASE";
    pub const DEFAULT_RUNNER_IMAGE: &str = "GYRE_DEFAULT_RUNNER_IMAGE";
    pub const DEFAULT_ENVIRONMENT: &str = "GYRE_DEFAULT_ENVIRONMENT";
    pub const DEFAULT_SERVICE_ACCOUNT: &str = "GYRE_DEFAULT_SERVICE_ACCOUNT";
    pub const SYSTEM_NAMESPACE: &str = "GYRE_SYSTEM_NAMESPACE";
    pub const SCM_INSTALLATION_TOKEN: &str = "GYRE_SCM_INSTALLATION_TOKEN";
    pub const SCM_PERSONAL_TOKEN: &str = "GYRE_SCM_PERSONAL_TOKEN";
}

#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Base for clone URLs; an absolute path keeps everything local.
    pub clone_base: String,
    /// Digest-pinned image used when auto-provisioning the default
    /// environment.
    pub default_runner_image: String,
    pub default_environment_name: String,
    pub default_service_account: Option<String>,
    pub system_namespace: String,
    pub scm_installation_token: Option<String>,
    pub scm_personal_token: Option<String>,
    pub cancel_marker_ttl: Duration,
    pub branch_lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Cadence of human-question polls; seconds in production.
    pub human_poll_interval: Duration,
}

impl ControlConfig {
    pub fn from_env() -> ControlResult<Self> {
        let config = Self {
            clone_base: std::env::var(env_keys::CLONE_BASE)
                .unwrap_or_else(|_| "https://github.com".to_string()),
            default_runner_image: std::env::var(env_keys::DEFAULT_RUNNER_IMAGE)
                .unwrap_or_else(|_| Self::fallback_runner_image()),
            default_environment_name: std::env::var(env_keys::DEFAULT_ENVIRONMENT)
                .unwrap_or_else(|_| "default".to_string()),
            default_service_account: std::env::var(env_keys::DEFAULT_SERVICE_ACCOUNT).ok(),
            system_namespace: std::env::var(env_keys::SYSTEM_NAMESPACE)
                .unwrap_or_else(|_| "gyre-system".to_string()),
            scm_installation_token: std::env::var(env_keys::SCM_INSTALLATION_TOKEN).ok(),
            scm_personal_token: std::env::var(env_keys::SCM_PERSONAL_TOKEN).ok(),
            cancel_marker_ttl: Duration::from_secs(24 * 60 * 60),
            branch_lock_ttl: Duration::from_secs(6 * 60 * 60),
            heartbeat_interval: Duration::from_secs(15),
            human_poll_interval: Duration::from_secs(3),
        };
        validate_runner_image_ref(&config.default_runner_image)?;
        Ok(config)
    }

    /// Configuration for in-process use (tests, the CLI demo) with a local
    /// clone base.
    pub fn local(clone_base: impl Into<String>) -> Self {
        Self {
            clone_base: clone_base.into(),
            default_runner_image: Self::fallback_runner_image(),
            default_environment_name: "default".to_string(),
            default_service_account: None,
            system_namespace: "gyre-system".to_string(),
            scm_installation_token: None,
            scm_personal_token: Some("local-token".to_string()),
            cancel_marker_ttl: Duration::from_secs(60 * 60),
            branch_lock_ttl: Duration::from_secs(60 * 60),
            heartbeat_interval: Duration::from_secs(15),
            human_poll_interval: Duration::from_millis(50),
        }
    }

    fn fallback_runner_image() -> String {
        format!("ghcr.io/gyre/runner@sha256:{}", "0".repeat(64))
    }

    /// Clone URL for a repository full name. Absolute clone bases are joined
    /// as filesystem paths; HTTP bases get the conventional `.git` suffix.
    pub fn clone_url(&self, repo_full_name: &str) -> String {
        if self.clone_base.starts_with("http") {
            format!("{}/{repo_full_name}.git", self.clone_base.trim_end_matches('/'))
        } else {
            format!("{}/{repo_full_name}", self.clone_base.trim_end_matches('/'))
        }
    }
}
