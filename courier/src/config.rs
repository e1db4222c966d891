//! Application configuration
//!
//! ```ron
//! (
//!     orchestrator: (
//!         rate_limit: (capacity: 5, interval_ms: 1000),
//!         retry: (max_attempts: 3, base_delay_ms: 500),
//!     ),
//!     providers: [
//!         (name: "ProviderA", fail_rate: 0.5),
//!         (name: "ProviderB", fail_rate: 0.2),
//!     ],
//! )
//! ```

use std::path::{Path, PathBuf};

use courier_delivery::OrchestratorConfig;
use serde::Deserialize;

const CONFIG_ENV: &str = "COURIER_CONFIG";

/// A mock provider to register, in priority order
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Probability in `0.0..=1.0` that an attempt fails
    #[serde(default)]
    pub fail_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(alias = "provider")]
    pub providers: Vec<ProviderConfig>,
}

impl CourierConfig {
    /// Parse a RON document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or a provider's failure rate
    /// is outside `0.0..=1.0`.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        let config: Self = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(content)?;

        if let Some(provider) = config
            .providers
            .iter()
            .find(|provider| !(0.0..=1.0).contains(&provider.fail_rate))
        {
            anyhow::bail!(
                "Provider {} has fail_rate {} outside 0.0..=1.0",
                provider.name,
                provider.fail_rate
            );
        }

        Ok(config)
    }

    /// Read and parse the file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Self::from_ron(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `explicit` (the `--config` argument)
/// 2. `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if a requested file does not exist, or none of the defaults do.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    locate(explicit, std::env::var(CONFIG_ENV).ok(), &default_paths())
}

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ]
}

fn locate(
    explicit: Option<&Path>,
    env_path: Option<String>,
    default_paths: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    for path in default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config argument\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
