//! Orchestrator-wide configuration. Mirrors the teacher's `PhaseGolemConfig`
//! idiom: a plain struct with manual `Default`, TOML loading with
//! fallback-to-default semantics, and a `validate()` that collects every
//! violation instead of bailing on the first.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RehydrationConfig {
    pub startup_delay_ms: u64,
    pub sweep_timeout_ms: u64,
    pub sleep_between_campaigns_ms: u64,
    pub run_on_start: bool,
}

impl Default for RehydrationConfig {
    fn default() -> Self {
        RehydrationConfig {
            startup_delay_ms: 3_000,
            sweep_timeout_ms: 120_000,
            sleep_between_campaigns_ms: 25,
            run_on_start: true,
        }
    }
}

impl RehydrationConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }

    pub fn sleep_between_campaigns(&self) -> Duration {
        Duration::from_millis(self.sleep_between_campaigns_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.sweep_timeout_ms == 0 {
            errors.push("rehydration.sweep_timeout_ms must be greater than 0".to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long `PausePhase`/`ResumePhase` wait for a worker ack before
    /// timing out (spec §5).
    pub control_ack_timeout_ms: u64,
    /// TTL for cached control-op outcomes keyed by idempotency key.
    pub idempotency_ttl_ms: u64,
    /// Buffer size of each `PhaseControlBus` channel.
    pub control_bus_buffer: usize,
    /// Whether `RehydrateInFlight` actually resumes `in_progress` phases or
    /// only parks them `paused` (spec §9 ambiguity 1). Defaults to `false`:
    /// deferred-paused on restart.
    pub auto_resume_on_restart: bool,
    pub rehydration: RehydrationConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            control_ack_timeout_ms: 30_000,
            idempotency_ttl_ms: 300_000,
            control_bus_buffer: 8,
            auto_resume_on_restart: false,
            rehydration: RehydrationConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn control_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.control_ack_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    /// Collects every configuration violation instead of stopping at the
    /// first, matching the teacher's config validation idiom.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.control_ack_timeout_ms == 0 {
            errors.push("control_ack_timeout_ms must be greater than 0".to_string());
        }
        if self.idempotency_ttl_ms == 0 {
            errors.push("idempotency_ttl_ms must be greater than 0".to_string());
        }
        if self.control_bus_buffer == 0 {
            errors.push("control_bus_buffer must be greater than 0".to_string());
        }
        self.rehydration.validate(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads configuration from a TOML file at `path`, falling back to
/// `OrchestratorConfig::default()` when the file does not exist. Any other
/// I/O or parse error is surfaced.
pub fn load_config_from(path: &Path) -> Result<OrchestratorConfig, String> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let config: OrchestratorConfig =
        toml::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", path.display()))?;

    config
        .validate()
        .map_err(|errors| format!("invalid config in {}: {}", path.display(), errors.join("; ")))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_timeouts_collect_multiple_errors() {
        let config = OrchestratorConfig {
            control_ack_timeout_ms: 0,
            idempotency_ttl_ms: 0,
            ..OrchestratorConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = load_config_from(Path::new("/nonexistent/orchestrator.toml")).unwrap();
        assert_eq!(config.control_bus_buffer, 8);
    }

    #[test]
    fn loads_overrides_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        fs::write(&path, "auto_resume_on_restart = true\n").unwrap();
        let config = load_config_from(&path).unwrap();
        assert!(config.auto_resume_on_restart);
        assert_eq!(config.control_ack_timeout_ms, 30_000);
    }
}
