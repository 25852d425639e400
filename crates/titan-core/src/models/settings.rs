//! AI backend settings and the configuration gate consulted before execution.
//!
//! Settings are persisted through [`SettingsStore`] and may be overlaid from the
//! environment:
//! - `TITAN_API_KEY` - backend credential; its presence is what "configured" means.
//! - `TITAN_ENDPOINT` - optional backend endpoint.
//! - `TITAN_MODEL` - model identifier.
//! - `TITAN_RETENTION_DAYS` - age after which completed/failed tasks are swept.
//! - `TITAN_SWEEP_INTERVAL_SECS` - how often the retention sweeper runs.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{CoreError, CoreErrorKind, TaskType};
use crate::persistence::{PersistenceResult, SettingsStore};

pub const DEFAULT_MODEL: &str = "titan-default";
pub const DEFAULT_RETENTION_DAYS: u64 = 7;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SettingsError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<SettingsError> for CoreError {
    fn from(error: SettingsError) -> Self {
        CoreError::new(CoreErrorKind::InvalidInput, error.to_string())
    }
}

/// Per task-type switches. Translation ships disabled.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureGates {
    pub web_search: bool,
    pub data_extraction: bool,
    pub form_filling: bool,
    pub page_summary: bool,
    pub translation: bool,
    pub custom: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            web_search: true,
            data_extraction: true,
            form_filling: true,
            page_summary: true,
            translation: false,
            custom: true,
        }
    }
}

impl FeatureGates {
    pub fn is_enabled(&self, task_type: TaskType) -> bool {
        match task_type {
            TaskType::WebSearch => self.web_search,
            TaskType::DataExtraction => self.data_extraction,
            TaskType::FormFilling => self.form_filling,
            TaskType::PageSummary => self.page_summary,
            TaskType::Translation => self.translation,
            TaskType::Custom => self.custom,
        }
    }

    pub fn set_enabled(&mut self, task_type: TaskType, enabled: bool) {
        let slot = match task_type {
            TaskType::WebSearch => &mut self.web_search,
            TaskType::DataExtraction => &mut self.data_extraction,
            TaskType::FormFilling => &mut self.form_filling,
            TaskType::PageSummary => &mut self.page_summary,
            TaskType::Translation => &mut self.translation,
            TaskType::Custom => &mut self.custom,
        };
        *slot = enabled;
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: String,
    pub features: FeatureGates,
    pub retention_days: u64,
    /// Seconds between retention sweeps; a running sweeper picks up changes after its next sweep.
    pub sweep_interval_secs: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: None,
            model: DEFAULT_MODEL.to_string(),
            features: FeatureGates::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl AiSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn with_env_overrides(self) -> Result<Self, SettingsError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        if let Some(api_key) = lookup("TITAN_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Some(endpoint) = lookup("TITAN_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(model) = lookup("TITAN_MODEL") {
            self.model = model;
        }
        if let Some(raw) = lookup("TITAN_RETENTION_DAYS") {
            self.retention_days = parse_u64("TITAN_RETENTION_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("TITAN_SWEEP_INTERVAL_SECS") {
            let interval = parse_u64("TITAN_SWEEP_INTERVAL_SECS", &raw)?;
            if interval == 0 {
                return Err(SettingsError::InvalidValue(
                    "TITAN_SWEEP_INTERVAL_SECS".to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
            self.sweep_interval_secs = interval;
        }
        Ok(self)
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, SettingsError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| SettingsError::InvalidValue(key.to_string(), error.to_string()))
}

/// The only external precondition that can stop `execute` before a transition.
pub trait ConfigurationGate: Send + Sync {
    fn is_configured(&self) -> bool;

    fn is_enabled(&self, _task_type: TaskType) -> bool {
        true
    }
}

/// Shared, swappable settings with optional write-through persistence.
#[derive(Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<AiSettings>>,
    store: Option<Arc<dyn SettingsStore>>,
}

impl SettingsHandle {
    pub fn new(settings: AiSettings) -> Self {
        Self {
            current: Arc::new(RwLock::new(settings)),
            store: None,
        }
    }

    /// Loads persisted settings (defaults when none were saved yet).
    pub fn load(store: Arc<dyn SettingsStore>) -> PersistenceResult<Self> {
        let settings = store.load_settings()?.unwrap_or_default();
        Ok(Self {
            current: Arc::new(RwLock::new(settings)),
            store: Some(store),
        })
    }

    /// Like [`SettingsHandle::load`], with `TITAN_*` variables layered on top. The
    /// overlay is not written back until the next [`SettingsHandle::update`].
    pub fn load_with_env(store: Arc<dyn SettingsStore>) -> PersistenceResult<Self> {
        let settings = store
            .load_settings()?
            .unwrap_or_default()
            .with_env_overrides()?;
        Ok(Self {
            current: Arc::new(RwLock::new(settings)),
            store: Some(store),
        })
    }

    pub fn get(&self) -> AiSettings {
        match self.current.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Persists first, then swaps the in-memory copy.
    pub fn update(&self, settings: AiSettings) -> PersistenceResult<()> {
        if let Some(store) = &self.store {
            store.save_settings(&settings)?;
        }
        let mut current = self.current.write().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "settings lock poisoned")
        })?;
        *current = settings;
        tracing::info!("ai settings updated");
        Ok(())
    }

    pub fn modify(&self, change: impl FnOnce(&mut AiSettings)) -> PersistenceResult<()> {
        let mut settings = self.get();
        change(&mut settings);
        self.update(settings)
    }
}

impl ConfigurationGate for SettingsHandle {
    fn is_configured(&self) -> bool {
        self.get().is_configured()
    }

    fn is_enabled(&self, task_type: TaskType) -> bool {
        self.get().features.is_enabled(task_type)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn blank_api_key_is_not_configured() {
        let mut settings = AiSettings::default();
        assert!(!settings.is_configured());
        settings.api_key = Some("   ".to_string());
        assert!(!settings.is_configured());
        settings.api_key = Some("sk-test".to_string());
        assert!(settings.is_configured());
    }

    #[test]
    fn defaults_keep_a_week_of_history() {
        let settings = AiSettings::default();
        assert_eq!(settings.retention_window(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(300));
        assert!(!settings.features.is_enabled(TaskType::Translation));
        assert!(settings.features.is_enabled(TaskType::PageSummary));
    }

    #[test]
    fn overrides_apply_on_top_of_persisted_values() {
        let settings = AiSettings::default()
            .with_overrides(lookup(&[
                ("TITAN_API_KEY", "sk-env"),
                ("TITAN_MODEL", "titan-large"),
                ("TITAN_RETENTION_DAYS", "3"),
            ]))
            .unwrap();

        assert_eq!(settings.api_key.as_deref(), Some("sk-env"));
        assert_eq!(settings.model, "titan-large");
        assert_eq!(settings.retention_days, 3);
        assert_eq!(settings.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
    }

    #[test]
    fn malformed_override_is_rejected() {
        let error = AiSettings::default()
            .with_overrides(lookup(&[("TITAN_RETENTION_DAYS", "a week")]))
            .unwrap_err();
        assert!(matches!(error, SettingsError::InvalidValue(key, _) if key == "TITAN_RETENTION_DAYS"));

        let error = AiSettings::default()
            .with_overrides(lookup(&[("TITAN_SWEEP_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(error, SettingsError::InvalidValue(..)));
    }

    #[test]
    fn handle_gates_on_features() {
        let handle = SettingsHandle::new(AiSettings {
            api_key: Some("sk-test".to_string()),
            ..AiSettings::default()
        });
        assert!(handle.is_configured());
        assert!(!handle.is_enabled(TaskType::Translation));

        handle
            .modify(|settings| settings.features.set_enabled(TaskType::Translation, true))
            .unwrap();
        assert!(handle.is_enabled(TaskType::Translation));
    }
}
