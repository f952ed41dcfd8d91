//! Evidence Collector interface
//!
//! Collectors are read-only probes (disk, drivers, network, event log,
//! resources). Each one answers `investigate(step, options)` with a JSON
//! report. The conventional report shape is:
//!
//! ```json
//! { "findings": [...], "recommendations": [...], "metrics": {...} }
//! ```
//!
//! Callers isolate every call; a collector error never aborts a session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collector errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectorError {
    #[error("No collector registered for '{0}'")]
    NotRegistered(String),

    #[error("Collector '{collector}' does not support action '{action}'")]
    UnsupportedAction { collector: String, action: String },

    #[error("Collector '{collector}' failed: {message}")]
    Failed { collector: String, message: String },

    #[error("Collector '{collector}' rejected {key} = {value:?}")]
    InvalidArgument {
        collector: String,
        key: String,
        value: String,
    },
}

/// One step of an investigation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvestigationStep {
    pub action: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl InvestigationStep {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            config: serde_json::Map::new(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub timeout: Duration,
    pub max_items: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_items: 50,
        }
    }
}

/// A read-only evidence source
#[async_trait]
pub trait Collector: Send + Sync {
    /// Registry key, e.g. `disk`
    fn name(&self) -> &str;

    async fn investigate(
        &self,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError>;
}

/// Collectors by name
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector, replacing any previous one with the same name
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.insert(collector.name().to_string(), collector);
    }

    pub fn with(mut self, collector: Arc<dyn Collector>) -> Self {
        self.register(collector);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn investigate(
        &self,
        collector: &str,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        let target = self
            .get(collector)
            .ok_or_else(|| CollectorError::NotRegistered(collector.to_string()))?;
        target.investigate(step, options).await
    }
}

/// Collector with canned per-action responses (tests and replays)
pub struct StaticCollector {
    name: String,
    responses: HashMap<String, Result<serde_json::Value, String>>,
    calls: Mutex<Vec<InvestigationStep>>,
}

impl StaticCollector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(mut self, action: &str, report: serde_json::Value) -> Self {
        self.responses.insert(action.to_string(), Ok(report));
        self
    }

    pub fn fail(mut self, action: &str, message: &str) -> Self {
        self.responses
            .insert(action.to_string(), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<InvestigationStep> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Collector for StaticCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn investigate(
        &self,
        step: &InvestigationStep,
        _options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(step.clone());
        }
        match self.responses.get(&step.action) {
            Some(Ok(report)) => Ok(report.clone()),
            Some(Err(message)) => Err(CollectorError::Failed {
                collector: self.name.clone(),
                message: message.clone(),
            }),
            None => Err(CollectorError::UnsupportedAction {
                collector: self.name.clone(),
                action: step.action.clone(),
            }),
        }
    }
}
