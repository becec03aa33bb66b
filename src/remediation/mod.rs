//! Remediation handlers and the static kind registry.
//!
//! A handler receives a task's evidence and reports success, a retryable
//! failure or a fatal failure. What it actually does is opaque to the agent.
//! The registry is assembled and validated at startup; a category routed to
//! an unregistered kind is a configuration error.

pub mod webhook;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use self::webhook::WebhookHandler;
use crate::config::RemediationConfig;
use crate::detect::{Category, Severity};

/// Kind name of the built-in no-op handler.
pub const ACKNOWLEDGE: &str = "acknowledge";

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("remediation kind '{0}' is registered twice")]
    Duplicate(String),
    #[error("category {category} is routed to unregistered remediation kind '{kind}'")]
    UnknownKind { category: Category, kind: String },
    #[error("failed to build handler '{kind}': {reason}")]
    Build { kind: String, reason: String },
}

/// What a handler is asked to fix.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRequest {
    pub task_id: Uuid,
    pub finding_id: Uuid,
    pub kind: String,
    pub category: Category,
    pub severity: Severity,
    pub signature: String,
    pub evidence: serde_json::Value,
    /// 1-based attempt number for this execution.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemediationOutcome {
    Success(serde_json::Value),
    /// Worth trying again in a later run.
    Retryable(String),
    /// Will not succeed on retry.
    Fatal(String),
}

#[async_trait::async_trait]
pub trait RemediationHandler: Send + Sync {
    fn kind(&self) -> &str;

    async fn remediate(&self, request: &RemediationRequest) -> RemediationOutcome;
}

/// Records the finding as handled without touching anything. Useful for
/// categories that only need a human-visible trail.
pub struct Acknowledge;

#[async_trait::async_trait]
impl RemediationHandler for Acknowledge {
    fn kind(&self) -> &str {
        ACKNOWLEDGE
    }

    async fn remediate(&self, request: &RemediationRequest) -> RemediationOutcome {
        RemediationOutcome::Success(serde_json::json!({
            "acknowledged": true,
            "signature": request.signature,
        }))
    }
}

/// Maps categories to remediation kinds and kinds to handlers.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn RemediationHandler>>,
    routes: BTreeMap<Category, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration: the built-in `acknowledge`
    /// handler, one webhook handler per entry, then the category routes.
    pub fn from_config(cfg: &RemediationConfig, timeout: Duration) -> Result<Self, RemediationError> {
        let mut registry = Self::new();
        registry.register(Arc::new(Acknowledge))?;
        for hook in &cfg.webhooks {
            let handler = WebhookHandler::new(&hook.kind, &hook.url, hook.bearer_token.clone(), timeout)
                .map_err(|e| RemediationError::Build {
                    kind: hook.kind.clone(),
                    reason: e.to_string(),
                })?;
            registry.register(Arc::new(handler))?;
        }
        for (category, kind) in &cfg.routes {
            registry.route(*category, kind);
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn RemediationHandler>) -> Result<(), RemediationError> {
        let kind = handler.kind().to_string();
        if self.handlers.contains_key(&kind) {
            return Err(RemediationError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn route(&mut self, category: Category, kind: impl Into<String>) {
        self.routes.insert(category, kind.into());
    }

    /// Every route must point at a registered kind.
    pub fn validate(&self) -> Result<(), RemediationError> {
        for (category, kind) in &self.routes {
            if !self.handlers.contains_key(kind) {
                return Err(RemediationError::UnknownKind {
                    category: *category,
                    kind: kind.clone(),
                });
            }
        }
        Ok(())
    }

    /// The remediation kind routed for a category, if any.
    pub fn kind_for(&self, category: Category) -> Option<&str> {
        self.routes.get(&category).map(String::as_str)
    }

    pub fn handler(&self, kind: &str) -> Option<Arc<dyn RemediationHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
