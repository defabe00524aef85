//! Host drive loop.
//!
//! The driver owns the host side of the continuation protocol: conduct until
//! the composition suspends, invoke the requested action, write its response
//! into the params, inject `$resume`, and re-enter the conductor. Failures
//! from the action client are written back as `{error: ...}` params so
//! compositions can catch them.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use maestro_core::conduct::{ActionClient, ConductError, Conductor, Outcome};

/// Driver tuning knobs.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Upper bound on action invocations per run.
    pub max_resumes: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { max_resumes: 1_000 }
    }
}

/// Drive loop errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("conduct error: {0}")]
    Conduct(#[from] ConductError),

    #[error("resume limit exceeded after {0} action invocations")]
    ResumeLimit(usize),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Runs a composition to completion against an action client.
pub struct Driver {
    conductor: Conductor,
    client: Arc<dyn ActionClient>,
    config: DriverConfig,
}

impl Driver {
    /// Create a driver over a conductor and an action client.
    pub fn new(conductor: Conductor, client: Arc<dyn ActionClient>) -> Self {
        Self {
            conductor,
            client,
            config: DriverConfig::default(),
        }
    }

    /// Override the driver configuration.
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the composition to a terminal parameter object, which may be an
    /// error object.
    pub async fn run(&self, params: Value) -> Result<Value, DriverError> {
        let mut params = params;
        let mut resumes = 0usize;
        loop {
            match self.conductor.conduct(params).await? {
                Outcome::Complete { params } => return Ok(params),
                Outcome::Suspended {
                    action,
                    params: action_params,
                    resume,
                } => {
                    if resumes >= self.config.max_resumes {
                        return Err(DriverError::ResumeLimit(resumes));
                    }
                    resumes += 1;
                    tracing::info!(action = %action, resumes, "invoking suspended action");

                    let response = match self.client.invoke(&action, action_params).await {
                        Ok(response) => response,
                        Err(err) => {
                            tracing::warn!(action = %action, error = %err, "action invocation failed");
                            json!({ "error": err.to_string() })
                        }
                    };
                    let mut next = if response.is_object() {
                        response
                    } else {
                        json!({ "value": response })
                    };
                    if let Some(map) = next.as_object_mut() {
                        map.insert("$resume".to_string(), serde_json::to_value(&resume)?);
                    }
                    params = next;
                }
            }
        }
    }
}
