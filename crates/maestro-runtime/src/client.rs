//! Action client implementations.
//!
//! The conductor and driver see actions through the [`ActionClient`]
//! capability. The in-memory client backs tests and embedded hosts with a
//! registry of named handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use maestro_core::compose::parse_action_name;
use maestro_core::conduct::{ActionClient, ActionError};

/// Handler closure for one registered action.
pub type ActionHandler = Arc<dyn Fn(Value) -> Result<Value, ActionError> + Send + Sync>;

/// In-memory action registry keyed by fully qualified name.
pub struct InMemoryActionClient {
    actions: RwLock<HashMap<String, ActionHandler>>,
}

impl InMemoryActionClient {
    /// Create an empty client.
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Register an action handler. The name is qualified through the action
    /// name grammar, so `"echo"` registers as `"/_/echo"`.
    pub async fn register<F>(&self, name: &str, handler: F) -> Result<(), ActionError>
    where
        F: Fn(Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        let qualified =
            parse_action_name(name).map_err(|err| ActionError::InvalidName(err.to_string()))?;
        self.actions
            .write()
            .await
            .insert(qualified, Arc::new(handler));
        Ok(())
    }

    /// All registered action names.
    pub async fn names(&self) -> Vec<String> {
        self.actions.read().await.keys().cloned().collect()
    }
}

impl Default for InMemoryActionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionClient for InMemoryActionClient {
    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ActionError> {
        let handler = self
            .actions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;
        tracing::debug!(action = %name, "invoking action");
        handler(params)
    }

    async fn fire(&self, name: &str, params: Value) -> Result<Value, ActionError> {
        let handler = self
            .actions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;
        let activation_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(action = %name, activation_id = %activation_id, "fired action");
        if let Err(err) = handler(params) {
            // fire-and-forget: the activation descriptor is returned anyway
            tracing::warn!(action = %name, error = %err, "asynchronous action failed");
        }
        Ok(json!({ "activation_id": activation_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_qualifies_names() {
        tokio_test::block_on(async {
            let client = InMemoryActionClient::new();
            client
                .register("echo", |params| Ok(params))
                .await
                .unwrap();
            assert_eq!(client.names().await, vec!["/_/echo".to_string()]);

            let result = client.invoke("/_/echo", json!({"x": 1})).await.unwrap();
            assert_eq!(result, json!({"x": 1}));
        });
    }

    #[test]
    fn test_unknown_action_is_not_found() {
        tokio_test::block_on(async {
            let client = InMemoryActionClient::new();
            let err = client.invoke("/_/ghost", json!({})).await.unwrap_err();
            assert!(matches!(err, ActionError::NotFound(_)));
        });
    }

    #[test]
    fn test_fire_returns_an_activation_descriptor() {
        tokio_test::block_on(async {
            let client = InMemoryActionClient::new();
            client
                .register("bg", |_params| Ok(json!({"done": true})))
                .await
                .unwrap();
            let descriptor = client.fire("/_/bg", json!({})).await.unwrap();
            assert!(descriptor.get("activation_id").is_some());
        });
    }

    #[test]
    fn test_register_rejects_invalid_names() {
        tokio_test::block_on(async {
            let client = InMemoryActionClient::new();
            let err = client
                .register("a/b/c/d", |params| Ok(params))
                .await
                .unwrap_err();
            assert!(matches!(err, ActionError::InvalidName(_)));
        });
    }
}
