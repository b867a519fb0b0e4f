//! Control messages received on the `deployment` exchange
//!
//! ```json
//! {"type": "com.flowstudio.deployment.update", "data": {"properties": {...}, "context": {...}, "elements": [...]}}
//! {"type": "com.flowstudio.deployment.message", "data": {"elementId": "a", ...}}
//! {"type": "com.flowstudio.deployment.destroy"}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::router::{guarded, guarded_sync};
use super::Runtime;
use crate::definition::{DeploymentMessage, FlowContext};
use crate::events::{HealthEvent, HealthState};
use crate::transport::Delivery;

/// Type of a reconfiguration message
pub const DEPLOYMENT_UPDATE: &str = "com.flowstudio.deployment.update";
/// Type of a custom element message
pub const DEPLOYMENT_MESSAGE: &str = "com.flowstudio.deployment.message";
/// Type of a shutdown request
pub const DEPLOYMENT_DESTROY: &str = "com.flowstudio.deployment.destroy";

/// Envelope of a control message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Message type
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload
    #[serde(default)]
    pub data: Value,
}

impl ControlMessage {
    /// Reconfiguration message
    pub fn update(update: &FlowUpdate) -> Self {
        Self {
            kind: DEPLOYMENT_UPDATE.to_string(),
            data: serde_json::to_value(update).unwrap_or_default(),
        }
    }

    /// Custom message for one or all elements
    pub fn message(message: &DeploymentMessage) -> Self {
        Self {
            kind: DEPLOYMENT_MESSAGE.to_string(),
            data: serde_json::to_value(message).unwrap_or_default(),
        }
    }

    /// Shutdown request
    pub fn destroy() -> Self {
        Self {
            kind: DEPLOYMENT_DESTROY.to_string(),
            data: Value::Null,
        }
    }

    /// JSON body as published on the transport
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Payload of a reconfiguration message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowUpdate {
    /// Per-element updates
    #[serde(default)]
    pub elements: Vec<ElementUpdate>,
    /// Context fields to merge into the current context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FlowContext>,
    /// Replacement flow-scoped properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl FlowUpdate {
    /// Empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the properties of element `id`
    pub fn element_properties(mut self, id: impl Into<String>, properties: Value) -> Self {
        self.elements.push(ElementUpdate {
            id: id.into(),
            name: None,
            properties: Some(properties),
        });
        self
    }

    /// Merge `context` into the flow's context
    pub fn context(mut self, context: FlowContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Replace the flow-scoped properties
    pub fn properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Display name given to `id` in this update
    pub(crate) fn name_of(&self, id: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.name.as_deref())
    }
}

/// Update of a single element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementUpdate {
    /// Element ID
    pub id: String,
    /// New display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replacement properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl Runtime {
    /// Handle a control message body; unknown types are rejected without requeue
    pub(super) async fn handle_control(self: &Arc<Self>, body: Value) -> Delivery {
        let message: ControlMessage = match serde_json::from_value(body) {
            Ok(message) => message,
            Err(e) => {
                self.logger.error(format!("Invalid control message: {}", e));
                return Delivery::Nack { requeue: false };
            }
        };
        tracing::debug!(kind = %message.kind, "Control message received");

        match message.kind.as_str() {
            DEPLOYMENT_UPDATE => {
                let update: FlowUpdate = match serde_json::from_value(message.data) {
                    Ok(update) => update,
                    Err(e) => {
                        self.logger.error(format!("Invalid flow update: {}", e));
                        return Delivery::Nack { requeue: false };
                    }
                };
                self.update(update).await;
            }
            DEPLOYMENT_MESSAGE => {
                let payload = match message.data {
                    Value::Null => DeploymentMessage::default(),
                    data => match serde_json::from_value(data) {
                        Ok(payload) => payload,
                        Err(e) => {
                            self.logger.error(format!("Invalid deployment message: {}", e));
                            return Delivery::Nack { requeue: false };
                        }
                    },
                };
                self.send_message(payload).await;
            }
            DEPLOYMENT_DESTROY => {
                let runtime = self.clone();
                tokio::spawn(async move { runtime.destroy(0).await });
            }
            other => {
                self.logger
                    .warn(format!("Unknown control message type: {}", other));
                return Delivery::Nack { requeue: false };
            }
        }
        Delivery::Ack
    }

    /// Apply a reconfiguration, then publish the health status
    ///
    /// Every element is updated even if another one fails.
    pub(super) async fn update(&self, update: FlowUpdate) -> HealthState {
        let state = self.apply_update(&update);
        if state == HealthState::UpdatingFailed {
            self.logger.error("Updating the flow failed");
        }

        if let Some(publisher) = &self.publisher {
            let health = HealthEvent::new(self.context().deployment_id, state);
            if let Err(e) = publisher.publish_health(&health).await {
                self.logger.error(e.to_string());
            }
        }
        state
    }

    fn apply_update(&self, update: &FlowUpdate) -> HealthState {
        let Some(table) = self.table.get() else {
            return HealthState::UpdatingFailed;
        };
        let mut failed = false;

        let context = update.context.as_ref().map(|changes| {
            let mut context = self
                .context
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            context.merge(changes);
            context.clone()
        });

        if let Some(properties) = &update.properties {
            *self
                .flow_properties
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = properties.clone();
            for (id, element) in table.elements() {
                if let Err(e) = guarded_sync(id, || element.on_flow_properties_changed(properties)) {
                    self.logger
                        .error(format!("Updating flow properties of {} failed: {}", id, e));
                    failed = true;
                }
            }
        }

        if let Some(context) = &context {
            for (id, element) in table.elements() {
                let name = update.name_of(id);
                let changed = guarded_sync(id, || {
                    element.on_context_changed(context, name);
                    Ok(())
                });
                if let Err(e) = changed {
                    self.logger
                        .error(format!("Updating context of {} failed: {}", id, e));
                    failed = true;
                }
            }
        }

        for change in &update.elements {
            let Some(properties) = &change.properties else {
                continue;
            };
            let Some(element) = table.element(&change.id) else {
                self.logger
                    .warn(format!("Cannot update unknown element {}", change.id));
                continue;
            };
            if let Err(e) = guarded_sync(&change.id, || element.on_properties_changed(properties.clone())) {
                self.logger
                    .error(format!("Updating properties of {} failed: {}", change.id, e));
                failed = true;
            }
        }

        if failed {
            HealthState::UpdatingFailed
        } else {
            HealthState::Updated
        }
    }

    /// Deliver a custom message to its element, or to every element
    pub(super) async fn send_message(&self, message: DeploymentMessage) {
        let Some(table) = self.table.get() else {
            return;
        };
        let targets: Vec<_> = match &message.element_id {
            Some(id) => table
                .elements()
                .iter()
                .filter(|(element_id, _)| element_id == id)
                .collect(),
            None => table.elements().iter().collect(),
        };
        for (id, element) in targets {
            if let Err(e) = guarded(id, element.on_message(message.clone())).await {
                self.logger
                    .error(format!("{} failed to handle message: {}", id, e));
            }
        }
    }
}
