//! Device collaborator: the narrow interface the fan-out hub consumes, and
//! a store-backed implementation over the configured device catalog.
//!
//! Property writes go through the [`WriteCorrelator`]; the value pushed to
//! subscribers is whatever the store returns on read-back, which is how
//! stale reads from an eventually-consistent store become visible.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tgw_config::DeviceConfig;
use tgw_correlator::{WriteCorrelator, WriteError};

use crate::bus::{EventBus, SubscriptionHandle};

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub id: String,
    pub title: String,
    pub properties: Vec<String>,
    pub actions: Vec<String>,
    pub events: Vec<String>,
}

impl From<&DeviceConfig> for DeviceDescription {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            title: cfg.title.clone().unwrap_or_else(|| cfg.id.clone()),
            properties: cfg.properties.keys().cloned().collect(),
            actions: cfg.actions.clone(),
            events: cfg.events.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Created,
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescription {
    pub id: Uuid,
    pub name: String,
    pub input: Value,
    pub status: ActionStatus,
    pub time_requested: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_completed: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Events and topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTopic {
    PropertyChanged,
    ConnectedChanged,
    Removed,
    Modified,
    Events,
}

/// What a listener registers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Device { id: String, kind: DeviceTopic },
    DeviceAdded,
    ActionStatus,
}

impl Topic {
    pub fn device(id: impl Into<String>, kind: DeviceTopic) -> Self {
        Topic::Device {
            id: id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    PropertyChanged {
        device_id: String,
        property: String,
        value: Value,
    },
    ConnectedChanged {
        device_id: String,
        connected: bool,
    },
    Removed {
        device_id: String,
    },
    Modified {
        device_id: String,
    },
    Added {
        device_id: String,
    },
    Event {
        device_id: String,
        name: String,
        data: Value,
    },
    ActionStatus {
        device_id: Option<String>,
        action: ActionDescription,
    },
}

impl DeviceEvent {
    pub fn topic(&self) -> Topic {
        match self {
            DeviceEvent::PropertyChanged { device_id, .. } => {
                Topic::device(device_id.as_str(), DeviceTopic::PropertyChanged)
            }
            DeviceEvent::ConnectedChanged { device_id, .. } => {
                Topic::device(device_id.as_str(), DeviceTopic::ConnectedChanged)
            }
            DeviceEvent::Removed { device_id } => {
                Topic::device(device_id.as_str(), DeviceTopic::Removed)
            }
            DeviceEvent::Modified { device_id } => {
                Topic::device(device_id.as_str(), DeviceTopic::Modified)
            }
            DeviceEvent::Event { device_id, .. } => {
                Topic::device(device_id.as_str(), DeviceTopic::Events)
            }
            DeviceEvent::Added { .. } => Topic::DeviceAdded,
            DeviceEvent::ActionStatus { .. } => Topic::ActionStatus,
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("thing {0} not found")]
    NotFound(String),
    #[error("thing {device} has no property {property}")]
    UnknownProperty { device: String, property: String },
    #[error("thing {device} has no action {action}")]
    UnknownAction { device: String, action: String },
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
}

/// Everything the fan-out hub needs from the device model.
pub trait DeviceSource: Send + Sync {
    fn get_device(&self, id: &str) -> Option<DeviceDescription>;

    fn device_ids(&self) -> Vec<String>;

    fn get_property<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Value, DeviceError>>;

    fn set_property<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<Value, DeviceError>>;

    fn request_action<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, Result<ActionDescription, DeviceError>>;

    fn subscribe(&self, topic: Topic, tx: mpsc::UnboundedSender<DeviceEvent>)
        -> SubscriptionHandle;
}

// ---------------------------------------------------------------------------
// StoreBackedDevices
// ---------------------------------------------------------------------------

pub struct StoreBackedDevices {
    catalog: RwLock<BTreeMap<String, DeviceDescription>>,
    correlator: Arc<WriteCorrelator>,
    bus: EventBus,
}

impl StoreBackedDevices {
    pub fn new(
        catalog: impl IntoIterator<Item = DeviceDescription>,
        correlator: Arc<WriteCorrelator>,
    ) -> Self {
        Self {
            catalog: RwLock::new(catalog.into_iter().map(|d| (d.id.clone(), d)).collect()),
            correlator,
            bus: EventBus::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn add_device(&self, description: DeviceDescription) {
        let id = description.id.clone();
        self.catalog.write().insert(id.clone(), description);
        info!(device_id = %id, "thing added");
        self.bus.publish(DeviceEvent::Added { device_id: id });
    }

    pub fn remove_device(&self, id: &str) -> bool {
        if self.catalog.write().remove(id).is_none() {
            return false;
        }
        info!(device_id = id, "thing removed");
        self.bus.publish(DeviceEvent::Removed {
            device_id: id.to_string(),
        });
        true
    }

    pub fn modify_device(&self, description: DeviceDescription) -> bool {
        let id = description.id.clone();
        {
            let mut catalog = self.catalog.write();
            let Some(slot) = catalog.get_mut(&id) else {
                return false;
            };
            *slot = description;
        }
        self.bus.publish(DeviceEvent::Modified { device_id: id });
        true
    }

    pub fn set_connected(&self, id: &str, connected: bool) {
        self.bus.publish(DeviceEvent::ConnectedChanged {
            device_id: id.to_string(),
            connected,
        });
    }

    /// Publish a thing-level named event. Returns listeners reached.
    pub fn emit_event(&self, id: &str, name: &str, data: Value) -> usize {
        self.bus.publish(DeviceEvent::Event {
            device_id: id.to_string(),
            name: name.to_string(),
            data,
        })
    }

    fn check_property(&self, id: &str, name: &str) -> Result<(), DeviceError> {
        let catalog = self.catalog.read();
        let device = catalog
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        if !device.properties.iter().any(|p| p == name) {
            return Err(DeviceError::UnknownProperty {
                device: id.to_string(),
                property: name.to_string(),
            });
        }
        Ok(())
    }

    async fn write_and_observe(&self, id: &str, name: &str, value: Value) -> Result<Value, DeviceError> {
        self.check_property(id, name)?;

        let now = self.correlator.clock().now_millis();
        self.correlator.log().record_request(value.clone(), now);

        match self.correlator.write(id, name, value).await {
            Ok(ack) => {
                debug!(device_id = id, property = name, delayed = ack.was_delayed(), "write resolved");
            }
            Err(WriteError::Storage(err)) => {
                warn!(device_id = id, property = name, error = %err, "write not applied; no result");
                return Ok(Value::Null);
            }
            Err(err) => return Err(err.into()),
        }

        let Some(observed) = self.correlator.read(id, name).await else {
            return Ok(Value::Null);
        };
        self.bus.publish(DeviceEvent::PropertyChanged {
            device_id: id.to_string(),
            property: name.to_string(),
            value: observed.clone(),
        });
        Ok(observed)
    }

    fn create_action(&self, id: &str, name: &str, input: Value) -> Result<ActionDescription, DeviceError> {
        let catalog = self.catalog.read();
        let device = catalog
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        if !device.actions.iter().any(|a| a == name) {
            return Err(DeviceError::UnknownAction {
                device: id.to_string(),
                action: name.to_string(),
            });
        }
        Ok(ActionDescription {
            id: Uuid::new_v4(),
            name: name.to_string(),
            input,
            status: ActionStatus::Created,
            time_requested: Utc::now(),
            time_completed: None,
        })
    }
}

impl DeviceSource for StoreBackedDevices {
    fn get_device(&self, id: &str) -> Option<DeviceDescription> {
        self.catalog.read().get(id).cloned()
    }

    fn device_ids(&self) -> Vec<String> {
        self.catalog.read().keys().cloned().collect()
    }

    fn get_property<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Value, DeviceError>> {
        async move {
            self.check_property(id, name)?;
            Ok(self.correlator.read(id, name).await.unwrap_or(Value::Null))
        }
        .boxed()
    }

    fn set_property<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<Value, DeviceError>> {
        self.write_and_observe(id, name, value).boxed()
    }

    fn request_action<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, Result<ActionDescription, DeviceError>> {
        async move {
            let action = self.create_action(id, name, input)?;
            info!(device_id = id, action = name, action_id = %action.id, "action requested");

            let bus = self.bus.clone();
            let device_id = id.to_string();
            let dispatched = action.clone();
            tokio::spawn(async move {
                let mut current = dispatched;
                for status in [ActionStatus::Pending, ActionStatus::Completed] {
                    current.status = status;
                    if status == ActionStatus::Completed {
                        current.time_completed = Some(Utc::now());
                    }
                    bus.publish(DeviceEvent::ActionStatus {
                        device_id: Some(device_id.clone()),
                        action: current.clone(),
                    });
                    tokio::task::yield_now().await;
                }
            });

            Ok(action)
        }
        .boxed()
    }

    fn subscribe(
        &self,
        topic: Topic,
        tx: mpsc::UnboundedSender<DeviceEvent>,
    ) -> SubscriptionHandle {
        self.bus.subscribe(topic, tx)
    }
}
