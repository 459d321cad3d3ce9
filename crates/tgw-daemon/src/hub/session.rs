use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tgw_schemas::{ClientMessage, ErrorBody, ServerMessage};

use super::{EventFanoutHub, Scope};
use crate::bus::SubscriptionHandle;
use crate::devices::{DeviceEvent, DeviceTopic, Topic};

const DEVICE_TOPICS: [DeviceTopic; 5] = [
    DeviceTopic::PropertyChanged,
    DeviceTopic::ConnectedChanged,
    DeviceTopic::Removed,
    DeviceTopic::Modified,
    DeviceTopic::Events,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// What the connection writer should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness probe. Failing to deliver it ends the connection.
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    hub: EventFanoutHub,
    scope: Scope,
    state: SessionState,
    out: mpsc::UnboundedSender<Outbound>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    device_handles: HashMap<String, Vec<SubscriptionHandle>>,
    global_handles: Vec<SubscriptionHandle>,
    allow_list: HashSet<String>,
    liveness: Option<JoinHandle<()>>,
}

impl Session {
    pub(super) fn new(hub: EventFanoutHub, scope: Scope) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            hub,
            scope,
            state: SessionState::Connecting,
            out,
            events_tx,
            events_rx: Some(events_rx),
            device_handles: HashMap::new(),
            global_handles: Vec::new(),
            allow_list: HashSet::new(),
            liveness: None,
        };
        (session, out_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Device events for this session. Taken once by whoever drives it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events_rx.take()
    }

    /// Live subscriptions held, device and global.
    pub fn subscription_count(&self) -> usize {
        self.device_handles.values().map(Vec::len).sum::<usize>() + self.global_handles.len()
    }

    pub fn is_event_allowed(&self, name: &str) -> bool {
        self.allow_list.contains(name)
    }

    /// Subscribe, push the initial snapshot and start the liveness probe.
    ///
    /// Only valid from `Connecting`; anything else is a no-op.
    pub fn open(&mut self) -> Flow {
        if self.state != SessionState::Connecting {
            return self.flow();
        }

        let ids = match self.scope.clone() {
            Scope::AllDevices => self.hub.devices.device_ids(),
            Scope::Device(id) => {
                if self.hub.devices.get_device(&id).is_none() {
                    let message = format!("thing {id} not found");
                    self.send_error(Some(id), ErrorBody::not_found(message, None));
                    self.teardown();
                    return Flow::Close;
                }
                vec![id]
            }
        };

        for id in &ids {
            self.subscribe_device(id);
            self.push_snapshot(id);
        }

        if self.scope == Scope::AllDevices {
            let handle = self
                .hub
                .devices
                .subscribe(Topic::DeviceAdded, self.events_tx.clone());
            self.global_handles.push(handle);
        }
        let handle = self
            .hub
            .devices
            .subscribe(Topic::ActionStatus, self.events_tx.clone());
        self.global_handles.push(handle);

        self.liveness = Some(self.spawn_liveness());
        self.state = SessionState::Open;
        info!(scope = ?self.scope, devices = ids.len(), "session open");
        Flow::Continue
    }

    /// React to one device event delivered through a subscription.
    pub fn handle_event(&mut self, event: DeviceEvent) -> Flow {
        if self.state != SessionState::Open {
            return self.flow();
        }

        match event {
            DeviceEvent::PropertyChanged {
                device_id,
                property,
                value,
            } => {
                let now = self.hub.clock.now_millis();
                self.hub.log.record_notification(value.clone(), now);
                self.send(ServerMessage::property_status(device_id, property, value));
            }
            DeviceEvent::ConnectedChanged {
                device_id,
                connected,
            } => {
                self.send(ServerMessage::Connected {
                    id: device_id,
                    data: connected,
                });
            }
            DeviceEvent::Modified { device_id } => {
                self.send(ServerMessage::ThingModified { id: device_id });
            }
            DeviceEvent::Removed { device_id } => {
                self.send(ServerMessage::ThingRemoved {
                    id: device_id.clone(),
                });
                if let Scope::Device(_) = self.scope {
                    self.teardown();
                    return Flow::Close;
                }
                if let Some(handles) = self.device_handles.remove(&device_id) {
                    for handle in &handles {
                        handle.unsubscribe();
                    }
                }
            }
            DeviceEvent::Added { device_id } => {
                if self.scope == Scope::AllDevices {
                    if !self.device_handles.contains_key(&device_id) {
                        self.subscribe_device(&device_id);
                    }
                    self.send(ServerMessage::ThingAdded { id: device_id });
                }
            }
            DeviceEvent::Event {
                device_id,
                name,
                data,
            } => {
                if self.allow_list.contains(&name) {
                    let mut body = Map::new();
                    body.insert(name, data);
                    self.send(ServerMessage::Event {
                        id: device_id,
                        data: Value::Object(body),
                    });
                }
            }
            DeviceEvent::ActionStatus { device_id, action } => {
                if let Scope::Device(scoped) = &self.scope {
                    if device_id.as_deref() != Some(scoped.as_str()) {
                        return Flow::Continue;
                    }
                }
                match serde_json::to_value(&action) {
                    Ok(description) => {
                        let mut body = Map::new();
                        body.insert(action.name.clone(), description);
                        self.send(ServerMessage::ActionStatus {
                            id: device_id,
                            data: Value::Object(body),
                        });
                    }
                    Err(err) => warn!(error = %err, "action status not serializable"),
                }
            }
        }
        Flow::Continue
    }

    /// Handle one inbound text frame. Protocol errors are reported to the
    /// client and never close the connection.
    pub fn handle_text(&mut self, text: &str) -> Flow {
        if self.state != SessionState::Open {
            return self.flow();
        }

        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                self.send_error(None, ErrorBody::bad_request(format!("malformed message: {err}"), None));
                return Flow::Continue;
            }
        };

        let message: ClientMessage = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(err) => {
                let kind = raw.get("messageType").and_then(Value::as_str);
                let message = match kind {
                    Some(k) if ClientMessage::KNOWN_TYPES.contains(&k) => {
                        format!("invalid {k} message: {err}")
                    }
                    Some(k) => format!("unknown messageType: {k}"),
                    None => "missing messageType".to_string(),
                };
                self.send_error(None, ErrorBody::bad_request(message, Some(raw)));
                return Flow::Continue;
            }
        };

        let device_id = match (message.id(), &self.scope) {
            (Some(id), Scope::Device(scoped)) if id != scoped.as_str() => {
                let body = ErrorBody::bad_request(
                    format!("thing {id} is not served on this connection"),
                    Some(raw),
                );
                self.send_error(Some(id.to_string()), body);
                return Flow::Continue;
            }
            (Some(id), _) => id.to_string(),
            (None, Scope::Device(scoped)) => scoped.clone(),
            (None, Scope::AllDevices) => {
                self.send_error(None, ErrorBody::bad_request("missing thing id", Some(raw)));
                return Flow::Continue;
            }
        };

        if self.hub.devices.get_device(&device_id).is_none() {
            let body = ErrorBody::not_found(format!("thing {device_id} not found"), Some(raw));
            self.send_error(Some(device_id), body);
            return Flow::Continue;
        }

        match message {
            ClientMessage::SetProperty { data, .. } => self.spawn_set_properties(device_id, data, raw),
            ClientMessage::AddEventSubscription { data, .. } => {
                debug!(device_id = %device_id, events = data.len(), "event subscription added");
                self.allow_list.extend(data.into_iter().map(|(name, _)| name));
            }
            ClientMessage::RequestAction { data, .. } => self.spawn_actions(device_id, data, raw),
        }
        Flow::Continue
    }

    /// Release every subscription and stop the liveness probe. Returns the
    /// number of subscriptions released; a second call releases nothing.
    pub fn teardown(&mut self) -> usize {
        if self.state == SessionState::Closed {
            return 0;
        }
        self.state = SessionState::Closed;

        let mut released = 0;
        for (_, handles) in self.device_handles.drain() {
            released += handles.iter().filter(|h| h.unsubscribe()).count();
        }
        released += self
            .global_handles
            .drain(..)
            .filter(|h| h.unsubscribe())
            .count();
        self.allow_list.clear();
        if let Some(task) = self.liveness.take() {
            task.abort();
        }

        debug!(scope = ?self.scope, released, "session closed");
        released
    }

    fn flow(&self) -> Flow {
        match self.state {
            SessionState::Closed => Flow::Close,
            _ => Flow::Continue,
        }
    }

    fn send(&self, message: ServerMessage) {
        // A closed writer means the connection is going away; teardown follows.
        let _ = self.out.send(Outbound::Message(message));
    }

    fn send_error(&self, id: Option<String>, body: ErrorBody) {
        self.send(ServerMessage::error(id, body));
    }

    fn subscribe_device(&mut self, id: &str) {
        let handles: Vec<SubscriptionHandle> = DEVICE_TOPICS
            .iter()
            .map(|kind| {
                self.hub
                    .devices
                    .subscribe(Topic::device(id, *kind), self.events_tx.clone())
            })
            .collect();
        self.device_handles.insert(id.to_string(), handles);
    }

    /// One read per known property; values arrive in whatever order the
    /// reads complete, interleaved with live changes.
    fn push_snapshot(&self, id: &str) {
        let Some(description) = self.hub.devices.get_device(id) else {
            return;
        };
        for name in description.properties {
            let devices = Arc::clone(&self.hub.devices);
            let out = self.out.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                let result = devices.get_property(&id, &name).await;
                match result {
                    Ok(value) => {
                        let message = ServerMessage::property_status(id, name, value);
                        let _ = out.send(Outbound::Message(message));
                    }
                    Err(err) => debug!(device_id = %id, property = %name, error = %err, "snapshot read failed"),
                }
            });
        }
    }

    fn spawn_liveness(&self) -> JoinHandle<()> {
        let out = self.out.clone();
        let period = self.hub.liveness_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if out.send(Outbound::Ping).is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_set_properties(&self, device_id: String, data: Map<String, Value>, request: Value) {
        let devices = Arc::clone(&self.hub.devices);
        let out = self.out.clone();
        tokio::spawn(async move {
            let writes = data
                .iter()
                .map(|(name, value)| devices.set_property(&device_id, name, value.clone()));
            let results = join_all(writes).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                warn!(device_id = %device_id, error = %err, "setProperty failed");
                let body = ErrorBody::bad_request(err.to_string(), Some(request));
                let _ = out.send(Outbound::Message(ServerMessage::error(Some(device_id), body)));
            }
        });
    }

    fn spawn_actions(&self, device_id: String, data: Map<String, Value>, request: Value) {
        for (name, params) in data {
            let devices = Arc::clone(&self.hub.devices);
            let out = self.out.clone();
            let device_id = device_id.clone();
            let request = request.clone();
            let input = params.get("input").cloned().unwrap_or(Value::Null);
            tokio::spawn(async move {
                let result = devices.request_action(&device_id, &name, input).await;
                if let Err(err) = result {
                    warn!(device_id = %device_id, action = %name, error = %err, "requestAction failed");
                    let body = ErrorBody::bad_request(err.to_string(), Some(request));
                    let _ = out.send(Outbound::Message(ServerMessage::error(Some(device_id), body)));
                }
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
