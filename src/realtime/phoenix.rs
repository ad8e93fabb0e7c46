//! Supabase realtime client over the Phoenix channels websocket protocol.
//!
//! One websocket carries every table. Joining `realtime:public:<table>` with a
//! `postgres_changes` config makes the server push a frame per row change.
//! Frames are JSON objects `{topic, event, payload, ref}`; a heartbeat on the
//! `phoenix` topic keeps the socket alive.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{BroadcastRealtime, ChangeEvent, ChangeKind, RealtimeError, RealtimeSource, Subscription};
use crate::model::EntityType;

/// Default heartbeat interval expected by the realtime server
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection settings for the realtime websocket
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Project URL (`https://<project>.supabase.co`)
    pub base_url: String,
    /// Anon API key
    pub api_key: String,
    pub heartbeat_interval: Duration,
}

impl PhoenixConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Websocket endpoint derived from the project URL
    pub fn socket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, self.api_key)
    }
}

/// Channel topic for a table
pub fn topic(entity_type: EntityType) -> String {
    format!("realtime:public:{}", entity_type.table())
}

pub fn encode_join(entity_type: EntityType, msg_ref: &str) -> String {
    json!({
        "topic": topic(entity_type),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": entity_type.table() }
                ]
            }
        },
        "ref": msg_ref,
    })
    .to_string()
}

pub fn encode_leave(entity_type: EntityType, msg_ref: &str) -> String {
    json!({
        "topic": topic(entity_type),
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref,
    })
    .to_string()
}

pub fn encode_heartbeat(msg_ref: &str) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref,
    })
    .to_string()
}

/// A decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum PhoenixFrame {
    Change(ChangeEvent),
    /// Server refused a join or other request
    ReplyError { topic: String, reason: String },
    Other,
}

#[derive(Deserialize)]
struct Envelope {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Decode one text frame
pub fn parse_frame(text: &str) -> PhoenixFrame {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return PhoenixFrame::Other,
    };

    match envelope.event.as_str() {
        "postgres_changes" => envelope
            .payload
            .get("data")
            .and_then(|data| decode_change(&envelope.topic, data))
            .map(PhoenixFrame::Change)
            .unwrap_or(PhoenixFrame::Other),
        // Older servers push the change type as the event name
        "INSERT" | "UPDATE" | "DELETE" => decode_change(&envelope.topic, &envelope.payload)
            .map(PhoenixFrame::Change)
            .unwrap_or(PhoenixFrame::Other),
        "phx_reply" if envelope.payload.get("status").and_then(Value::as_str) == Some("error") => {
            PhoenixFrame::ReplyError {
                topic: envelope.topic,
                reason: envelope
                    .payload
                    .get("response")
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
            }
        }
        _ => PhoenixFrame::Other,
    }
}

fn decode_change(topic: &str, data: &Value) -> Option<ChangeEvent> {
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let table = data
        .get("table")
        .and_then(Value::as_str)
        .or_else(|| topic.rsplit(':').next())?;
    let entity_type = EntityType::from_table(table)?;
    let record = data.get("record").filter(|r| !r.is_null()).cloned();

    Some(ChangeEvent::new(entity_type, kind, record))
}

/// Realtime source backed by a Supabase websocket
pub struct PhoenixRealtime {
    hub: BroadcastRealtime,
    outbound: mpsc::UnboundedSender<String>,
    joined: DashMap<EntityType, String>,
    refs: Arc<AtomicU64>,
}

impl PhoenixRealtime {
    /// Open the websocket and start the reader/writer tasks
    ///
    /// Both tasks stop when `shutdown` flips to `true` or the socket closes.
    /// When the reader stops, every subscription ends so listeners fall back
    /// to polling.
    pub async fn connect(
        config: PhoenixConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, RealtimeError> {
        let url = config.socket_url();
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        let (mut sink, mut source) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let refs = Arc::new(AtomicU64::new(1));

        let realtime = Arc::new(Self {
            hub: BroadcastRealtime::new(),
            outbound,
            joined: DashMap::new(),
            refs: refs.clone(),
        });

        // Writer: outbound frames and heartbeats
        let heartbeat_interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(text) = frame else { break };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            error!("Realtime send failed: {}", e);
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let msg_ref = refs.fetch_add(1, Ordering::SeqCst).to_string();
                        if let Err(e) = sink.send(Message::Text(encode_heartbeat(&msg_ref))).await {
                            error!("Realtime heartbeat failed: {}", e);
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            let _ = sink.close().await;
                            info!("Realtime writer shutting down");
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decode frames and fan out change events
        let reader = Arc::downgrade(&realtime);
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_frame(&text) {
                        PhoenixFrame::Change(event) => {
                            let Some(realtime) = reader.upgrade() else { break };
                            debug!("Realtime {:?} on {}", event.kind, event.entity_type);
                            realtime.hub.publish(event);
                        }
                        PhoenixFrame::ReplyError { topic, reason } => {
                            warn!("Realtime server rejected {}: {}", topic, reason);
                        }
                        PhoenixFrame::Other => {}
                    },
                    Ok(Message::Close(frame)) => {
                        warn!("Realtime socket closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Realtime socket error: {}", e);
                        break;
                    }
                }
            }
            warn!("Realtime reader stopped");
            if let Some(realtime) = reader.upgrade() {
                realtime.hub.close();
            }
        });

        info!("Connected to realtime at {}", config.base_url);
        Ok(realtime)
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn send(&self, frame: String) -> Result<(), RealtimeError> {
        self.outbound.send(frame).map_err(|_| RealtimeError::Closed)
    }
}

#[async_trait]
impl RealtimeSource for PhoenixRealtime {
    async fn subscribe(&self, entity_type: EntityType) -> Result<Subscription, RealtimeError> {
        if self.hub.is_closed() {
            return Err(RealtimeError::Closed);
        }
        if !self.joined.contains_key(&entity_type) {
            let msg_ref = self.next_ref();
            self.send(encode_join(entity_type, &msg_ref))?;
            self.joined.insert(entity_type, msg_ref);
            info!("Joined realtime topic {}", topic(entity_type));
        }
        Ok(self.hub.subscribe_to(entity_type))
    }

    async fn unsubscribe(&self, subscription_id: Uuid, entity_type: EntityType) {
        self.hub.release(subscription_id);
        if self.hub.subscriber_count(entity_type) == 0 && self.joined.remove(&entity_type).is_some() {
            let msg_ref = self.next_ref();
            if self.send(encode_leave(entity_type, &msg_ref)).is_err() {
                debug!("Realtime socket already closed while leaving {}", topic(entity_type));
            }
        }
    }
}
