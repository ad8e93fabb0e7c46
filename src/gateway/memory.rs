//! In-process gateway backed by a static storefront catalog.
//!
//! Used when no database is configured (the storefront then serves its mock
//! catalog) and as the test double for the sync layer. Writes are published
//! to an optional [`BroadcastRealtime`] hub the same way the database would
//! push change notifications.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{GatewayError, GatewayResult, ListFilter, PersistenceGateway};
use crate::model::{fields, Entity, EntityId, EntityType, Fields};
use crate::realtime::{BroadcastRealtime, ChangeEvent, ChangeKind};

/// A call served by the memory gateway
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Create {
        entity_type: EntityType,
        payload: Fields,
    },
    Update {
        entity_type: EntityType,
        id: EntityId,
        payload: Fields,
    },
    Delete {
        entity_type: EntityType,
        id: EntityId,
    },
    List {
        entity_type: EntityType,
    },
}

impl GatewayCall {
    pub fn is_write(&self) -> bool {
        !matches!(self, GatewayCall::List { .. })
    }
}

#[derive(Default)]
struct Table {
    rows: Vec<Entity>,
    next_id: u64,
}

impl Table {
    fn insert(&mut self, payload: &Fields) -> Entity {
        self.next_id += 1;
        let now = Utc::now();
        let mut entity = Entity::new(self.next_id.to_string(), payload.clone());
        entity.fields.remove("id");
        entity.created_at = Some(now);
        entity.updated_at = Some(now);
        self.rows.push(entity.clone());
        entity
    }
}

/// Write failure plan: let `successes_left` writes through, then fail every write
struct WriteFault {
    successes_left: usize,
    error: GatewayError,
}

/// Gateway holding every table in memory
pub struct MemoryGateway {
    tables: Mutex<HashMap<EntityType, Table>>,
    calls: Mutex<Vec<GatewayCall>>,
    unreachable: AtomicBool,
    write_fault: Mutex<Option<WriteFault>>,
    list_delays: Mutex<VecDeque<Duration>>,
    write_delays: Mutex<VecDeque<Duration>>,
    realtime: Option<Arc<BroadcastRealtime>>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Empty gateway
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            write_fault: Mutex::new(None),
            list_delays: Mutex::new(VecDeque::new()),
            write_delays: Mutex::new(VecDeque::new()),
            realtime: None,
        }
    }

    /// Gateway seeded with the storefront's static catalog
    pub fn with_mock_catalog() -> Self {
        let gateway = Self::new();

        for name in ["Baby Diapers", "Adult Diapers", "Sanitary Pads", "Baby Care"] {
            gateway.seed(EntityType::Category, fields(json!({ "name": name })));
        }

        let products = [
            ("Comfy Baby Diapers Size 2 (40 pcs)", "Nepi za Watoto Saizi 2", 1, 950, 40),
            ("Comfy Baby Diapers Size 3 (36 pcs)", "Nepi za Watoto Saizi 3", 1, 1050, 35),
            ("Comfy Baby Diapers Size 4 (32 pcs)", "Nepi za Watoto Saizi 4", 1, 1150, 30),
            ("Comfy Baby Pants XL (28 pcs)", "Suruali za Nepi XL", 1, 1250, 25),
            ("Adult Diapers Medium (10 pcs)", "Nepi za Watu Wazima M", 2, 1200, 12),
            ("Adult Diapers Large (10 pcs)", "Nepi za Watu Wazima L", 2, 1300, 10),
            ("Sanitary Pads Regular (10 pcs)", "Pedi za Kawaida", 3, 120, 100),
            ("Sanitary Pads Night (8 pcs)", "Pedi za Usiku", 3, 150, 80),
        ];
        for (name, name_sw, category_id, price, stock) in products {
            gateway.seed(
                EntityType::Product,
                fields(json!({
                    "name": name,
                    "name_sw": name_sw,
                    "category_id": category_id,
                    "price": price,
                    "stock": stock,
                })),
            );
        }

        gateway.seed(
            EntityType::BlogPost,
            fields(json!({
                "title": "Choosing the right diaper size",
                "slug": "choosing-the-right-diaper-size",
                "published": true,
            })),
        );

        gateway
    }

    /// Publish every write to `hub`
    pub fn with_realtime(mut self, hub: Arc<BroadcastRealtime>) -> Self {
        self.realtime = Some(hub);
        self
    }

    /// Insert a row directly, bypassing call logging and notifications
    pub fn seed(&self, entity_type: EntityType, payload: Fields) -> Entity {
        self.tables
            .lock()
            .entry(entity_type)
            .or_default()
            .insert(&payload)
    }

    /// Simulate a lost connection: every call fails with a transient error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Let `successes` more writes through, then fail every write with `error`
    pub fn fail_writes_after(&self, successes: usize, error: GatewayError) {
        *self.write_fault.lock() = Some(WriteFault {
            successes_left: successes,
            error,
        });
    }

    pub fn clear_faults(&self) {
        *self.write_fault.lock() = None;
        self.set_unreachable(false);
    }

    /// Hold the response of the next list call for `delay`
    ///
    /// The rows are read before the delay, so the response reflects the state
    /// at the moment the request arrived.
    pub fn delay_next_list(&self, delay: Duration) {
        self.list_delays.lock().push_back(delay);
    }

    /// Hold the next write for `delay` before it is applied
    pub fn delay_next_write(&self, delay: Duration) {
        self.write_delays.lock().push_back(delay);
    }

    async fn hold_write(&self) {
        let delay = self.write_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Calls served so far, in arrival order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Write calls served so far, in arrival order
    pub fn write_calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Current rows of a table
    pub fn rows(&self, entity_type: EntityType) -> Vec<Entity> {
        self.tables
            .lock()
            .get(&entity_type)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.rows(entity_type).into_iter().find(|e| e.id == id)
    }

    fn check_reachable(&self) -> GatewayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("gateway unreachable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> GatewayResult<()> {
        self.check_reachable()?;
        let mut fault = self.write_fault.lock();
        match fault.as_mut() {
            Some(plan) if plan.successes_left > 0 => {
                plan.successes_left -= 1;
                Ok(())
            }
            Some(plan) => Err(plan.error.clone()),
            None => Ok(()),
        }
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    fn publish(&self, entity_type: EntityType, kind: ChangeKind, record: Option<&Entity>) {
        if let Some(hub) = &self.realtime {
            let record = record.and_then(|e| serde_json::to_value(e).ok());
            let delivered = hub.publish(ChangeEvent::new(entity_type, kind, record));
            debug!("Published {:?} on {} to {} subscriber(s)", kind, entity_type, delivered);
        }
    }
}

fn matches_filter(entity: &Entity, filter: &ListFilter) -> bool {
    filter.equals.iter().all(|(column, expected)| {
        let actual = if column == "id" {
            Some(Value::String(entity.id.clone()))
        } else {
            entity.field(column).cloned()
        };
        match actual {
            Some(Value::String(s)) => &s == expected,
            Some(other) => &other.to_string() == expected,
            None => false,
        }
    })
}

fn sort_key(entity: &Entity, column: &str) -> String {
    match column {
        "id" => format!("{:>20}", entity.id),
        "created_at" => entity.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        "updated_at" => entity.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        other => match entity.field(other) {
            Some(Value::Number(n)) => format!("{:020.4}", n.as_f64().unwrap_or_default()),
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        },
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn create(&self, entity_type: EntityType, payload: &Fields) -> GatewayResult<Entity> {
        self.hold_write().await;
        self.check_write()?;
        let entity = self
            .tables
            .lock()
            .entry(entity_type)
            .or_default()
            .insert(payload);

        self.record(GatewayCall::Create {
            entity_type,
            payload: payload.clone(),
        });
        self.publish(entity_type, ChangeKind::Insert, Some(&entity));
        Ok(entity)
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Fields,
    ) -> GatewayResult<Entity> {
        self.hold_write().await;
        self.check_write()?;
        let updated = {
            let mut tables = self.tables.lock();
            let row = tables
                .get_mut(&entity_type)
                .and_then(|t| t.rows.iter_mut().find(|e| e.id == id))
                .ok_or_else(|| GatewayError::NotFound {
                    entity_type,
                    id: id.to_string(),
                })?;
            row.merge(payload);
            row.fields.remove("id");
            row.updated_at = Some(Utc::now());
            row.clone()
        };

        self.record(GatewayCall::Update {
            entity_type,
            id: id.to_string(),
            payload: payload.clone(),
        });
        self.publish(entity_type, ChangeKind::Update, Some(&updated));
        Ok(updated)
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> GatewayResult<()> {
        self.hold_write().await;
        self.check_write()?;
        let removed = {
            let mut tables = self.tables.lock();
            let table = tables.entry(entity_type).or_default();
            let before = table.rows.len();
            table.rows.retain(|e| e.id != id);
            before != table.rows.len()
        };
        if !removed {
            return Err(GatewayError::NotFound {
                entity_type,
                id: id.to_string(),
            });
        }

        self.record(GatewayCall::Delete {
            entity_type,
            id: id.to_string(),
        });
        self.publish(entity_type, ChangeKind::Delete, None);
        Ok(())
    }

    async fn list(
        &self,
        entity_type: EntityType,
        filter: Option<&ListFilter>,
    ) -> GatewayResult<Vec<Entity>> {
        self.check_reachable()?;
        let mut rows = self.rows(entity_type);
        self.record(GatewayCall::List { entity_type });

        if let Some(filter) = filter {
            rows.retain(|e| matches_filter(e, filter));
            if let Some(column) = &filter.order_by {
                rows.sort_by_key(|e| sort_key(e, column));
                if filter.descending {
                    rows.reverse();
                }
            }
            if let Some(limit) = filter.limit {
                rows.truncate(limit);
            }
        }

        let delay = self.list_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(rows)
    }
}
