//! Entity and mutation types shared by the queue, cache, and gateways.
//!
//! The storefront works with five entity collections. Rows coming back from the
//! database keep their column set open (`fields`), while the collection itself
//! and the mutation kind are closed enums so adding an entity type forces every
//! `match` to be revisited.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier assigned by the persistence gateway (or `local-<uuid>` for
/// optimistic placeholders)
pub type EntityId = String;

/// Open column set of a row
pub type Fields = serde_json::Map<String, Value>;

/// Prefix for ids of optimistic placeholders not yet confirmed remotely
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Entity collections mirrored by the client cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Category,
    Order,
    Registration,
    BlogPost,
}

impl EntityType {
    /// Every collection, in the order the admin dashboard loads them
    pub const ALL: [EntityType; 5] = [
        EntityType::Product,
        EntityType::Category,
        EntityType::Order,
        EntityType::Registration,
        EntityType::BlogPost,
    ];

    /// Database table backing this collection
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Product => "products",
            EntityType::Category => "categories",
            EntityType::Order => "orders",
            EntityType::Registration => "registrations",
            EntityType::BlogPost => "blog_posts",
        }
    }

    /// Resolve a table name back to its collection
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.table() == table)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Error returned when parsing an unknown collection name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    /// Accepts both table names (`blog_posts`) and singular names (`blog_post`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        if let Some(t) = Self::from_table(&normalized) {
            return Ok(t);
        }
        match normalized.as_str() {
            "product" => Ok(EntityType::Product),
            "category" => Ok(EntityType::Category),
            "order" => Ok(EntityType::Order),
            "registration" => Ok(EntityType::Registration),
            "blog_post" | "blog" => Ok(EntityType::BlogPost),
            _ => Err(UnknownEntityType(s.to_string())),
        }
    }
}

/// A row owned by the persistence gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            fields,
        }
    }

    /// Placeholder for an optimistic create, keyed by the creating mutation
    pub fn placeholder(mutation_id: Uuid, fields: Fields) -> Self {
        Self::new(placeholder_id(mutation_id), fields)
    }

    /// Whether this entity only exists locally
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Overlay `patch` onto the current fields
    pub fn merge(&mut self, patch: &Fields) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// Database ids are integers for most tables and uuids for a few; both are
/// carried as strings
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unsupported id value: {}", other))),
    }
}

/// Kind of write, without its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A write against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationOp {
    Create { payload: Fields },
    Update { id: EntityId, payload: Fields },
    Delete { id: EntityId },
}

impl MutationOp {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationOp::Create { .. } => MutationKind::Create,
            MutationOp::Update { .. } => MutationKind::Update,
            MutationOp::Delete { .. } => MutationKind::Delete,
        }
    }

    /// Target entity, if the write addresses an existing one
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            MutationOp::Create { .. } => None,
            MutationOp::Update { id, .. } | MutationOp::Delete { id } => Some(id),
        }
    }
}

/// A write recorded by the sync controller, persisted while pending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "mutation_id")]
    pub id: Uuid,
    pub entity_type: EntityType,
    #[serde(flatten)]
    pub op: MutationOp,
    pub enqueued_at: DateTime<Utc>,
}

impl Mutation {
    pub fn new(entity_type: EntityType, op: MutationOp) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            op,
            enqueued_at: Utc::now(),
        }
    }

    pub fn create(entity_type: EntityType, payload: Fields) -> Self {
        Self::new(entity_type, MutationOp::Create { payload })
    }

    pub fn update(entity_type: EntityType, id: impl Into<String>, payload: Fields) -> Self {
        Self::new(
            entity_type,
            MutationOp::Update {
                id: id.into(),
                payload,
            },
        )
    }

    pub fn delete(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self::new(entity_type, MutationOp::Delete { id: id.into() })
    }

    pub fn kind(&self) -> MutationKind {
        self.op.kind()
    }

    /// Id the cache shows for this create until the gateway assigns one
    pub fn placeholder_id(&self) -> Option<EntityId> {
        match self.op {
            MutationOp::Create { .. } => Some(placeholder_id(self.id)),
            _ => None,
        }
    }

    /// Point a write at `stored` instead of the placeholder `local`
    ///
    /// Covers the target id and any payload value equal to `local` (e.g. a
    /// `category_id` naming a category created offline). Returns whether
    /// anything changed.
    pub fn rebind(&mut self, local: &str, stored: &str) -> bool {
        let mut changed = false;
        let payload = match &mut self.op {
            MutationOp::Create { payload } => payload,
            MutationOp::Update { id, payload } => {
                if id == local {
                    *id = stored.to_string();
                    changed = true;
                }
                payload
            }
            MutationOp::Delete { id } => {
                if id == local {
                    *id = stored.to_string();
                    changed = true;
                }
                return changed;
            }
        };
        for value in payload.values_mut() {
            if value.as_str() == Some(local) {
                *value = Value::String(stored.to_string());
                changed = true;
            }
        }
        changed
    }
}

/// Placeholder id for the entity created by `mutation_id`
pub fn placeholder_id(mutation_id: Uuid) -> EntityId {
    format!("{}{}", LOCAL_ID_PREFIX, mutation_id)
}

/// Build a `Fields` map from a JSON object literal; non-objects yield an empty map
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_names() {
        assert_eq!(EntityType::BlogPost.table(), "blog_posts");
        assert_eq!("blog_posts".parse::<EntityType>().unwrap(), EntityType::BlogPost);
        assert_eq!("Category".parse::<EntityType>().unwrap(), EntityType::Category);
        assert_eq!("blog-post".parse::<EntityType>().unwrap(), EntityType::BlogPost);
        assert!("coupons".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_numeric_id() {
        let entity: Entity = serde_json::from_value(json!({
            "id": 5,
            "name": "Pampers Size 3",
            "stock": 12,
            "created_at": "2024-03-01T10:00:00+00:00"
        }))
        .unwrap();

        assert_eq!(entity.id, "5");
        assert_eq!(entity.field("stock"), Some(&json!(12)));
        assert!(entity.created_at.is_some());
        assert!(!entity.fields.contains_key("id"));
    }

    #[test]
    fn test_entity_merge() {
        let mut entity = Entity::new("5", fields(json!({"name": "Wipes", "stock": 3})));
        entity.merge(&fields(json!({"stock": 1})));

        assert_eq!(entity.field("stock"), Some(&json!(1)));
        assert_eq!(entity.field("name"), Some(&json!("Wipes")));
    }

    #[test]
    fn test_placeholder_id() {
        let create = Mutation::create(EntityType::Category, fields(json!({"name": "Wipes"})));
        let entity = Entity::placeholder(create.id, Fields::new());
        assert!(entity.is_placeholder());
        assert_eq!(create.placeholder_id(), Some(entity.id));
        assert!(!Entity::new("7", Fields::new()).is_placeholder());
        assert_eq!(Mutation::delete(EntityType::Category, "7").placeholder_id(), None);
    }

    #[test]
    fn test_rebind_placeholder_references() {
        let local = placeholder_id(Uuid::new_v4());

        let mut rename = Mutation::update(EntityType::Category, &local, fields(json!({"name": "Wipes"})));
        assert!(rename.rebind(&local, "5"));
        assert_eq!(rename.op.entity_id(), Some("5"));

        let mut product = Mutation::create(
            EntityType::Product,
            fields(json!({"name": "Wet Wipes", "category_id": local})),
        );
        assert!(product.rebind(&local, "5"));
        assert_eq!(
            product.op,
            MutationOp::Create {
                payload: fields(json!({"name": "Wet Wipes", "category_id": "5"}))
            }
        );

        let mut unrelated = Mutation::delete(EntityType::Product, "7");
        assert!(!unrelated.rebind(&local, "5"));
        assert_eq!(unrelated.op.entity_id(), Some("7"));
    }

    #[test]
    fn test_mutation_record_layout() {
        let mutation = Mutation::update(EntityType::Product, "5", fields(json!({"stock": 3})));
        let value = serde_json::to_value(&mutation).unwrap();

        assert_eq!(value["kind"], "update");
        assert_eq!(value["entity_type"], "product");
        assert_eq!(value["mutation_id"], json!(mutation.id));
        assert_eq!(value["id"], "5");
        assert_eq!(value["payload"]["stock"], 3);
        assert!(value["enqueued_at"].is_string());

        let back: Mutation = serde_json::from_value(value).unwrap();
        assert_eq!(back, mutation);
    }
}
