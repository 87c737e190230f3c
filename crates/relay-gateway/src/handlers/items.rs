use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Accountability, CollectionService, PrimaryKey, Query};
use serde_json::Value as JsonValue;

use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::frame::{ClientFrame, GetFrame, ItemsFrame, ServerFrame};
use crate::router::SocketHandler;

/// Serves `ITEMS` (create/read/update/delete) and `GET` frames against the
/// Collection Service under the connection's current accountability.
pub struct ItemsHandler {
    collections: Arc<dyn CollectionService>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    fn parse(action: Option<&str>) -> Option<Self> {
        match action?.trim().to_lowercase().as_str() {
            "create" => Some(Action::Create),
            "read" => Some(Action::Read),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

fn keys_json(keys: &[PrimaryKey]) -> JsonValue {
    JsonValue::Array(keys.iter().map(PrimaryKey::to_json).collect())
}

impl ItemsHandler {
    pub fn new(collections: Arc<dyn CollectionService>) -> Self {
        Self { collections }
    }

    async fn items(&self, frame: &ItemsFrame, acc: &Accountability) -> Result<JsonValue> {
        let collection = frame
            .collection
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::operation("invalid collection"))?;
        let action = Action::parse(frame.action.as_deref())
            .ok_or_else(|| GatewayError::operation("invalid action"))?;
        let query = frame.query.clone().unwrap_or_default();
        let svc = &self.collections;

        tracing::debug!(collection, action = ?action, user = acc.label(), "ITEMS request");

        let result = match action {
            Action::Create => match &frame.data {
                Some(JsonValue::Array(rows)) => {
                    let keys = svc.create_many(collection, rows.clone(), acc).await?;
                    JsonValue::Array(svc.read_many(collection, &keys, &query, acc).await?)
                }
                Some(data) if !data.is_null() => {
                    let key = svc.create_one(collection, data.clone(), acc).await?;
                    svc.read_one(collection, &key, &query, acc).await?
                }
                _ => return Err(GatewayError::operation("invalid data payload")),
            },
            Action::Read => {
                let query = frame
                    .query
                    .as_ref()
                    .ok_or_else(|| GatewayError::operation("invalid query"))?;
                JsonValue::Array(svc.read_by_query(collection, query, acc).await?)
            }
            Action::Update => {
                let data = match &frame.data {
                    Some(data) if !data.is_null() => data.clone(),
                    _ => return Err(GatewayError::operation("invalid data payload")),
                };
                if let Some(ids) = &frame.ids {
                    let keys = svc.update_many(collection, ids, data, acc).await?;
                    JsonValue::Array(svc.read_many(collection, &keys, &query, acc).await?)
                } else if let Some(id) = &frame.id {
                    let key = svc.update_one(collection, id, data, acc).await?;
                    svc.read_one(collection, &key, &query, acc).await?
                } else {
                    return Err(GatewayError::operation(
                        "Either 'ids' or 'id' is required for an UPDATE request",
                    ));
                }
            }
            Action::Delete => {
                if let Some(keys) = &frame.keys {
                    svc.delete_many(collection, keys, acc).await?;
                    keys_json(keys)
                } else if let Some(key) = &frame.key {
                    svc.delete_one(collection, key, acc).await?;
                    key.to_json()
                } else {
                    return Err(GatewayError::operation(
                        "Either 'keys' or 'key' is required for a DELETE request",
                    ));
                }
            }
        };
        Ok(result)
    }

    async fn get(&self, frame: &GetFrame, acc: &Accountability) -> Result<JsonValue> {
        let collection = frame
            .collection
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::operation("invalid collection"))?;
        let query: &Query = &frame.query;
        Ok(JsonValue::Array(
            self.collections.read_by_query(collection, query, acc).await?,
        ))
    }
}

#[async_trait]
impl SocketHandler for ItemsHandler {
    fn name(&self) -> &'static str {
        "items"
    }

    async fn on_message(&self, connection: &Arc<Connection>, frame: &ClientFrame) -> Result<()> {
        let acc = connection.accountability();
        let (data, uid) = match frame {
            ClientFrame::Items(items) => (self.items(items, &acc).await?, items.uid.clone()),
            ClientFrame::Get(get) => (self.get(get, &acc).await?, get.uid.clone()),
            _ => return Ok(()),
        };
        connection.send(&ServerFrame::response(data, uid));
        Ok(())
    }
}
