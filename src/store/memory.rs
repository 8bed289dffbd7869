//! In-memory store driver for testing and single-process use
//!
//! Databases are keyed by datasource URL and shared across connections,
//! so a recreated connection sees the rows written through the old one.
//! Filters support plain equality (`null` matches a missing field) and
//! the `equals`, `not`, and `in` operators.

use super::{StoreConnection, StoreDriver};
use crate::config::ConnectionConfig;
use crate::error::{DbError, Result};
use crate::types::{Operation, OperationKind, QueryArgs};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

type Row = Map<String, Value>;

#[derive(Default)]
struct Shared {
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
    unreachable: RwLock<HashSet<String>>,
    opened: AtomicUsize,
}

impl Shared {
    fn is_unreachable(&self, url: &str) -> bool {
        self.unreachable
            .read()
            .map(|set| set.contains(url))
            .unwrap_or(false)
    }
}

/// In-memory store driver
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
    connect_delay: Option<Duration>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `connect` call (simulates a slow network handshake)
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Mark a datasource URL as unreachable (or reachable again)
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        if let Ok(mut set) = self.shared.unreachable.write() {
            if unreachable {
                set.insert(url.to_string());
            } else {
                set.remove(url);
            }
        }
    }

    /// Total connections successfully opened by this driver
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// The database behind a datasource URL, created on first use
    pub fn database(&self, url: &str) -> Arc<MemoryDatabase> {
        if let Ok(dbs) = self.shared.databases.read() {
            if let Some(db) = dbs.get(url) {
                return db.clone();
            }
        }
        match self.shared.databases.write() {
            Ok(mut dbs) => dbs.entry(url.to_string()).or_default().clone(),
            Err(_) => Arc::new(MemoryDatabase::default()),
        }
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn StoreConnection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let url = config.datasource_url.clone();
        if self.shared.is_unreachable(&url) {
            return Err(DbError::Connection(format!("{}: store unreachable", url)));
        }

        let database = self.database(&url);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(url = %url, "Memory store connection opened");

        Ok(Box::new(MemoryConnection {
            url,
            database,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Connection to a shared in-memory database
pub struct MemoryConnection {
    url: String,
    database: Arc<MemoryDatabase>,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn execute(&self, op: &Operation) -> Result<Value> {
        if self.is_closed() {
            return Err(DbError::Connection(format!("{}: connection closed", self.url)));
        }
        self.database.execute(op)
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Connection(format!("{}: connection closed", self.url)));
        }
        if self.shared.is_unreachable(&self.url) {
            return Err(DbError::Connection(format!("{}: store unreachable", self.url)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(url = %self.url, "Memory store connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Tables of JSON rows, keyed by model name
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    failing: RwLock<HashSet<(String, OperationKind)>>,
}

impl MemoryDatabase {
    /// All rows of a model, unfiltered (soft-deleted rows included)
    pub fn rows(&self, model: &str) -> Vec<Value> {
        self.tables
            .read()
            .map(|t| {
                t.get(model)
                    .map(|rows| rows.iter().cloned().map(Value::Object).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Insert a row directly, bypassing any connection or interception
    pub fn insert_raw(&self, model: &str, row: Value) {
        if let (Value::Object(row), Ok(mut tables)) = (row, self.tables.write()) {
            tables.entry(model.to_string()).or_default().push(row);
        }
    }

    /// Make every `kind` operation on `model` fail (or succeed again)
    pub fn set_failing(&self, model: &str, kind: OperationKind, failing: bool) {
        if let Ok(mut set) = self.failing.write() {
            if failing {
                set.insert((model.to_string(), kind));
            } else {
                set.remove(&(model.to_string(), kind));
            }
        }
    }

    fn execute(&self, op: &Operation) -> Result<Value> {
        let injected = self
            .failing
            .read()
            .map(|set| set.contains(&(op.model.clone(), op.kind)))
            .unwrap_or(false);
        if injected {
            return Err(query_error(op, "injected failure"));
        }

        let mut tables = self.tables.write().map_err(|e| {
            DbError::Connection(format!("Memory store lock poisoned: {}", e))
        })?;
        let rows = tables.entry(op.model.clone()).or_default();
        let args = &op.args;
        let filter = args.filter.clone().unwrap_or_default();

        match op.kind {
            OperationKind::FindUnique | OperationKind::FindFirst => Ok(rows
                .iter()
                .find(|r| matches(r, &filter))
                .map(|r| Value::Object(r.clone()))
                .unwrap_or(Value::Null)),
            OperationKind::FindUniqueOrThrow | OperationKind::FindFirstOrThrow => rows
                .iter()
                .find(|r| matches(r, &filter))
                .map(|r| Value::Object(r.clone()))
                .ok_or_else(|| not_found(op)),
            OperationKind::FindMany => Ok(Value::Array(
                rows.iter()
                    .filter(|r| matches(r, &filter))
                    .map(|r| Value::Object(r.clone()))
                    .collect(),
            )),
            OperationKind::Count => Ok(Value::from(count(rows, &filter))),
            OperationKind::Aggregate => {
                let mut out = Map::new();
                out.insert("_count".to_string(), Value::from(count(rows, &filter)));
                Ok(Value::Object(out))
            }
            OperationKind::GroupBy => Ok(group_by(rows, &filter, &args.by)),
            OperationKind::Create => {
                let row = with_id(object_payload(op, args.data.as_ref())?);
                rows.push(row.clone());
                Ok(Value::Object(row))
            }
            OperationKind::CreateMany => {
                let items = match &args.data {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Object(obj)) => vec![Value::Object(obj.clone())],
                    _ => return Err(query_error(op, "create_many requires an array of objects")),
                };
                // all-or-nothing: reject the batch before inserting any row
                let created = items
                    .iter()
                    .map(|item| object_payload(op, Some(item)).map(with_id))
                    .collect::<Result<Vec<_>>>()?;
                let count = created.len();
                rows.extend(created);
                Ok(count_result(count))
            }
            OperationKind::Update => {
                let data = object_payload(op, args.data.as_ref())?;
                let row = rows
                    .iter_mut()
                    .find(|r| matches(r, &filter))
                    .ok_or_else(|| not_found(op))?;
                merge(row, data);
                Ok(Value::Object(row.clone()))
            }
            OperationKind::UpdateMany => {
                let data = object_payload(op, args.data.as_ref())?;
                let mut updated = 0usize;
                for row in rows.iter_mut().filter(|r| matches(r, &filter)) {
                    merge(row, data.clone());
                    updated += 1;
                }
                Ok(count_result(updated))
            }
            OperationKind::Upsert => match rows.iter_mut().find(|r| matches(r, &filter)) {
                Some(row) => {
                    merge(row, object_payload(op, args.update.as_ref())?);
                    Ok(Value::Object(row.clone()))
                }
                None => {
                    let row = with_id(object_payload(op, args.create.as_ref())?);
                    rows.push(row.clone());
                    Ok(Value::Object(row))
                }
            },
            OperationKind::Delete => {
                let index = rows
                    .iter()
                    .position(|r| matches(r, &filter))
                    .ok_or_else(|| not_found(op))?;
                Ok(Value::Object(rows.remove(index)))
            }
            OperationKind::DeleteMany => {
                let before = rows.len();
                rows.retain(|r| !matches(r, &filter));
                Ok(count_result(before - rows.len()))
            }
        }
    }
}

fn query_error(op: &Operation, reason: &str) -> DbError {
    DbError::Query {
        model: op.model.clone(),
        operation: op.kind.to_string(),
        reason: reason.to_string(),
    }
}

fn not_found(op: &Operation) -> DbError {
    let filter = serde_json::to_string(&QueryArgs {
        filter: op.args.filter.clone(),
        ..Default::default()
    })
    .unwrap_or_default();
    DbError::NotFound(format!("{} {} {}", op.model, op.kind, filter))
}

fn object_payload(op: &Operation, payload: Option<&Value>) -> Result<Row> {
    match payload {
        Some(Value::Object(obj)) => Ok(obj.clone()),
        _ => Err(query_error(op, "payload must be a JSON object")),
    }
}

fn with_id(mut row: Row) -> Row {
    if !row.contains_key("id") {
        row.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    row
}

fn merge(row: &mut Row, data: Row) {
    for (k, v) in data {
        row.insert(k, v);
    }
}

fn count(rows: &[Row], filter: &Row) -> usize {
    rows.iter().filter(|r| matches(r, filter)).count()
}

fn count_result(n: usize) -> Value {
    let mut out = Map::new();
    out.insert("count".to_string(), Value::from(n));
    Value::Object(out)
}

fn group_by(rows: &[Row], filter: &Row, by: &[String]) -> Value {
    let mut groups: Vec<(Vec<Value>, usize)> = Vec::new();
    for row in rows.iter().filter(|r| matches(r, filter)) {
        let key: Vec<Value> = by
            .iter()
            .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, n)) => *n += 1,
            None => groups.push((key, 1)),
        }
    }

    Value::Array(
        groups
            .into_iter()
            .map(|(key, n)| {
                let mut out: Row = by.iter().cloned().zip(key).collect();
                out.insert("_count".to_string(), Value::from(n));
                Value::Object(out)
            })
            .collect(),
    )
}

fn matches(row: &Row, filter: &Row) -> bool {
    filter
        .iter()
        .all(|(field, cond)| field_matches(row.get(field).unwrap_or(&Value::Null), cond))
}

const OPERATORS: [&str; 3] = ["equals", "not", "in"];

fn field_matches(actual: &Value, cond: &Value) -> bool {
    match cond {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| OPERATORS.contains(&k.as_str())) => {
            ops.iter().all(|(op, v)| match op.as_str() {
                "equals" => actual == v,
                "not" => !field_matches(actual, v),
                "in" => v.as_array().map(|a| a.contains(actual)).unwrap_or(false),
                _ => false,
            })
        }
        other => actual == other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(model: &str, kind: OperationKind, args: QueryArgs) -> Operation {
        Operation::new(model, kind, args)
    }

    async fn connect(driver: &MemoryDriver, url: &str) -> Box<dyn StoreConnection> {
        driver.connect(&ConnectionConfig::new(url)).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;

        let created = conn
            .execute(&op("tb_unit", OperationKind::Create, QueryArgs::data(json!({"name": "KG"}))))
            .await
            .unwrap();
        assert!(created["id"].is_string());

        let found = conn
            .execute(&op("tb_unit", OperationKind::FindFirst, QueryArgs::filter(json!({"name": "KG"}))))
            .await
            .unwrap();
        assert_eq!(found["id"], created["id"]);

        let missing = conn
            .execute(&op("tb_unit", OperationKind::FindFirst, QueryArgs::filter(json!({"name": "L"}))))
            .await
            .unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_or_throw_not_found() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        let err = conn
            .execute(&op("tb_unit", OperationKind::FindUniqueOrThrow, QueryArgs::filter(json!({"id": "x"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_filter_operators() {
        let driver = MemoryDriver::new();
        let db = driver.database("memory://t1");
        db.insert_raw("tb_location", json!({"id": "a", "deleted_at": null}));
        db.insert_raw("tb_location", json!({"id": "b", "deleted_at": "2024-01-01T00:00:00Z"}));
        db.insert_raw("tb_location", json!({"id": "c"}));
        let conn = connect(&driver, "memory://t1").await;

        let live = conn
            .execute(&op("tb_location", OperationKind::Count, QueryArgs::filter(json!({"deleted_at": null}))))
            .await
            .unwrap();
        assert_eq!(live, json!(2));

        let deleted = conn
            .execute(&op(
                "tb_location",
                OperationKind::FindMany,
                QueryArgs::filter(json!({"deleted_at": {"not": null}})),
            ))
            .await
            .unwrap();
        assert_eq!(deleted.as_array().unwrap().len(), 1);
        assert_eq!(deleted[0]["id"], "b");

        let some = conn
            .execute(&op("tb_location", OperationKind::Count, QueryArgs::filter(json!({"id": {"in": ["a", "c"]}}))))
            .await
            .unwrap();
        assert_eq!(some, json!(2));
    }

    #[tokio::test]
    async fn test_update_upsert_delete() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        conn.execute(&op("tb_tax", OperationKind::Create, QueryArgs::data(json!({"id": "v7", "rate": 7}))))
            .await
            .unwrap();

        let updated = conn
            .execute(&op(
                "tb_tax",
                OperationKind::Update,
                QueryArgs {
                    filter: Some(json!({"id": "v7"}).as_object().unwrap().clone()),
                    data: Some(json!({"rate": 8})),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(updated["rate"], 8);

        let upsert = |id: &str| QueryArgs {
            filter: Some(json!({"id": id}).as_object().unwrap().clone()),
            create: Some(json!({"id": id, "rate": 0})),
            update: Some(json!({"rate": 10})),
            ..Default::default()
        };
        let existing = conn.execute(&op("tb_tax", OperationKind::Upsert, upsert("v7"))).await.unwrap();
        assert_eq!(existing["rate"], 10);
        let inserted = conn.execute(&op("tb_tax", OperationKind::Upsert, upsert("z0"))).await.unwrap();
        assert_eq!(inserted["rate"], 0);

        let removed = conn
            .execute(&op("tb_tax", OperationKind::Delete, QueryArgs::filter(json!({"id": "v7"}))))
            .await
            .unwrap();
        assert_eq!(removed["id"], "v7");
        assert_eq!(driver.database("memory://t1").rows("tb_tax").len(), 1);
    }

    #[tokio::test]
    async fn test_many_variants_return_counts() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        let created = conn
            .execute(&op(
                "tb_unit",
                OperationKind::CreateMany,
                QueryArgs::data(json!([{"g": "a"}, {"g": "a"}, {"g": "b"}])),
            ))
            .await
            .unwrap();
        assert_eq!(created, json!({"count": 3}));

        let groups = conn
            .execute(&op(
                "tb_unit",
                OperationKind::GroupBy,
                QueryArgs {
                    by: vec!["g".to_string()],
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(groups, json!([{"g": "a", "_count": 2}, {"g": "b", "_count": 1}]));

        let updated = conn
            .execute(&op(
                "tb_unit",
                OperationKind::UpdateMany,
                QueryArgs {
                    filter: Some(json!({"g": "a"}).as_object().unwrap().clone()),
                    data: Some(json!({"g": "c"})),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(updated, json!({"count": 2}));

        let deleted = conn
            .execute(&op("tb_unit", OperationKind::DeleteMany, QueryArgs::default()))
            .await
            .unwrap();
        assert_eq!(deleted, json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_create_many_rejects_whole_batch() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        let err = conn
            .execute(&op(
                "tb_unit",
                OperationKind::CreateMany,
                QueryArgs::data(json!([{"id": "a"}, {"id": "b"}, 3])),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        assert!(driver.database("memory://t1").rows("tb_unit").is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(conn.ensure_connected().await.is_err());
        let err = conn
            .execute(&op("tb_unit", OperationKind::Count, QueryArgs::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let driver = MemoryDriver::new();
        driver.set_unreachable("memory://down", true);
        let result = driver.connect(&ConnectionConfig::new("memory://down")).await;
        assert!(matches!(result, Err(DbError::Connection(_))));
        assert_eq!(driver.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_databases_shared_per_url() {
        let driver = MemoryDriver::new();
        let a = connect(&driver, "memory://t1").await;
        a.execute(&op("tb_unit", OperationKind::Create, QueryArgs::data(json!({"n": 1}))))
            .await
            .unwrap();
        let b = connect(&driver, "memory://t1").await;
        let other = connect(&driver, "memory://t2").await;

        let count = OperationKind::Count;
        assert_eq!(b.execute(&op("tb_unit", count, QueryArgs::default())).await.unwrap(), json!(1));
        assert_eq!(other.execute(&op("tb_unit", count, QueryArgs::default())).await.unwrap(), json!(0));
        assert_eq!(driver.connections_opened(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://t1").await;
        driver
            .database("memory://t1")
            .set_failing("tb_activity", OperationKind::CreateMany, true);
        let err = conn
            .execute(&op("tb_activity", OperationKind::CreateMany, QueryArgs::data(json!([{}]))))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
    }
}
