// src/db.rs
use crate::auth::Session;
use crate::config::{Config, StoreBackend};
use crate::error::{AppError, Result};
use crate::models::{Holding, HoldingChanges, NewHolding, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use reqwest::{Client, Method, RequestBuilder, Response};
use scylla::{frame::response::result::CqlValue, query::Query, SessionBuilder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for holdings. Every call is scoped to the session's user; a
/// holding owned by someone else is reported as missing.
#[async_trait]
pub trait HoldingStore: Send + Sync {
    /// Newest first.
    async fn list(&self, session: &Session) -> Result<Vec<Holding>>;
    async fn insert(&self, session: &Session, holding: NewHolding) -> Result<Holding>;
    async fn update(&self, session: &Session, id: &str, changes: HoldingChanges) -> Result<Holding>;
    async fn delete(&self, session: &Session, id: &str) -> Result<()>;
}

pub async fn init(config: &Config, http: Client) -> Result<Arc<dyn HoldingStore>> {
    let store: Arc<dyn HoldingStore> = match config.store_backend {
        StoreBackend::Rest => Arc::new(RestStore::new(
            http,
            &config.supabase_url,
            &config.supabase_anon_key,
        )),
        StoreBackend::Scylla => Arc::new(ScyllaStore::connect(&config.scylla_node).await?),
        StoreBackend::Memory => Arc::new(MemoryStore::default()),
    };
    info!("Using {:?} holdings store.", config.store_backend);
    Ok(store)
}

fn store_err<E: std::fmt::Display>(err: E) -> AppError {
    AppError::Store(err.to_string())
}

fn newest_first(holdings: &mut [Holding]) {
    holdings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Hosted `holdings` table reached through the provider's REST interface.
/// Requests carry the user's token so row-level policies apply upstream too.
pub struct RestStore {
    http: Client,
    table_url: String,
    anon_key: String,
}

#[derive(Serialize)]
struct InsertRow<'a> {
    user_id: &'a str,
    name: &'a str,
    symbol: &'a Symbol,
    quantity: f64,
    purchase_price: f64,
}

#[derive(Serialize)]
struct UpdateRow<'a> {
    #[serde(flatten)]
    changes: &'a HoldingChanges,
    updated_at: DateTime<Utc>,
}

impl RestStore {
    pub fn new(http: Client, base_url: &str, anon_key: &str) -> Self {
        RestStore {
            http,
            table_url: format!("{}/rest/v1/holdings", base_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
        }
    }

    fn request(&self, method: Method, session: &Session) -> RequestBuilder {
        self.http
            .request(method, &self.table_url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
    }

    async fn rows(response: Response) -> Result<Vec<Holding>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Store(format!("HTTP {}: {}", status, body)));
        }
        response.json::<Vec<Holding>>().await.map_err(store_err)
    }
}

#[async_trait]
impl HoldingStore for RestStore {
    async fn list(&self, session: &Session) -> Result<Vec<Holding>> {
        let owner = format!("eq.{}", session.user_id);
        let response = self
            .request(Method::GET, session)
            .query(&[
                ("select", "*"),
                ("user_id", owner.as_str()),
                ("order", "created_at.desc"),
            ])
            .send()
            .await
            .map_err(store_err)?;
        Self::rows(response).await
    }

    async fn insert(&self, session: &Session, holding: NewHolding) -> Result<Holding> {
        let row = InsertRow {
            user_id: &session.user_id,
            name: &holding.name,
            symbol: &holding.symbol,
            quantity: holding.quantity,
            purchase_price: holding.purchase_price,
        };
        let response = self
            .request(Method::POST, session)
            .header("Prefer", "return=representation")
            .json(&[row])
            .send()
            .await
            .map_err(store_err)?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Store("insert returned no row".to_string()))
    }

    async fn update(&self, session: &Session, id: &str, changes: HoldingChanges) -> Result<Holding> {
        let owner = format!("eq.{}", session.user_id);
        let target = format!("eq.{}", id);
        let row = UpdateRow {
            changes: &changes,
            updated_at: Utc::now(),
        };
        let response = self
            .request(Method::PATCH, session)
            .query(&[("id", target.as_str()), ("user_id", owner.as_str())])
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(store_err)?;
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<()> {
        let owner = format!("eq.{}", session.user_id);
        let target = format!("eq.{}", id);
        let response = self
            .request(Method::DELETE, session)
            .query(&[("id", target.as_str()), ("user_id", owner.as_str())])
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(store_err)?;
        if Self::rows(response).await?.is_empty() {
            return Err(AppError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, symbol, quantity, purchase_price, created_at, updated_at FROM coin_tracker.holdings";
const UPSERT: &str = "INSERT INTO coin_tracker.holdings (user_id, id, name, symbol, quantity, purchase_price, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

/// Self-hosted alternative on ScyllaDB. Ids and timestamps are assigned here.
pub struct ScyllaStore {
    session: scylla::Session,
}

impl ScyllaStore {
    pub async fn connect(node: &str) -> Result<ScyllaStore> {
        let session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .map_err(store_err)?;

        session.query("CREATE KEYSPACE IF NOT EXISTS coin_tracker WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}", &[]).await.map_err(store_err)?;
        session.query("CREATE TABLE IF NOT EXISTS coin_tracker.holdings (user_id TEXT, id TEXT, name TEXT, symbol TEXT, quantity DOUBLE, purchase_price DOUBLE, created_at TIMESTAMP, updated_at TIMESTAMP, PRIMARY KEY (user_id, id))", &[]).await.map_err(store_err)?;

        info!("Successfully connected to ScyllaDB at {}.", node);
        Ok(ScyllaStore { session })
    }

    async fn fetch_one(&self, user_id: &str, id: &str) -> Result<Option<Holding>> {
        let query = Query::new(format!("{} WHERE user_id = ? AND id = ?", SELECT_COLUMNS));
        let rows = self
            .session
            .query(query, (user_id, id))
            .await
            .map_err(store_err)?
            .rows
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .find_map(|row| holding_from_columns(user_id, &row.columns)))
    }

    async fn write(&self, holding: &Holding) -> Result<()> {
        let created = holding.created_at.unwrap_or_else(Utc::now).timestamp_millis();
        let updated = holding.updated_at.unwrap_or_else(Utc::now).timestamp_millis();
        self.session
            .query(
                Query::new(UPSERT),
                (
                    holding.user_id.as_str(),
                    holding.id.as_str(),
                    holding.name.as_str(),
                    holding.symbol.as_str(),
                    holding.quantity,
                    holding.purchase_price,
                    created,
                    updated,
                ),
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Millisecond precision, matching what a TIMESTAMP column stores.
fn now_millis() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn holding_from_columns(user_id: &str, columns: &[Option<CqlValue>]) -> Option<Holding> {
    let text = |i: usize| {
        columns
            .get(i)?
            .as_ref()
            .and_then(|v| v.as_text())
            .map(|s| s.to_string())
    };
    let double = |i: usize| columns.get(i)?.as_ref().and_then(|v| v.as_double());
    let timestamp = |i: usize| match columns.get(i)?.as_ref()? {
        CqlValue::Timestamp(ts) => DateTime::<Utc>::from_timestamp_millis(ts.num_milliseconds()),
        _ => None,
    };

    match (text(0), text(1), text(2), double(3), double(4)) {
        (Some(id), Some(name), Some(symbol), Some(quantity), Some(purchase_price)) => Some(Holding {
            id,
            user_id: user_id.to_string(),
            name,
            symbol: Symbol::from(symbol),
            quantity,
            purchase_price,
            created_at: timestamp(5),
            updated_at: timestamp(6),
        }),
        other => {
            error!("Skipping incomplete holding row for {}: {:?}", user_id, other);
            None
        }
    }
}

#[async_trait]
impl HoldingStore for ScyllaStore {
    async fn list(&self, session: &Session) -> Result<Vec<Holding>> {
        let query = Query::new(format!("{} WHERE user_id = ?", SELECT_COLUMNS));
        let result = self
            .session
            .query(query, (session.user_id.as_str(),))
            .await
            .map_err(store_err)?;
        let mut holdings: Vec<Holding> = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| holding_from_columns(&session.user_id, &row.columns))
            .collect();
        newest_first(&mut holdings);
        info!("Fetched {} holdings for user: {}", holdings.len(), session.user_id);
        Ok(holdings)
    }

    async fn insert(&self, session: &Session, holding: NewHolding) -> Result<Holding> {
        let now = now_millis();
        let record = Holding {
            id: Uuid::new_v4().to_string(),
            user_id: session.user_id.clone(),
            name: holding.name,
            symbol: holding.symbol,
            quantity: holding.quantity,
            purchase_price: holding.purchase_price,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.write(&record).await?;
        Ok(record)
    }

    async fn update(&self, session: &Session, id: &str, changes: HoldingChanges) -> Result<Holding> {
        let mut record = self
            .fetch_one(&session.user_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        changes.apply(&mut record);
        record.updated_at = Some(now_millis());
        self.write(&record).await?;
        Ok(record)
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<()> {
        if self.fetch_one(&session.user_id, id).await?.is_none() {
            return Err(AppError::NotFound(id.to_string()));
        }
        let query = Query::new("DELETE FROM coin_tracker.holdings WHERE user_id = ? AND id = ?");
        self.session
            .query(query, (session.user_id.as_str(), id))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Process-local store for development and tests. Contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    holdings: RwLock<Vec<Holding>>,
}

#[async_trait]
impl HoldingStore for MemoryStore {
    async fn list(&self, session: &Session) -> Result<Vec<Holding>> {
        let holdings = self.holdings.read().await;
        // Reverse first so equal timestamps still come out newest first.
        let mut owned: Vec<Holding> = holdings
            .iter()
            .rev()
            .filter(|h| h.user_id == session.user_id)
            .cloned()
            .collect();
        newest_first(&mut owned);
        Ok(owned)
    }

    async fn insert(&self, session: &Session, holding: NewHolding) -> Result<Holding> {
        let now = Utc::now();
        let record = Holding {
            id: Uuid::new_v4().to_string(),
            user_id: session.user_id.clone(),
            name: holding.name,
            symbol: holding.symbol,
            quantity: holding.quantity,
            purchase_price: holding.purchase_price,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.holdings.write().await.push(record.clone());
        Ok(record)
    }

    async fn update(&self, session: &Session, id: &str, changes: HoldingChanges) -> Result<Holding> {
        let mut holdings = self.holdings.write().await;
        let record = holdings
            .iter_mut()
            .find(|h| h.id == id && h.user_id == session.user_id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        changes.apply(record);
        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn delete(&self, session: &Session, id: &str) -> Result<()> {
        let mut holdings = self.holdings.write().await;
        let before = holdings.len();
        holdings.retain(|h| !(h.id == id && h.user_id == session.user_id));
        if holdings.len() == before {
            return Err(AppError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_upstream::{Recorded, Upstream};
    use serde_json::{json, Value};

    fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            access_token: "token".to_string(),
        }
    }

    fn new_holding(symbol: &str, quantity: f64) -> NewHolding {
        NewHolding {
            name: symbol.to_uppercase(),
            symbol: symbol.into(),
            quantity,
            purchase_price: 1.0,
        }
    }

    #[tokio::test]
    async fn memory_store_lists_newest_first_per_user() {
        let store = MemoryStore::default();
        let alice = session("alice");
        let bob = session("bob");
        store.insert(&alice, new_holding("btc", 1.0)).await.unwrap();
        store.insert(&bob, new_holding("eth", 2.0)).await.unwrap();
        store.insert(&alice, new_holding("sol", 3.0)).await.unwrap();

        let listed = store.list(&alice).await.unwrap();
        let symbols: Vec<&str> = listed.iter().map(|h| h.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["sol", "btc"]);
        assert_eq!(store.list(&bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_scopes_mutations_to_owner() {
        let store = MemoryStore::default();
        let alice = session("alice");
        let mallory = session("mallory");
        let created = store.insert(&alice, new_holding("btc", 1.0)).await.unwrap();

        let changes = HoldingChanges {
            quantity: Some(9.0),
            ..Default::default()
        };
        let err = store
            .update(&mallory, &created.id, changes.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(
            store.delete(&mallory, &created.id).await,
            Err(AppError::NotFound(_))
        ));

        let updated = store.update(&alice, &created.id, changes).await.unwrap();
        assert_eq!(updated.quantity, 9.0);
        assert_eq!(updated.created_at, created.created_at);

        store.delete(&alice, &created.id).await.unwrap();
        assert!(store.list(&alice).await.unwrap().is_empty());
    }

    #[test]
    fn scylla_row_maps_to_holding() {
        let columns = vec![
            Some(CqlValue::Text("h-1".to_string())),
            Some(CqlValue::Text("Bitcoin".to_string())),
            Some(CqlValue::Text("BTC".to_string())),
            Some(CqlValue::Double(0.5)),
            Some(CqlValue::Double(30000.0)),
            None,
            None,
        ];
        let holding = holding_from_columns("alice", &columns).unwrap();
        assert_eq!(holding.id, "h-1");
        assert_eq!(holding.symbol.as_str(), "btc");
        assert_eq!(holding.quantity, 0.5);
        assert!(holding.created_at.is_none());

        let incomplete = vec![Some(CqlValue::Text("h-2".to_string())), None];
        assert!(holding_from_columns("alice", &incomplete).is_none());
    }

    #[test]
    fn rest_store_targets_holdings_table() {
        let store = RestStore::new(Client::new(), "https://proj.supabase.co/", "anon");
        assert_eq!(store.table_url, "https://proj.supabase.co/rest/v1/holdings");
    }

    fn table_row(id: &str, created_at: &str) -> Value {
        json!({
            "id": id, "user_id": "alice", "name": "Bitcoin", "symbol": "BTC",
            "quantity": 2.0, "purchase_price": 100.0,
            "created_at": created_at, "updated_at": null
        })
    }

    /// Only `h-1` exists for the caller; filters on any other id match nothing.
    fn holdings_table(req: &Recorded) -> (u16, Value) {
        let matches = req.query("id").map_or(true, |id| id == "eq.h-1");
        match (req.method.as_str(), matches) {
            ("GET", _) => (
                200,
                json!([
                    table_row("h-2", "2024-02-01T00:00:00Z"),
                    table_row("h-1", "2024-01-01T00:00:00Z")
                ]),
            ),
            (_, true) => (200, json!([table_row("h-1", "2024-01-01T00:00:00Z")])),
            (_, false) => (200, json!([])),
        }
    }

    fn assert_authorized(req: &Recorded) {
        assert_eq!(req.path, "/rest/v1/holdings");
        assert_eq!(req.header("apikey"), Some("anon"));
        assert_eq!(req.header("authorization"), Some("Bearer token"));
    }

    #[tokio::test]
    async fn rest_store_lists_only_the_callers_rows_newest_first() {
        let upstream = Upstream::start(holdings_table);
        let store = RestStore::new(Client::new(), &upstream.url, "anon");

        let listed = store.list(&session("alice")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "h-2");
        assert_eq!(listed[0].symbol.as_str(), "btc");

        let req = upstream.single();
        assert_eq!(req.method.as_str(), "GET");
        assert_authorized(&req);
        assert_eq!(req.query("select"), Some("*"));
        assert_eq!(req.query("user_id"), Some("eq.alice"));
        assert_eq!(req.query("order"), Some("created_at.desc"));
    }

    #[tokio::test]
    async fn rest_store_insert_sends_owner_and_canonical_symbol() {
        let upstream = Upstream::start(holdings_table);
        let store = RestStore::new(Client::new(), &upstream.url, "anon");

        let created = store
            .insert(&session("alice"), new_holding("BTC", 2.0))
            .await
            .unwrap();
        assert_eq!(created.id, "h-1");

        let req = upstream.single();
        assert_eq!(req.method.as_str(), "POST");
        assert_authorized(&req);
        assert_eq!(req.header("prefer"), Some("return=representation"));
        assert_eq!(req.body[0]["user_id"], "alice");
        assert_eq!(req.body[0]["symbol"], "btc");
        assert_eq!(req.body[0]["quantity"], 2.0);
    }

    #[tokio::test]
    async fn rest_store_update_filters_by_id_and_owner() {
        let upstream = Upstream::start(holdings_table);
        let store = RestStore::new(Client::new(), &upstream.url, "anon");
        let changes = HoldingChanges {
            quantity: Some(3.0),
            ..Default::default()
        };

        store
            .update(&session("alice"), "h-1", changes.clone())
            .await
            .unwrap();
        let req = upstream.single();
        assert_eq!(req.method.as_str(), "PATCH");
        assert_authorized(&req);
        assert_eq!(req.query("id"), Some("eq.h-1"));
        assert_eq!(req.query("user_id"), Some("eq.alice"));
        assert_eq!(req.body["quantity"], 3.0);
        assert!(req.body.get("name").is_none());
        assert!(req.body["updated_at"].is_string());

        let err = store
            .update(&session("alice"), "h-9", changes)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn rest_store_delete_reports_missing_rows() {
        let upstream = Upstream::start(holdings_table);
        let store = RestStore::new(Client::new(), &upstream.url, "anon");

        store.delete(&session("alice"), "h-1").await.unwrap();
        let err = store.delete(&session("alice"), "h-9").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let requests = upstream.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method.as_str(), "DELETE");
        assert_authorized(&requests[0]);
        assert_eq!(requests[0].query("id"), Some("eq.h-1"));
        assert_eq!(requests[0].query("user_id"), Some("eq.alice"));
    }

    #[tokio::test]
    async fn rest_store_surfaces_upstream_failure() {
        let upstream = Upstream::start(|_| (500, json!({ "message": "boom" })));
        let store = RestStore::new(Client::new(), &upstream.url, "anon");
        let err = store.list(&session("alice")).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }
}
