//! Live read projections
//!
//! A [`Projection`] is a read-only view over the cache together with the
//! entity kinds it depends on. [`QueryHub::subscribe`] turns one into a
//! stream of values: the current result first, then a fresh result after
//! every committed transaction that touched a dependency and changed the
//! result.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Params, Row};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{
    EntityKind, House, PhoneCall, PhoneNumber, PhoneTerritory, Recall, RecordKey, Territory,
    TerritoryAddress, Token, UserToken, Visit,
};
use crate::pending;
use crate::storage::record;
use crate::storage::{LocalStore, Record, StorageResult};

/// A read-only view over the cache
pub trait Projection: Send + Sync + 'static {
    type Output: Clone + PartialEq + Send + Sync + 'static;

    /// Kinds whose changes can alter the result
    fn dependencies(&self) -> &'static [EntityKind];

    /// Whether the result also depends on the pending change log
    fn watches_pending(&self) -> bool {
        false
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output>;
}

fn select_list<R: Record>(alias: &str) -> String {
    R::COLUMNS
        .iter()
        .map(|col| format!("{}.{}", alias, col))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> StorageResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Rows of `R` followed by one integer column
fn rows_with_count<R: Record>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> StorageResult<Vec<(R, i64)>> {
    let n = R::COLUMNS.len();
    query_rows(conn, sql, params, |row| Ok((R::from_row(row)?, row.get(n)?)))
}

/// Newest child per parent, from rows already sorted newest first
fn newest_by<T, K>(rows: Vec<T>, parent: impl Fn(&T) -> K) -> HashMap<K, T>
where
    K: std::hash::Hash + Eq,
{
    let mut out = HashMap::new();
    for row in rows {
        out.entry(parent(&row)).or_insert(row);
    }
    out
}

// ==================== Territory hierarchy ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerritorySummary {
    pub territory: Territory,
    pub address_count: i64,
    pub house_count: i64,
    /// Date of the most recent visit anywhere in the territory
    pub last_visit: Option<i64>,
    /// Names of the keys granting access to the territory
    pub keys: Vec<String>,
}

/// Every territory with its size and the keys that share it
#[derive(Debug, Clone, Default)]
pub struct TerritoryOverview;

impl Projection for TerritoryOverview {
    type Output = Vec<TerritorySummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[
            EntityKind::Territory,
            EntityKind::TerritoryAddress,
            EntityKind::House,
            EntityKind::Visit,
            EntityKind::Token,
            EntityKind::TokenTerritory,
        ]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let sql = format!(
            "SELECT {},
                (SELECT COUNT(*) FROM territory_addresses a WHERE a.territory = t.id),
                (SELECT COUNT(*) FROM houses h
                    JOIN territory_addresses a ON h.territory_address = a.id
                    WHERE a.territory = t.id),
                (SELECT MAX(v.date) FROM visits v
                    JOIN houses h ON v.house = h.id
                    JOIN territory_addresses a ON h.territory_address = a.id
                    WHERE a.territory = t.id)
             FROM territories t
             ORDER BY t.number, t.id",
            select_list::<Territory>("t")
        );
        let n = Territory::COLUMNS.len();
        let rows = query_rows(conn, &sql, [], |row| {
            Ok((
                Territory::from_row(row)?,
                row.get::<_, i64>(n)?,
                row.get::<_, i64>(n + 1)?,
                row.get::<_, Option<i64>>(n + 2)?,
            ))
        })?;

        let mut keys: HashMap<String, Vec<String>> = HashMap::new();
        let grants = query_rows(
            conn,
            "SELECT tt.territory, k.name FROM token_territories tt
             JOIN tokens k ON k.id = tt.token
             ORDER BY k.name",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        for (territory, name) in grants {
            keys.entry(territory).or_default().push(name);
        }

        Ok(rows
            .into_iter()
            .map(|(territory, address_count, house_count, last_visit)| TerritorySummary {
                keys: keys.remove(&territory.id).unwrap_or_default(),
                territory,
                address_count,
                house_count,
                last_visit,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressSummary {
    pub address: TerritoryAddress,
    pub house_count: i64,
}

/// Addresses of one territory
#[derive(Debug, Clone)]
pub struct AddressList {
    pub territory: String,
}

impl Projection for AddressList {
    type Output = Vec<AddressSummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::TerritoryAddress, EntityKind::House]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let sql = format!(
            "SELECT {}, (SELECT COUNT(*) FROM houses h WHERE h.territory_address = a.id)
             FROM territory_addresses a
             WHERE a.territory = ?1
             ORDER BY a.address, a.id",
            select_list::<TerritoryAddress>("a")
        );
        Ok(rows_with_count::<TerritoryAddress>(conn, &sql, [&self.territory])?
            .into_iter()
            .map(|(address, house_count)| AddressSummary {
                address,
                house_count,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HouseSummary {
    pub house: House,
    pub last_visit: Option<Visit>,
}

/// Houses at one address with their latest visit
#[derive(Debug, Clone)]
pub struct HouseList {
    pub address: String,
}

impl Projection for HouseList {
    type Output = Vec<HouseSummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::House, EntityKind::Visit]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let houses: Vec<House> = query_rows(
            conn,
            &format!(
                "SELECT {} FROM houses h
                 WHERE h.territory_address = ?1
                 ORDER BY h.floor, CAST(h.number AS INTEGER), h.number",
                select_list::<House>("h")
            ),
            [&self.address],
            House::from_row,
        )?;
        let visits: Vec<Visit> = query_rows(
            conn,
            &format!(
                "SELECT {} FROM visits v
                 JOIN houses h ON v.house = h.id
                 WHERE h.territory_address = ?1
                 ORDER BY v.date DESC, v.id",
                select_list::<Visit>("v")
            ),
            [&self.address],
            Visit::from_row,
        )?;
        let mut latest = newest_by(visits, |visit| visit.house.clone());

        Ok(houses
            .into_iter()
            .map(|house| HouseSummary {
                last_visit: latest.remove(&house.id),
                house,
            })
            .collect())
    }
}

/// Visits of one house, newest first
#[derive(Debug, Clone)]
pub struct VisitList {
    pub house: String,
}

impl Projection for VisitList {
    type Output = Vec<Visit>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::Visit]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        query_rows(
            conn,
            &format!(
                "SELECT {} FROM visits v WHERE v.house = ?1 ORDER BY v.date DESC, v.id",
                select_list::<Visit>("v")
            ),
            [&self.house],
            Visit::from_row,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentTerritory {
    pub territory: Territory,
    pub last_visit: i64,
}

/// Territories ordered by their most recent visit
#[derive(Debug, Clone)]
pub struct RecentTerritories {
    pub limit: usize,
}

impl Default for RecentTerritories {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

impl Projection for RecentTerritories {
    type Output = Vec<RecentTerritory>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[
            EntityKind::Territory,
            EntityKind::TerritoryAddress,
            EntityKind::House,
            EntityKind::Visit,
        ]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let sql = format!(
            "SELECT {}, MAX(v.date) AS last_visit
             FROM territories t
             JOIN territory_addresses a ON a.territory = t.id
             JOIN houses h ON h.territory_address = a.id
             JOIN visits v ON v.house = h.id
             GROUP BY t.id
             ORDER BY last_visit DESC, t.number
             LIMIT ?1",
            select_list::<Territory>("t")
        );
        let limit = i64::try_from(self.limit).unwrap_or(i64::MAX);
        Ok(rows_with_count::<Territory>(conn, &sql, [limit])?
            .into_iter()
            .map(|(territory, last_visit)| RecentTerritory {
                territory,
                last_visit,
            })
            .collect())
    }
}

// ==================== Phone hierarchy ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneTerritorySummary {
    pub territory: PhoneTerritory,
    pub number_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PhoneTerritoryList;

impl Projection for PhoneTerritoryList {
    type Output = Vec<PhoneTerritorySummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::PhoneTerritory, EntityKind::PhoneNumber]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let sql = format!(
            "SELECT {}, (SELECT COUNT(*) FROM phone_numbers n WHERE n.territory = t.id)
             FROM phone_territories t
             ORDER BY t.number, t.id",
            select_list::<PhoneTerritory>("t")
        );
        Ok(rows_with_count::<PhoneTerritory>(conn, &sql, [])?
            .into_iter()
            .map(|(territory, number_count)| PhoneTerritorySummary {
                territory,
                number_count,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneNumberSummary {
    pub number: PhoneNumber,
    pub last_call: Option<PhoneCall>,
}

/// Numbers of one phone territory with their latest call
#[derive(Debug, Clone)]
pub struct PhoneNumberList {
    pub territory: String,
}

impl Projection for PhoneNumberList {
    type Output = Vec<PhoneNumberSummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::PhoneNumber, EntityKind::PhoneCall]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let numbers: Vec<PhoneNumber> = query_rows(
            conn,
            &format!(
                "SELECT {} FROM phone_numbers n WHERE n.territory = ?1 ORDER BY n.number, n.id",
                select_list::<PhoneNumber>("n")
            ),
            [&self.territory],
            PhoneNumber::from_row,
        )?;
        let calls: Vec<PhoneCall> = query_rows(
            conn,
            &format!(
                "SELECT {} FROM phone_calls c
                 JOIN phone_numbers n ON c.phonenumber = n.id
                 WHERE n.territory = ?1
                 ORDER BY c.date DESC, c.id",
                select_list::<PhoneCall>("c")
            ),
            [&self.territory],
            PhoneCall::from_row,
        )?;
        let mut latest = newest_by(calls, |call| call.phone_number.clone());

        Ok(numbers
            .into_iter()
            .map(|number| PhoneNumberSummary {
                last_call: latest.remove(&number.id),
                number,
            })
            .collect())
    }
}

/// Calls to one number, newest first
#[derive(Debug, Clone)]
pub struct PhoneCallList {
    pub number: String,
}

impl Projection for PhoneCallList {
    type Output = Vec<PhoneCall>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[EntityKind::PhoneCall]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        query_rows(
            conn,
            &format!(
                "SELECT {} FROM phone_calls c WHERE c.phonenumber = ?1 ORDER BY c.date DESC, c.id",
                select_list::<PhoneCall>("c")
            ),
            [&self.number],
            PhoneCall::from_row,
        )
    }
}

// ==================== Keys and recalls ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySummary {
    pub token: Token,
    pub territories: Vec<String>,
    pub users: Vec<UserToken>,
}

/// Access keys with their territories and members
#[derive(Debug, Clone, Default)]
pub struct KeyList;

impl Projection for KeyList {
    type Output = Vec<KeySummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[
            EntityKind::Token,
            EntityKind::TokenTerritory,
            EntityKind::UserToken,
        ]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let tokens: Vec<Token> = query_rows(
            conn,
            &format!(
                "SELECT {} FROM tokens k ORDER BY k.name, k.id",
                select_list::<Token>("k")
            ),
            [],
            Token::from_row,
        )?;

        let mut territories: HashMap<String, Vec<String>> = HashMap::new();
        let grants = query_rows(
            conn,
            "SELECT token, territory FROM token_territories ORDER BY territory",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        for (token, territory) in grants {
            territories.entry(token).or_default().push(territory);
        }

        let mut users: HashMap<String, Vec<UserToken>> = HashMap::new();
        for member in record::fetch_all::<UserToken>(conn)? {
            users.entry(member.token.clone()).or_default().push(member);
        }

        Ok(tokens
            .into_iter()
            .map(|token| KeySummary {
                territories: territories.remove(&token.id).unwrap_or_default(),
                users: users.remove(&token.id).unwrap_or_default(),
                token,
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallSummary {
    pub recall: Recall,
    pub house: House,
    pub address: TerritoryAddress,
    pub territory: Territory,
    pub last_visit: Option<Visit>,
}

/// Recalls whose house is cached, with where it is and its latest visit
#[derive(Debug, Clone, Default)]
pub struct RecallList;

impl Projection for RecallList {
    type Output = Vec<RecallSummary>;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[
            EntityKind::Recall,
            EntityKind::Territory,
            EntityKind::TerritoryAddress,
            EntityKind::House,
            EntityKind::Visit,
        ]
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let visit_sql = format!(
            "SELECT {} FROM visits v WHERE v.house = ?1 ORDER BY v.date DESC, v.id LIMIT 1",
            select_list::<Visit>("v")
        );

        let mut out = Vec::new();
        for recall in record::fetch_all::<Recall>(conn)? {
            // Houses outside the cached territories are skipped
            let Some(house) = record::fetch_one::<House>(conn, &RecordKey::id(&recall.house))?
            else {
                continue;
            };
            let Some(address) = record::fetch_one::<TerritoryAddress>(
                conn,
                &RecordKey::id(&house.territory_address),
            )?
            else {
                continue;
            };
            let Some(territory) =
                record::fetch_one::<Territory>(conn, &RecordKey::id(&address.territory))?
            else {
                continue;
            };
            let last_visit = query_rows(conn, &visit_sql, [&house.id], Visit::from_row)?
                .into_iter()
                .next();

            out.push(RecallSummary {
                recall,
                house,
                address,
                territory,
                last_visit,
            });
        }

        out.sort_by(|a, b| {
            (a.territory.number, &a.address.address, &a.house.number)
                .cmp(&(b.territory.number, &b.address.address, &b.house.number))
        });
        Ok(out)
    }
}

// ==================== Pending changes ====================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PendingOverview {
    pub count: usize,
    pub by_kind: BTreeMap<EntityKind, usize>,
    pub oldest: Option<DateTime<Utc>>,
}

/// Unsynced work, for the "not uploaded yet" indicator
#[derive(Debug, Clone, Default)]
pub struct PendingSummary;

impl Projection for PendingSummary {
    type Output = PendingOverview;

    fn dependencies(&self) -> &'static [EntityKind] {
        &[]
    }

    fn watches_pending(&self) -> bool {
        true
    }

    fn load(&self, conn: &Connection) -> StorageResult<Self::Output> {
        let mut overview = PendingOverview::default();
        for change in pending::list(conn)? {
            overview.count += 1;
            *overview.by_kind.entry(change.kind).or_default() += 1;
            if overview.oldest.map_or(true, |oldest| change.created_at < oldest) {
                overview.oldest = Some(change.created_at);
            }
        }
        Ok(overview)
    }
}

// ==================== Subscriptions ====================

/// Live results of one projection
///
/// Dropping it cancels the background task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    /// Next result that differs from the last one
    ///
    /// Waits for a relevant commit. The task keeps its own store handle,
    /// so this keeps waiting for as long as the subscription is held.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// A result already delivered, without waiting
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs projections against the cache
#[derive(Clone)]
pub struct QueryHub {
    store: LocalStore,
}

impl QueryHub {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Evaluate once
    pub fn query<P: Projection>(&self, projection: &P) -> StorageResult<P::Output> {
        self.store.read(|conn| projection.load(conn))
    }

    /// Evaluate now and again after every relevant commit
    pub fn subscribe<P: Projection>(&self, projection: P) -> Subscription<P::Output> {
        // Listen before the first load so no commit slips between them
        let mut changes = self.store.subscribe_changes();
        let store = self.store.clone();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let mut last: Option<P::Output> = None;
            let mut dirty = true;
            loop {
                if dirty {
                    match store.read(|conn| projection.load(conn)) {
                        Ok(output) if last.as_ref() != Some(&output) => {
                            if tx.send(output.clone()).await.is_err() {
                                return;
                            }
                            last = Some(output);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Projection reload failed: {}", e),
                    }
                }

                dirty = match changes.recv().await {
                    Ok(change) => {
                        change.touches(projection.dependencies())
                            || (change.pending && projection.watches_pending())
                    }
                    // Missed notifications: reload to be safe
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => return,
                };
            }
        });

        Subscription { rx, task }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{TokenTerritory, VisitSymbol};
    use crate::pending::LocalMutations;
    use crate::testing::{address, house, territory};

    fn seeded() -> LocalStore {
        let store = LocalStore::open_in_memory().unwrap();
        store.upsert(&territory("t1")).unwrap();
        store.upsert(&address("a1", "t1")).unwrap();
        store.upsert(&house("h1", "a1")).unwrap();
        store.upsert(&house("h2", "a1")).unwrap();
        store
    }

    fn visit(house: &str, date: i64) -> Visit {
        Visit::new(house, date, VisitSymbol::NC, "", "ann")
    }

    #[test]
    fn test_territory_overview_counts_and_keys() {
        let store = seeded();
        store.upsert(&visit("h1", 100)).unwrap();
        store
            .upsert(&Token {
                id: "k1".into(),
                name: "Shared".into(),
                owner: "ann".into(),
                congregation: "c1".into(),
                moderator: false,
                expire: None,
                user: None,
            })
            .unwrap();
        store
            .upsert(&TokenTerritory {
                token: "k1".into(),
                territory: "t1".into(),
            })
            .unwrap();

        let overview = QueryHub::new(store).query(&TerritoryOverview).unwrap();

        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].address_count, 1);
        assert_eq!(overview[0].house_count, 2);
        assert_eq!(overview[0].last_visit, Some(100));
        assert_eq!(overview[0].keys, vec!["Shared".to_string()]);
    }

    #[test]
    fn test_house_list_latest_visit() {
        let store = seeded();
        store.upsert(&visit("h1", 100)).unwrap();
        store.upsert(&visit("h1", 300)).unwrap();

        let houses = QueryHub::new(store)
            .query(&HouseList {
                address: "a1".into(),
            })
            .unwrap();

        assert_eq!(houses.len(), 2);
        assert_eq!(houses[0].last_visit.as_ref().unwrap().date, 300);
        assert!(houses[1].last_visit.is_none());
    }

    #[test]
    fn test_visit_list_newest_first() {
        let store = seeded();
        store.upsert(&visit("h1", 100)).unwrap();
        store.upsert(&visit("h1", 300)).unwrap();

        let visits = QueryHub::new(store)
            .query(&VisitList { house: "h1".into() })
            .unwrap();

        let dates: Vec<_> = visits.iter().map(|v| v.date).collect();
        assert_eq!(dates, vec![300, 100]);
    }

    #[test]
    fn test_recall_list_skips_unknown_houses() {
        let store = seeded();
        for house in ["h1", "elsewhere"] {
            store
                .upsert(&Recall {
                    id: 0,
                    user: "ann".into(),
                    house: house.into(),
                })
                .unwrap();
        }

        let recalls = QueryHub::new(store).query(&RecallList).unwrap();

        assert_eq!(recalls.len(), 1);
        assert_eq!(recalls[0].territory.id, "t1");
    }

    #[test]
    fn test_recent_territories() {
        let store = seeded();
        store.upsert(&territory("t2")).unwrap();
        store.upsert(&address("a2", "t2")).unwrap();
        store.upsert(&house("h3", "a2")).unwrap();
        store.upsert(&visit("h1", 100)).unwrap();
        store.upsert(&visit("h3", 500)).unwrap();

        let recent = QueryHub::new(store)
            .query(&RecentTerritories::default())
            .unwrap();

        let ids: Vec<_> = recent.iter().map(|r| r.territory.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
    }

    #[test]
    fn test_pending_summary() {
        let store = seeded();
        LocalMutations::new(store.clone())
            .add(&visit("h1", 100))
            .unwrap();

        let summary = QueryHub::new(store).query(&PendingSummary).unwrap();

        assert_eq!(summary.count, 1);
        assert_eq!(summary.by_kind.get(&EntityKind::Visit), Some(&1));
        assert!(summary.oldest.is_some());
    }

    #[tokio::test]
    async fn test_subscription_delivers_initial_and_updates() {
        let store = seeded();
        let hub = QueryHub::new(store.clone());
        let mut visits = hub.subscribe(VisitList { house: "h1".into() });

        assert_eq!(visits.next().await.unwrap(), vec![]);

        store.upsert(&visit("h1", 100)).unwrap();
        let update = visits.next().await.unwrap();
        assert_eq!(update.len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_skips_unrelated_and_identical_results() {
        let store = seeded();
        let hub = QueryHub::new(store.clone());
        let mut visits = hub.subscribe(VisitList { house: "h1".into() });
        visits.next().await.unwrap();

        // Unrelated kind, then a visit elsewhere that leaves the result as it was
        store.upsert(&territory("t2")).unwrap();
        store.upsert(&visit("h2", 100)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(visits.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_task() {
        let store = seeded();
        let hub = QueryHub::new(store.clone());
        let mut visits = hub.subscribe(VisitList { house: "h1".into() });
        visits.next().await.unwrap();
        let handle = visits.task.abort_handle();
        assert!(!handle.is_finished());

        visits.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_subscription_outlives_other_store_handles() {
        let store = seeded();
        let mut visits = QueryHub::new(store).subscribe(VisitList { house: "h1".into() });
        visits.next().await.unwrap();

        // Hub and store handles are gone; the subscription keeps waiting
        let waited = tokio::time::timeout(Duration::from_millis(50), visits.next()).await;

        assert!(waited.is_err());
        assert!(!visits.task.is_finished());
    }
}
