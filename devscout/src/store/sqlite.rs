//! SQLite-backed device store.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use strum::IntoEnumIterator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use super::models::window_label;
use super::{
    AddressEntry, DeviceId, DeviceIdentity, DeviceStore, Record, RecordKind, STAT_WINDOWS_HOURS,
    StoreStats,
};
use crate::{Error, Result};

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

const LATEST_ADDRESS: &str = "r.kind = 'Address' AND r.id = (
    SELECT r2.id FROM records r2
    WHERE r2.device_id = r.device_id AND r2.kind = 'Address'
    ORDER BY r2.recorded_at DESC, r2.id DESC
    LIMIT 1
)";

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn cutoff_ms(max_age: Duration) -> i64 {
    let age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_sub(age)
}

/// sqlx implementation of [`DeviceStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and apply
    /// pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .foreign_keys(true)
            .create_if_missing(true);

        // Every connection to `:memory:` is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            DEFAULT_POOL_SIZE
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(
            max_connections,
            "Device store ready"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn address_entries(rows: Vec<(String, i64, String)>) -> Vec<AddressEntry> {
        rows.into_iter()
            .filter_map(|(device, at, data)| {
                let record = Record {
                    kind: RecordKind::Address,
                    at: ms_to_datetime(at),
                    data: serde_json::from_str(&data).ok()?,
                };
                let (ip, port) = record.as_address()?;
                Some(AddressEntry {
                    device: DeviceId::from(device),
                    ip,
                    port,
                    at: record.at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn upsert_device(&self, id: &DeviceId, identity: &DeviceIdentity) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO devices (id, mac, wifi_mac, hw_id, retry, created_at)
             VALUES (?, ?, ?, ?, 0, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(identity.mac.as_deref())
        .bind(identity.wifi_mac.as_deref())
        .bind(identity.hw_id.as_deref())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        sqlx::query("UPDATE devices SET retry = 0 WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(false)
    }

    async fn mark_unreachable(&self, id: &DeviceId) -> Result<u32> {
        let retry: Option<i64> =
            sqlx::query_scalar("UPDATE devices SET retry = retry + 1 WHERE id = ? RETURNING retry")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let retry = retry.ok_or_else(|| Error::store(format!("unknown device {id}")))?;
        Ok(u32::try_from(retry).unwrap_or(u32::MAX))
    }

    async fn append_record(&self, id: &DeviceId, record: Record) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        sqlx::query(
            "INSERT INTO records (device_id, kind, recorded_at, data) VALUES (?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(record.kind.to_string())
        .bind(record.at.timestamp_millis())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn devices_needing_work(
        &self,
        max_age: Duration,
        max_retry: u32,
    ) -> Result<Vec<AddressEntry>> {
        let query = format!(
            "SELECT r.device_id, r.recorded_at, r.data
             FROM records r JOIN devices d ON d.id = r.device_id
             WHERE d.retry < ? AND {LATEST_ADDRESS}
               AND NOT EXISTS (
                   SELECT 1 FROM records s
                   WHERE s.device_id = d.id AND s.kind = 'Status' AND s.recorded_at > ?
               )
             ORDER BY r.device_id"
        );
        let rows: Vec<(String, i64, String)> = sqlx::query_as(&query)
            .bind(i64::from(max_retry))
            .bind(cutoff_ms(max_age))
            .fetch_all(&self.pool)
            .await?;
        Ok(Self::address_entries(rows))
    }

    async fn latest_addresses(&self) -> Result<Vec<AddressEntry>> {
        let query = format!(
            "SELECT r.device_id, r.recorded_at, r.data FROM records r
             WHERE {LATEST_ADDRESS}
             ORDER BY r.device_id"
        );
        let rows: Vec<(String, i64, String)> =
            sqlx::query_as(&query).fetch_all(&self.pool).await?;
        Ok(Self::address_entries(rows))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let (total, active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN retry = 0 THEN 1 ELSE 0 END), 0) FROM devices",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut records: BTreeMap<RecordKind, u64> =
            RecordKind::iter().map(|k| (k, 0)).collect();
        let by_kind: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, COUNT(*) FROM records GROUP BY kind")
                .fetch_all(&self.pool)
                .await?;
        for (kind, count) in by_kind {
            let kind = kind.parse().unwrap_or(RecordKind::Other);
            *records.entry(kind).or_default() += count.max(0) as u64;
        }

        let now = Utc::now().timestamp_millis();
        let mut recent = BTreeMap::new();
        for hours in STAT_WINDOWS_HOURS {
            let since = now - hours * 3_600_000;
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE recorded_at > ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
            recent.insert(window_label(hours), count.max(0) as u64);
        }

        let mut stats = StoreStats::default();
        stats.devices.total = total.max(0) as u64;
        stats.devices.active = active.max(0) as u64;
        stats.records = records;
        stats.recent = recent;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn identity(hw_id: &str) -> DeviceIdentity {
        DeviceIdentity {
            hw_id: Some(hw_id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_and_retry() {
        let store = store().await;
        let id = identity("cam-1").device_id("");

        assert!(store.upsert_device(&id, &identity("cam-1")).await.unwrap());
        assert!(!store.upsert_device(&id, &identity("cam-1")).await.unwrap());
        assert_eq!(store.mark_unreachable(&id).await.unwrap(), 1);
        assert_eq!(store.mark_unreachable(&id).await.unwrap(), 2);

        let unknown = DeviceId::from("nope".to_string());
        assert!(store.mark_unreachable(&unknown).await.is_err());
    }

    #[tokio::test]
    async fn test_records_and_latest_address() {
        let store = store().await;
        let id = identity("cam-2").device_id("");
        store.upsert_device(&id, &identity("cam-2")).await.unwrap();

        let mut old = Record::address("10.1.1.1".parse().unwrap(), 80);
        old.at = Utc::now() - chrono::Duration::hours(2);
        store.append_record(&id, old).await.unwrap();
        store
            .append_record(&id, Record::address("10.1.1.2".parse().unwrap(), 8080))
            .await
            .unwrap();

        let addresses = store.latest_addresses().await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].ip, "10.1.1.2".parse::<IpAddr>().unwrap());
        assert_eq!(addresses[0].port, 8080);

        let due = store
            .devices_needing_work(Duration::from_secs(3600), 3)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        store
            .append_record(&id, Record::status(true, Some(12)))
            .await
            .unwrap();
        let due = store
            .devices_needing_work(Duration::from_secs(3600), 3)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_record_for_unknown_device_is_rejected() {
        let store = store().await;
        let unknown = DeviceId::from("ghost".to_string());
        let err = store
            .append_record(&unknown, Record::status(false, None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatabaseSqlx(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store().await;
        let a = identity("a").device_id("");
        let b = identity("b").device_id("");
        store.upsert_device(&a, &identity("a")).await.unwrap();
        store.upsert_device(&b, &identity("b")).await.unwrap();
        store.mark_unreachable(&b).await.unwrap();
        store
            .append_record(&a, Record::address("10.0.0.9".parse().unwrap(), 80))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.devices.total, 2);
        assert_eq!(stats.devices.active, 1);
        assert_eq!(stats.records[&RecordKind::Address], 1);
        assert_eq!(stats.records[&RecordKind::Location], 0);
        assert_eq!(stats.recent["last 6h"], 1);
    }
}
