use crate::errors::{Error, Result};
use crate::lifecycle::{self, Action};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    Device, DeviceCount, DeviceLog, DevicePatch, DeviceStatus, Event, Metric, MetricSummary,
    NewDevice, NewEvent, Telemetry, TelemetrySummary,
};
use crate::store::{DeviceFilter, EventFilter, Store, TelemetryFilter};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEVICE_COLUMNS: &str = "id, name, type, serial_number, description, status, location, \
     specifications, purchase_date, deploy_date, last_maintenance_date, created_at, updated_at";

const TELEMETRY_COLUMNS: &str =
    "device_id, ts AS timestamp, temperature, humidity, battery, cpu_usage, ram_usage, gpu_usage";

const LOG_COLUMNS: &str = "id, device_id, action, old_status, new_status, notes, created_at";

const EVENT_COLUMNS: &str =
    "id, device_id, event_type, severity, details, acknowledged, created_at";

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = make_pool(database_url, max_connections).await?;
        Ok(Self { pool })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    #[sqlx(rename = "type")]
    device_type: String,
    serial_number: String,
    description: Option<String>,
    status: String,
    location: Option<String>,
    specifications: Option<Value>,
    purchase_date: Option<NaiveDate>,
    deploy_date: Option<DateTime<Utc>>,
    last_maintenance_date: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            id: row.id,
            name: row.name,
            device_type: row.device_type.parse()?,
            serial_number: row.serial_number,
            description: row.description,
            status: row.status.parse()?,
            location: row.location,
            specifications: row.specifications,
            purchase_date: row.purchase_date,
            deploy_date: row.deploy_date,
            last_maintenance_date: row.last_maintenance_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceLogRow {
    id: i64,
    device_id: i64,
    action: String,
    old_status: Option<String>,
    new_status: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeviceLogRow> for DeviceLog {
    type Error = Error;

    fn try_from(row: DeviceLogRow) -> Result<Self> {
        Ok(DeviceLog {
            id: row.id,
            device_id: row.device_id,
            action: row.action,
            old_status: row.old_status.map(|s| s.parse()).transpose()?,
            new_status: row.new_status.map(|s| s.parse()).transpose()?,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    device_id: i64,
    event_type: String,
    severity: String,
    details: Option<Value>,
    acknowledged: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Event {
            id: row.id,
            device_id: row.device_id,
            event_type: row.event_type,
            severity: row.severity.parse()?,
            details: row.details,
            acknowledged: row.acknowledged,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn map_unique_violation(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Error::Conflict(
            "Device with this serial number already exists".to_string(),
        ),
        other => Error::Database(other),
    }
}

fn push_device_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &DeviceFilter) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(device_type) = filter.device_type {
        qb.push(" AND type = ").push_bind(device_type.as_str());
    }
}

fn push_telemetry_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TelemetryFilter) {
    qb.push(" WHERE TRUE");
    if let Some(device_id) = filter.device_id {
        qb.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(start) = filter.start {
        qb.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        qb.push(" AND ts <= ").push_bind(end);
    }
}

fn push_event_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    qb.push(" WHERE TRUE");
    if let Some(device_id) = filter.device_id {
        qb.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(event_type) = &filter.event_type {
        qb.push(" AND event_type = ").push_bind(event_type.clone());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(acknowledged) = filter.acknowledged {
        qb.push(" AND acknowledged = ").push_bind(acknowledged);
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, limit: usize, offset: usize) {
    qb.push(" LIMIT ")
        .push_bind(limit as i64)
        .push(" OFFSET ")
        .push_bind(offset as i64);
}

#[async_trait]
impl Store for PgStore {
    async fn create_device(&self, new: NewDevice) -> Result<Device> {
        let query = format!(
            "INSERT INTO devices \
             (name, type, serial_number, description, location, specifications, \
              purchase_date, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {}",
            DEVICE_COLUMNS
        );

        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(&new.name)
            .bind(new.device_type.as_str())
            .bind(&new.serial_number)
            .bind(&new.description)
            .bind(&new.location)
            .bind(&new.specifications)
            .bind(new.purchase_date)
            .bind(DeviceStatus::InStock.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_unique_violation)?;

        row.try_into()
    }

    async fn list_devices(
        &self,
        filter: DeviceFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Device>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM devices");
        push_device_filter(&mut count, &filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM devices", DEVICE_COLUMNS));
        push_device_filter(&mut qb, &filter);
        qb.push(" ORDER BY id");
        push_page(&mut qb, limit, offset);
        let rows = qb.build_query_as::<DeviceRow>().fetch_all(&self.pool).await?;

        Ok((convert_all(rows)?, total))
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        sqlx::query_as::<_, DeviceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn update_device(&self, id: i64, patch: DevicePatch) -> Result<Option<Device>> {
        let query = format!(
            "UPDATE devices SET \
             name = COALESCE($2, name), \
             description = COALESCE($3, description), \
             location = COALESCE($4, location), \
             specifications = COALESCE($5, specifications), \
             updated_at = now() \
             WHERE id = $1 \
             RETURNING {}",
            DEVICE_COLUMNS
        );

        sqlx::query_as::<_, DeviceRow>(&query)
            .bind(id)
            .bind(&patch.name)
            .bind(&patch.description)
            .bind(&patch.location)
            .bind(&patch.specifications)
            .fetch_optional(&self.pool)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn apply_action(
        &self,
        id: i64,
        action: Action,
        notes: Option<String>,
    ) -> Result<(Device, DeviceLog)> {
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {} FROM devices WHERE id = $1 FOR UPDATE", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::device_not_found(id))?;

        let mut device = Device::try_from(row)?;
        let old_status = device.status;
        lifecycle::apply(&mut device, &action, Utc::now())?;

        sqlx::query(
            "UPDATE devices SET status = $2, location = $3, deploy_date = $4, \
             last_maintenance_date = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(device.status.as_str())
        .bind(&device.location)
        .bind(device.deploy_date)
        .bind(device.last_maintenance_date)
        .bind(device.updated_at)
        .execute(&mut *tx)
        .await?;

        let insert_log = format!(
            "INSERT INTO device_logs (device_id, action, old_status, new_status, notes) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            LOG_COLUMNS
        );
        let log_row = sqlx::query_as::<_, DeviceLogRow>(&insert_log)
            .bind(id)
            .bind(action.log_name())
            .bind(old_status.as_str())
            .bind(device.status.as_str())
            .bind(&notes)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!("Device {} {} ({} -> {})", id, action.log_name(), old_status, device.status);
        Ok((device, log_row.try_into()?))
    }

    async fn device_logs(&self, id: i64) -> Result<Vec<DeviceLog>> {
        let query = format!(
            "SELECT {} FROM device_logs WHERE device_id = $1 ORDER BY created_at DESC, id DESC",
            LOG_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceLogRow>(&query)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn insert_telemetry(&self, batch: &[Telemetry]) -> Result<()> {
        insert_batch(&self.pool, batch).await
    }

    async fn query_telemetry(
        &self,
        filter: &TelemetryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Telemetry>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM telemetry");
        push_telemetry_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {} FROM telemetry", TELEMETRY_COLUMNS));
        push_telemetry_filter(&mut qb, filter);
        qb.push(" ORDER BY ts DESC, device_id");
        push_page(&mut qb, limit, offset);
        let rows = qb.build_query_as::<Telemetry>().fetch_all(&self.pool).await?;

        Ok((rows, total))
    }

    async fn latest_telemetry(&self, device_id: i64) -> Result<Option<Telemetry>> {
        let query = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 ORDER BY ts DESC LIMIT 1",
            TELEMETRY_COLUMNS
        );
        let row = sqlx::query_as::<_, Telemetry>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn telemetry_summary(
        &self,
        device_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TelemetrySummary> {
        let filter = TelemetryFilter {
            device_id: Some(device_id),
            start,
            end,
        };

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM telemetry");
        push_telemetry_filter(&mut count, &filter);
        let samples: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            // column names come from a fixed list, never from input
            let column = metric.column();
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT MIN({c}), MAX({c}), AVG({c}), COUNT({c}) FROM telemetry",
                c = column
            ));
            push_telemetry_filter(&mut qb, &filter);

            let (min, max, avg, count) = qb
                .build_query_as::<(Option<f64>, Option<f64>, Option<f64>, i64)>()
                .fetch_one(&self.pool)
                .await?;

            if let (Some(min), Some(max), Some(avg)) = (min, max, avg) {
                metrics.insert(metric, MetricSummary { min, max, avg, count });
            }
        }

        Ok(TelemetrySummary {
            device_id,
            start,
            end,
            samples,
            metrics,
        })
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let query = format!(
            "INSERT INTO events (device_id, event_type, severity, details) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            EVENT_COLUMNS
        );
        let row = sqlx::query_as::<_, EventRow>(&query)
            .bind(event.device_id)
            .bind(&event.event_type)
            .bind(event.severity.as_str())
            .bind(&event.details)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Event>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM events");
        push_event_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM events", EVENT_COLUMNS));
        push_event_filter(&mut qb, filter);
        qb.push(" ORDER BY id DESC");
        push_page(&mut qb, limit, offset);
        let rows = qb.build_query_as::<EventRow>().fetch_all(&self.pool).await?;

        Ok((convert_all(rows)?, total))
    }

    async fn acknowledge_event(&self, id: i64) -> Result<Option<Event>> {
        let query = format!(
            "UPDATE events SET acknowledged = TRUE WHERE id = $1 RETURNING {}",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, EventRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Event::try_from)
            .transpose()
    }

    async fn device_counts(&self) -> Result<Vec<DeviceCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT status, type, COUNT(*) FROM devices GROUP BY status, type",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, device_type, count)| -> Result<DeviceCount> {
                Ok(DeviceCount {
                    status: status.parse()?,
                    device_type: device_type.parse()?,
                    count,
                })
            })
            .collect()
    }
}

async fn insert_batch(pool: &PgPool, batch: &[Telemetry]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match insert_batch_inner(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    if attempts >= max_attempts || !is_transient_error(db_err) {
                        error!(
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, e
                        );
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Database insert failed with non-database error: {}", e);
                    return Err(e);
                }
            },
        }
    }
}

async fn insert_batch_inner(pool: &PgPool, batch: &[Telemetry]) -> Result<()> {
    let device_ids: Vec<i64> = batch.iter().map(|t| t.device_id).collect();
    let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|t| t.timestamp).collect();
    let column = |metric: Metric| -> Vec<Option<f64>> {
        batch.iter().map(|t| metric.value(t)).collect()
    };

    let query = r#"
        INSERT INTO telemetry
            (device_id, ts, temperature, humidity, battery, cpu_usage, ram_usage, gpu_usage)
        SELECT * FROM UNNEST(
            $1::int8[], $2::timestamptz[],
            $3::float8[], $4::float8[], $5::float8[], $6::float8[], $7::float8[], $8::float8[]
        )
        ON CONFLICT (device_id, ts) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(column(Metric::Temperature))
        .bind(column(Metric::Humidity))
        .bind(column(Metric::Battery))
        .bind(column(Metric::CpuUsage))
        .bind(column(Metric::RamUsage))
        .bind(column(Metric::GpuUsage))
        .execute(pool)
        .await?;

    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_device_row_with_bad_status() {
        let now = Utc::now();
        let row = DeviceRow {
            id: 1,
            name: "x".to_string(),
            device_type: "sensor".to_string(),
            serial_number: "S".to_string(),
            description: None,
            status: "lost".to_string(),
            location: None,
            specifications: None,
            purchase_date: None,
            deploy_date: None,
            last_maintenance_date: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(Device::try_from(row), Err(Error::Decode(_))));
    }

    #[test]
    fn test_device_filter_sql() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM devices");
        let filter = DeviceFilter {
            status: Some(DeviceStatus::Deployed),
            device_type: None,
        };
        push_device_filter(&mut qb, &filter);
        assert_eq!(qb.sql(), "SELECT COUNT(*) FROM devices WHERE TRUE AND status = $1");
    }
}
