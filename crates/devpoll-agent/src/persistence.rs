//! `SQLite` persistence layer.

use devpoll_core::{
    ConfigurationStore, CovMode, DeviceSettings, NetworkIdentity, PointId, StoreError,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;

const STATUS_ENABLED: &str = "enabled";
const STATUS_DISABLED: &str = "disabled";

/// `SQLite`-backed configuration store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            -- One row per device node
            CREATE TABLE IF NOT EXISTS devices (
                name TEXT PRIMARY KEY,
                mac TEXT NOT NULL,
                instance_number INTEGER NOT NULL,
                poll_interval_ms INTEGER NOT NULL,
                cov_mode TEXT NOT NULL,
                cov_lease_minutes INTEGER NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Points under a device, with their disconnected marker
            CREATE TABLE IF NOT EXISTS points (
                device TEXT NOT NULL
                    REFERENCES devices(name) ON UPDATE CASCADE ON DELETE CASCADE,
                point TEXT NOT NULL,
                disconnected_ts TEXT,
                PRIMARY KEY (device, point)
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| StoreError::Backend(format!("value out of range: {e}")))
}

struct DeviceRow {
    name: String,
    mac: String,
    instance_number: i64,
    poll_interval_ms: i64,
    cov_mode: String,
    cov_lease_minutes: i64,
    status: String,
}

impl DeviceRow {
    const COLUMNS: &'static str =
        "name, mac, instance_number, poll_interval_ms, cov_mode, cov_lease_minutes, status";

    fn read(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            name: row.get(0)?,
            mac: row.get(1)?,
            instance_number: row.get(2)?,
            poll_interval_ms: row.get(3)?,
            cov_mode: row.get(4)?,
            cov_lease_minutes: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn into_settings(self) -> Result<DeviceSettings, StoreError> {
        let out_of_range =
            |field: &str| StoreError::Backend(format!("{field} out of range for {}", self.name));
        Ok(DeviceSettings {
            identity: NetworkIdentity::new(
                self.mac.clone(),
                u32::try_from(self.instance_number).map_err(|_| out_of_range("instance_number"))?,
            ),
            poll_interval_ms: u64::try_from(self.poll_interval_ms)
                .map_err(|_| out_of_range("poll_interval_ms"))?,
            cov_mode: CovMode::parse_lenient(&self.cov_mode),
            cov_lease_minutes: u32::try_from(self.cov_lease_minutes)
                .map_err(|_| out_of_range("cov_lease_minutes"))?,
            enabled: self.status == STATUS_ENABLED,
            name: self.name,
        })
    }
}

fn parse_point(device: &str, text: &str) -> Option<PointId> {
    match text.parse() {
        Ok(point) => Some(point),
        Err(err) => {
            tracing::warn!(device, point = text, error = %err, "Skipping unparseable stored point");
            None
        }
    }
}

impl ConfigurationStore for SqliteStore {
    fn list_devices(&self) -> Result<Vec<DeviceSettings>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM devices ORDER BY name",
                DeviceRow::COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], DeviceRow::read)
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;
        rows.into_iter().map(DeviceRow::into_settings).collect()
    }

    fn load_device(&self, name: &str) -> Result<Option<DeviceSettings>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE name = ?1", DeviceRow::COLUMNS),
                [name],
                DeviceRow::read,
            )
            .optional()
            .map_err(backend)?;
        row.map(DeviceRow::into_settings).transpose()
    }

    fn save_device(&self, settings: &DeviceSettings) -> Result<(), StoreError> {
        let status = if settings.enabled {
            STATUS_ENABLED
        } else {
            STATUS_DISABLED
        };
        self.conn
            .lock()
            .execute(
                r"
                INSERT INTO devices
                    (name, mac, instance_number, poll_interval_ms, cov_mode, cov_lease_minutes, status, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(name) DO UPDATE SET
                    mac = excluded.mac,
                    instance_number = excluded.instance_number,
                    poll_interval_ms = excluded.poll_interval_ms,
                    cov_mode = excluded.cov_mode,
                    cov_lease_minutes = excluded.cov_lease_minutes,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                ",
                (
                    &settings.name,
                    &settings.identity.mac,
                    i64::from(settings.identity.instance_number),
                    to_i64(settings.poll_interval_ms)?,
                    settings.cov_mode.as_str(),
                    i64::from(settings.cov_lease_minutes),
                    status,
                    now_secs(),
                ),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let status = if enabled {
            STATUS_ENABLED
        } else {
            STATUS_DISABLED
        };
        let updated = self
            .conn
            .lock()
            .execute(
                "UPDATE devices SET status = ?1, updated_at = ?2 WHERE name = ?3",
                (status, now_secs(), name),
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn rename_device(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let taken: Option<String> = conn
            .query_row("SELECT name FROM devices WHERE name = ?1", [new], |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)?;
        if taken.is_some() {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let updated = conn
            .execute(
                "UPDATE devices SET name = ?1, updated_at = ?2 WHERE name = ?3",
                (new, now_secs(), old),
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(old.to_string()));
        }
        Ok(())
    }

    fn remove_device(&self, name: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM devices WHERE name = ?1", [name])
            .map_err(backend)?;
        Ok(())
    }

    fn points(&self, device: &str) -> Result<Vec<PointId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT point FROM points WHERE device = ?1 ORDER BY point")
            .map_err(backend)?;
        let texts = stmt
            .query_map([device], |row| row.get::<_, String>(0))
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;
        Ok(texts
            .iter()
            .filter_map(|text| parse_point(device, text))
            .collect())
    }

    fn add_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        let result = self.conn.lock().execute(
            "INSERT OR IGNORE INTO points (device, point) VALUES (?1, ?2)",
            (device, point.to_string()),
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::NotFound(device.to_string()))
            }
            Err(err) => Err(backend(err)),
        }
    }

    fn remove_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM points WHERE device = ?1 AND point = ?2",
                (device, point.to_string()),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn set_disconnected(
        &self,
        device: &str,
        point: PointId,
        since: &str,
    ) -> Result<(), StoreError> {
        let updated = self
            .conn
            .lock()
            .execute(
                "UPDATE points SET disconnected_ts = ?1 WHERE device = ?2 AND point = ?3",
                (since, device, point.to_string()),
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{device}/{point}")));
        }
        Ok(())
    }

    fn clear_disconnected(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "UPDATE points SET disconnected_ts = NULL WHERE device = ?1 AND point = ?2",
                (device, point.to_string()),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn disconnected_since(
        &self,
        device: &str,
        point: PointId,
    ) -> Result<Option<String>, StoreError> {
        let marker: Option<Option<String>> = self
            .conn
            .lock()
            .query_row(
                "SELECT disconnected_ts FROM points WHERE device = ?1 AND point = ?2",
                (device, point.to_string()),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(marker.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpoll_core::ObjectType;

    fn settings(name: &str) -> DeviceSettings {
        DeviceSettings {
            name: name.to_string(),
            identity: NetworkIdentity::new("10.0.1.50:47808", 1001),
            poll_interval_ms: 5000,
            cov_mode: CovMode::Confirmed,
            cov_lease_minutes: 30,
            enabled: true,
        }
    }

    #[test]
    fn sqlite_store_device_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_device(&settings("ahu-1")).unwrap();

        assert_eq!(store.load_device("ahu-1").unwrap(), Some(settings("ahu-1")));

        store.set_enabled("ahu-1", false).unwrap();
        assert!(!store.load_device("ahu-1").unwrap().unwrap().enabled);
        assert!(matches!(
            store.set_enabled("missing", true),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn sqlite_store_rename_cascades_points() {
        let store = SqliteStore::in_memory().unwrap();
        let point = PointId::new(ObjectType::AnalogInput, 3);
        store.save_device(&settings("a")).unwrap();
        store.add_point("a", point).unwrap();
        store.set_disconnected("a", point, "20240101_000000").unwrap();

        store.rename_device("a", "b").unwrap();

        assert!(store.points("a").unwrap().is_empty());
        assert_eq!(store.points("b").unwrap(), vec![point]);
        assert_eq!(
            store.disconnected_since("b", point).unwrap().as_deref(),
            Some("20240101_000000")
        );
    }

    #[test]
    fn sqlite_store_remove_cascades_points() {
        let store = SqliteStore::in_memory().unwrap();
        let point = PointId::new(ObjectType::BinaryOutput, 1);
        store.save_device(&settings("a")).unwrap();
        store.add_point("a", point).unwrap();

        store.remove_device("a").unwrap();
        store.save_device(&settings("a")).unwrap();

        assert!(store.points("a").unwrap().is_empty());
    }

    #[test]
    fn sqlite_store_point_requires_device() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.add_point("ghost", PointId::new(ObjectType::AnalogValue, 1));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn sqlite_store_markers() {
        let store = SqliteStore::in_memory().unwrap();
        let point = PointId::new(ObjectType::AnalogValue, 9);
        store.save_device(&settings("a")).unwrap();
        store.add_point("a", point).unwrap();
        store.add_point("a", point).unwrap();

        assert!(store.disconnected_since("a", point).unwrap().is_none());
        store.set_disconnected("a", point, "20240505_101010").unwrap();
        assert!(store.disconnected_since("a", point).unwrap().is_some());
        store.clear_disconnected("a", point).unwrap();
        assert!(store.disconnected_since("a", point).unwrap().is_none());
    }

    #[test]
    fn sqlite_store_duplicate_uses_default_impl() {
        let store = SqliteStore::in_memory().unwrap();
        let point = PointId::new(ObjectType::MultiStateValue, 2);
        store.save_device(&settings("src")).unwrap();
        store.add_point("src", point).unwrap();

        let copy = store.duplicate_device("src", "dst").unwrap();

        assert_eq!(copy.name, "dst");
        assert_eq!(store.list_devices().unwrap().len(), 2);
        assert_eq!(store.points("dst").unwrap(), vec![point]);
    }

    #[test]
    fn sqlite_store_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devpoll.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_device(&settings("persisted")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.load_device("persisted").unwrap().unwrap().cov_mode,
            CovMode::Confirmed
        );
    }
}
