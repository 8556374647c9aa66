//! SQLite-backed data-product registry.
//!
//! Implements the ready/published contract: mosaics are registered with
//! their metadata, then finalized with a QA verdict; auto-publish flips the
//! published flag only on a passing QA status.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::errors::{ErrorKind, StageError, StageResult};
use crate::store::now_ts;

use super::DataRegistry;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS data_products (
    data_id TEXT PRIMARY KEY,
    data_type TEXT NOT NULL,
    file_path TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    auto_publish INTEGER NOT NULL DEFAULT 0,
    qa_status TEXT,
    validation_status TEXT,
    published INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_data_products_type
    ON data_products(data_type, created_at DESC);
"#;

#[derive(Clone)]
pub struct SqliteDataRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataRegistry {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn get_status(&self, data_id: &str) -> StageResult<Option<(String, bool)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(qa_status, ''), published FROM data_products WHERE data_id = ?1",
            params![data_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .optional()
        .map_err(|e| StageError::transient(format!("registry status {data_id}: {e}")))
    }
}

#[async_trait]
impl DataRegistry for SqliteDataRegistry {
    async fn register(
        &self,
        data_type: &str,
        data_id: &str,
        path: &Path,
        metadata: serde_json::Value,
        auto_publish: bool,
    ) -> StageResult<()> {
        let metadata_json = metadata.to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO data_products
                 (data_id, data_type, file_path, metadata_json, auto_publish,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(data_id) DO UPDATE SET
                 file_path = excluded.file_path,
                 metadata_json = excluded.metadata_json,
                 auto_publish = excluded.auto_publish,
                 updated_at = excluded.updated_at",
            params![
                data_id,
                data_type,
                path.to_string_lossy().into_owned(),
                metadata_json,
                auto_publish as i64,
                now_ts(),
            ],
        )
        .map_err(|e| StageError::transient(format!("register {data_id}: {e}")))?;
        info!(data_id, data_type, "registered data product");
        Ok(())
    }

    async fn finalize(
        &self,
        data_id: &str,
        qa_status: &str,
        validation_status: &str,
    ) -> StageResult<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE data_products SET
                     qa_status = ?2,
                     validation_status = ?3,
                     published = CASE WHEN auto_publish = 1 AND ?2 = 'passed'
                                      THEN 1 ELSE published END,
                     updated_at = ?4
                 WHERE data_id = ?1",
                params![data_id, qa_status, validation_status, now_ts()],
            )
            .map_err(|e| StageError::transient(format!("finalize {data_id}: {e}")))?;
        if changed == 0 {
            return Err(StageError::new(
                ErrorKind::NotFound,
                format!("cannot finalize unregistered data product {data_id}"),
            ));
        }
        info!(data_id, qa_status, validation_status, "finalized data product");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (SqliteDataRegistry, TempDir) {
        let tmp = TempDir::new().unwrap();
        let registry = SqliteDataRegistry::open(&tmp.path().join("data_registry.sqlite3")).unwrap();
        (registry, tmp)
    }

    #[tokio::test]
    async fn register_and_finalize_publishes_on_pass() {
        let (registry, _tmp) = registry();
        registry
            .register(
                "mosaic",
                "mosaic_abc",
                Path::new("/out/mosaic_abc.fits"),
                serde_json::json!({"group_id": "group_abc", "n_images": 10}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("mosaic_abc").unwrap(),
            Some(("".into(), false))
        );

        registry
            .finalize("mosaic_abc", "passed", "validated")
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("mosaic_abc").unwrap(),
            Some(("passed".into(), true))
        );
    }

    #[tokio::test]
    async fn warning_qa_does_not_auto_publish() {
        let (registry, _tmp) = registry();
        registry
            .register(
                "mosaic",
                "mosaic_warn",
                Path::new("/out/mosaic_warn.fits"),
                serde_json::json!({}),
                true,
            )
            .await
            .unwrap();
        registry
            .finalize("mosaic_warn", "warning", "validated")
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("mosaic_warn").unwrap(),
            Some(("warning".into(), false))
        );
    }

    #[tokio::test]
    async fn finalize_unknown_id_is_not_found() {
        let (registry, _tmp) = registry();
        let err = registry
            .finalize("missing", "passed", "validated")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reregistration_is_idempotent() {
        let (registry, _tmp) = registry();
        for _ in 0..2 {
            registry
                .register(
                    "mosaic",
                    "mosaic_dup",
                    Path::new("/out/mosaic_dup.fits"),
                    serde_json::json!({}),
                    true,
                )
                .await
                .unwrap();
        }
        assert!(registry.get_status("mosaic_dup").unwrap().is_some());
    }
}
