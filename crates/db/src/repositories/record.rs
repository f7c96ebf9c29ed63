use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use concierge_core::domain::record::{Record, TableName};
use concierge_core::errors::ServiceError;
use concierge_core::ports::RecordStore;

use super::{format_timestamp, RepositoryError};
use crate::DbPool;

/// Record tables persisted as one JSON object of fields per key.
pub struct SqlRecordStore {
    pool: DbPool,
}

impl SqlRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn list(&self, table: &TableName) -> Result<Vec<Record>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record_key, fields_json FROM records WHERE table_name = ? ORDER BY record_key",
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn insert(&self, table: &TableName, record: &Record) -> Result<(), RepositoryError> {
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|e| RepositoryError::Decode(format!("unencodable fields: {e}")))?;
        let result = sqlx::query(
            r#"
            INSERT INTO records (table_name, record_key, fields_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (table_name, record_key) DO NOTHING
            "#,
        )
        .bind(table.as_str())
        .bind(&record.key)
        .bind(fields_json)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "`{}` already exists in `{table}`",
                record.key
            )));
        }
        Ok(())
    }

    async fn set_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT record_key, fields_json FROM records WHERE table_name = ? AND record_key = ?",
        )
        .bind(table.as_str())
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("`{key}` in `{table}`")))?;

        let mut record = record_from_row(&row)?;
        record.fields.insert(field.to_owned(), value.to_owned());
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|e| RepositoryError::Decode(format!("unencodable fields: {e}")))?;

        sqlx::query(
            "UPDATE records SET fields_json = ?, updated_at = ? WHERE table_name = ? AND record_key = ?",
        )
        .bind(fields_json)
        .bind(format_timestamp(Utc::now()))
        .bind(table.as_str())
        .bind(key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, table: &TableName, key: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM records WHERE table_name = ? AND record_key = ?")
            .bind(table.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("`{key}` in `{table}`")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordStore for SqlRecordStore {
    async fn list_all(&self, table: &TableName) -> Result<Vec<Record>, ServiceError> {
        Ok(self.list(table).await?)
    }

    async fn create(&self, table: &TableName, record: Record) -> Result<(), ServiceError> {
        Ok(self.insert(table, &record).await?)
    }

    async fn update_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), ServiceError> {
        Ok(self.set_field(table, key, field, value).await?)
    }

    async fn delete(&self, table: &TableName, key: &str) -> Result<(), ServiceError> {
        Ok(self.remove(table, key).await?)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, RepositoryError> {
    let key: String = row.try_get("record_key")?;
    let fields_json: String = row.try_get("fields_json")?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
        .map_err(|e| RepositoryError::Decode(format!("invalid fields_json for `{key}`: {e}")))?;
    Ok(Record { key, fields })
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::record::{Record, TableName};
    use concierge_core::errors::ServiceError;
    use concierge_core::ports::RecordStore;

    use super::SqlRecordStore;
    use crate::{connect_with_settings, migrations::run_pending};

    async fn store() -> SqlRecordStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        SqlRecordStore::new(pool)
    }

    #[tokio::test]
    async fn create_update_delete_round_trip() {
        let store = store().await;
        let contacts = TableName::contacts();

        store
            .create(&contacts, Record::new("John").with_field("email", "john@x.com"))
            .await
            .expect("create");
        store.update_field(&contacts, "John", "email", "j2@x.com").await.expect("update");

        let records = store.list_all(&contacts).await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("email"), Some("j2@x.com"));

        store.delete(&contacts, "John").await.expect("delete");
        assert!(store.list_all(&contacts).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_and_missing_update_is_not_found() {
        let store = store().await;
        let contacts = TableName::contacts();

        store.create(&contacts, Record::new("John")).await.expect("create");
        let duplicate = store.create(&contacts, Record::new("John")).await;
        assert!(matches!(duplicate, Err(ServiceError::Rejected(_))));

        let missing = store.update_field(&contacts, "Nobody", "email", "x@y.z").await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn tables_are_isolated() {
        let store = store().await;
        store.create(&TableName::new("vendors"), Record::new("Acme")).await.expect("create");

        assert!(store.list_all(&TableName::contacts()).await.expect("list").is_empty());
    }
}
