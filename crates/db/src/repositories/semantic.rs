use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::memory::{SemanticEntry, SemanticMatch, UserId};
use concierge_core::embedding::cosine_similarity;
use concierge_core::errors::ServiceError;
use concierge_core::ports::{Embedder, SemanticMemory};

use super::{format_timestamp, RepositoryError};
use crate::DbPool;

/// Embeddings stored as JSON arrays and ranked by cosine similarity in process.
pub struct SqlSemanticMemory {
    pool: DbPool,
    embedder: Arc<dyn Embedder>,
}

impl SqlSemanticMemory {
    pub fn new(pool: DbPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    async fn ranked(
        &self,
        user_id: &UserId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SemanticMatch>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT text, intent, embedding_json FROM semantic_entries WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let embedding_json: String = row.try_get("embedding_json")?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
                .map_err(|e| RepositoryError::Decode(format!("invalid embedding_json: {e}")))?;
            let intent: Option<String> = row.try_get("intent")?;
            matches.push(SemanticMatch {
                text: row.try_get("text")?,
                intent: intent.and_then(|value| value.parse::<IntentCategory>().ok()),
                score: cosine_similarity(query, &embedding),
            });
        }

        matches.sort_by(|left, right| right.score.total_cmp(&left.score));
        matches.truncate(k);
        Ok(matches)
    }

    async fn store(&self, user_id: &UserId, entry: SemanticEntry) -> Result<(), RepositoryError> {
        let embedding_json = serde_json::to_string(&entry.embedding)
            .map_err(|e| RepositoryError::Decode(format!("unencodable embedding: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO semantic_entries (user_id, text, intent, embedding_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, text) DO UPDATE SET
                intent = excluded.intent,
                embedding_json = excluded.embedding_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(&entry.text)
        .bind(entry.intent.map(IntentCategory::as_str))
        .bind(embedding_json)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM semantic_entries WHERE created_at < ?")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl SemanticMemory for SqlSemanticMemory {
    async fn query(
        &self,
        user_id: &UserId,
        text: &str,
        k: usize,
    ) -> Result<Vec<SemanticMatch>, ServiceError> {
        let query = self.embedder.embed(text).await?;
        Ok(self.ranked(user_id, &query, k).await?)
    }

    async fn upsert(&self, user_id: &UserId, entry: SemanticEntry) -> Result<(), ServiceError> {
        Ok(self.store(user_id, entry).await?)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        Ok(self.delete_before(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use concierge_core::domain::intent::IntentCategory;
    use concierge_core::domain::memory::{SemanticEntry, UserId};
    use concierge_core::embedding::HashingEmbedder;
    use concierge_core::ports::SemanticMemory;

    use super::SqlSemanticMemory;
    use crate::{connect_with_settings, migrations::run_pending};

    #[tokio::test]
    async fn query_ranks_by_similarity_and_upserts_by_text() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        let embedder = Arc::new(HashingEmbedder::default());
        let memory = SqlSemanticMemory::new(pool, embedder.clone());
        let user = UserId::new("whatsapp:+971500000005");

        for (text, intent) in [
            ("email John about the quarterly report", IntentCategory::Email),
            ("find sushi near Dubai Marina", IntentCategory::PlaceSearch),
            ("email John about the quarterly report", IntentCategory::Email),
        ] {
            memory
                .upsert(
                    &user,
                    SemanticEntry {
                        text: text.to_owned(),
                        intent: Some(intent),
                        embedding: embedder.vectorize(text),
                    },
                )
                .await
                .expect("upsert");
        }

        let matches =
            memory.query(&user, "send John the quarterly report", 5).await.expect("query");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].text, "email John about the quarterly report");
        assert_eq!(matches[0].intent, Some(IntentCategory::Email));
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn prune_removes_entries_older_than_the_cutoff() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        let embedder = HashingEmbedder::default();
        let memory = SqlSemanticMemory::new(pool, Arc::new(embedder));
        let user = UserId::new("whatsapp:+971500000009");

        memory
            .upsert(
                &user,
                SemanticEntry {
                    text: "call the dentist".to_owned(),
                    intent: None,
                    embedding: embedder.vectorize("call the dentist"),
                },
            )
            .await
            .expect("upsert");

        let now = Utc::now();
        assert_eq!(memory.prune_before(now - Duration::days(30)).await.expect("prune"), 0);
        assert_eq!(memory.prune_before(now + Duration::seconds(5)).await.expect("prune"), 1);
        assert!(memory.query(&user, "dentist", 5).await.expect("query").is_empty());
    }
}
