use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::memory::{
    ConversationTurn, NewTask, PreferenceUpdate, Preferences, PrunedRows, TaskStatus, UserId,
    UserTask,
};
use concierge_core::errors::ServiceError;
use concierge_core::ports::StructuredMemory;

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlStructuredMemory {
    pool: DbPool,
}

impl SqlStructuredMemory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_preferences(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Preferences>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT email_tone, email_signoff, work_hours, favorite_locations_json
            FROM user_preferences
            WHERE user_id = ?
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(preferences_from_row).transpose()
    }

    /// Read-modify-write inside one transaction; absent fields keep their value.
    async fn merge_preferences(
        &self,
        user_id: &UserId,
        update: &PreferenceUpdate,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            r#"
            SELECT email_tone, email_signoff, work_hours, favorite_locations_json
            FROM user_preferences
            WHERE user_id = ?
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let mut preferences = match existing {
            Some(row) => preferences_from_row(&row)?,
            None => Preferences::default(),
        };
        preferences.apply(update);
        let locations = serde_json::to_string(&preferences.favorite_locations)
            .map_err(|e| RepositoryError::Decode(format!("unencodable locations: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO user_preferences (
                user_id, email_tone, email_signoff, work_hours, favorite_locations_json, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                email_tone = excluded.email_tone,
                email_signoff = excluded.email_signoff,
                work_hours = excluded.work_hours,
                favorite_locations_json = excluded.favorite_locations_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(&preferences.email_tone)
        .bind(&preferences.email_signoff)
        .bind(&preferences.work_hours)
        .bind(locations)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_tasks(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<UserTask>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_type, description, status, created_at
            FROM user_tasks
            WHERE user_id = ? AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id
            LIMIT ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(status.map(TaskStatus::as_str))
        .bind(status.map(TaskStatus::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn insert_task(&self, user_id: &UserId, task: &NewTask) -> Result<(), RepositoryError> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO user_tasks (
                id, user_id, task_type, description, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(user_id.as_str())
        .bind(&task.task_type)
        .bind(&task.description)
        .bind(TaskStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!("task {} already exists", task.id)));
        }
        Ok(())
    }

    async fn set_task_status(
        &self,
        user_id: &UserId,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE user_tasks
            SET status = ?, updated_at = ?
            WHERE user_id = ? AND id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(user_id.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<PrunedRows, RepositoryError> {
        let cutoff = format_timestamp(cutoff);
        let mut tx = self.pool.begin().await?;
        let turns = sqlx::query("DELETE FROM conversation_turns WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        let tasks = sqlx::query("DELETE FROM user_tasks WHERE status <> ? AND updated_at < ?")
            .bind(TaskStatus::Pending.as_str())
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(PrunedRows {
            conversation_turns: turns.rows_affected(),
            tasks: tasks.rows_affected(),
            semantic_entries: 0,
        })
    }

    async fn load_turns(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT message, reply, intent, created_at
            FROM conversation_turns
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(turn_from_row).collect()
    }

    async fn insert_turn(
        &self,
        user_id: &UserId,
        turn: &ConversationTurn,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turns (user_id, message, reply, intent, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id.as_str())
        .bind(&turn.message)
        .bind(&turn.reply)
        .bind(turn.intent.map(IntentCategory::as_str))
        .bind(format_timestamp(turn.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StructuredMemory for SqlStructuredMemory {
    async fn get_preferences(&self, user_id: &UserId) -> Result<Option<Preferences>, ServiceError> {
        Ok(self.load_preferences(user_id).await?)
    }

    async fn update_preferences(
        &self,
        user_id: &UserId,
        update: &PreferenceUpdate,
    ) -> Result<(), ServiceError> {
        Ok(self.merge_preferences(user_id, update).await?)
    }

    async fn get_tasks(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<UserTask>, ServiceError> {
        Ok(self.load_tasks(user_id, status, limit).await?)
    }

    async fn create_task(&self, user_id: &UserId, task: &NewTask) -> Result<(), ServiceError> {
        Ok(self.insert_task(user_id, task).await?)
    }

    async fn update_task_status(
        &self,
        user_id: &UserId,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), ServiceError> {
        Ok(self.set_task_status(user_id, task_id, status).await?)
    }

    async fn recent_turns(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ServiceError> {
        Ok(self.load_turns(user_id, limit).await?)
    }

    async fn append_turn(
        &self,
        user_id: &UserId,
        turn: &ConversationTurn,
    ) -> Result<(), ServiceError> {
        Ok(self.insert_turn(user_id, turn).await?)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PrunedRows, ServiceError> {
        Ok(self.delete_before(cutoff).await?)
    }
}

fn preferences_from_row(row: &SqliteRow) -> Result<Preferences, RepositoryError> {
    let locations: String = row.try_get("favorite_locations_json")?;
    Ok(Preferences {
        email_tone: row.try_get("email_tone")?,
        email_signoff: row.try_get("email_signoff")?,
        work_hours: row.try_get("work_hours")?,
        favorite_locations: serde_json::from_str(&locations).map_err(|e| {
            RepositoryError::Decode(format!("invalid favorite_locations_json: {e}"))
        })?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<UserTask, RepositoryError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(UserTask {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        description: row.try_get("description")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("invalid task status: {status}")))?,
        created_at: parse_timestamp("created_at", created_at)?,
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<ConversationTurn, RepositoryError> {
    let intent: Option<String> = row.try_get("intent")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ConversationTurn {
        message: row.try_get("message")?,
        reply: row.try_get("reply")?,
        intent: intent
            .map(|value| value.parse::<IntentCategory>().map_err(RepositoryError::Decode))
            .transpose()?,
        created_at: parse_timestamp("created_at", created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use concierge_core::domain::intent::IntentCategory;
    use concierge_core::domain::memory::{
        ConversationTurn, NewTask, PreferenceUpdate, TaskStatus, UserId,
    };
    use concierge_core::errors::ServiceError;
    use concierge_core::ports::StructuredMemory;

    use super::SqlStructuredMemory;
    use crate::{connect_with_settings, migrations::run_pending};

    async fn memory() -> SqlStructuredMemory {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        SqlStructuredMemory::new(pool)
    }

    #[tokio::test]
    async fn preferences_merge_field_by_field() {
        let memory = memory().await;
        let user = UserId::new("whatsapp:+971500000001");

        assert!(memory.get_preferences(&user).await.expect("load").is_none());

        memory
            .update_preferences(
                &user,
                &PreferenceUpdate { email_tone: Some("polite".into()), ..Default::default() },
            )
            .await
            .expect("first update");
        memory
            .update_preferences(
                &user,
                &PreferenceUpdate {
                    add_favorite_location: Some("Dubai Marina".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("second update");

        let preferences = memory.get_preferences(&user).await.expect("load").expect("present");
        assert_eq!(preferences.email_tone, "polite");
        assert_eq!(preferences.email_signoff, "Best regards");
        assert_eq!(preferences.favorite_locations, vec!["Dubai Marina".to_owned()]);
    }

    #[tokio::test]
    async fn recent_turns_are_newest_first_and_bounded() {
        let memory = memory().await;
        let user = UserId::new("whatsapp:+971500000002");
        let start = Utc::now();

        for index in 0..4 {
            memory
                .append_turn(
                    &user,
                    &ConversationTurn {
                        message: format!("message {index}"),
                        reply: format!("reply {index}"),
                        intent: Some(IntentCategory::General),
                        created_at: start + Duration::seconds(index),
                    },
                )
                .await
                .expect("append");
        }

        let turns = memory.recent_turns(&user, 2).await.expect("recent");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].message, "message 3");
        assert_eq!(turns[1].message, "message 2");
        assert_eq!(turns[0].intent, Some(IntentCategory::General));
    }

    #[tokio::test]
    async fn pending_tasks_are_scoped_to_user() {
        let memory = memory().await;
        let user = UserId::new("whatsapp:+971500000003");
        let other = UserId::new("whatsapp:+971500000004");

        memory
            .create_task(&user, &NewTask::new("email_task", "email John"))
            .await
            .expect("create");

        let tasks = memory.get_tasks(&user, Some(TaskStatus::Pending), 3).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, "email_task");
        assert!(memory
            .get_tasks(&other, Some(TaskStatus::Pending), 3)
            .await
            .expect("tasks")
            .is_empty());
    }

    #[tokio::test]
    async fn resolving_a_task_moves_it_out_of_pending() {
        let memory = memory().await;
        let user = UserId::new("whatsapp:+971500000005");
        let sent = NewTask::new("email_task", "Email John: Friday lunch");
        let dropped = NewTask::new("email_task", "Email Sara: budget");
        memory.create_task(&user, &sent).await.expect("create sent");
        memory.create_task(&user, &dropped).await.expect("create dropped");

        memory.update_task_status(&user, &sent.id, TaskStatus::Done).await.expect("done");
        memory
            .update_task_status(&user, &dropped.id, TaskStatus::Cancelled)
            .await
            .expect("cancelled");

        assert!(memory
            .get_tasks(&user, Some(TaskStatus::Pending), 5)
            .await
            .expect("pending")
            .is_empty());
        let done = memory.get_tasks(&user, Some(TaskStatus::Done), 5).await.expect("done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, sent.id);
        assert_eq!(memory.get_tasks(&user, None, 5).await.expect("all").len(), 2);
    }

    #[tokio::test]
    async fn resolving_another_users_task_is_not_found() {
        let memory = memory().await;
        let owner = UserId::new("whatsapp:+971500000006");
        let stranger = UserId::new("whatsapp:+971500000007");
        let task = NewTask::new("email_task", "Email John");
        memory.create_task(&owner, &task).await.expect("create");

        let result = memory.update_task_status(&stranger, &task.id, TaskStatus::Done).await;

        assert!(matches!(result, Err(ServiceError::NotFound(_))));
        assert_eq!(
            memory.get_tasks(&owner, Some(TaskStatus::Pending), 5).await.expect("pending").len(),
            1
        );
    }

    #[tokio::test]
    async fn prune_keeps_pending_tasks_and_recent_turns() {
        let memory = memory().await;
        let user = UserId::new("whatsapp:+971500000008");
        let now = Utc::now();

        for (message, age_days) in [("old", 40), ("recent", 1)] {
            memory
                .append_turn(
                    &user,
                    &ConversationTurn {
                        message: message.to_owned(),
                        reply: "ok".to_owned(),
                        intent: None,
                        created_at: now - Duration::days(age_days),
                    },
                )
                .await
                .expect("append");
        }
        let pending = NewTask::new("calendar_task", "Dentist on Friday");
        let resolved = NewTask::new("email_task", "Email John");
        memory.create_task(&user, &pending).await.expect("create pending");
        memory.create_task(&user, &resolved).await.expect("create resolved");
        memory.update_task_status(&user, &resolved.id, TaskStatus::Done).await.expect("done");

        let pruned = memory.prune_before(now + Duration::seconds(5)).await.expect("prune");

        assert_eq!(pruned.conversation_turns, 2);
        assert_eq!(pruned.tasks, 1);
        let remaining = memory.get_tasks(&user, None, 5).await.expect("tasks");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, pending.id);

        memory
            .append_turn(
                &user,
                &ConversationTurn {
                    message: "fresh".to_owned(),
                    reply: "ok".to_owned(),
                    intent: None,
                    created_at: now,
                },
            )
            .await
            .expect("append fresh");
        let pruned = memory.prune_before(now - Duration::days(30)).await.expect("prune");
        assert_eq!(pruned.total(), 0);
        assert_eq!(memory.recent_turns(&user, 5).await.expect("turns").len(), 1);
    }
}
