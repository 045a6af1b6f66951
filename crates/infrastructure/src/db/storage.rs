//! Postgres 持久化实现
//!
//! 只实现核心调用的几个窄接口，表结构由外部迁移工具维护。

use async_trait::async_trait;
use domain::{
    ArchiveBatch, BanRepository, ChatMessage, MessageArchive, PrivateChatMessage,
    RateLimitConfig, RateLimitRepository, RepositoryError, RepositoryResult, SessionRecord,
    SessionRecordRepository, UserId,
};
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::DbPool;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::not_found("row"),
        other => RepositoryError::storage(other.to_string()),
    }
}

fn sequence_value(sequence_id: Option<domain::SequenceId>) -> RepositoryResult<i64> {
    let sequence_id = sequence_id
        .ok_or_else(|| RepositoryError::storage("cached message without sequence id"))?;
    i64::try_from(sequence_id.value())
        .map_err(|_| RepositoryError::storage(format!("sequence id {sequence_id} out of range")))
}

#[derive(Clone)]
pub struct PgStorage {
    pool: DbPool,
}

impl PgStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_public(
        tx: &mut Transaction<'_, Postgres>,
        messages: &[ChatMessage],
    ) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for message in messages {
            let result = sqlx::query(
                r#"INSERT INTO chatserver.chat_messages (cache_id, owner_id, channel, message, authored_at)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(sequence_value(message.sequence_id)?)
            .bind(Uuid::from(message.owner_id))
            .bind(&message.channel)
            .bind(&message.text)
            .bind(message.sent_at)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_private(
        tx: &mut Transaction<'_, Postgres>,
        messages: &[PrivateChatMessage],
    ) -> RepositoryResult<u64> {
        let mut inserted = 0;
        for message in messages {
            let result = sqlx::query(
                r#"INSERT INTO chatserver.private_messages (cache_id, owner_id, recipient_id, message, authored_at)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(sequence_value(message.sequence_id)?)
            .bind(Uuid::from(message.owner_id))
            .bind(Uuid::from(message.recipient_id))
            .bind(&message.text)
            .bind(message.sent_at)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl MessageArchive for PgStorage {
    async fn insert_batch(&self, batch: ArchiveBatch) -> RepositoryResult<u64> {
        let class = batch.class();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 任一插入失败时 tx 被丢弃，整批回滚
        let inserted = match &batch {
            ArchiveBatch::Public(messages) => Self::insert_public(&mut tx, messages).await?,
            ArchiveBatch::Private(messages) => Self::insert_private(&mut tx, messages).await?,
        };

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!(%class, inserted, "message batch committed");
        Ok(inserted)
    }
}

#[async_trait]
impl SessionRecordRepository for PgStorage {
    async fn insert_session_record(&self, record: SessionRecord) -> RepositoryResult<()> {
        sqlx::query(
            r#"INSERT INTO chatserver.chat_sessions (owner_id, start_time, end_time)
               VALUES ($1, $2, $3)"#,
        )
        .bind(Uuid::from(record.user_id))
        .bind(record.started_at)
        .bind(record.ended_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl BanRepository for PgStorage {
    async fn is_banned(&self, user_id: UserId) -> RepositoryResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)
               FROM chatserver.bans
               WHERE banished_id = $1
                 AND (end_time IS NULL OR end_time > NOW())
                 AND (pardoned IS NULL OR pardoned = FALSE)"#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(count > 0)
    }
}

#[async_trait]
impl RateLimitRepository for PgStorage {
    async fn load(&self, settings_id: i32) -> RepositoryResult<RateLimitConfig> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            r#"SELECT message_limit, window_seconds
               FROM chatserver.rate_limiter
               WHERE id = $1"#,
        )
        .bind(settings_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let (limit, window_seconds) = row.ok_or_else(|| {
            RepositoryError::not_found(format!("rate_limiter {settings_id}"))
        })?;
        match (u32::try_from(limit), u64::try_from(window_seconds)) {
            (Ok(limit), Ok(window_seconds)) if limit > 0 && window_seconds > 0 => {
                Ok(RateLimitConfig {
                    limit,
                    window_seconds,
                })
            }
            _ => Err(RepositoryError::storage(format!(
                "invalid rate limiter row {settings_id}: {limit}/{window_seconds}s"
            ))),
        }
    }

    async fn update(&self, settings_id: i32, config: RateLimitConfig) -> RepositoryResult<()> {
        let limit = i32::try_from(config.limit)
            .map_err(|_| RepositoryError::storage("message limit out of range"))?;
        let window_seconds = i32::try_from(config.window_seconds)
            .map_err(|_| RepositoryError::storage("window out of range"))?;

        let result = sqlx::query(
            r#"UPDATE chatserver.rate_limiter
               SET message_limit = $1, window_seconds = $2
               WHERE id = $3"#,
        )
        .bind(limit)
        .bind(window_seconds)
        .bind(settings_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(format!(
                "rate_limiter {settings_id}"
            )));
        }
        Ok(())
    }
}
