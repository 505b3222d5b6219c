use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SessionExistsSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu,
    StorageError, StorageResult,
};
use super::ids::{MessageId, SessionName};
use super::types::{MessageRecord, MessageRole, NewMessage, unix_timestamp_nanos};
use super::{BoxFuture, SessionGateway};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_name: String,
    role: String,
    content: String,
    created_at: i64,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One connection serializes writers, which keeps per-session seq allocation race free.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite session store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_session_row(&self, name: &SessionName) -> StorageResult<()> {
        let now = u64_to_i64(unix_timestamp_nanos(), "session-create-timestamp")?;
        let result = sqlx::query(
            "INSERT INTO sessions (name, created_at) VALUES (?, ?) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-create-insert",
        })?;

        if result.rows_affected() == 0 {
            return SessionExistsSnafu {
                stage: "session-create-conflict",
                name: name.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn delete_session_row(&self, name: &SessionName) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-delete-apply",
            })?;

        if result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "session-delete-missing",
                entity: "session",
                id: name.to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn load_messages(&self, name: &SessionName) -> StorageResult<Vec<MessageRecord>> {
        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "message-list-acquire",
        })?;
        ensure_session_exists(&mut *connection, name, "message-list-missing-session").await?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, session_name, role, content, created_at FROM messages WHERE session_name = ? ORDER BY seq ASC",
        )
        .bind(name.as_str())
        .fetch_all(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn insert_message(
        &self,
        name: &SessionName,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-append-begin",
        })?;
        ensure_session_exists(&mut *tx, name, "message-append-missing-session").await?;

        let (next_seq, last_created_at) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(MAX(seq), 0) + 1, COALESCE(MAX(created_at), 0) FROM messages WHERE session_name = ?",
        )
        .bind(name.as_str())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-next-seq",
        })?;

        // Wall clocks can step backwards; clamp so per-session order stays monotonic.
        let now = u64_to_i64(unix_timestamp_nanos(), "message-append-timestamp")?;
        let created_at = now.max(last_created_at);
        let message_id = MessageId::new_v7();

        sqlx::query(
            "INSERT INTO messages (id, session_name, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(name.as_str())
        .bind(next_seq)
        .bind(input.role.as_str())
        .bind(input.content.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-append-commit",
        })?;

        Ok(MessageRecord {
            id: message_id,
            session: name.clone(),
            role: input.role,
            content: input.content,
            timestamp_unix_nanos: i64_to_u64(created_at, "message-append-created-at")?,
        })
    }
}

impl SessionGateway for SqliteStore {
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionName>>> {
        Box::pin(async move {
            let names = sqlx::query_scalar::<_, String>(
                "SELECT name FROM sessions ORDER BY created_at DESC, rowid DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            names.into_iter().map(SessionName::parse).collect()
        })
    }

    fn create_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.create_session_row(name))
    }

    fn delete_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.delete_session_row(name))
    }

    fn list_messages<'a>(
        &'a self,
        name: &'a SessionName,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.load_messages(name))
    }

    fn append_message<'a>(
        &'a self,
        name: &'a SessionName,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(self.insert_message(name, input))
    }

    fn clear_expired_messages(&self, max_age: Duration) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let max_age_nanos = u64::try_from(max_age.as_nanos()).unwrap_or(u64::MAX);
            let cutoff = unix_timestamp_nanos().saturating_sub(max_age_nanos);
            let result = sqlx::query("DELETE FROM messages WHERE created_at < ?")
                .bind(u64_to_i64(cutoff, "message-expire-cutoff")?)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-expire-delete",
                })?;

            Ok(result.rows_affected())
        })
    }
}

async fn ensure_session_exists(
    connection: &mut SqliteConnection,
    name: &SessionName,
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE name = ?")
        .bind(name.as_str())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-exists-query",
        })?
        .context(NotFoundSnafu {
            stage,
            entity: "session",
            id: name.to_string(),
        })?;

    Ok(())
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session: SessionName::parse(row.session_name)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        timestamp_unix_nanos: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: &str) -> SessionName {
        SessionName::parse(raw).expect("valid session name")
    }

    async fn open_temp_store() -> (tempfile::TempDir, SqliteStore) {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("nested").join("sessions.db");
        let store = SqliteStore::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open store");
        (directory, store)
    }

    #[test]
    fn database_url_normalization() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("/tmp/parley.db"),
            "sqlite:///tmp/parley.db"
        );
    }

    #[tokio::test]
    async fn create_list_and_reject_duplicates() {
        let (_directory, store) = open_temp_store().await;
        store.create_session(&name("alpha")).await.expect("create");
        store.create_session(&name("beta")).await.expect("create");

        let error = store
            .create_session(&name("alpha"))
            .await
            .expect_err("duplicate");
        assert!(matches!(
            error,
            StorageError::SessionExists {
                stage: "session-create-conflict",
                ..
            }
        ));

        let listed = store.list_sessions().await.expect("list");
        assert_eq!(listed, vec![name("beta"), name("alpha")]);
    }

    #[tokio::test]
    async fn messages_round_trip_in_append_order() {
        let (_directory, store) = open_temp_store().await;
        let session = name("chat");
        store.create_session(&session).await.expect("create");

        let user = store
            .append_message(&session, NewMessage::user("hi"))
            .await
            .expect("append user");
        let assistant = store
            .append_message(&session, NewMessage::assistant(""))
            .await
            .expect("append assistant");

        let messages = store.list_messages(&session).await.expect("list");
        assert_eq!(messages, vec![user, assistant]);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "");
        assert!(messages[0].timestamp_unix_nanos <= messages[1].timestamp_unix_nanos);
    }

    #[tokio::test]
    async fn delete_cascades_and_unknown_session_is_not_found() {
        let (_directory, store) = open_temp_store().await;
        let session = name("short-lived");
        store.create_session(&session).await.expect("create");
        store
            .append_message(&session, NewMessage::user("bye"))
            .await
            .expect("append");

        store.delete_session(&session).await.expect("delete");

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(remaining, 0);

        assert!(
            store
                .list_messages(&session)
                .await
                .expect_err("gone")
                .is_not_found()
        );
        assert!(
            store
                .delete_session(&session)
                .await
                .expect_err("gone")
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn clear_expired_removes_old_rows_only() {
        let (_directory, store) = open_temp_store().await;
        let session = name("retention");
        store.create_session(&session).await.expect("create");
        store
            .append_message(&session, NewMessage::user("old"))
            .await
            .expect("append");
        sqlx::query("UPDATE messages SET created_at = 1")
            .execute(store.pool())
            .await
            .expect("backdate");
        store
            .append_message(&session, NewMessage::user("new"))
            .await
            .expect("append");

        let removed = store
            .clear_expired_messages(Duration::from_secs(60))
            .await
            .expect("clear");
        assert_eq!(removed, 1);

        let messages = store.list_messages(&session).await.expect("list");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "new");
    }
}
