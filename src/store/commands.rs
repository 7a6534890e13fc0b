//! command_queue：持久命令队列（至少一次投递，执行后标记，不再重复处理）

use chrono::Utc;
use rusqlite::params;

use super::models::CommandQueueEntry;
use super::Store;
use crate::core::StoreError;

impl Store {
    /// 入队；同一 request_id 只入一次，返回行 ID（重复时为 None）
    pub async fn enqueue_command(&self, request_id: &str, command_json: &str) -> Result<Option<i64>, StoreError> {
        let request_id = request_id.to_string();
        let command_json = command_json.to_string();
        self.pool
            .with_conn(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO command_queue (request_id, command, created_at, executed)
                     VALUES (?1, ?2, ?3, 0)",
                    params![request_id, command_json, Utc::now()],
                )?;
                Ok((n > 0).then(|| conn.last_insert_rowid()))
            })
            .await
    }

    /// 未执行的命令，按入队顺序
    pub async fn pending_commands(&self, limit: usize) -> Result<Vec<CommandQueueEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, request_id, command, created_at, executed, executed_at, error
                     FROM command_queue WHERE executed = 0 ORDER BY id ASC LIMIT ?1",
                )?;
                let entries = stmt
                    .query_map([limit], |row| {
                        Ok(CommandQueueEntry {
                            id: row.get(0)?,
                            request_id: row.get(1)?,
                            command: row.get(2)?,
                            created_at: row.get(3)?,
                            executed: row.get(4)?,
                            executed_at: row.get(5)?,
                            error: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await
    }

    /// 标记已执行（成功或失败都标记，error 记录失败原因）
    pub async fn mark_command_executed(&self, id: i64, error: Option<&str>) -> Result<(), StoreError> {
        let error = error.map(str::to_string);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE command_queue SET executed = 1, executed_at = ?2, error = ?3 WHERE id = ?1",
                    params![id, Utc::now(), error],
                )?;
                Ok(())
            })
            .await
    }

    /// 经邮箱文件已执行的请求，在队列中按 request_id 标记，避免重复执行
    pub async fn mark_request_executed(&self, request_id: &str, error: Option<&str>) -> Result<bool, StoreError> {
        let request_id = request_id.to_string();
        let error = error.map(str::to_string);
        self.pool
            .with_conn(move |conn| {
                let n = conn.execute(
                    "UPDATE command_queue SET executed = 1, executed_at = ?2, error = ?3
                     WHERE request_id = ?1 AND executed = 0",
                    params![request_id, Utc::now(), error],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn test_queue_entries_are_executed_once() {
        let (_dir, store) = temp_store().await;
        let id = store.enqueue_command("r-1", r#"{"action":"join","channel":"foo"}"#).await.unwrap();
        assert!(id.is_some());
        assert!(store.enqueue_command("r-1", "{}").await.unwrap().is_none());

        let pending = store.pending_commands(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id.as_deref(), Some("r-1"));

        store.mark_command_executed(pending[0].id, None).await.unwrap();
        assert!(store.pending_commands(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_by_request_id() {
        let (_dir, store) = temp_store().await;
        store.enqueue_command("r-2", "{}").await.unwrap();
        assert!(store.mark_request_executed("r-2", Some("join failed")).await.unwrap());
        assert!(!store.mark_request_executed("r-2", None).await.unwrap());
        assert!(store.pending_commands(10).await.unwrap().is_empty());
    }
}
