//! 启动时的增量建表 / 补列 / 补索引
//!
//! 只做加法并且可重复执行：缺表建表、缺列 ALTER TABLE ADD COLUMN、缺索引建索引。
//! 管理端进程与机器人进程可能运行不同版本，旧库会被补齐到当前结构。

use rusqlite::Connection;

use crate::core::StoreError;

/// 表定义：建表语句 + 期望的列（列名, 列定义）
struct TableSpec {
    name: &'static str,
    create: &'static str,
    columns: &'static [(&'static str, &'static str)],
}

const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "channel_configs",
        create: "CREATE TABLE IF NOT EXISTS channel_configs (
            channel_name TEXT PRIMARY KEY
        )",
        columns: &[
            ("join_channel", "INTEGER NOT NULL DEFAULT 1"),
            ("tts_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("voice_enabled", "INTEGER NOT NULL DEFAULT 0"),
            ("voice_preset", "TEXT"),
            ("synthesis_model", "TEXT"),
            ("lines_between_messages", "INTEGER NOT NULL DEFAULT 100"),
            ("time_between_messages", "INTEGER NOT NULL DEFAULT 0"),
            ("use_general_model", "INTEGER NOT NULL DEFAULT 1"),
            ("ignored_users", "TEXT NOT NULL DEFAULT '[]'"),
            ("currently_connected", "INTEGER NOT NULL DEFAULT 0"),
            ("response_threshold", "INTEGER NOT NULL DEFAULT 0"),
            ("created_at", "TEXT"),
            ("updated_at", "TEXT"),
        ],
    },
    TableSpec {
        name: "trusted_users",
        create: "CREATE TABLE IF NOT EXISTS trusted_users (
            channel_name TEXT NOT NULL,
            username TEXT NOT NULL,
            PRIMARY KEY (channel_name, username)
        )",
        columns: &[("added_at", "TEXT")],
    },
    TableSpec {
        name: "messages",
        create: "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            author TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )",
        columns: &[
            ("is_bot_response", "INTEGER NOT NULL DEFAULT 0"),
            ("message_id", "TEXT"),
            ("author_color", "TEXT"),
        ],
    },
    TableSpec {
        name: "tts_logs",
        create: "CREATE TABLE IF NOT EXISTS tts_logs (
            message_id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            file_path TEXT NOT NULL
        )",
        columns: &[("voice_preset", "TEXT"), ("message", "TEXT")],
    },
    TableSpec {
        name: "bot_status",
        create: "CREATE TABLE IF NOT EXISTS bot_status (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        columns: &[("updated_at", "TEXT")],
    },
    TableSpec {
        name: "cache_build_times",
        create: "CREATE TABLE IF NOT EXISTS cache_build_times (
            model_key TEXT PRIMARY KEY,
            built_at TEXT NOT NULL
        )",
        columns: &[("line_count", "INTEGER NOT NULL DEFAULT 0")],
    },
    TableSpec {
        name: "command_queue",
        create: "CREATE TABLE IF NOT EXISTS command_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        columns: &[
            ("request_id", "TEXT"),
            ("executed", "INTEGER NOT NULL DEFAULT 0"),
            ("executed_at", "TEXT"),
            ("error", "TEXT"),
        ],
    },
];

const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel, id)",
    "CREATE INDEX IF NOT EXISTS idx_tts_logs_channel ON tts_logs(channel, timestamp)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_command_queue_request ON command_queue(request_id)",
    "CREATE INDEX IF NOT EXISTS idx_command_queue_pending ON command_queue(executed, id)",
];

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// 执行增量迁移，返回本次新增的列数
pub fn migrate(conn: &mut Connection) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut added = 0;

    for table in TABLES {
        tx.execute_batch(table.create)?;
        let present = existing_columns(&tx, table.name)?;
        for (column, definition) in table.columns {
            if present.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                continue;
            }
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table.name, column, definition
            ))?;
            tracing::info!(table = table.name, column = *column, "Added missing column");
            added += 1;
        }
    }

    for index in INDEXES {
        tx.execute_batch(index)?;
    }

    tx.commit()?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let first = migrate(&mut conn).unwrap();
        assert!(first > 0);
        assert_eq!(migrate(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_migrate_adds_missing_columns_to_old_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                author TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            INSERT INTO messages (channel, author, content, timestamp)
                VALUES ('foo', 'alice', 'hi', '2024-01-01T00:00:00Z');",
        )
        .unwrap();

        migrate(&mut conn).unwrap();

        let columns = existing_columns(&conn, "messages").unwrap();
        assert!(columns.contains(&"message_id".to_string()));
        assert!(columns.contains(&"is_bot_response".to_string()));

        let is_bot: i64 = conn
            .query_row("SELECT is_bot_response FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(is_bot, 0);
    }
}
