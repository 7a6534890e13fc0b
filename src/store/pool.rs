//! SQLite 连接池
//!
//! - 启动时预热全部连接，开启 WAL（多读单写，管理端进程可同时读取）
//! - 借出的连接由 PooledConnection 持有：无论正常返回、出错还是 panic，
//!   Drop 时都会回滚未提交的事务并归还
//! - 借出前用 `SELECT 1` 探活，坏连接被丢弃并透明重建
//! - 所有 SQLite 调用都在 spawn_blocking 中执行，不阻塞事件循环

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::StoreError;

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub path: PathBuf,
    pub size: usize,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl PoolConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            size: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl PoolInner {
    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "SQLite refused WAL journal mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// 取出一个健康的连接；空闲列表里的坏连接直接丢弃
    fn checkout(&self) -> Result<Connection, StoreError> {
        loop {
            let candidate = self.idle.lock().unwrap_or_else(|p| p.into_inner()).pop();
            match candidate {
                Some(conn) => {
                    if conn.query_row("SELECT 1", [], |_| Ok(())).is_ok() {
                        return Ok(conn);
                    }
                    tracing::warn!("Discarding dead SQLite connection");
                }
                None => return self.open_connection(),
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        self.idle.lock().unwrap_or_else(|p| p.into_inner()).push(conn);
    }
}

/// 作用域内借出的连接
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn conn(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection is present until drop"))
    }

    /// 标记连接已损坏，归还时丢弃
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discard {
            return;
        }
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback on checkin failed, discarding connection: {}", e);
                return;
            }
        }
        self.pool.checkin(conn);
    }
}

/// 有界连接池，可廉价克隆
#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

impl SqlitePool {
    /// 创建连接池并预热全部连接
    pub async fn open(config: PoolConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let size = config.size.max(1);
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            config,
        });

        let warm = Arc::clone(&inner);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            for _ in 0..size {
                let conn = warm.open_connection()?;
                warm.checkin(conn);
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        tracing::info!(path = %inner.config.path.display(), size, "SQLite pool ready");
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// 空闲连接数（仅用于诊断与测试）
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// 借出一个连接并在阻塞线程池中执行 f
    ///
    /// 连接出故障时（见 StoreError::is_connection_fault）不会归还，下次借出时重建。
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| StoreError::PoolTimeout(timeout))?
            .map_err(|_| StoreError::PoolClosed)?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || {
            let conn = inner.checkout()?;
            let mut pooled = PooledConnection {
                conn: Some(conn),
                pool: inner,
                discard: false,
                _permit: permit,
            };
            let result = f(pooled.conn());
            if let Err(ref e) = result {
                if e.is_connection_fault() {
                    tracing::warn!("Store connection fault, replacing connection: {}", e);
                    pooled.discard();
                }
            }
            result
        });

        // 阻塞任务本身不可取消：超时只是让调用方不再等待，连接仍由 guard 负责归还
        match tokio::time::timeout(timeout + self.inner.config.busy_timeout, task).await {
            Ok(joined) => joined.map_err(|e| StoreError::Join(e.to_string()))?,
            Err(_) => Err(StoreError::PoolTimeout(timeout)),
        }
    }

    /// 在事务中执行 f；f 返回 Err 时 guard 负责回滚
    pub async fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn test_pool(dir: &TempDir, size: usize) -> SqlitePool {
        let mut config = PoolConfig::new(dir.path().join("pool.db"));
        config.size = size;
        config.acquire_timeout = Duration::from_millis(200);
        SqlitePool::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_pool_is_prewarmed() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 3).await;
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn test_connection_returned_after_error() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 1).await;

        let err = pool
            .with_conn(|conn| {
                conn.query_row("SELECT * FROM missing_table", [], |_| Ok(()))?;
                Ok(())
            })
            .await;
        assert!(err.is_err());

        let one: i64 = pool
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(one, 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_open_transaction_is_rolled_back_on_checkin() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 1).await;
        pool.with_conn(|conn| {
            conn.execute_batch("CREATE TABLE t (v INTEGER)")?;
            Ok(())
        })
        .await
        .unwrap();

        let _ = pool
            .with_conn(|conn| {
                conn.execute_batch("BEGIN; INSERT INTO t VALUES (1);")?;
                Err::<(), _>(StoreError::PoolClosed)
            })
            .await;

        let count: i64 = pool
            .with_conn(|conn| {
                assert!(conn.is_autocommit());
                Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_with_tx_commits() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 2).await;
        pool.with_tx(|tx| {
            tx.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2);")?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = pool
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 1).await;

        let busy = pool.clone();
        let holder = tokio::spawn(async move {
            busy.with_conn(|_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = pool.with_conn(|_| Ok(())).await;
        assert!(matches!(result, Err(StoreError::PoolTimeout(_))));
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_discarded_connection_is_replaced() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir, 1).await;

        let _ = pool
            .with_conn(|_| {
                Err::<(), _>(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                    None,
                )))
            })
            .await;
        assert_eq!(pool.idle_count(), 0);

        pool.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(pool.idle_count(), 1);
    }
}
