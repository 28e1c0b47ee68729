//! 数据库迁移模块
//!
//! 显式的版本化迁移列表，启动时按序应用一次（记录在 schema_migrations 表），
//! 代替每次启动重复的"检查列是否存在再补列"。

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

/// 迁移版本
const MIGRATION_VERSION: i64 = 2;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    info!("Migration system initialized");
    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: SqliteResult<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        });

    match version {
        Ok(v) => Ok(v),
        Err(_) => Ok(0), // 表为空时返回 0
    }
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let now = chrono::Utc::now().timestamp_millis();

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, now],
    )?;

    Ok(())
}

/// 检查表是否存在
fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 检查列是否存在
fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| {
        let col_name: String = row.get(1)?;
        Ok(col_name)
    })?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// 迁移 1: 为 events 表补齐 HITL 列（早期库没有 HITL 支持）
fn migration_001_add_hitl_columns(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Add HITL columns");

    // 如果表不存在，跳过迁移（schema 会创建完整表）
    if !table_exists(conn, "events")? {
        info!("events table does not exist, skipping migration (will be created by schema)");
        return Ok(());
    }

    for (column, ddl) in [
        ("hitl_request", "ALTER TABLE events ADD COLUMN hitl_request TEXT"),
        ("hitl_state", "ALTER TABLE events ADD COLUMN hitl_state TEXT"),
        ("hitl_response", "ALTER TABLE events ADD COLUMN hitl_response TEXT"),
        (
            "hitl_responded_at",
            "ALTER TABLE events ADD COLUMN hitl_responded_at INTEGER",
        ),
        ("hitl_responder", "ALTER TABLE events ADD COLUMN hitl_responder TEXT"),
    ] {
        if !column_exists(conn, "events", column)? {
            info!("Adding {} column", column);
            conn.execute(ddl, [])?;
        } else {
            info!("{} column already exists, skipping", column);
        }
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_hitl_pending ON events(hitl_state) WHERE hitl_state = 'pending'",
        [],
    )?;

    info!("Migration 001 complete");
    Ok(())
}

/// 迁移 2: 为 tool_outcomes 表补齐错误分类列
fn migration_002_add_error_classification(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 002: Add error classification fields");

    if !table_exists(conn, "tool_outcomes")? {
        info!("tool_outcomes table does not exist, skipping migration (will be created by schema)");
        return Ok(());
    }

    if !column_exists(conn, "tool_outcomes", "error_type")? {
        info!("Adding error_type column");
        conn.execute("ALTER TABLE tool_outcomes ADD COLUMN error_type TEXT", [])?;
    } else {
        info!("error_type column already exists, skipping");
    }

    if !column_exists(conn, "tool_outcomes", "error_message")? {
        info!("Adding error_message column");
        conn.execute("ALTER TABLE tool_outcomes ADD COLUMN error_message TEXT", [])?;
    } else {
        info!("error_message column already exists, skipping");
    }

    info!("Migration 002 complete");
    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current_version = get_current_version(conn)?;
    info!("Current database version: {}", current_version);

    if current_version >= MIGRATION_VERSION {
        info!("Database is up to date, no migration needed");
        return Ok(());
    }

    // 执行迁移（事务保证原子性）
    let tx = conn.unchecked_transaction()?;

    if current_version < 1 {
        match migration_001_add_hitl_columns(&tx) {
            Ok(_) => {
                record_migration(&tx, 1)?;
                info!("Migration 1 applied");
            }
            Err(e) => {
                warn!("Migration 1 failed: {}", e);
                return Err(e);
            }
        }
    }

    if current_version < 2 {
        match migration_002_add_error_classification(&tx) {
            Ok(_) => {
                record_migration(&tx, 2)?;
                info!("Migration 2 applied");
            }
            Err(e) => {
                warn!("Migration 2 failed: {}", e);
                return Err(e);
            }
        }
    }

    tx.commit()?;

    info!(
        "All migrations applied successfully, current version: {}",
        MIGRATION_VERSION
    );
    Ok(())
}
