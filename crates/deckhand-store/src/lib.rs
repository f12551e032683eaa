//! Shared SQLite store and the per-plugin data-isolation gate.
//!
//! The host owns one connection and the core schema; plugins only ever see a
//! [`PluginStore`] handle that re-validates every statement against the
//! plugin's generated table prefix before it reaches the driver.

use std::{
    collections::BTreeSet,
    path::Path,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, Params};
use thiserror::Error;
use tracing::debug;

/// Prefix shared by every plugin namespace; a plugin's own tables start with
/// `plugin_<name>_`.
pub const PLUGIN_TABLE_PREFIX: &str = "plugin_";

const SQLITE_SYSTEM_TABLE_PREFIX: &str = "sqlite_";
const PLUGIN_NAME_MAX_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("plugin '{plugin}' may not reference core table '{table}'")]
    CoreTableDenied { plugin: String, table: String },
    #[error("plugin '{plugin}' may not reference table '{table}' owned by another plugin")]
    ForeignTableDenied { plugin: String, table: String },
    #[error("invalid plugin name '{name}' for a table prefix")]
    InvalidPluginName { name: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare store directory: {0}")]
    Directory(#[from] std::io::Error),
}

/// A validated `plugin_<name>_` namespace prefix.
///
/// Constructible only through [`TablePrefix::for_plugin`], so holding one is
/// proof the underlying plugin name passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePrefix(String);

impl TablePrefix {
    pub fn for_plugin(name: &str) -> Result<Self, StoreError> {
        if !is_valid_plugin_name(name) {
            return Err(StoreError::InvalidPluginName {
                name: name.to_string(),
            });
        }
        Ok(Self(format!("{PLUGIN_TABLE_PREFIX}{name}_")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TablePrefix {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

fn is_valid_plugin_name(name: &str) -> bool {
    if name.is_empty() || name.len() > PLUGIN_NAME_MAX_CHARS {
        return false;
    }
    let mut characters = name.chars();
    let Some(first) = characters.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && characters.all(|character| {
            character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
        })
}

/// Process-wide store handle owning the shared connection and core schema.
#[derive(Clone)]
pub struct SharedStore {
    connection: Arc<Mutex<Connection>>,
}

impl SharedStore {
    /// Opens (or creates) the store at `path` and initializes the core
    /// schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(path)?;
        Self::from_connection(connection)
    }

    /// In-memory store, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self, StoreError> {
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Self::initialize_schema(&connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn initialize_schema(connection: &Connection) -> Result<(), StoreError> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                started_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(conversation_id)
                    ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS command_audit (
                audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
                program TEXT NOT NULL,
                arguments TEXT NOT NULL,
                exit_code INTEGER NULL,
                executed_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Creates the isolation handle for `plugin`; the generated prefix is the
    /// only namespace the handle will accept.
    pub fn plugin_handle(&self, plugin: &str) -> Result<PluginStore, StoreError> {
        let prefix = TablePrefix::for_plugin(plugin)?;
        Ok(PluginStore {
            connection: self.connection.clone(),
            plugin: plugin.to_string(),
            prefix,
        })
    }

    /// Host-side audit trail for gated command executions.
    pub fn record_command_audit(
        &self,
        program: &str,
        arguments: &[String],
        exit_code: Option<i32>,
    ) -> Result<(), StoreError> {
        let guard = self.connection.lock().map_err(|_| StoreError::LockPoisoned)?;
        guard.execute(
            "INSERT INTO command_audit (program, arguments, exit_code, executed_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                program,
                serde_json::to_string(arguments).unwrap_or_default(),
                exit_code,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent audit rows, newest first.
    pub fn recent_command_audit(&self, limit: usize) -> Result<Vec<CommandAuditEntry>, StoreError> {
        let guard = self.connection.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut statement = guard.prepare(
            "SELECT program, arguments, exit_code, executed_at FROM command_audit \
             ORDER BY audit_id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map([limit as i64], |row| {
            Ok(CommandAuditEntry {
                program: row.get(0)?,
                arguments: row.get(1)?,
                exit_code: row.get(2)?,
                executed_at: row.get(3)?,
            })
        })?;
        let mut collected = Vec::new();
        for row in rows {
            collected.push(row?);
        }
        Ok(collected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One row of the host-owned command audit trail.
pub struct CommandAuditEntry {
    pub program: String,
    pub arguments: String,
    pub exit_code: Option<i32>,
    pub executed_at: String,
}

/// Per-plugin database handle: `{shared connection, plugin name, prefix}`.
///
/// Stateless beyond those three fields; every call re-validates the SQL text,
/// so the handle can be passed freely into plugin code without widening its
/// namespace. The connection, pragma configuration, and database path are not
/// reachable through it.
#[derive(Clone)]
pub struct PluginStore {
    connection: Arc<Mutex<Connection>>,
    plugin: String,
    prefix: TablePrefix,
}

impl PluginStore {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn prefix(&self) -> &TablePrefix {
        &self.prefix
    }

    /// Checks `sql` against the caller's namespace without executing it.
    ///
    /// Table references are extracted heuristically (see
    /// [`collect_table_references`]); SQLite system tables and `PRAGMA`
    /// statements pass unconditionally.
    pub fn validate(&self, sql: &str) -> Result<(), StoreError> {
        validate_statement(&self.plugin, &self.prefix, sql)
    }

    pub fn execute(&self, sql: &str, params: impl Params) -> Result<usize, StoreError> {
        self.validate(sql)?;
        let guard = self.connection.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.execute(sql, params)?)
    }

    pub fn query_rows<T>(
        &self,
        sql: &str,
        params: impl Params,
        mut map_row: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        self.validate(sql)?;
        let guard = self.connection.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut statement = guard.prepare(sql)?;
        let rows = statement.query_map(params, |row| map_row(row))?;
        let mut collected = Vec::new();
        for row in rows {
            collected.push(row?);
        }
        Ok(collected)
    }

    /// Runs `operations` inside one SQLite transaction. Each statement the
    /// closure issues is re-validated; the transaction commits only when the
    /// closure returns `Ok`.
    pub fn transaction<T>(
        &self,
        operations: impl FnOnce(&PluginTransaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.connection.lock().map_err(|_| StoreError::LockPoisoned)?;
        let transaction = guard.transaction()?;
        let scoped = PluginTransaction {
            transaction,
            plugin: &self.plugin,
            prefix: &self.prefix,
        };
        let value = operations(&scoped)?;
        scoped.transaction.commit()?;
        Ok(value)
    }
}

/// Transaction-scoped view of a [`PluginStore`]; same namespace rules.
pub struct PluginTransaction<'conn> {
    transaction: rusqlite::Transaction<'conn>,
    plugin: &'conn str,
    prefix: &'conn TablePrefix,
}

impl PluginTransaction<'_> {
    pub fn execute(&self, sql: &str, params: impl Params) -> Result<usize, StoreError> {
        self.validate(sql)?;
        Ok(self.transaction.execute(sql, params)?)
    }

    pub fn query_rows<T>(
        &self,
        sql: &str,
        params: impl Params,
        mut map_row: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        self.validate(sql)?;
        let mut statement = self.transaction.prepare(sql)?;
        let rows = statement.query_map(params, |row| map_row(row))?;
        let mut collected = Vec::new();
        for row in rows {
            collected.push(row?);
        }
        Ok(collected)
    }

    fn validate(&self, sql: &str) -> Result<(), StoreError> {
        validate_statement(self.plugin, self.prefix, sql)
    }
}

fn validate_statement(plugin: &str, prefix: &TablePrefix, sql: &str) -> Result<(), StoreError> {
    if sql.trim_start().to_ascii_lowercase().starts_with("pragma") {
        return Ok(());
    }
    for table in collect_table_references(sql) {
        if table.starts_with(SQLITE_SYSTEM_TABLE_PREFIX) || table.starts_with(prefix.as_str()) {
            continue;
        }
        debug!(plugin, table = %table, "isolation gate rejected statement");
        if table.starts_with(PLUGIN_TABLE_PREFIX) {
            return Err(StoreError::ForeignTableDenied {
                plugin: plugin.to_string(),
                table,
            });
        }
        return Err(StoreError::CoreTableDenied {
            plugin: plugin.to_string(),
            table,
        });
    }
    Ok(())
}

fn table_reference_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)\b(?:create|drop|alter)\s+table\s+(?:if\s+(?:not\s+)?exists\s+)?["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\binsert\s+(?:or\s+[a-z]+\s+)?into\s+["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\bupdate\s+(?:or\s+[a-z]+\s+)?["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\bdelete\s+from\s+["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\bfrom\s+["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\bjoin\s+["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
            r#"(?i)\bindex\s+(?:if\s+not\s+exists\s+)?[A-Za-z0-9_]+\s+on\s+["'`\[]?([A-Za-z_][A-Za-z0-9_]*)"#,
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("table reference pattern compiles"))
        .collect()
    })
}

/// Extracts candidate table identifiers from `sql`, lowercased.
///
/// Deliberately a heuristic over a fixed pattern set, not a SQL parser: the
/// gate is a second layer behind the assumption that plugin code is buggy
/// rather than hostile.
pub fn collect_table_references(sql: &str) -> BTreeSet<String> {
    let mut references = BTreeSet::new();
    for pattern in table_reference_patterns() {
        for captures in pattern.captures_iter(sql) {
            if let Some(identifier) = captures.get(1) {
                references.insert(identifier.as_str().to_ascii_lowercase());
            }
        }
    }
    references
}
