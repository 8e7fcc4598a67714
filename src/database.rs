//! Database access for the database phase.
//!
//! Steps talk to MySQL through the `DatabaseClient` trait. The production
//! client opens one connection per call and closes it on every exit path.

use crate::config::DatabaseSettings;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use regex::Regex;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor, MySql, QueryBuilder};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use std::sync::LazyLock;

/// Rows per INSERT statement during bulk loads.
const INSERT_BATCH: usize = 500;

/// MySQL's limit on placeholders in one prepared statement.
const MAX_PLACEHOLDERS: usize = 65_535;

/// Rows per INSERT for `columns` columns, kept under the placeholder limit.
fn batch_rows(columns: usize) -> usize {
    INSERT_BATCH.min(MAX_PLACEHOLDERS / columns.max(1)).max(1)
}

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("identifier pattern is a valid static regex")
});

/// Column-oriented rows ready for a bulk insert. `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl SeedRows {
    /// Parse a JSON array of flat objects. Columns are collected in first-seen
    /// order; a key missing from a row becomes NULL.
    pub fn from_json(path: &Path, text: &str) -> Result<Self, DatabaseError> {
        let invalid = |reason: String| DatabaseError::InvalidSeed {
            path: path.to_path_buf(),
            reason,
        };
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
        let items = value
            .as_array()
            .ok_or_else(|| invalid("expected a JSON array of objects".to_string()))?;

        let mut columns: Vec<String> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let obj = item
                .as_object()
                .ok_or_else(|| invalid(format!("element {} is not an object", i)))?;
            for key in obj.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let obj = item
                .as_object()
                .ok_or_else(|| invalid(format!("element {} is not an object", i)))?;
            let mut row = Vec::with_capacity(columns.len());
            for column in &columns {
                let cell = match obj.get(column) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(serde_json::Value::Bool(b)) => Some(if *b { "1" } else { "0" }.to_string()),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    Some(_) => {
                        return Err(invalid(format!(
                            "element {} column '{}' is nested; seed rows must be flat",
                            i, column
                        )));
                    }
                };
                row.push(cell);
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }
}

pub fn validate_identifier(name: &str) -> Result<&str, DatabaseError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// MySQL only treats `--` as a comment when whitespace (or the end of input)
/// follows it; `chars` is positioned just after the first dash.
fn opens_line_comment(chars: &Peekable<Chars<'_>>) -> bool {
    let mut ahead = chars.clone();
    ahead.next() == Some('-') && ahead.next().is_none_or(char::is_whitespace)
}

/// Split a SQL script into statements on `;`, ignoring semicolons inside
/// quotes, backticks, and comments. Comments are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' && q != '`' {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if opens_line_comment(&chars) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '#' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                // `/*! ... */` is executable by MySQL and stays in the statement.
                let executable = chars.peek() == Some(&'!');
                if executable {
                    current.push_str("/*");
                }
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if executable {
                        current.push(skipped);
                    }
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
                if !executable {
                    current.push(' ');
                }
            }
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Connect and return the server version.
    async fn ping(&self) -> Result<String, DatabaseError>;

    /// Execute every statement in `script` in order; returns the statement count.
    async fn execute_script(&self, script: &str) -> Result<usize, DatabaseError>;

    /// `INSERT IGNORE` the rows in batches; returns rows actually inserted.
    async fn bulk_insert(&self, table: &str, seed: &SeedRows) -> Result<u64, DatabaseError>;

    async fn count_rows(&self, table: &str) -> Result<i64, DatabaseError>;
}

/// `DatabaseClient` for MySQL, backed by sqlx.
#[derive(Debug, Clone)]
pub struct MySqlClient {
    settings: DatabaseSettings,
}

impl MySqlClient {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self { settings }
    }

    async fn connect(&self) -> Result<MySqlConnection, DatabaseError> {
        let password = self
            .settings
            .password
            .as_deref()
            .ok_or(DatabaseError::MissingPassword)?;
        let options = MySqlConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .password(password)
            .database(&self.settings.name);
        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            database = %self.settings.name,
            "connecting to database"
        );
        MySqlConnection::connect_with(&options)
            .await
            .map_err(DatabaseError::Connect)
    }

    /// Closing is best-effort; a failed close never masks the task result.
    async fn close(conn: MySqlConnection) {
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "failed to close database connection cleanly");
        }
    }

    async fn run_statements(conn: &mut MySqlConnection, script: &str) -> Result<usize, DatabaseError> {
        let statements = split_statements(script);
        for (index, stmt) in statements.iter().enumerate() {
            conn.execute(sqlx::raw_sql(stmt))
                .await
                .map_err(|source| DatabaseError::Statement {
                    index: index + 1,
                    source,
                })?;
        }
        Ok(statements.len())
    }

    async fn insert_batches(
        conn: &mut MySqlConnection,
        table: &str,
        seed: &SeedRows,
    ) -> Result<u64, DatabaseError> {
        let column_list = seed
            .columns
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut inserted = 0;
        for chunk in seed.rows.chunks(batch_rows(seed.columns.len())) {
            let mut builder: QueryBuilder<MySql> =
                QueryBuilder::new(format!("INSERT IGNORE INTO `{}` ({}) ", table, column_list));
            builder.push_values(chunk, |mut b, row| {
                for cell in row {
                    b.push_bind(cell.clone());
                }
            });
            let result = builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(DatabaseError::Query)?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    async fn ping(&self) -> Result<String, DatabaseError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query_scalar::<_, String>("SELECT VERSION()")
            .fetch_one(&mut conn)
            .await
            .map_err(DatabaseError::Query);
        Self::close(conn).await;
        result
    }

    async fn execute_script(&self, script: &str) -> Result<usize, DatabaseError> {
        let mut conn = self.connect().await?;
        let result = Self::run_statements(&mut conn, script).await;
        Self::close(conn).await;
        result
    }

    async fn bulk_insert(&self, table: &str, seed: &SeedRows) -> Result<u64, DatabaseError> {
        validate_identifier(table)?;
        for column in &seed.columns {
            validate_identifier(column)?;
        }
        if seed.rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect().await?;
        let result = Self::insert_batches(&mut conn, table, seed).await;
        Self::close(conn).await;
        result
    }

    async fn count_rows(&self, table: &str) -> Result<i64, DatabaseError> {
        validate_identifier(table)?;
        let mut conn = self.connect().await?;
        let result = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM `{}`", table))
            .fetch_one(&mut conn)
            .await
            .map_err(DatabaseError::Query);
        Self::close(conn).await;
        result
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedFile {
    pub table: String,
    pub path: PathBuf,
}

/// Database work a step can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseTask {
    Ping,
    ApplySchema { path: PathBuf },
    LoadSeeds { files: Vec<SeedFile> },
    VerifyTables { tables: Vec<String> },
}

impl DatabaseTask {
    pub fn describe(&self) -> String {
        match self {
            DatabaseTask::Ping => "database: SELECT VERSION()".to_string(),
            DatabaseTask::ApplySchema { path } => format!("database: apply {}", path.display()),
            DatabaseTask::LoadSeeds { files } => format!(
                "database: load {}",
                files
                    .iter()
                    .map(|f| format!("{} <- {}", f.table, f.path.display()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            DatabaseTask::VerifyTables { tables } => {
                format!("database: count rows in {}", tables.join(", "))
            }
        }
    }
}

/// Run `task` against `client`; relative paths resolve against `base_dir`.
/// Returns a one-line summary for the step record.
pub async fn run_task(
    client: &dyn DatabaseClient,
    task: &DatabaseTask,
    base_dir: &Path,
) -> Result<String, DatabaseError> {
    match task {
        DatabaseTask::Ping => {
            let version = client.ping().await?;
            Ok(format!("connected, server version {}", version))
        }
        DatabaseTask::ApplySchema { path } => {
            let path = base_dir.join(path);
            let script = std::fs::read_to_string(&path).map_err(|source| DatabaseError::Read {
                path: path.clone(),
                source,
            })?;
            let count = client.execute_script(&script).await?;
            Ok(format!("applied {} statements from {}", count, path.display()))
        }
        DatabaseTask::LoadSeeds { files } => {
            let mut parts = Vec::new();
            for file in files {
                validate_identifier(&file.table)?;
                let path = base_dir.join(&file.path);
                let text = std::fs::read_to_string(&path).map_err(|source| DatabaseError::Read {
                    path: path.clone(),
                    source,
                })?;
                let seed = SeedRows::from_json(&path, &text)?;
                let inserted = client.bulk_insert(&file.table, &seed).await?;
                tracing::info!(table = %file.table, rows = seed.rows.len(), inserted, "seed file loaded");
                parts.push(format!("{}: {} of {} rows inserted", file.table, inserted, seed.rows.len()));
            }
            Ok(parts.join("; "))
        }
        DatabaseTask::VerifyTables { tables } => {
            let mut parts = Vec::new();
            for table in tables {
                let count = client.count_rows(table).await?;
                parts.push(format!("{}={}", table, count));
            }
            Ok(parts.join(", "))
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::{DatabaseClient, SeedRows, validate_identifier};
    use crate::errors::DatabaseError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory stand-in that tracks row counts per table.
    #[derive(Default)]
    pub struct StubDatabase {
        pub unreachable: bool,
        tables: Mutex<BTreeMap<String, i64>>,
        scripts: Mutex<Vec<String>>,
    }

    impl StubDatabase {
        pub fn with_tables(tables: &[(&str, i64)]) -> Self {
            Self {
                unreachable: false,
                tables: Mutex::new(tables.iter().map(|(t, n)| (t.to_string(), *n)).collect()),
                scripts: Mutex::new(Vec::new()),
            }
        }

        pub fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Default::default()
            }
        }

        pub fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), DatabaseError> {
            if self.unreachable {
                Err(DatabaseError::MissingPassword)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DatabaseClient for StubDatabase {
        async fn ping(&self) -> Result<String, DatabaseError> {
            self.check()?;
            Ok("8.0.36-stub".to_string())
        }

        async fn execute_script(&self, script: &str) -> Result<usize, DatabaseError> {
            self.check()?;
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(super::split_statements(script).len())
        }

        async fn bulk_insert(&self, table: &str, seed: &SeedRows) -> Result<u64, DatabaseError> {
            self.check()?;
            validate_identifier(table)?;
            *self.tables.lock().unwrap().entry(table.to_string()).or_default() +=
                seed.rows.len() as i64;
            Ok(seed.rows.len() as u64)
        }

        async fn count_rows(&self, table: &str) -> Result<i64, DatabaseError> {
            self.check()?;
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .copied()
                .ok_or_else(|| DatabaseError::InvalidIdentifier(table.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubDatabase;
    use super::*;

    #[test]
    fn test_split_handles_comments_and_quotes() {
        let script = "-- users\nCREATE TABLE users (id INT);\n# note; ignored\nINSERT INTO t VALUES ('a;b', \"c;d\");\n/* block; */ SELECT 1;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "CREATE TABLE users (id INT)");
        assert_eq!(statements[1], "INSERT INTO t VALUES ('a;b', \"c;d\")");
        assert_eq!(statements[2], "SELECT 1");
    }

    #[test]
    fn test_split_handles_escaped_quotes_and_missing_final_semicolon() {
        let statements = split_statements("INSERT INTO t VALUES ('it\\'s; fine')\n");
        assert_eq!(statements, vec!["INSERT INTO t VALUES ('it\\'s; fine')"]);
    }

    #[test]
    fn test_double_dash_without_space_is_not_a_comment() {
        let statements = split_statements("UPDATE stock SET qty = qty--1;\nSELECT 2; --\n");
        assert_eq!(statements, vec!["UPDATE stock SET qty = qty--1", "SELECT 2"]);
    }

    #[test]
    fn test_executable_comments_are_kept() {
        let statements =
            split_statements("/*!40101 SET NAMES utf8mb4 */;\n/* plain */ CREATE TABLE t (id INT);");
        assert_eq!(
            statements,
            vec!["/*!40101 SET NAMES utf8mb4 */", "CREATE TABLE t (id INT)"]
        );
    }

    #[test]
    fn test_batches_stay_under_placeholder_limit() {
        assert_eq!(batch_rows(0), INSERT_BATCH);
        assert_eq!(batch_rows(8), INSERT_BATCH);
        assert_eq!(batch_rows(200), 327);
        assert!(batch_rows(200) * 200 <= MAX_PLACEHOLDERS);
        assert_eq!(batch_rows(100_000), 1);
    }

    #[test]
    fn test_split_of_blank_script_is_empty() {
        assert!(split_statements("  -- nothing\n  ").is_empty());
    }

    #[test]
    fn test_identifiers_are_validated() {
        assert!(validate_identifier("order_items").is_ok());
        assert!(validate_identifier("users`; DROP TABLE x").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_seed_rows_from_json_collects_columns() {
        let text = r#"[{"id": 1, "name": "Widget", "active": true}, {"id": 2, "price": 9.5, "name": null}]"#;
        let seed = SeedRows::from_json(Path::new("p.json"), text).unwrap();
        assert_eq!(seed.columns, vec!["id", "name", "active", "price"]);
        assert_eq!(
            seed.rows[0],
            vec![Some("1".into()), Some("Widget".into()), Some("1".into()), None]
        );
        assert_eq!(seed.rows[1], vec![Some("2".into()), None, None, Some("9.5".into())]);
    }

    #[test]
    fn test_seed_rows_reject_non_arrays_and_nested_values() {
        let err = SeedRows::from_json(Path::new("p.json"), r#"{"id": 1}"#).unwrap_err();
        assert!(err.to_string().contains("JSON array"));
        let err = SeedRows::from_json(Path::new("p.json"), r#"[{"tags": ["a"]}]"#).unwrap_err();
        assert!(err.to_string().contains("flat"));
    }

    #[tokio::test]
    async fn test_run_task_applies_schema_and_loads_seeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schema.sql"), "CREATE TABLE a (x INT); CREATE TABLE b (y INT);").unwrap();
        std::fs::write(dir.path().join("products.json"), r#"[{"sku": "A"}, {"sku": "B"}]"#).unwrap();
        let db = StubDatabase::with_tables(&[]);

        let summary = run_task(
            &db,
            &DatabaseTask::ApplySchema {
                path: "schema.sql".into(),
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert!(summary.starts_with("applied 2 statements"));

        let summary = run_task(
            &db,
            &DatabaseTask::LoadSeeds {
                files: vec![SeedFile {
                    table: "products".into(),
                    path: "products.json".into(),
                }],
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(summary, "products: 2 of 2 rows inserted");

        let summary = run_task(
            &db,
            &DatabaseTask::VerifyTables {
                tables: vec!["products".into()],
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(summary, "products=2");
    }

    #[tokio::test]
    async fn test_missing_schema_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_task(
            &StubDatabase::default(),
            &DatabaseTask::ApplySchema {
                path: "nope.sql".into(),
            },
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DatabaseError::Read { .. }));
    }

    #[tokio::test]
    async fn test_mysql_client_without_password_fails_before_connecting() {
        let client = MySqlClient::new(DatabaseSettings {
            host: "127.0.0.1".into(),
            port: 1,
            user: "root".into(),
            password: None,
            name: "ecommerce".into(),
        });
        assert!(matches!(client.ping().await, Err(DatabaseError::MissingPassword)));
    }

    #[test]
    fn test_describe_names_the_work() {
        let task = DatabaseTask::VerifyTables {
            tables: vec!["users".into(), "orders".into()],
        };
        assert_eq!(task.describe(), "database: count rows in users, orders");
    }
}
