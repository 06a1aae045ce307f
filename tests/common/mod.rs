// ABOUTME: In-memory MySQL stand-in driving the real dumper, loader and pool in tests
// ABOUTME: Understands the statements the engine issues and records what was executed

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mysql_dumper::session::{Connector, RowSink, Session, SqlValue, TextRow};
use mysql_dumper::utils::split_statements;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub numeric: bool,
    pub generated: bool,
}

impl Column {
    pub fn int(name: &str) -> Self {
        Self {
            name: name.to_string(),
            numeric: true,
            generated: false,
        }
    }

    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            numeric: false,
            generated: false,
        }
    }

    pub fn generated(name: &str) -> Self {
        Self {
            name: name.to_string(),
            numeric: true,
            generated: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Clone, Default)]
pub struct Database {
    pub tables: BTreeMap<String, Table>,
    pub views: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Gauge {
    pub active: usize,
    pub peak: usize,
}

impl Gauge {
    fn enter(&mut self) {
        self.active += 1;
        self.peak = self.peak.max(self.active);
    }

    fn leave(&mut self) {
        self.active -= 1;
    }
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub databases: BTreeMap<String, Database>,
    /// Executed statements with the id of the session that ran them
    pub log: Vec<(usize, String)>,
    /// Metadata queries and streaming SELECTs
    pub queries: Vec<String>,
    pub fail_on: Option<String>,
    pub fail_stream_table: Option<String>,
    pub delay: Option<Duration>,
    pub streams: Gauge,
    pub inserts: Gauge,
    /// Connections open at the same time
    pub sessions: Gauge,
    pub connects: usize,
    pub disconnects: usize,
}

#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    next_id: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    pub fn add_database(&self, db: &str) {
        self.state().databases.entry(db.to_string()).or_default();
    }

    pub fn add_table(&self, db: &str, table: &str, columns: Vec<Column>, rows: Vec<Vec<SqlValue>>) {
        self.state()
            .databases
            .entry(db.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), Table { columns, rows });
    }

    pub fn add_view(&self, db: &str, view: &str, definition: &str) {
        self.state()
            .databases
            .entry(db.to_string())
            .or_default()
            .views
            .insert(view.to_string(), definition.to_string());
    }

    pub fn fail_on(&self, pattern: &str) {
        self.state().fail_on = Some(pattern.to_string());
    }

    pub fn fail_stream_of(&self, table: &str) {
        self.state().fail_stream_table = Some(table.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.iter().map(|(_, sql)| sql.clone()).collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state().queries.clone()
    }

    pub fn has_table(&self, db: &str, table: &str) -> bool {
        self.state()
            .databases
            .get(db)
            .is_some_and(|d| d.tables.contains_key(table))
    }

    pub fn has_view(&self, db: &str, view: &str) -> bool {
        self.state()
            .databases
            .get(db)
            .is_some_and(|d| d.views.contains_key(view))
    }

    /// Rows of `db.table` restricted to `columns`, in insertion order
    pub fn rows(&self, db: &str, table: &str, columns: &[&str]) -> Vec<Vec<SqlValue>> {
        let state = self.state();
        let table = &state.databases[db].tables[table];
        let indexes: Vec<usize> = columns
            .iter()
            .map(|name| {
                table
                    .columns
                    .iter()
                    .position(|c| c.name == *name)
                    .unwrap_or_else(|| panic!("no column {}", name))
            })
            .collect();
        table
            .rows
            .iter()
            .map(|row| indexes.iter().map(|&idx| row[idx].clone()).collect())
            .collect()
    }

    fn query(&self, sql: &str) -> Result<Vec<TextRow>> {
        let mut state = self.state();
        state.queries.push(sql.to_string());

        if sql == "SHOW DATABASES" {
            return Ok(state
                .databases
                .keys()
                .map(|name| vec![Some(name.clone())])
                .collect());
        }
        if let Some(rest) = sql.strip_prefix("SHOW FULL TABLES FROM ") {
            let db = database(&state, &idents(rest)[0])?;
            let mut rows: Vec<TextRow> = db
                .tables
                .keys()
                .map(|t| vec![Some(t.clone()), Some("BASE TABLE".to_string())])
                .collect();
            rows.extend(
                db.views
                    .keys()
                    .map(|v| vec![Some(v.clone()), Some("VIEW".to_string())]),
            );
            return Ok(rows);
        }
        if let Some(rest) = sql.strip_prefix("SHOW CREATE DATABASE IF NOT EXISTS ") {
            let name = idents(rest).remove(0);
            database(&state, &name)?;
            return Ok(vec![vec![
                Some(name.clone()),
                Some(format!(
                    "CREATE DATABASE IF NOT EXISTS `{}` /*!40100 DEFAULT CHARACTER SET utf8mb4 */",
                    name
                )),
            ]]);
        }
        if let Some(rest) = sql.strip_prefix("SHOW CREATE TABLE ") {
            let names = idents(rest);
            let table = table(&state, &names[0], &names[1])?;
            return Ok(vec![vec![
                Some(names[1].clone()),
                Some(create_table_statement(&names[1], table)),
            ]]);
        }
        if let Some(rest) = sql.strip_prefix("SHOW CREATE VIEW ") {
            let names = idents(rest);
            let definition = database(&state, &names[0])?
                .views
                .get(&names[1])
                .with_context(|| format!("Unknown view {}", names[1]))?;
            return Ok(vec![vec![Some(names[1].clone()), Some(definition.clone())]]);
        }
        if let Some(rest) = sql.strip_prefix("SHOW FIELDS FROM ") {
            let names = idents(rest);
            let table = table(&state, &names[0], &names[1])?;
            return Ok(table
                .columns
                .iter()
                .map(|c| {
                    vec![
                        Some(c.name.clone()),
                        Some(if c.numeric { "int" } else { "text" }.to_string()),
                        Some("YES".to_string()),
                        Some(String::new()),
                        None,
                        Some(if c.generated { "VIRTUAL GENERATED" } else { "" }.to_string()),
                    ]
                })
                .collect());
        }
        bail!("mock cannot answer query: {}", sql)
    }

    fn execute(&self, session: usize, current: &mut Option<String>, sql: &str) -> Result<()> {
        let mut state = self.state();
        state.log.push((session, sql.to_string()));
        if let Some(pattern) = &state.fail_on {
            if sql.contains(pattern.as_str()) {
                bail!("injected failure on '{}'", pattern);
            }
        }

        let sql = sql.trim();
        if let Some(rest) = sql.strip_prefix("USE ") {
            let name = idents(rest).remove(0);
            database(&state, &name)?;
            *current = Some(name);
        } else if sql.starts_with("SET ") {
        } else if let Some(rest) = sql.strip_prefix("CREATE DATABASE IF NOT EXISTS ") {
            let name = idents(rest).remove(0);
            state.databases.entry(name).or_default();
        } else if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let db = current_db(&mut state, current)?;
            let (name, table) = parse_create_table(rest)?;
            if db.tables.contains_key(&name) {
                bail!("Table '{}' already exists", name);
            }
            db.tables.insert(name, table);
        } else if sql.starts_with("CREATE ") && sql.contains(" VIEW ") {
            let (_, after) = sql.split_once(" VIEW ").unwrap();
            let name = idents(after).remove(0);
            let db = current_db(&mut state, current)?;
            if db.views.contains_key(&name) {
                bail!("View '{}' already exists", name);
            }
            db.views.insert(name, sql.to_string());
        } else if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            let name = idents(rest).remove(0);
            current_db(&mut state, current)?.tables.remove(&name);
        } else if let Some(rest) = sql.strip_prefix("DROP VIEW IF EXISTS ") {
            let name = idents(rest).remove(0);
            current_db(&mut state, current)?.views.remove(&name);
        } else if sql.starts_with("INSERT INTO ") {
            let (name, columns, rows) = parse_insert(sql)?;
            let db = current_db(&mut state, current)?;
            let table = db
                .tables
                .get_mut(&name)
                .with_context(|| format!("Table '{}' doesn't exist", name))?;
            let indexes = columns
                .iter()
                .map(|c| {
                    table
                        .columns
                        .iter()
                        .position(|col| &col.name == c)
                        .with_context(|| format!("Unknown column '{}'", c))
                })
                .collect::<Result<Vec<_>>>()?;
            for values in rows {
                let mut row = vec![SqlValue::Null; table.columns.len()];
                for (idx, value) in indexes.iter().zip(values) {
                    row[*idx] = value;
                }
                table.rows.push(row);
            }
        } else {
            bail!("mock cannot execute: {}", sql);
        }
        Ok(())
    }

    /// Resolve a data SELECT into the requested columns of every row
    fn select(&self, sql: &str) -> Result<(String, Vec<Vec<SqlValue>>)> {
        let mut state = self.state();
        state.queries.push(sql.to_string());

        let body = sql.strip_prefix("SELECT ").context("not a SELECT")?;
        let (list, from) = body.split_once(" FROM ").context("SELECT without FROM")?;
        let from = from.split(" WHERE ").next().unwrap_or(from);
        let names = idents(from);
        if state.fail_stream_table.as_deref() == Some(names[1].as_str()) {
            bail!("injected stream failure for {}", names[1]);
        }
        let table = table(&state, &names[0], &names[1])?;

        let mut picks: Vec<Result<usize, SqlValue>> = Vec::new();
        for item in list.split(',') {
            match item.split_once(" AS ") {
                Some((expr, _)) => {
                    let literal = expr.trim().trim_matches('\'');
                    picks.push(Err(SqlValue::Bytes(literal.as_bytes().to_vec())));
                }
                None => {
                    let name = idents(item).remove(0);
                    let idx = table
                        .columns
                        .iter()
                        .position(|c| c.name == name)
                        .with_context(|| format!("Unknown column '{}'", name))?;
                    picks.push(Ok(idx));
                }
            }
        }

        let rows = table
            .rows
            .iter()
            .map(|row| {
                picks
                    .iter()
                    .map(|pick| match pick {
                        Ok(idx) => row[*idx].clone(),
                        Err(value) => value.clone(),
                    })
                    .collect()
            })
            .collect();
        Ok((names[1].clone(), rows))
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn database<'a>(state: &'a ServerState, name: &str) -> Result<&'a Database> {
    state
        .databases
        .get(name)
        .with_context(|| format!("Unknown database '{}'", name))
}

fn table<'a>(state: &'a ServerState, db: &str, name: &str) -> Result<&'a Table> {
    database(state, db)?
        .tables
        .get(name)
        .with_context(|| format!("Table '{}.{}' doesn't exist", db, name))
}

fn current_db<'a>(state: &'a mut ServerState, current: &Option<String>) -> Result<&'a mut Database> {
    let name = current.as_ref().context("No database selected")?;
    state
        .databases
        .get_mut(name)
        .with_context(|| format!("Unknown database '{}'", name))
}

fn create_table_statement(name: &str, table: &Table) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            if c.generated {
                format!("  `{}` int GENERATED ALWAYS AS (1) VIRTUAL", c.name)
            } else if c.numeric {
                format!("  `{}` int", c.name)
            } else {
                format!("  `{}` text", c.name)
            }
        })
        .collect();
    format!(
        "CREATE TABLE `{}` (\n{}\n) ENGINE=InnoDB",
        name,
        columns.join(",\n")
    )
}

fn parse_create_table(rest: &str) -> Result<(String, Table)> {
    let mut lines = rest.lines();
    let name = idents(lines.next().context("empty CREATE TABLE")?).remove(0);
    let columns = lines
        .map(str::trim)
        .filter(|line| line.starts_with('`'))
        .map(|line| Column {
            name: idents(line).remove(0),
            numeric: line.contains(" int"),
            generated: line.contains("GENERATED ALWAYS"),
        })
        .collect();
    Ok((
        name,
        Table {
            columns,
            rows: Vec::new(),
        },
    ))
}

/// Every backtick-quoted identifier in `input`, in order
pub fn idents(input: &str) -> Vec<String> {
    input
        .split('`')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

/// Parse `INSERT INTO `t`(`a`,..) VALUES\n(..),\n(..)` back into rows
pub fn parse_insert(sql: &str) -> Result<(String, Vec<String>, Vec<Vec<SqlValue>>)> {
    let rest = sql.strip_prefix("INSERT INTO ").context("not an INSERT")?;
    let (head, values) = rest
        .split_once(" VALUES\n")
        .context("INSERT without VALUES")?;
    let (table, columns) = head.split_once('(').context("INSERT without columns")?;
    Ok((
        idents(table).remove(0),
        idents(columns),
        parse_tuples(values.as_bytes())?,
    ))
}

/// Parse `(v1,v2),\n(v3,v4)` where values are NULL, bare numerics or
/// double-quoted MySQL string literals
pub fn parse_tuples(input: &[u8]) -> Result<Vec<Vec<SqlValue>>> {
    let mut rows = Vec::new();
    let mut i = 0;

    loop {
        while i < input.len() && (input[i] == b',' || input[i].is_ascii_whitespace()) {
            i += 1;
        }
        if i >= input.len() {
            break;
        }
        if input[i] != b'(' {
            bail!("expected '(' at byte {}", i);
        }
        i += 1;

        let mut row = Vec::new();
        loop {
            if input[i] == b'"' {
                i += 1;
                let mut buf = Vec::new();
                loop {
                    match input[i] {
                        b'\\' => {
                            buf.push(match input[i + 1] {
                                b'0' => 0,
                                b'b' => 0x08,
                                b'n' => b'\n',
                                b'r' => b'\r',
                                b't' => b'\t',
                                b'Z' => 0x1A,
                                other => other,
                            });
                            i += 2;
                        }
                        b'"' => {
                            i += 1;
                            break;
                        }
                        byte => {
                            buf.push(byte);
                            i += 1;
                        }
                    }
                }
                row.push(SqlValue::Bytes(buf));
            } else {
                let start = i;
                while input[i] != b',' && input[i] != b')' {
                    i += 1;
                }
                let token = std::str::from_utf8(&input[start..i])?.trim();
                row.push(if token == "NULL" {
                    SqlValue::Null
                } else {
                    SqlValue::Numeric(token.to_string())
                });
            }

            match input[i] {
                b',' => i += 1,
                b')' => {
                    i += 1;
                    break;
                }
                other => bail!("unexpected byte {:?} at {}", other as char, i),
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Re-parse every `<db>.<table>.NNNNN.sql` file in `dir`, in file order
pub fn read_dump_rows(dir: &Path, db: &str, table: &str) -> Vec<Vec<SqlValue>> {
    let prefix = format!("{}.{}.", db, table);
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.starts_with(&prefix) && name.ends_with(".sql"))
        .collect();
    files.sort();

    let mut rows = Vec::new();
    for file in files {
        let data = std::fs::read(dir.join(&file)).unwrap();
        for statement in split_statements(&data) {
            let sql = std::str::from_utf8(statement).unwrap();
            let (_, _, parsed) = parse_insert(sql).unwrap();
            rows.extend(parsed);
        }
    }
    rows
}

pub fn data_files(dir: &Path, db: &str, table: &str, ext: &str) -> Vec<String> {
    let prefix = format!("{}.{}.", db, table);
    let suffix = format!(".{}", ext);
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.starts_with(&prefix) && name.ends_with(&suffix))
        .collect();
    files.sort();
    files
}

pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession> {
        {
            let mut state = self.server.state();
            state.connects += 1;
            state.sessions.enter();
        }
        Ok(MockSession {
            id: self.server.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            server: self.server.clone(),
            current: None,
        })
    }
}

pub struct MockSession {
    id: usize,
    server: MockServer,
    current: Option<String>,
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let insert = sql.starts_with("INSERT");
        if insert {
            self.server.state().inserts.enter();
        }
        self.server.pause().await;
        let result = self.server.execute(self.id, &mut self.current, sql);
        if insert {
            self.server.state().inserts.leave();
        }
        result
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<TextRow>> {
        self.server.query(sql)
    }

    async fn stream_rows(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<u64> {
        self.server.state().streams.enter();
        self.server.pause().await;
        let selected = self.server.select(sql);
        let result = match selected {
            Ok((_, rows)) => {
                let mut count = 0;
                let mut outcome = Ok(());
                for row in rows {
                    if let Err(e) = sink.accept(row).await {
                        outcome = Err(e);
                        break;
                    }
                    count += 1;
                }
                outcome.map(|_| count)
            }
            Err(e) => Err(e),
        };
        self.server.state().streams.leave();
        result
    }

    async fn disconnect(self) -> Result<()> {
        let mut state = self.server.state();
        state.disconnects += 1;
        state.sessions.leave();
        Ok(())
    }
}

pub fn int(value: i64) -> SqlValue {
    SqlValue::Numeric(value.to_string())
}

pub fn text(value: &str) -> SqlValue {
    SqlValue::Bytes(value.as_bytes().to_vec())
}
