//! Generic table browser over the live database. Table names are checked
//! against a strict pattern and the catalog; column names only ever come
//! from `PRAGMA table_info`, never from the request.

use axum::http::StatusCode;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::sync::OnceLock;

use super::Database;

pub const MAX_PAGE: usize = 500;
pub const DEFAULT_PAGE: usize = 50;

#[derive(thiserror::Error, Debug)]
pub enum BrowseError {
    #[error("Invalid table name")]
    BadTable,
    #[error("Table not found")]
    TableNotFound,
    #[error("Invalid row id")]
    BadRowId,
    #[error("A data object is required")]
    MissingData,
    #[error("No valid columns given")]
    NoColumns,
    #[error("Row not found")]
    RowNotFound,
    #[error("{0}")]
    Sql(#[from] rusqlite::Error),
}

impl BrowseError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadTable | Self::BadRowId | Self::MissingData | Self::NoColumns => StatusCode::BAD_REQUEST,
            Self::TableNotFound | Self::RowNotFound => StatusCode::NOT_FOUND,
            Self::Sql(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BrowseError> for crate::error::ApiError {
    fn from(err: BrowseError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub notnull: bool,
    pub pk: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowPage {
    pub table: String,
    pub limit: usize,
    pub offset: usize,
    pub q: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowRecord {
    pub table: String,
    pub rowid: i64,
    pub columns: Vec<ColumnInfo>,
    pub row: Map<String, Value>,
}

static TABLE_NAME: OnceLock<Option<Regex>> = OnceLock::new();

pub fn valid_table_name(name: &str) -> bool {
    TABLE_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z_]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn check_rowid(rowid: i64) -> Result<i64, BrowseError> {
    if rowid <= 0 {
        return Err(BrowseError::BadRowId);
    }
    Ok(rowid)
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), BrowseError> {
    if !valid_table_name(table) {
        return Err(BrowseError::BadTable);
    }
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1",
            params![table],
            |r| r.get(0),
        )
        .optional()?;
    found.map(|_| ()).ok_or(BrowseError::TableNotFound)
}

fn columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, BrowseError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let cols = stmt.query_map([], |r| {
        Ok(ColumnInfo {
            name: r.get("name")?,
            notnull: r.get::<_, i64>("notnull")? == 1,
            pk: r.get::<_, i64>("pk")? > 0,
        })
    })?;
    Ok(cols.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_map(row: &Row<'_>, names: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut out = Map::new();
    for (i, name) in names.iter().enumerate() {
        out.insert(name.clone(), to_json(row.get_ref(i)?));
    }
    Ok(out)
}

fn select_rows(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Map<String, Value>>, BrowseError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let rows = stmt.query_map(params_from_iter(args), |r| row_map(r, &names))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Keeps the whitelisted keys of a JSON object, in request order.
fn writable_fields(data: &Value, columns: &[ColumnInfo]) -> Result<Vec<(String, SqlValue)>, BrowseError> {
    let obj = data.as_object().filter(|o| !o.is_empty()).ok_or(BrowseError::MissingData)?;
    let fields: Vec<(String, SqlValue)> = obj
        .iter()
        .filter(|(k, _)| columns.iter().any(|c| &c.name == *k))
        .map(|(k, v)| (k.clone(), to_sql(v)))
        .collect();
    if fields.is_empty() {
        return Err(BrowseError::NoColumns);
    }
    Ok(fields)
}

impl Database {
    pub async fn list_tables(&self) -> Result<Vec<String>, BrowseError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name ASC",
        )?;
        let names = stmt.query_map([], |r| r.get(0))?;
        Ok(names.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// `q` matches any column rendered as text.
    pub async fn list_rows(
        &self,
        table: &str,
        limit: usize,
        offset: usize,
        q: &str,
    ) -> Result<RowPage, BrowseError> {
        let conn = self.conn.lock().await;
        ensure_table(&conn, table)?;
        let columns = columns(&conn, table)?;
        let limit = limit.clamp(1, MAX_PAGE);
        let q = q.trim().to_string();

        let mut args = Vec::new();
        let mut sql = format!("SELECT rowid AS __rowid, * FROM {}", quote_ident(table));
        if !q.is_empty() && !columns.is_empty() {
            let clause: Vec<String> = columns
                .iter()
                .map(|c| format!("CAST({} AS TEXT) LIKE ?", quote_ident(&c.name)))
                .collect();
            sql.push_str(&format!(" WHERE {}", clause.join(" OR ")));
            args.extend(columns.iter().map(|_| SqlValue::Text(format!("%{}%", q))));
        }
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(limit as i64));
        args.push(SqlValue::Integer(offset as i64));

        let rows = select_rows(&conn, &sql, args)?;
        Ok(RowPage { table: table.to_string(), limit, offset, q, columns, rows })
    }

    pub async fn get_row(&self, table: &str, rowid: i64) -> Result<RowRecord, BrowseError> {
        let conn = self.conn.lock().await;
        let rowid = check_rowid(rowid)?;
        ensure_table(&conn, table)?;
        let columns = columns(&conn, table)?;
        let sql = format!("SELECT rowid AS __rowid, * FROM {} WHERE rowid = ?", quote_ident(table));
        let row = select_rows(&conn, &sql, vec![SqlValue::Integer(rowid)])?
            .into_iter()
            .next()
            .ok_or(BrowseError::RowNotFound)?;
        Ok(RowRecord { table: table.to_string(), rowid, columns, row })
    }

    /// Returns the new rowid.
    pub async fn insert_row(&self, table: &str, data: &Value) -> Result<i64, BrowseError> {
        let conn = self.conn.lock().await;
        ensure_table(&conn, table)?;
        let fields = writable_fields(data, &columns(&conn, table)?)?;
        let names: Vec<String> = fields.iter().map(|(k, _)| quote_ident(k)).collect();
        let marks = vec!["?"; fields.len()].join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(table), names.join(", "), marks);
        conn.execute(&sql, params_from_iter(fields.into_iter().map(|(_, v)| v)))?;
        let rowid = conn.last_insert_rowid();
        tracing::info!("Inserted row {} into {}", rowid, table);
        Ok(rowid)
    }

    /// Returns the number of changed rows.
    pub async fn update_row(&self, table: &str, rowid: i64, data: &Value) -> Result<usize, BrowseError> {
        let conn = self.conn.lock().await;
        let rowid = check_rowid(rowid)?;
        ensure_table(&conn, table)?;
        let fields = writable_fields(data, &columns(&conn, table)?)?;
        let set: Vec<String> = fields.iter().map(|(k, _)| format!("{} = ?", quote_ident(k))).collect();
        let sql = format!("UPDATE {} SET {} WHERE rowid = ?", quote_ident(table), set.join(", "));
        let mut args: Vec<SqlValue> = fields.into_iter().map(|(_, v)| v).collect();
        args.push(SqlValue::Integer(rowid));
        let changed = conn.execute(&sql, params_from_iter(args))?;
        tracing::info!("Updated row {} in {} ({} changed)", rowid, table, changed);
        Ok(changed)
    }

    /// Returns the number of deleted rows.
    pub async fn delete_row(&self, table: &str, rowid: i64) -> Result<usize, BrowseError> {
        let conn = self.conn.lock().await;
        let rowid = check_rowid(rowid)?;
        ensure_table(&conn, table)?;
        let deleted = conn.execute(&format!("DELETE FROM {} WHERE rowid = ?", quote_ident(table)), params![rowid])?;
        tracing::info!("Deleted row {} from {} ({} deleted)", rowid, table, deleted);
        Ok(deleted)
    }
}
