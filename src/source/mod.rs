//! Database sources the exporter can stream from.
//!
//! A source hands out one connection per database; each connection enumerates tables,
//! describes them, counts rows, and streams rows without materialising a table in memory.

pub mod postgres;

use anyhow::Result;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"schema"."table"` with embedded quotes doubled.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Binary columns are streamed as raw bytes; everything else as text.
    pub binary: bool,
}

#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub table: TableRef,
    pub columns: Vec<ColumnDef>,
    pub create_statement: String,
    /// Key and index statements replayed after all data is loaded.
    pub deferred_statements: Vec<String>,
}

/// One field of a streamed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Text(String),
    Binary(Vec<u8>),
}

#[allow(async_fn_in_trait)]
pub trait DatabaseSource {
    type Connection: DatabaseConnection;

    /// Every database the credentials can see, system catalogs included.
    async fn list_databases(&mut self) -> Result<Vec<String>>;

    /// Names that are always skipped by discovery unless listed explicitly.
    fn system_databases(&self) -> &[&str];

    async fn connect(&mut self, database: &str) -> Result<Self::Connection>;
}

#[allow(async_fn_in_trait)]
pub trait DatabaseConnection {
    async fn server_version(&mut self) -> Result<String>;

    /// Statements emitted once at the top of a dump (schemas, sequences).
    async fn preamble(&mut self) -> Result<Vec<String>>;

    async fn tables(&mut self) -> Result<Vec<TableRef>>;

    async fn describe(&mut self, table: &TableRef) -> Result<TableDefinition>;

    async fn row_count(&mut self, table: &TableRef) -> Result<u64>;

    /// Streams every row of `table` into `sink`, returning the number of rows delivered.
    async fn stream_rows(
        &mut self,
        table: &TableDefinition,
        sink: &mut dyn FnMut(Vec<FieldValue>) -> Result<()>,
    ) -> Result<u64>;

    async fn close(self) -> Result<()>;
}
