//! In-memory stand-ins shared by the integration tests.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sitebackup::source::{
    ColumnDef, DatabaseConnection, DatabaseSource, FieldValue, TableDefinition, TableRef,
};
use sitebackup::storage::{DirectoryStore, RemoteEntry, RemoteStore};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub table: TableRef,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<FieldValue>>,
}

#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    pub name: String,
    pub tables: Vec<MemoryTable>,
}

/// A server whose databases live in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub databases: Vec<MemoryDatabase>,
}

pub struct MemoryConnection {
    tables: Vec<MemoryTable>,
}

impl MemorySource {
    pub fn with_database(mut self, name: &str, row_count: usize) -> Self {
        let rows = (0..row_count)
            .map(|i| {
                vec![
                    FieldValue::Text(i.to_string()),
                    FieldValue::Text(format!("{} line item with a fairly repetitive description", name)),
                    if i % 10 == 0 {
                        FieldValue::Binary(vec![0, 1, 2, 255])
                    } else {
                        FieldValue::Null
                    },
                ]
            })
            .collect();
        self.databases.push(MemoryDatabase {
            name: name.to_string(),
            tables: vec![MemoryTable {
                table: TableRef::new("public", "items"),
                columns: vec![
                    ColumnDef { name: "id".into(), binary: false },
                    ColumnDef { name: "description".into(), binary: false },
                    ColumnDef { name: "thumbnail".into(), binary: true },
                ],
                rows,
            }],
        });
        self
    }
}

impl DatabaseSource for MemorySource {
    type Connection = MemoryConnection;

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        let mut names = vec!["postgres".to_string(), "template0".to_string()];
        names.extend(self.databases.iter().map(|d| d.name.clone()));
        Ok(names)
    }

    fn system_databases(&self) -> &[&str] {
        &["postgres", "template0", "template1"]
    }

    async fn connect(&mut self, database: &str) -> Result<MemoryConnection> {
        let db = self
            .databases
            .iter()
            .find(|d| d.name == database)
            .ok_or_else(|| anyhow!("database \"{}\" does not exist", database))?;
        Ok(MemoryConnection {
            tables: db.tables.clone(),
        })
    }
}

impl MemoryConnection {
    fn find(&self, table: &TableRef) -> Result<&MemoryTable> {
        self.tables
            .iter()
            .find(|t| &t.table == table)
            .ok_or_else(|| anyhow!("relation {} does not exist", table))
    }
}

impl DatabaseConnection for MemoryConnection {
    async fn server_version(&mut self) -> Result<String> {
        Ok("PostgreSQL 16.4 (in-memory)".into())
    }

    async fn preamble(&mut self) -> Result<Vec<String>> {
        Ok(vec!["CREATE SCHEMA IF NOT EXISTS \"public\";".into()])
    }

    async fn tables(&mut self) -> Result<Vec<TableRef>> {
        Ok(self.tables.iter().map(|t| t.table.clone()).collect())
    }

    async fn describe(&mut self, table: &TableRef) -> Result<TableDefinition> {
        let found = self.find(table)?;
        Ok(TableDefinition {
            table: table.clone(),
            columns: found.columns.clone(),
            create_statement: format!(
                "CREATE TABLE {} (\n  \"id\" integer NOT NULL,\n  \"description\" text,\n  \"thumbnail\" bytea\n);",
                table.quoted()
            ),
            deferred_statements: vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT \"items_pkey\" PRIMARY KEY (\"id\");",
                table.quoted()
            )],
        })
    }

    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        Ok(self.find(table)?.rows.len() as u64)
    }

    async fn stream_rows(
        &mut self,
        table: &TableDefinition,
        sink: &mut dyn FnMut(Vec<FieldValue>) -> Result<()>,
    ) -> Result<u64> {
        let found = self.find(&table.table)?;
        for row in &found.rows {
            sink(row.clone())?;
        }
        Ok(found.rows.len() as u64)
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Writes `content` to `path` and backdates its modification time.
pub fn write_aged(path: &Path, content: &[u8], age: Duration) -> Result<()> {
    fs::write(path, content)?;
    let file = fs::File::options().write(true).open(path)?;
    file.set_modified(SystemTime::now() - age)?;
    Ok(())
}

/// A mounted share that only reveals ages through its listing lines.
pub struct ListingOnlyStore(pub DirectoryStore);

impl RemoteStore for ListingOnlyStore {
    fn remote_path(&self, name: &str) -> String {
        self.0.remote_path(name)
    }

    async fn connect(&mut self) -> Result<()> {
        self.0.connect().await
    }

    async fn ensure_directory(&mut self) -> Result<()> {
        self.0.ensure_directory().await
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        self.0.list().await
    }

    async fn size(&mut self, name: &str) -> Result<Option<u64>> {
        self.0.size(name).await
    }

    async fn modified(&mut self, _name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn put(&mut self, local: &Path, name: &str) -> Result<()> {
        self.0.put(local, name).await
    }

    async fn put_resumable(
        &mut self,
        local: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.0.put_resumable(local, name, cancel).await
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        self.0.delete(name).await
    }
}
