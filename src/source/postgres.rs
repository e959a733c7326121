// sitebackup/src/source/postgres.rs
use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use sqlx::{Connection, PgConnection, Row};
use url::Url;

use super::{
    ColumnDef, DatabaseConnection, DatabaseSource, FieldValue, TableDefinition, TableRef,
    quote_ident,
};

const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

/// Streams databases from a PostgreSQL server reachable at `source_database_url`.
pub struct PgSource {
    base_url: Url,
}

impl PgSource {
    pub fn new(source_db_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: get_base_url_without_db(source_db_url)?,
        })
    }

    fn url_for(&self, database: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/{}", database));
        url.to_string()
    }
}

fn get_base_url_without_db(full_url: &str) -> Result<Url> {
    let mut parsed = Url::parse(full_url)
        .with_context(|| format!("Invalid database URL format: {}", full_url))?;
    parsed.set_path("");
    Ok(parsed)
}

impl DatabaseSource for PgSource {
    type Connection = PgSession;

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        let mut conn = PgConnection::connect(&self.url_for("postgres"))
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to 'postgres' database on {} for listing databases",
                    self.base_url.host_str().unwrap_or("<unknown host>")
                )
            })?;

        let rows = sqlx::query(
            "SELECT datname::text AS datname FROM pg_database \
             WHERE datistemplate = false AND datallowconn = true ORDER BY datname",
        )
        .fetch_all(&mut conn)
        .await
        .context("Failed to fetch database list from pg_database")?;

        let names = rows
            .iter()
            .map(|row| row.try_get::<String, _>("datname"))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to get 'datname' from row when fetching database list")?;

        conn.close().await.ok();
        Ok(names)
    }

    fn system_databases(&self) -> &[&str] {
        SYSTEM_DATABASES
    }

    async fn connect(&mut self, database: &str) -> Result<PgSession> {
        let conn = PgConnection::connect(&self.url_for(database))
            .await
            .with_context(|| format!("Failed to connect to database {}", database))?;
        Ok(PgSession { conn })
    }
}

pub struct PgSession {
    conn: PgConnection,
}

impl DatabaseConnection for PgSession {
    async fn server_version(&mut self) -> Result<String> {
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&mut self.conn)
            .await
            .context("Failed to query server version")?;
        Ok(version)
    }

    async fn preamble(&mut self) -> Result<Vec<String>> {
        let mut statements = Vec::new();

        let schemas = sqlx::query(
            "SELECT nspname::text AS schema_name FROM pg_namespace \
             WHERE nspname NOT IN ('pg_catalog', 'information_schema', 'public') \
               AND nspname NOT LIKE 'pg\\_%' \
             ORDER BY nspname",
        )
        .fetch_all(&mut self.conn)
        .await
        .context("Failed to fetch schemas")?;
        for row in schemas {
            let schema: String = row.try_get("schema_name")?;
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {};", quote_ident(&schema)));
        }

        let sequences = sqlx::query(
            "SELECT sequence_schema::text AS sequence_schema, sequence_name::text AS sequence_name \
             FROM information_schema.sequences \
             WHERE sequence_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY sequence_schema, sequence_name",
        )
        .fetch_all(&mut self.conn)
        .await
        .context("Failed to fetch sequences")?;
        for row in sequences {
            let seq = TableRef::new(
                row.try_get::<String, _>("sequence_schema")?,
                row.try_get::<String, _>("sequence_name")?,
            );
            statements.push(format!("CREATE SEQUENCE IF NOT EXISTS {};", seq.quoted()));
        }

        Ok(statements)
    }

    async fn tables(&mut self) -> Result<Vec<TableRef>> {
        let rows = sqlx::query(
            "SELECT table_schema::text AS table_schema, table_name::text AS table_name \
             FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
               AND table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name",
        )
        .fetch_all(&mut self.conn)
        .await
        .context("Failed to fetch Tables")?;

        rows.iter()
            .map(|row| -> Result<TableRef> {
                Ok(TableRef::new(
                    row.try_get::<String, _>("table_schema")?,
                    row.try_get::<String, _>("table_name")?,
                ))
            })
            .collect()
    }

    async fn describe(&mut self, table: &TableRef) -> Result<TableDefinition> {
        let columns = sqlx::query(
            "SELECT a.attname::text AS column_name, \
                    format_type(a.atttypid, a.atttypmod) AS data_type, \
                    a.attnotnull AS not_null, \
                    pg_get_expr(d.adbin, d.adrelid) AS column_default \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
             WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_all(&mut self.conn)
        .await
        .with_context(|| format!("Failed to fetch columns for table {}", table))?;

        let owned_sequences = sqlx::query(
            "SELECT seq.relname::text AS sequence_name, attr.attname::text AS column_name \
             FROM pg_class seq \
             JOIN pg_depend dep ON dep.objid = seq.oid AND dep.deptype = 'a' \
             JOIN pg_class tab ON dep.refobjid = tab.oid \
             JOIN pg_attribute attr ON dep.refobjid = attr.attrelid AND dep.refobjsubid = attr.attnum \
             JOIN pg_namespace nsp ON tab.relnamespace = nsp.oid \
             WHERE seq.relkind = 'S' AND tab.relkind = 'r' AND nsp.nspname = $1 AND tab.relname = $2",
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_all(&mut self.conn)
        .await
        .with_context(|| format!("Failed to fetch owned sequences for table {}", table))?;

        let mut create_statement = String::new();
        for row in &owned_sequences {
            let seq = TableRef::new(table.schema.clone(), row.try_get::<String, _>("sequence_name")?);
            create_statement.push_str(&format!("CREATE SEQUENCE IF NOT EXISTS {};\n", seq.quoted()));
        }

        let mut column_defs = Vec::with_capacity(columns.len());
        let mut column_sql = Vec::with_capacity(columns.len());
        for row in &columns {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let not_null: bool = row.try_get("not_null")?;
            let default: Option<String> = row.try_get("column_default")?;

            let mut ddl = format!("  {} {}", quote_ident(&name), data_type);
            if not_null {
                ddl.push_str(" NOT NULL");
            }
            if let Some(def) = default {
                ddl.push_str(&format!(" DEFAULT {}", def));
            }
            column_sql.push(ddl);
            column_defs.push(ColumnDef {
                binary: data_type == "bytea",
                name,
            });
        }
        create_statement.push_str(&format!(
            "CREATE TABLE {} (\n{}\n);",
            table.quoted(),
            column_sql.join(",\n")
        ));

        let constraints = sqlx::query(
            "SELECT contype::text AS contype, conname::text AS conname, \
                    pg_get_constraintdef(oid) AS def \
             FROM pg_constraint \
             WHERE conrelid = $1::regclass AND contype IN ('p', 'u', 'f') \
             ORDER BY contype DESC, conname",
        )
        .bind(table.quoted())
        .fetch_all(&mut self.conn)
        .await
        .with_context(|| format!("Failed to fetch constraints for table {}", table))?;

        let mut deferred_statements = Vec::new();
        let mut foreign_keys = Vec::new();
        for row in constraints {
            let kind: String = row.try_get("contype")?;
            let name: String = row.try_get("conname")?;
            let def: String = row.try_get("def")?;
            let statement = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {};",
                table.quoted(),
                quote_ident(&name),
                def
            );
            if kind == "f" {
                foreign_keys.push(statement);
            } else {
                deferred_statements.push(statement);
            }
        }

        let indexes = sqlx::query(
            "SELECT pg_get_indexdef(i.indexrelid) AS def \
             FROM pg_index i \
             WHERE i.indrelid = $1::regclass AND NOT i.indisprimary \
               AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = i.indexrelid)",
        )
        .bind(table.quoted())
        .fetch_all(&mut self.conn)
        .await
        .with_context(|| format!("Failed to fetch indexes for table {}", table))?;
        for row in indexes {
            let def: String = row.try_get("def")?;
            deferred_statements.push(format!("{};", def));
        }

        // Restart owned sequences after the highest restored value.
        for row in &owned_sequences {
            let seq = TableRef::new(table.schema.clone(), row.try_get::<String, _>("sequence_name")?);
            let column: String = row.try_get("column_name")?;
            deferred_statements.push(format!(
                "SELECT setval('{}', COALESCE(MAX({}), 0) + 1, false) FROM {};",
                seq.quoted().replace('\'', "''"),
                quote_ident(&column),
                table.quoted()
            ));
        }
        deferred_statements.extend(foreign_keys);

        Ok(TableDefinition {
            table: table.clone(),
            columns: column_defs,
            create_statement,
            deferred_statements,
        })
    }

    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.quoted()))
            .fetch_one(&mut self.conn)
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?;
        Ok(count.max(0) as u64)
    }

    async fn stream_rows(
        &mut self,
        table: &TableDefinition,
        sink: &mut dyn FnMut(Vec<FieldValue>) -> Result<()>,
    ) -> Result<u64> {
        // Non-binary columns are rendered by the server so every type arrives as text.
        let select_list = table
            .columns
            .iter()
            .map(|c| {
                if c.binary {
                    quote_ident(&c.name)
                } else {
                    format!("{}::text", quote_ident(&c.name))
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", select_list, table.table.quoted());

        let mut rows = sqlx::query(&sql).fetch(&mut self.conn);
        let mut delivered = 0u64;
        while let Some(row) = rows
            .try_next()
            .await
            .with_context(|| format!("Failed to fetch rows from table {}", table.table))?
        {
            let mut values = Vec::with_capacity(table.columns.len());
            for (idx, column) in table.columns.iter().enumerate() {
                let value = if column.binary {
                    row.try_get::<Option<Vec<u8>>, _>(idx)?.map(FieldValue::Binary)
                } else {
                    row.try_get::<Option<String>, _>(idx)?.map(FieldValue::Text)
                };
                values.push(value.unwrap_or(FieldValue::Null));
            }
            sink(values)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn close(self) -> Result<()> {
        self.conn.close().await.context("Failed to close database connection")
    }
}
