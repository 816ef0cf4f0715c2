//! SQL text shared by the relational destinations.

use pg_escape::quote_identifier;
use sqlx::query::Query;
use sqlx::{Database, Encode, Type};

use crate::checkpoint::base::CHECKPOINT_TABLE_NAME;
use crate::conversions::Cell;
use crate::conversions::flatten::{FlatRow, ID_COLUMN};
use crate::destination::base::project_row;
use crate::schema::{ColumnType, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => quote_identifier(name).to_string(),
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    pub fn column_type(self, typ: ColumnType) -> &'static str {
        match (self, typ) {
            (_, ColumnType::Text) => "TEXT",
            (Dialect::MySql, ColumnType::Real) => "DOUBLE",
            (_, ColumnType::Real) => "REAL",
            (Dialect::Sqlite, ColumnType::Boolean) => "INTEGER",
            (Dialect::Postgres, ColumnType::Boolean) => "BOOLEAN",
            (Dialect::MySql, ColumnType::Boolean) => "TINYINT(1)",
        }
    }

    fn id_column_type(self) -> &'static str {
        match self {
            Dialect::MySql => "VARCHAR(255)",
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
        }
    }

    /// Placeholder of the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    pub fn create_table(self, target: &str, schema: &Schema) -> String {
        let mut columns = vec![format!(
            "{} {} PRIMARY KEY",
            self.quote_identifier(ID_COLUMN),
            self.id_column_type()
        )];
        columns.extend(
            schema
                .column_schemas
                .iter()
                .filter(|column| column.name != ID_COLUMN)
                .map(|column| {
                    format!(
                        "{} {}",
                        self.quote_identifier(&column.name),
                        self.column_type(column.typ)
                    )
                }),
        );

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote_identifier(target),
            columns.join(", ")
        )
    }

    pub fn drop_table(self, target: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_identifier(target))
    }

    /// Returns the create statement of `target`, preceded by a drop with `reset`.
    pub fn generate_ddl(self, target: &str, schema: &Schema, reset: bool) -> Vec<String> {
        let mut statements = Vec::with_capacity(2);
        if reset {
            statements.push(self.drop_table(target));
        }
        statements.push(self.create_table(target, schema));

        statements
    }

    /// Returns the upsert of one row of `schema`, with one parameter per column in schema
    /// order.
    pub fn upsert(self, target: &str, schema: &Schema) -> String {
        let columns: Vec<_> = schema
            .column_names()
            .map(|name| self.quote_identifier(name))
            .collect();
        let placeholders: Vec<_> = (1..=columns.len())
            .map(|index| self.placeholder(index))
            .collect();
        let target = self.quote_identifier(target);

        match self {
            Dialect::Sqlite | Dialect::MySql => format!(
                "REPLACE INTO {target} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            Dialect::Postgres => {
                let id = self.quote_identifier(ID_COLUMN);
                let updates: Vec<_> = columns
                    .iter()
                    .filter(|column| **column != id)
                    .map(|column| format!("{column} = EXCLUDED.{column}"))
                    .collect();
                let conflict = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", updates.join(", "))
                };

                format!(
                    "INSERT INTO {target} ({}) VALUES ({}) ON CONFLICT ({id}) {conflict}",
                    columns.join(", "),
                    placeholders.join(", ")
                )
            }
        }
    }

    pub fn delete(self, target: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {}",
            self.quote_identifier(target),
            self.quote_identifier(ID_COLUMN),
            self.placeholder(1)
        )
    }

    pub fn create_checkpoint_table(self) -> String {
        let id = match self {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
            Dialect::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
        };
        let tablename = match self {
            Dialect::MySql => "tablename VARCHAR(255)",
            Dialect::Sqlite | Dialect::Postgres => "tablename TEXT",
        };

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({id}, {tablename}, seq TEXT)",
            self.quote_identifier(CHECKPOINT_TABLE_NAME)
        )
    }

    pub fn drop_checkpoint_table(self) -> String {
        self.drop_table(CHECKPOINT_TABLE_NAME)
    }

    pub fn insert_checkpoint(self) -> String {
        format!(
            "INSERT INTO {} (tablename, seq) VALUES ({}, {})",
            self.quote_identifier(CHECKPOINT_TABLE_NAME),
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    /// Selects the most recent checkpoint of one key.
    pub fn select_checkpoint(self) -> String {
        format!(
            "SELECT seq FROM {} WHERE tablename = {} ORDER BY id DESC LIMIT 1",
            self.quote_identifier(CHECKPOINT_TABLE_NAME),
            self.placeholder(1)
        )
    }
}

/// Binds an already coerced cell, using a null of the column type for [`Cell::Null`].
pub fn bind_cell<'q, DB>(
    query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    cell: Cell,
    typ: ColumnType,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<f64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
{
    match cell {
        Cell::Text(text) => query.bind(Some(text)),
        Cell::Real(real) => query.bind(Some(real)),
        Cell::Bool(b) => query.bind(Some(b)),
        Cell::Null => match typ {
            ColumnType::Text => query.bind(None::<String>),
            ColumnType::Real => query.bind(None::<f64>),
            ColumnType::Boolean => query.bind(None::<bool>),
        },
    }
}

/// Builds the upsert `sql` of `row`, binding one coerced cell per column of `schema`.
pub fn upsert_query<'q, DB>(
    sql: &'q str,
    schema: &Schema,
    row: &FlatRow,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<f64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
{
    schema
        .column_schemas
        .iter()
        .zip(project_row(schema, row))
        .fold(sqlx::query(sql), |query, (column, cell)| {
            bind_cell(query, cell, column.typ)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSchema::new("title", ColumnType::Text),
            ColumnSchema::new("age", ColumnType::Real),
            ColumnSchema::new("verified", ColumnType::Boolean),
            ColumnSchema::new("id", ColumnType::Text),
        ])
    }

    #[test]
    fn create_table_puts_id_first_as_primary_key() {
        assert_eq!(
            Dialect::Sqlite.create_table("sampledata", &schema()),
            "CREATE TABLE IF NOT EXISTS sampledata (id TEXT PRIMARY KEY, title TEXT, age REAL, verified INTEGER)"
        );
        assert_eq!(
            Dialect::MySql.create_table("sampledata", &schema()),
            "CREATE TABLE IF NOT EXISTS `sampledata` (`id` VARCHAR(255) PRIMARY KEY, `title` TEXT, `age` DOUBLE, `verified` TINYINT(1))"
        );
    }

    #[test]
    fn reset_drops_before_create() {
        let ddl = Dialect::Postgres.generate_ddl("sampledata", &schema(), true);

        assert_eq!(ddl.len(), 2);
        assert_eq!(ddl[0], "DROP TABLE IF EXISTS sampledata");
        assert!(ddl[1].contains("verified BOOLEAN"));
        assert_eq!(Dialect::Postgres.generate_ddl("sampledata", &schema(), false).len(), 1);
    }

    #[test]
    fn postgres_upsert_updates_every_column_but_id() {
        assert_eq!(
            Dialect::Postgres.upsert("sampledata", &schema()),
            "INSERT INTO sampledata (title, age, verified, id) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, age = EXCLUDED.age, \
             verified = EXCLUDED.verified"
        );
    }

    #[test]
    fn replace_dialects_use_positional_placeholders() {
        assert_eq!(
            Dialect::Sqlite.upsert("sampledata", &schema()),
            "REPLACE INTO sampledata (title, age, verified, id) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(
            Dialect::MySql.delete("sampledata"),
            "DELETE FROM `sampledata` WHERE `id` = ?"
        );
    }

    #[test]
    fn mixed_case_identifiers_are_quoted() {
        assert_eq!(Dialect::Postgres.quote_identifier("Order"), "\"Order\"");
    }
}
