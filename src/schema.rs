//! Declarative schema for synced tables.
//!
//! Every synced table gets an implicit `id TEXT PRIMARY KEY NOT NULL` column;
//! declared columns hold the row payload. The store generates the DDL, the
//! crud-capture triggers, and the remote-merge upsert statements from these
//! definitions, so the schema is the single source of truth for what is
//! replicated.

/// SQLite column affinity for a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// A declared column on a synced table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Text,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Integer,
        }
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Real,
        }
    }
}

/// A table definition.
///
/// `local_only` tables are stored and watchable like any other table but are
/// excluded from crud capture and remote merge — nothing about them ever
/// leaves the device.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub local_only: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            local_only: false,
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Names of the declared (non-id) columns, in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// The full set of table definitions for one database.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables participating in sync (crud capture + remote merge).
    pub fn synced_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| !t.local_only)
    }
}
