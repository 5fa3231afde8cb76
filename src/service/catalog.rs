//! Table catalog: the mapping from table id to table config.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::datasource::TableConfig;
use crate::error::{DataError, Result};
use crate::TableId;

#[derive(Deserialize)]
struct CatalogFile {
    tables: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    id: TableId,
    config: TableConfig,
}

/// Registered tables, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    tables: BTreeMap<TableId, TableConfig>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"tables": [{"id": 1, "config": {...}}, ...]}`.
    ///
    /// Every config is validated; duplicate ids are rejected.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| DataError::ConfigValidation(e.to_string()))?;
        let mut catalog = Self::new();
        for entry in file.tables {
            if catalog.tables.contains_key(&entry.id) {
                return Err(DataError::ConfigValidation(format!(
                    "table id {} is defined twice",
                    entry.id
                )));
            }
            catalog.tables.insert(entry.id, entry.config);
        }
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DataError::ConfigValidation(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Register `config` under `table_id`, returning the config it replaced.
    pub fn insert(&mut self, table_id: TableId, config: TableConfig) -> Option<TableConfig> {
        self.tables.insert(table_id, config)
    }

    pub fn get(&self, table_id: TableId) -> Result<&TableConfig> {
        self.tables
            .get(&table_id)
            .ok_or(DataError::UnknownTable(table_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableId, &TableConfig)> {
        self.tables.iter().map(|(id, config)| (*id, config))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::BackendKind;

    #[test]
    fn test_catalog_from_json() {
        let catalog = TableCatalog::from_json(
            r#"{"tables": [
                {"id": 5, "config": {"kind": "sqlite", "path": "/tmp/app.db", "table_name": "users"}},
                {"id": 6, "config": {"kind": "postgres", "host": "db", "port": 5432, "user": "app",
                                     "password": "", "database": "appdb", "table_name": "orders"}}
            ]}"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(5).unwrap().kind(), BackendKind::Sqlite);
        assert_eq!(catalog.get(6).unwrap().table_name(), "orders");
        assert!(matches!(catalog.get(7), Err(DataError::UnknownTable(7))));
    }

    #[test]
    fn test_catalog_rejects_duplicates_and_invalid_configs() {
        let duplicate = r#"{"tables": [
            {"id": 1, "config": {"kind": "sqlite", "path": "/a.db", "table_name": "t"}},
            {"id": 1, "config": {"kind": "sqlite", "path": "/b.db", "table_name": "t"}}
        ]}"#;
        assert!(matches!(
            TableCatalog::from_json(duplicate),
            Err(DataError::ConfigValidation(_))
        ));

        let missing_table = r#"{"tables": [
            {"id": 1, "config": {"kind": "sqlite", "path": "/a.db", "table_name": ""}}
        ]}"#;
        assert!(matches!(
            TableCatalog::from_json(missing_table),
            Err(DataError::ConfigValidation(_))
        ));
    }
}
