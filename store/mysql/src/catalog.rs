//! Information about what objects actually exist in a schema, read from
//! `information_schema`. Object-name comparisons are case-insensitive
//! since MySQL's identifier case sensitivity depends on server settings.

use std::collections::HashSet;

use diesel::mysql::MysqlConnection;
use diesel::sql_types::Text;
use diesel::{sql_query, QueryableByName, RunQueryDsl};

use crate::error::StoreError;
use crate::Namespace;

#[derive(QueryableByName)]
struct ObjectName {
    #[diesel(sql_type = Text)]
    object_name: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub schema: Namespace,
    tables: HashSet<String>,
    routines: HashSet<String>,
}

impl Catalog {
    /// Load the tables and stored routines that currently exist in
    /// `schema`.
    pub fn for_schema(conn: &mut MysqlConnection, schema: Namespace) -> Result<Self, StoreError> {
        const TABLES_QUERY: &str = "
            select table_name as object_name
              from information_schema.tables
             where table_schema = ?";
        const ROUTINES_QUERY: &str = "
            select routine_name as object_name
              from information_schema.routines
             where routine_schema = ?";

        let tables = load_object_names(conn, TABLES_QUERY, &schema)?;
        let routines = load_object_names(conn, ROUTINES_QUERY, &schema)?;
        Ok(Catalog {
            schema,
            tables,
            routines,
        })
    }

    /// Make a catalog as if the given `schema` did not contain any objects
    /// yet. This should only be used in situations where a database
    /// connection is definitely not available, such as in unit tests
    pub fn make_empty(schema: Namespace) -> Self {
        Catalog {
            schema,
            tables: HashSet::new(),
            routines: HashSet::new(),
        }
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains(&name.to_lowercase())
    }

    pub fn routine_exists(&self, name: &str) -> bool {
        self.routines.contains(&name.to_lowercase())
    }

    /// Record that `name` was just created so later existence checks
    /// against this catalog see it without a reload.
    pub(crate) fn add_table(&mut self, name: &str) {
        self.tables.insert(name.to_lowercase());
    }

    pub(crate) fn add_routine(&mut self, name: &str) {
        self.routines.insert(name.to_lowercase());
    }
}

fn load_object_names(
    conn: &mut MysqlConnection,
    query: &str,
    schema: &Namespace,
) -> Result<HashSet<String>, StoreError> {
    let names = sql_query(query)
        .bind::<Text, _>(schema.as_str())
        .load::<ObjectName>(conn)?
        .into_iter()
        .map(|row| row.object_name.to_lowercase())
        .collect();
    Ok(names)
}

/// Check that `schema` exists on the server `conn` points at.
pub fn has_schema(conn: &mut MysqlConnection, schema: &Namespace) -> Result<bool, StoreError> {
    const QUERY: &str = "
        select schema_name as object_name
          from information_schema.schemata
         where schema_name = ?";

    let rows = sql_query(QUERY)
        .bind::<Text, _>(schema.as_str())
        .load::<ObjectName>(conn)?;
    Ok(!rows.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_case_insensitive() {
        let mut catalog = Catalog::make_empty(Namespace::new("tenant_1".to_string()).unwrap());
        catalog.add_table("Login2User");
        catalog.add_routine("get_context_id");

        assert!(catalog.table_exists("login2user"));
        assert!(catalog.table_exists("LOGIN2USER"));
        assert!(!catalog.table_exists("login2user_seq"));
        assert!(catalog.routine_exists("GET_CONTEXT_ID"));
        assert!(!catalog.routine_exists("unknown"));
    }
}
