//! Idempotent schema provisioning.
//!
//! External modules contribute provisioning units, each declaring the
//! objects it needs and the objects it creates. Units are ordered so that
//! nothing runs before its requirements exist; per object, creation is
//! skipped if the object is already there, making a second provisioning
//! run over the same schema a no-op. Execution happens inside the
//! caller's open transaction; this module never commits or rolls back.

use std::collections::HashMap;

use anyhow::anyhow;
use diesel::connection::SimpleConnection;
use diesel::mysql::MysqlConnection;
use itertools::Itertools;
use slog::{debug, Logger};

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::Namespace;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ObjectKind {
    Table,
    Routine,
}

/// A named database object. Names compare case-insensitively, matching
/// how the catalog reports them.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DbObject {
    kind: ObjectKind,
    name: String,
}

impl DbObject {
    pub fn table(name: &str) -> Self {
        DbObject {
            kind: ObjectKind::Table,
            name: name.to_lowercase(),
        }
    }

    pub fn routine(name: &str) -> Self {
        DbObject {
            kind: ObjectKind::Routine,
            name: name.to_lowercase(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn exists_in(&self, catalog: &Catalog) -> bool {
        match self.kind {
            ObjectKind::Table => catalog.table_exists(&self.name),
            ObjectKind::Routine => catalog.routine_exists(&self.name),
        }
    }

    fn add_to(&self, catalog: &mut Catalog) {
        match self.kind {
            ObjectKind::Table => catalog.add_table(&self.name),
            ObjectKind::Routine => catalog.add_routine(&self.name),
        }
    }
}

/// One object a unit creates, together with the statement that creates it.
pub struct CreateStatement {
    pub object: DbObject,
    pub sql: String,
}

/// A contribution to schema provisioning. Units come from the modules
/// that own the objects; the provisioner only consumes the list.
pub trait ProvisioningUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Objects that must exist before this unit runs.
    fn required_objects(&self) -> Vec<DbObject>;

    /// Objects this unit creates, each with its creation statement.
    fn objects_to_create(&self) -> Vec<CreateStatement>;
}

/// Order `units` so that every unit runs after the units creating its
/// required objects. A dependency cycle, two units creating the same
/// object, or a requirement that neither a unit nor the live schema can
/// satisfy is a `ProvisioningOrder` error; nothing executes in that case.
fn execution_order(
    units: &[&dyn ProvisioningUnit],
    catalog: &Catalog,
) -> Result<Vec<usize>, StoreError> {
    let mut creator: HashMap<DbObject, usize> = HashMap::new();
    for (idx, unit) in units.iter().enumerate() {
        for stmt in unit.objects_to_create() {
            if let Some(other) = creator.insert(stmt.object.clone(), idx) {
                return Err(StoreError::ProvisioningOrder(format!(
                    "object {} is created by both {} and {}",
                    stmt.object.name(),
                    units[other].name(),
                    unit.name()
                )));
            }
        }
    }

    let mut indegree = vec![0usize; units.len()];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    for (idx, unit) in units.iter().enumerate() {
        for required in unit.required_objects() {
            match creator.get(&required) {
                Some(&dep) => {
                    edges[dep].push(idx);
                    indegree[idx] += 1;
                }
                None if required.exists_in(catalog) => {}
                None => {
                    return Err(StoreError::ProvisioningOrder(format!(
                        "{} requires {} which no unit creates and which does not exist in schema {}",
                        unit.name(),
                        required.name(),
                        catalog.schema
                    )));
                }
            }
        }
    }

    let mut order = Vec::with_capacity(units.len());
    let mut done = vec![false; units.len()];
    // Among the runnable units, always pick the first by position; that
    // keeps the order stable across runs
    while let Some(next) = (0..units.len()).find(|&i| !done[i] && indegree[i] == 0) {
        done[next] = true;
        order.push(next);
        for &follower in &edges[next] {
            indegree[follower] -= 1;
        }
    }

    if order.len() != units.len() {
        let stuck = (0..units.len())
            .filter(|&i| !done[i])
            .map(|i| units[i].name())
            .join(", ");
        return Err(StoreError::ProvisioningOrder(format!(
            "circular dependency among provisioning units: {}",
            stuck
        )));
    }
    Ok(order)
}

/// Run `units` against the schema `conn` is bound to, in dependency
/// order, skipping objects that already exist. Must be called inside an
/// open transaction; a creation failure is re-raised with the offending
/// statement attached and aborts the run.
pub fn provision(
    logger: &Logger,
    conn: &mut MysqlConnection,
    schema: &Namespace,
    units: &[&dyn ProvisioningUnit],
) -> Result<(), StoreError> {
    let mut catalog = Catalog::for_schema(conn, schema.clone())?;
    let order = execution_order(units, &catalog)?;

    for idx in order {
        let unit = units[idx];
        for stmt in unit.objects_to_create() {
            if stmt.object.exists_in(&catalog) {
                debug!(logger, "object already exists, skipping";
                       "unit" => unit.name().to_string(),
                       "object" => stmt.object.name().to_string());
                continue;
            }
            conn.batch_execute(&stmt.sql).map_err(|e| {
                StoreError::Unknown(anyhow!(
                    "creating {} failed: {}; statement: `{}`",
                    stmt.object.name(),
                    StoreError::from(e),
                    stmt.sql
                ))
            })?;
            stmt.object.add_to(&mut catalog);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unit {
        name: &'static str,
        requires: Vec<DbObject>,
        creates: Vec<DbObject>,
    }

    impl Unit {
        fn new(name: &'static str, requires: Vec<DbObject>, creates: Vec<DbObject>) -> Self {
            Unit {
                name,
                requires,
                creates,
            }
        }
    }

    impl ProvisioningUnit for Unit {
        fn name(&self) -> &str {
            self.name
        }

        fn required_objects(&self) -> Vec<DbObject> {
            self.requires.clone()
        }

        fn objects_to_create(&self) -> Vec<CreateStatement> {
            self.creates
                .iter()
                .map(|object| CreateStatement {
                    object: object.clone(),
                    sql: format!("create table {} (id int)", object.name()),
                })
                .collect()
        }
    }

    fn empty_catalog() -> Catalog {
        Catalog::make_empty(Namespace::new("tenant_1".to_string()).unwrap())
    }

    fn order_of(units: &[&dyn ProvisioningUnit], catalog: &Catalog) -> Vec<usize> {
        execution_order(units, catalog).unwrap()
    }

    #[test]
    fn units_run_after_their_requirements() {
        let users = Unit::new("users", vec![], vec![DbObject::table("user")]);
        let groups = Unit::new(
            "groups",
            vec![DbObject::table("user")],
            vec![DbObject::table("user_group")],
        );
        // Declared in the wrong order on purpose
        let order = order_of(&[&groups, &users], &empty_catalog());
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn requirement_names_match_case_insensitively() {
        let users = Unit::new("users", vec![], vec![DbObject::table("User")]);
        let groups = Unit::new("groups", vec![DbObject::table("USER")], vec![]);
        let order = order_of(&[&groups, &users], &empty_catalog());
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn independent_units_keep_their_declared_order() {
        let a = Unit::new("a", vec![], vec![DbObject::table("a")]);
        let b = Unit::new("b", vec![], vec![DbObject::table("b")]);
        let order = order_of(&[&a, &b], &empty_catalog());
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn cycles_are_fatal_before_anything_runs() {
        let a = Unit::new(
            "a",
            vec![DbObject::table("b")],
            vec![DbObject::table("a")],
        );
        let b = Unit::new(
            "b",
            vec![DbObject::table("a")],
            vec![DbObject::table("b")],
        );
        match execution_order(&[&a, &b], &empty_catalog()) {
            Err(StoreError::ProvisioningOrder(msg)) => {
                assert!(msg.contains("circular"), "{}", msg)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn unsatisfiable_requirements_are_fatal() {
        let unit = Unit::new("needs_missing", vec![DbObject::table("nowhere")], vec![]);
        match execution_order(&[&unit], &empty_catalog()) {
            Err(StoreError::ProvisioningOrder(msg)) => {
                assert!(msg.contains("nowhere"), "{}", msg)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn live_objects_satisfy_requirements() {
        let mut catalog = empty_catalog();
        catalog.add_table("user");
        let unit = Unit::new("groups", vec![DbObject::table("user")], vec![]);
        assert_eq!(order_of(&[&unit], &catalog), vec![0]);
    }

    #[test]
    fn routines_and_tables_are_distinct_namespaces() {
        let mut catalog = empty_catalog();
        catalog.add_table("get_context");
        let unit = Unit::new("needs_routine", vec![DbObject::routine("get_context")], vec![]);
        assert!(matches!(
            execution_order(&[&unit], &catalog),
            Err(StoreError::ProvisioningOrder(_))
        ));
    }

    #[test]
    fn two_units_creating_the_same_object_is_an_error() {
        let a = Unit::new("a", vec![], vec![DbObject::table("user")]);
        let b = Unit::new("b", vec![], vec![DbObject::table("USER")]);
        match execution_order(&[&a, &b], &empty_catalog()) {
            Err(StoreError::ProvisioningOrder(msg)) => {
                assert!(msg.contains("both"), "{}", msg)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
