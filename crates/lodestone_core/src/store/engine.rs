//! SQLite store engine.
//!
//! # Responsibility
//! - Attach the backing file: bootstrap the connection, synchronize the
//!   schema with the model (creating tables, auto-migrating additions),
//!   apply file protection, seed the permanent-id allocator.
//! - Scan entity tables into attribute rows and apply pending-change logs
//!   transactionally.
//!
//! # Invariants
//! - One table per entity: `id INTEGER PRIMARY KEY` plus one typed column
//!   per attribute.
//! - A pending-change log is applied atomically: all of it commits or none
//!   of it does.
//! - Only permanent identifiers reach SQL; a pending identifier surviving
//!   to this layer is a save error, not a silent skip.

use super::{LoadError, LoadResult, StoreDescriptor};
use crate::context::{PendingChange, PendingOp, SaveError};
use crate::model::{AttrKind, AttrMap, EntityDef, IdKey, Model, Value};
use crate::query::{QueryError, QueryResult};
use log::{error, info, warn};
use rusqlite::{params_from_iter, Connection};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The attached durable store: one SQLite connection serialized behind the
/// root context's queue (plus an internal mutex for engine-level safety).
pub(crate) struct Store {
    model: Arc<Model>,
    conn: Mutex<Connection>,
    next_id: AtomicI64,
}

impl Store {
    /// Opens and prepares the backing file described by `descriptor`.
    ///
    /// # Side effects
    /// - Creates or migrates entity tables.
    /// - Emits `store_attach` events with duration and status.
    pub(crate) fn attach(descriptor: StoreDescriptor, model: Arc<Model>) -> LoadResult<Self> {
        let started_at = Instant::now();
        info!(
            "event=store_attach module=store status=start path={}",
            descriptor.path().display()
        );

        let result = Self::attach_inner(&descriptor, &model);
        match result {
            Ok(store) => {
                info!(
                    "event=store_attach module=store status=ok path={} duration_ms={}",
                    descriptor.path().display(),
                    started_at.elapsed().as_millis()
                );
                Ok(store)
            }
            Err(err) => {
                error!(
                    "event=store_attach module=store status=error path={} duration_ms={} error={err}",
                    descriptor.path().display(),
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    fn attach_inner(descriptor: &StoreDescriptor, model: &Arc<Model>) -> LoadResult<Self> {
        let mut conn = Connection::open(descriptor.path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        sync_schema(&mut conn, model, descriptor.auto_migrate())?;
        apply_protection(descriptor)?;
        let next_id = seed_next_id(&conn, model)?;

        Ok(Self {
            model: model.clone(),
            conn: Mutex::new(conn),
            next_id: AtomicI64::new(next_id),
        })
    }

    /// Hands out the next permanent identifier. Monotonic for the lifetime
    /// of the attached store.
    pub(crate) fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads every durable row of `entity`, decoded through the model.
    pub(crate) fn scan(&self, entity: &str) -> QueryResult<Vec<(i64, AttrMap)>> {
        let def = self.model.require_entity(entity)?;
        let conn = self.lock_conn();

        let mut sql = String::from("SELECT id");
        for attr in &def.attributes {
            sql.push_str(", \"");
            sql.push_str(&attr.name);
            sql.push('"');
        }
        sql.push_str(&format!(" FROM \"{}\";", def.name));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let mut attrs = AttrMap::new();
            for (index, attr) in def.attributes.iter().enumerate() {
                let value = decode_column(row, index + 1, attr.kind).map_err(|message| {
                    QueryError::InvalidData {
                        entity: entity.to_string(),
                        message: format!("column `{}`: {message}", attr.name),
                    }
                })?;
                attrs.insert(attr.name.clone(), value);
            }
            out.push((id, attrs));
        }
        Ok(out)
    }

    /// Applies a pending-change log in one transaction.
    pub(crate) fn apply(&self, log: &[PendingChange]) -> Result<(), SaveError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        for change in log {
            let def = self
                .model
                .require_entity(&change.entity)
                .map_err(SaveError::Model)?;
            match &change.op {
                PendingOp::Insert { id, attrs } => {
                    let id = permanent(&change.entity, *id)?;
                    let mut sql = format!("INSERT INTO \"{}\" (id", def.name);
                    for attr in &def.attributes {
                        sql.push_str(", \"");
                        sql.push_str(&attr.name);
                        sql.push('"');
                    }
                    sql.push_str(") VALUES (?1");
                    for index in 0..def.attributes.len() {
                        sql.push_str(&format!(", ?{}", index + 2));
                    }
                    sql.push_str(");");

                    let mut params = vec![rusqlite::types::Value::Integer(id)];
                    params.extend(row_params(def, attrs));
                    tx.execute(&sql, params_from_iter(params))?;
                }
                PendingOp::Update { id, attrs } => {
                    let id = permanent(&change.entity, *id)?;
                    let mut sql = format!("UPDATE \"{}\" SET ", def.name);
                    for (index, attr) in def.attributes.iter().enumerate() {
                        if index > 0 {
                            sql.push_str(", ");
                        }
                        sql.push_str(&format!("\"{}\" = ?{}", attr.name, index + 1));
                    }
                    sql.push_str(&format!(" WHERE id = ?{};", def.attributes.len() + 1));

                    let mut params = row_params(def, attrs);
                    params.push(rusqlite::types::Value::Integer(id));
                    let changed = tx.execute(&sql, params_from_iter(params))?;
                    if changed == 0 {
                        return Err(SaveError::MissingRow {
                            entity: change.entity.clone(),
                            id,
                        });
                    }
                }
                PendingOp::Delete { id } => {
                    let id = permanent(&change.entity, *id)?;
                    // Deleting an already-absent row is tolerated.
                    tx.execute(
                        &format!("DELETE FROM \"{}\" WHERE id = ?1;", def.name),
                        [id],
                    )?;
                }
                PendingOp::DeleteAll => {
                    tx.execute(&format!("DELETE FROM \"{}\";", def.name), [])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

fn permanent(entity: &str, key: IdKey) -> Result<i64, SaveError> {
    match key {
        IdKey::Permanent(id) => Ok(id),
        IdKey::Pending(_) => Err(SaveError::UnresolvedId {
            entity: entity.to_string(),
        }),
    }
}

fn row_params(def: &EntityDef, attrs: &AttrMap) -> Vec<rusqlite::types::Value> {
    def.attributes
        .iter()
        .map(|attr| encode_value(attrs.get(&attr.name).unwrap_or(&Value::Null)))
        .collect()
}

fn encode_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(v) => rusqlite::types::Value::Integer(i64::from(*v)),
        Value::Int(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
        Value::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

fn decode_column(row: &rusqlite::Row<'_>, index: usize, kind: AttrKind) -> Result<Value, String> {
    let decoded = match kind {
        AttrKind::Bool => match row.get::<_, Option<i64>>(index) {
            Ok(Some(0)) => Value::Bool(false),
            Ok(Some(1)) => Value::Bool(true),
            Ok(Some(other)) => return Err(format!("invalid bool value `{other}`")),
            Ok(None) => Value::Null,
            Err(err) => return Err(err.to_string()),
        },
        AttrKind::Int => match row.get::<_, Option<i64>>(index) {
            Ok(Some(v)) => Value::Int(v),
            Ok(None) => Value::Null,
            Err(err) => return Err(err.to_string()),
        },
        AttrKind::Real => match row.get::<_, Option<f64>>(index) {
            Ok(Some(v)) => Value::Real(v),
            Ok(None) => Value::Null,
            Err(err) => return Err(err.to_string()),
        },
        AttrKind::Text => match row.get::<_, Option<String>>(index) {
            Ok(Some(v)) => Value::Text(v),
            Ok(None) => Value::Null,
            Err(err) => return Err(err.to_string()),
        },
        AttrKind::Blob => match row.get::<_, Option<Vec<u8>>>(index) {
            Ok(Some(v)) => Value::Blob(v),
            Ok(None) => Value::Null,
            Err(err) => return Err(err.to_string()),
        },
    };
    Ok(decoded)
}

fn column_type(kind: AttrKind) -> &'static str {
    match kind {
        AttrKind::Bool | AttrKind::Int => "INTEGER",
        AttrKind::Real => "REAL",
        AttrKind::Text => "TEXT",
        AttrKind::Blob => "BLOB",
    }
}

fn default_literal(kind: AttrKind) -> &'static str {
    match kind {
        AttrKind::Bool | AttrKind::Int => "0",
        AttrKind::Real => "0.0",
        AttrKind::Text => "''",
        AttrKind::Blob => "x''",
    }
}

fn sync_schema(conn: &mut Connection, model: &Model, auto_migrate: bool) -> LoadResult<()> {
    let tx = conn.transaction()?;
    for entity in model.entities() {
        if table_exists(&tx, &entity.name)? {
            reconcile_table(&tx, entity, auto_migrate)?;
        } else {
            create_table(&tx, entity)?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> LoadResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1);",
        [name],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

fn create_table(conn: &Connection, entity: &EntityDef) -> LoadResult<()> {
    let mut sql = format!("CREATE TABLE \"{}\" (id INTEGER PRIMARY KEY", entity.name);
    for attr in &entity.attributes {
        sql.push_str(&format!(", \"{}\" {}", attr.name, column_type(attr.kind)));
        if !attr.optional {
            sql.push_str(" NOT NULL");
        }
    }
    sql.push_str(");");
    conn.execute_batch(&sql)?;
    Ok(())
}

fn reconcile_table(conn: &Connection, entity: &EntityDef, auto_migrate: bool) -> LoadResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\");", entity.name))?;
    let mut rows = stmt.query([])?;
    let mut disk_columns: Vec<(String, String)> = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        let column_type: String = row.get("type")?;
        disk_columns.push((name, column_type.to_ascii_uppercase()));
    }

    for attr in &entity.attributes {
        match disk_columns.iter().find(|(name, _)| name == &attr.name) {
            Some((_, disk_type)) => {
                if disk_type != column_type(attr.kind) {
                    return Err(LoadError::SchemaMismatch {
                        entity: entity.name.clone(),
                        detail: format!(
                            "column `{}` is {disk_type}, model expects {}",
                            attr.name,
                            column_type(attr.kind)
                        ),
                    });
                }
            }
            None if auto_migrate => {
                let mut sql = format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                    entity.name,
                    attr.name,
                    column_type(attr.kind)
                );
                if !attr.optional {
                    sql.push_str(&format!(" NOT NULL DEFAULT {}", default_literal(attr.kind)));
                }
                sql.push(';');
                conn.execute_batch(&sql)?;
                info!(
                    "event=store_migrate module=store status=ok entity={} column={}",
                    entity.name, attr.name
                );
            }
            None => {
                return Err(LoadError::SchemaMismatch {
                    entity: entity.name.clone(),
                    detail: format!("missing column `{}`", attr.name),
                });
            }
        }
    }

    for (name, _) in &disk_columns {
        if name == "id" || entity.attribute(name).is_some() {
            continue;
        }
        if auto_migrate {
            warn!(
                "event=store_migrate module=store status=skipped entity={} column={name} reason=extra_column",
                entity.name
            );
        } else {
            return Err(LoadError::SchemaMismatch {
                entity: entity.name.clone(),
                detail: format!("unexpected column `{name}`"),
            });
        }
    }

    Ok(())
}

fn seed_next_id(conn: &Connection, model: &Model) -> LoadResult<i64> {
    let mut max_id = 0_i64;
    for entity in model.entities() {
        let entity_max: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM \"{}\";", entity.name),
            [],
            |row| row.get(0),
        )?;
        max_id = max_id.max(entity_max);
    }
    Ok(max_id + 1)
}

#[cfg(unix)]
fn apply_protection(descriptor: &StoreDescriptor) -> LoadResult<()> {
    use super::FileProtection;
    use std::os::unix::fs::PermissionsExt;

    if descriptor.protection() == FileProtection::OwnerOnly {
        std::fs::set_permissions(descriptor.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_protection(_descriptor: &StoreDescriptor) -> LoadResult<()> {
    Ok(())
}
