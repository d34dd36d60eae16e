//! Cache of stored procedure and function metadata
//!
//! The cache is shared by every session of a pool. Concurrent lookups of the
//! same routine wait for a single load instead of querying the server repeatedly.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::{error::ConnectionResult, error::WithLoc, session::Session};

/// Whether a routine is a procedure or a function
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutineKind {
    /// Created with `CREATE PROCEDURE`
    Procedure,
    /// Created with `CREATE FUNCTION`
    Function,
}

/// Direction of a routine parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterMode {
    /// `IN`
    In,
    /// `OUT`
    Out,
    /// `INOUT`
    InOut,
}

/// One parameter of a stored routine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcedureParameter {
    /// 1-based position of the parameter
    pub ordinal: u32,
    /// Direction, functions only have [ParameterMode::In] parameters
    pub mode: ParameterMode,
    /// Name of the parameter
    pub name: String,
    /// Sql data type such as `int` or `varchar`
    pub data_type: String,
}

/// Metadata of a stored routine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Procedure {
    /// Schema the routine lives in
    pub schema: String,
    /// Name of the routine
    pub name: String,
    /// Procedure or function
    pub kind: RoutineKind,
    /// Parameters in declaration order
    pub parameters: Vec<ProcedureParameter>,
}

/// A cache entry, loaded at most once
type Entry = Arc<OnceCell<Option<Arc<Procedure>>>>;

/// Routine metadata by lower case `schema.name`
#[derive(Clone, Default)]
pub struct ProcedureCache {
    /// The entries
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for ProcedureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ProcedureCache").field("len", &len).finish()
    }
}

/// The key of a routine
fn key(schema: &str, name: &str) -> String {
    format!("{}.{}", schema.to_lowercase(), name.to_lowercase())
}

/// Quote a string literal
fn quote(v: &str) -> String {
    let mut ans = String::with_capacity(v.len() + 2);
    ans.push('\'');
    for c in v.chars() {
        match c {
            '\'' => ans.push_str("''"),
            '\\' => ans.push_str("\\\\"),
            '\0' => ans.push_str("\\0"),
            c => ans.push(c),
        }
    }
    ans.push('\'');
    ans
}

/// Query the metadata of a routine
async fn load(
    session: &mut Session,
    schema: &str,
    name: &str,
) -> ConnectionResult<Option<Arc<Procedure>>> {
    let (schema, name) = (quote(schema), quote(name));
    let sql = format!(
        "SELECT `ROUTINE_SCHEMA`, `ROUTINE_NAME`, `ROUTINE_TYPE` FROM `information_schema`.`ROUTINES` \
         WHERE `ROUTINE_SCHEMA`={schema} AND `ROUTINE_NAME`={name}"
    );
    let routines = session
        .query(&sql)
        .await?
        .map_rows(|row| {
            let schema = row.get(0).loc("ROUTINE_SCHEMA")?;
            let name = row.get(1).loc("ROUTINE_NAME")?;
            let kind = row.get(2).loc("ROUTINE_TYPE")?;
            Ok((
                schema.as_str().unwrap_or_default().to_string(),
                name.as_str().unwrap_or_default().to_string(),
                if kind.as_str() == Some("FUNCTION") {
                    RoutineKind::Function
                } else {
                    RoutineKind::Procedure
                },
            ))
        })
        .await?;
    let Some((schema_name, routine_name, kind)) = routines.into_iter().next() else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT `ORDINAL_POSITION`, `PARAMETER_MODE`, `PARAMETER_NAME`, `DATA_TYPE` \
         FROM `information_schema`.`PARAMETERS` \
         WHERE `SPECIFIC_SCHEMA`={schema} AND `SPECIFIC_NAME`={name} AND `ORDINAL_POSITION`>0 \
         ORDER BY `ORDINAL_POSITION`"
    );
    let parameters = session
        .query(&sql)
        .await?
        .map_rows(|row| {
            let ordinal = row.get(0).loc("ORDINAL_POSITION")?;
            let mode = row.get(1).loc("PARAMETER_MODE")?;
            let name = row.get(2).loc("PARAMETER_NAME")?;
            let data_type = row.get(3).loc("DATA_TYPE")?;
            Ok(ProcedureParameter {
                ordinal: ordinal.as_u64().unwrap_or_default() as u32,
                mode: match mode.as_str() {
                    Some("OUT") => ParameterMode::Out,
                    Some("INOUT") => ParameterMode::InOut,
                    _ => ParameterMode::In,
                },
                name: name.as_str().unwrap_or_default().to_string(),
                data_type: data_type.as_str().unwrap_or_default().to_string(),
            })
        })
        .await?;

    Ok(Some(Arc::new(Procedure {
        schema: schema_name,
        name: routine_name,
        kind,
        parameters,
    })))
}

impl ProcedureCache {
    /// Return the metadata of a routine, loading it with session if it is not cached
    ///
    /// Returns None if the routine does not exist. Failed loads are not cached.
    pub(crate) async fn get(
        &self,
        session: &mut Session,
        schema: &str,
        name: &str,
    ) -> ConnectionResult<Option<Arc<Procedure>>> {
        let key = key(schema, name);
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        if !entry.initialized() {
            debug!(routine = %key, "Loading routine metadata");
        }
        let procedure = entry
            .get_or_try_init(move || load(session, schema, name))
            .await?;
        Ok(procedure.clone())
    }

    /// Forget the metadata of one routine, for instance after it was altered
    pub fn invalidate(&self, schema: &str, name: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(schema, name));
    }

    /// Forget all cached metadata
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached routines, including routines found not to exist
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|v| v.initialized())
            .count()
    }

    /// Return true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcedureCache, key, quote};

    #[test]
    fn quoting() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), "'it''s'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn keys_ignore_case() {
        assert_eq!(key("Shop", "AddItem"), key("shop", "additem"));
        let cache = ProcedureCache::default();
        assert!(cache.is_empty());
        cache.invalidate("shop", "missing");
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
