/*!
 # Hierarchical light group store

 The bridge only supports flat groups, so nested groups are kept locally in SQLite.
 Every light belongs to at most one group and every group to at most one parent group;
 membership queries walk the group tree downwards.
*/

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::StoreConfig;
use crate::{Error, Result};

/// Name of the default root group that always exists after initialization
pub const UNCATEGORIZED: &str = "uncategorized";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS groups (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    parent_group_id INTEGER REFERENCES groups(id)
);
CREATE TABLE IF NOT EXISTS lights (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    base_station_id INTEGER NOT NULL,
    group_id        INTEGER REFERENCES groups(id)
);
CREATE INDEX IF NOT EXISTS idx_groups_parent ON groups(parent_group_id);
CREATE INDEX IF NOT EXISTS idx_lights_group ON lights(group_id);
";

/// SQLite-backed store of lights and nested groups
#[derive(Debug)]
pub struct GroupStore {
    conn: Mutex<Connection>,
}

impl GroupStore {
    /// Opens (or creates) the store at the configured location
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_path(config.path())
    }

    /// Opens (or creates) the store at `path`, creating missing parent directories
    #[instrument]
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| Error::StorageLocation {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        debug!("Opening group store");
        Self::from_connection(Connection::open(path)?)
    }

    /// Creates a private in-memory store
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates the schema and the uncategorized group if they are missing
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO groups (name, parent_group_id) VALUES (?1, NULL)",
            params![UNCATEGORIZED],
        )?;
        if created > 0 {
            info!("Created default group '{}'", UNCATEGORIZED);
        }
        Ok(())
    }

    /// Creates a root group; returns `false` if the name is already taken
    #[instrument(skip(self))]
    pub fn add_group(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT OR IGNORE INTO groups (name, parent_group_id) VALUES (?1, NULL)",
            params![name],
        )?;
        debug!(created = created > 0, "Added group");
        Ok(created > 0)
    }

    /// Registers a light without a group.
    ///
    /// A light that already exists is left as it is, including its `base_id`, even when
    /// the new `base_id` differs. Use [`GroupStore::add_light_to_group`] to place it.
    #[instrument(skip(self))]
    pub fn add_light(&self, name: &str, base_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT OR IGNORE INTO lights (name, base_station_id, group_id) VALUES (?1, ?2, NULL)",
            params![name, base_id],
        )?;
        if created == 0 {
            trace!("Light already registered, keeping stored base id");
        }
        Ok(())
    }

    /// Registers every light in `lights` without a group
    pub fn add_lights<'a, I>(&self, lights: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        for (name, base_id) in lights {
            self.add_light(name, base_id)?;
        }
        Ok(())
    }

    /// Places a light in a group, creating the light if it is unknown.
    ///
    /// An existing light is moved out of whatever group held it; its stored `base_id`
    /// is kept. Fails with [`Error::GroupNotFound`] without touching any light when the
    /// group does not exist.
    #[instrument(skip(self))]
    pub fn add_light_to_group(&self, light_name: &str, base_id: i64, group_name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let group_id = find_group_id(&tx, group_name)?
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;

        let moved = tx.execute(
            "UPDATE lights SET group_id = ?1 WHERE name = ?2",
            params![group_id, light_name],
        )?;
        if moved == 0 {
            tx.execute(
                "INSERT INTO lights (name, base_station_id, group_id) VALUES (?1, ?2, ?3)",
                params![light_name, base_id, group_id],
            )?;
            debug!("Created light in group");
        } else {
            debug!("Moved existing light to group");
        }

        tx.commit()?;
        Ok(())
    }

    /// Places each light in the group in order.
    ///
    /// Not atomic: lights handled before a failure stay committed.
    pub fn add_lights_to_group<'a, I>(&self, lights: I, group_name: &str) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        for (name, base_id) in lights {
            self.add_light_to_group(name, base_id, group_name)?;
        }
        Ok(())
    }

    /// Makes `child_name` a sub-group of `parent_name`.
    ///
    /// Rejects the move with [`Error::CycleDetected`] if the child is the parent itself
    /// or one of its ancestors.
    #[instrument(skip(self))]
    pub fn add_group_to_group(&self, child_name: &str, parent_name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let parent_id = find_group_id(&tx, parent_name)?
            .ok_or_else(|| Error::GroupNotFound(parent_name.to_string()))?;
        let child_id = find_group_id(&tx, child_name)?
            .ok_or_else(|| Error::GroupNotFound(child_name.to_string()))?;

        // Walk up from the new parent; meeting the child means it would become its own ancestor
        let mut seen = HashSet::new();
        let mut cursor = Some(parent_id);
        while let Some(id) = cursor {
            if id == child_id {
                warn!("Rejected group assignment that would create a cycle");
                return Err(Error::CycleDetected {
                    child: child_name.to_string(),
                    parent: parent_name.to_string(),
                });
            }
            if !seen.insert(id) {
                break;
            }
            cursor = tx
                .query_row(
                    "SELECT parent_group_id FROM groups WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten();
        }

        tx.execute(
            "UPDATE groups SET parent_group_id = ?1 WHERE id = ?2",
            params![parent_id, child_id],
        )?;
        tx.commit()?;
        debug!("Nested group");
        Ok(())
    }

    /// Returns `{light: base_id}` if the light sits directly in the group, else an empty map
    #[instrument(skip(self))]
    pub fn get_light_in_group(&self, light_name: &str, group_name: &str) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let group_id = exactly_one(&conn, "SELECT id FROM groups WHERE name = ?1", "group", group_name)?;
        let (light_group, base_id): (Option<i64>, i64) = {
            let mut stmt = conn.prepare("SELECT group_id, base_station_id FROM lights WHERE name = ?1")?;
            let rows = stmt
                .query_map(params![light_name], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            single(rows, "light", light_name)?
        };

        let mut found = BTreeMap::new();
        if light_group == Some(group_id) {
            found.insert(light_name.to_string(), base_id);
        }
        Ok(found)
    }

    /// Returns every light in the group or any of its descendant groups
    #[instrument(skip(self))]
    pub fn get_lights_in_group(&self, group_name: &str) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let root = exactly_one(&conn, "SELECT id FROM groups WHERE name = ?1", "group", group_name)?;

        let mut lights_stmt =
            conn.prepare("SELECT name, base_station_id FROM lights WHERE group_id = ?1")?;
        let mut children_stmt = conn.prepare("SELECT id FROM groups WHERE parent_group_id = ?1")?;

        let mut lights = BTreeMap::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(group_id) = stack.pop() {
            if !visited.insert(group_id) {
                continue;
            }
            let rows = lights_stmt.query_map(params![group_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (name, base_id) = row?;
                lights.insert(name, base_id);
            }
            let children = children_stmt.query_map(params![group_id], |row| row.get::<_, i64>(0))?;
            for child in children {
                stack.push(child?);
            }
        }

        trace!(count = lights.len(), "Collected lights");
        Ok(lights)
    }

    /// Returns every light in the store, grouped or not
    pub fn get_lights(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name, base_station_id FROM lights")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(Error::from)
    }

    /// Returns the name of every group in the store
    pub fn get_groups(&self) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM groups")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<BTreeSet<_>>>()
            .map_err(Error::from)
    }

    /// Returns the lights placed directly in a group, without descending into sub-groups
    pub fn get_direct_lights(&self, group_name: &str) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let group_id = find_group_id(&conn, group_name)?
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;
        let mut stmt = conn.prepare("SELECT name, base_station_id FROM lights WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(Error::from)
    }

    /// Returns the lights registered with [`GroupStore::add_light`] and never placed
    pub fn get_ungrouped_lights(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, base_station_id FROM lights WHERE group_id IS NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(Error::from)
    }

    /// Returns the names of the direct sub-groups of a group
    pub fn get_child_groups(&self, group_name: &str) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock();
        let group_id = find_group_id(&conn, group_name)?
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;
        let mut stmt = conn.prepare("SELECT name FROM groups WHERE parent_group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<BTreeSet<_>>>()
            .map_err(Error::from)
    }

    /// Returns the parent of a group, `None` for a root group
    pub fn get_parent_group(&self, group_name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT parent.name FROM groups child
                 LEFT JOIN groups parent ON parent.id = child.parent_group_id
                 WHERE child.name = ?1",
                params![group_name],
                |row| row.get(0),
            )
            .optional()?;
        parent.ok_or_else(|| Error::GroupNotFound(group_name.to_string()))
    }

    /// Deletes every light, then every group.
    ///
    /// The uncategorized group goes too; call [`GroupStore::initialize`] to restore it.
    #[instrument(skip(self))]
    pub fn purge(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let lights = tx.execute("DELETE FROM lights", [])?;
        tx.execute("UPDATE groups SET parent_group_id = NULL", [])?;
        let groups = tx.execute("DELETE FROM groups", [])?;
        tx.commit()?;
        info!(lights, groups, "Purged group store");
        Ok(())
    }
}

fn find_group_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM groups WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::from)
}

/// Runs a single-column id lookup that must match exactly one row
fn exactly_one(conn: &Connection, sql: &str, entity: &'static str, name: &str) -> Result<i64> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![name], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    single(rows, entity, name)
}

fn single<T>(mut rows: Vec<T>, entity: &'static str, name: &str) -> Result<T> {
    if rows.len() != 1 {
        return Err(Error::AmbiguousOrMissingEntity {
            entity,
            name: name.to_string(),
            matches: rows.len(),
        });
    }
    Ok(rows.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GroupStore {
        let store = GroupStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn initialize_creates_single_uncategorized_group() {
        let store = store();
        store.initialize().unwrap();
        store.initialize().unwrap();

        let groups = store.get_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups.contains(UNCATEGORIZED));
        assert!(store.get_lights_in_group(UNCATEGORIZED).unwrap().is_empty());
    }

    #[test]
    fn add_group_reports_duplicates() {
        let store = store();
        assert!(store.add_group("Kitchen").unwrap());
        assert!(!store.add_group("Kitchen").unwrap());
        assert_eq!(store.get_groups().unwrap().len(), 2);
    }

    #[test]
    fn add_light_keeps_existing_base_id() {
        let store = store();
        store.add_light("Lamp", 1).unwrap();
        store.add_light("Lamp", 2).unwrap();

        let lights = store.get_lights().unwrap();
        assert_eq!(lights.len(), 1);
        assert_eq!(lights["Lamp"], 1);
    }

    #[test]
    fn add_lights_registers_ungrouped_lights() {
        let store = store();
        let names: Vec<String> = (0..100).map(|i| format!("Light {i}")).collect();
        store
            .add_lights(names.iter().enumerate().map(|(i, n)| (n.as_str(), i as i64)))
            .unwrap();

        assert_eq!(store.get_lights().unwrap().len(), 100);
        assert!(store.get_lights_in_group(UNCATEGORIZED).unwrap().is_empty());
    }

    #[test]
    fn assigning_twice_moves_the_light() {
        let store = store();
        store.add_group("A").unwrap();
        store.add_group("B").unwrap();

        store.add_light_to_group("L", 5, "A").unwrap();
        store.add_light_to_group("L", 5, "B").unwrap();

        assert_eq!(store.get_lights().unwrap().len(), 1);
        assert!(store.get_lights_in_group("A").unwrap().is_empty());
        assert_eq!(store.get_lights_in_group("B").unwrap()["L"], 5);
    }

    #[test]
    fn moving_a_light_keeps_its_stored_base_id() {
        let store = store();
        store.add_group("A").unwrap();
        store.add_light("L", 3).unwrap();
        store.add_light_to_group("L", 9, "A").unwrap();

        assert_eq!(store.get_lights_in_group("A").unwrap()["L"], 3);
    }

    #[test]
    fn unknown_group_creates_no_light() {
        let store = store();
        let err = store.add_light_to_group("L", 1, "does-not-exist").unwrap_err();

        assert!(matches!(err, Error::GroupNotFound(name) if name == "does-not-exist"));
        assert!(store.get_lights().unwrap().is_empty());
    }

    #[test]
    fn bulk_assignment_is_not_rolled_back() {
        let store = store();
        store.add_group("A").unwrap();
        store
            .add_lights_to_group([("x", 1), ("y", 2)], "A")
            .unwrap();
        assert!(store.add_lights_to_group([("z", 3)], "missing").is_err());

        assert_eq!(store.get_lights_in_group("A").unwrap().len(), 2);
        assert_eq!(store.get_lights().unwrap().len(), 2);
    }

    #[test]
    fn lights_in_group_are_transitive() {
        let store = store();
        for name in ["A", "B", "C"] {
            store.add_group(name).unwrap();
        }
        store.add_group_to_group("B", "A").unwrap();
        store.add_group_to_group("C", "B").unwrap();
        store.add_light_to_group("x", 1, "B").unwrap();
        store.add_light_to_group("y", 2, "C").unwrap();

        let all = store.get_lights_in_group("A").unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["x", "y"]);

        let b = store.get_lights_in_group("B").unwrap();
        assert_eq!(b.len(), 2);
        store.add_group_to_group("C", "A").unwrap();
        let b = store.get_lights_in_group("B").unwrap();
        assert_eq!(b.into_iter().collect::<Vec<_>>(), vec![("x".to_string(), 1)]);
    }

    #[test]
    fn nesting_requires_both_groups() {
        let store = store();
        store.add_group("A").unwrap();

        assert!(matches!(
            store.add_group_to_group("A", "nope"),
            Err(Error::GroupNotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            store.add_group_to_group("nope", "A"),
            Err(Error::GroupNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn nesting_rejects_cycles() {
        let store = store();
        for name in ["A", "B", "C"] {
            store.add_group(name).unwrap();
        }
        store.add_group_to_group("B", "A").unwrap();
        store.add_group_to_group("C", "B").unwrap();

        assert!(matches!(
            store.add_group_to_group("A", "C"),
            Err(Error::CycleDetected { .. })
        ));
        assert!(matches!(
            store.add_group_to_group("A", "A"),
            Err(Error::CycleDetected { .. })
        ));
        assert_eq!(store.get_parent_group("A").unwrap(), None);
    }

    #[test]
    fn regrouping_a_subtree_is_allowed() {
        let store = store();
        for name in ["A", "B", "C"] {
            store.add_group(name).unwrap();
        }
        store.add_group_to_group("C", "B").unwrap();
        store.add_group_to_group("C", "A").unwrap();

        assert_eq!(store.get_parent_group("C").unwrap().as_deref(), Some("A"));
        assert!(store.get_child_groups("B").unwrap().is_empty());
        assert!(store.get_child_groups("A").unwrap().contains("C"));
    }

    #[test]
    fn light_in_group_is_a_direct_check() {
        let store = store();
        store.add_group("A").unwrap();
        store.add_group("B").unwrap();
        store.add_group_to_group("B", "A").unwrap();
        store.add_light_to_group("x", 4, "B").unwrap();

        let direct = store.get_light_in_group("x", "B").unwrap();
        assert_eq!(direct.get("x"), Some(&4));
        assert!(store.get_light_in_group("x", "A").unwrap().is_empty());
    }

    #[test]
    fn light_in_group_requires_exact_matches() {
        let store = store();
        store.add_group("A").unwrap();

        assert!(matches!(
            store.get_light_in_group("ghost", "A"),
            Err(Error::AmbiguousOrMissingEntity { entity: "light", matches: 0, .. })
        ));
        assert!(matches!(
            store.get_light_in_group("ghost", "nowhere"),
            Err(Error::AmbiguousOrMissingEntity { entity: "group", matches: 0, .. })
        ));
        assert!(matches!(
            store.get_lights_in_group("nowhere"),
            Err(Error::AmbiguousOrMissingEntity { entity: "group", .. })
        ));
    }

    #[test]
    fn direct_and_ungrouped_listings() {
        let store = store();
        store.add_group("A").unwrap();
        store.add_group("B").unwrap();
        store.add_group_to_group("B", "A").unwrap();
        store.add_light_to_group("top", 1, "A").unwrap();
        store.add_light_to_group("nested", 2, "B").unwrap();
        store.add_light("loose", 3).unwrap();

        let direct = store.get_direct_lights("A").unwrap();
        assert_eq!(direct.keys().collect::<Vec<_>>(), vec!["top"]);
        let ungrouped = store.get_ungrouped_lights().unwrap();
        assert_eq!(ungrouped.keys().collect::<Vec<_>>(), vec!["loose"]);
        assert!(matches!(store.get_direct_lights("nope"), Err(Error::GroupNotFound(_))));
    }

    #[test]
    fn purge_empties_the_store() {
        let store = store();
        store.add_group("A").unwrap();
        store.add_group("B").unwrap();
        store.add_group_to_group("B", "A").unwrap();
        store.add_light_to_group("x", 1, "B").unwrap();
        store.add_light("loose", 2).unwrap();

        store.purge().unwrap();
        assert!(store.get_lights().unwrap().is_empty());
        assert!(store.get_groups().unwrap().is_empty());

        store.purge().unwrap();
        store.initialize().unwrap();
        assert_eq!(store.get_groups().unwrap().len(), 1);
    }

    #[test]
    fn unreachable_location_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let err = GroupStore::open_path(&blocker.join("groups.db")).unwrap_err();
        assert!(matches!(err, Error::StorageLocation { ref path, .. } if path == &blocker));
        assert!(err.to_string().starts_with("Storage error"));
    }

    #[test]
    fn file_store_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("groups.db");
        {
            let store = GroupStore::open_path(&path).unwrap();
            store.initialize().unwrap();
            store.add_group("Office").unwrap();
            store.add_light_to_group("Desk", 12, "Office").unwrap();
        }

        let store = GroupStore::open(&StoreConfig::new(&path)).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.get_lights_in_group("Office").unwrap()["Desk"], 12);
        assert_eq!(store.get_groups().unwrap().len(), 2);
    }
}
