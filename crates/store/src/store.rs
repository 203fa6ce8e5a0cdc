use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, ReadableTableMetadata};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::schema::SCHEMA_VERSION;
use crate::txn::{
    CHILDREN_TABLE, META_SCHEMA_VERSION, META_TABLE, NODES_TABLE, ReadTxn, Txn, TxnMode,
    WriteTxn, load_all_nodes, load_meta,
};

/// Owner of the redb file.  Cheap reads go through [`MirrorStore::read`];
/// every write goes through one [`WriteTxn`] per reconciled batch.
pub struct MirrorStore {
    db: Database,
    path: PathBuf,
    migrated_from: Option<u32>,
}

impl std::fmt::Debug for MirrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorStore")
            .field("path", &self.path)
            .field("migrated_from", &self.migrated_from)
            .finish()
    }
}

impl MirrorStore {
    /// Open or create the mirror at `path`.
    ///
    /// The schema stamp is checked before anything else can touch the file:
    /// an older stamp is migrated in place, a newer one is rejected with
    /// [`StoreError::SchemaMismatch`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&path).map_err(|err| {
            StoreError::Unavailable(format!("opening redb mirror at {}: {err}", path.display()))
        })?;

        let mut store = Self {
            db,
            path,
            migrated_from: None,
        };
        store.migrated_from = store.check_schema()?;
        Ok(store)
    }

    /// Delete the mirror file and re-create it empty.
    pub fn reset(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version the file was migrated from during this open, if any.
    pub fn migrated_from(&self) -> Option<u32> {
        self.migrated_from
    }

    pub fn open_transaction(&self, mode: TxnMode) -> Result<Txn> {
        Ok(match mode {
            TxnMode::ReadOnly => Txn::Read(self.read()?),
            TxnMode::ReadWrite => Txn::Write(self.write()?),
        })
    }

    pub fn read(&self) -> Result<ReadTxn> {
        Ok(ReadTxn::new(self.db.begin_read()?))
    }

    pub fn write(&self) -> Result<WriteTxn> {
        Ok(WriteTxn::new(self.db.begin_write()?))
    }

    fn check_schema(&self) -> Result<Option<u32>> {
        let mut tx = self.write()?;
        let (stamp, has_nodes) = {
            let raw = tx.raw();
            let nodes = raw.open_table(NODES_TABLE)?;
            raw.open_table(CHILDREN_TABLE)?;
            let meta = raw.open_table(META_TABLE)?;
            let stamp: Option<u32> = load_meta(&meta, META_SCHEMA_VERSION)?;
            (stamp, nodes.len()? > 0)
        };

        let from = match stamp {
            Some(version) if version == SCHEMA_VERSION => None,
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StoreError::SchemaMismatch {
                    found: version,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(version) => Some(version),
            // Unstamped files with data predate the stamp, i.e. version 1.
            None if has_nodes => Some(1),
            None => None,
        };

        if let Some(version) = from {
            warn!(
                from = version,
                to = SCHEMA_VERSION,
                path = %self.path.display(),
                "mirror schema is out of date; migrating"
            );
            migrate(&mut tx, version).map_err(|err| StoreError::MigrationFailed {
                from: version,
                reason: err.to_string(),
            })?;
        }

        tx.put_meta(META_SCHEMA_VERSION, &SCHEMA_VERSION)?;
        tx.commit()?;
        Ok(from)
    }
}

fn migrate(tx: &mut WriteTxn, from: u32) -> Result<()> {
    if from < 2 {
        rebuild_children_index(tx)?;
    }
    Ok(())
}

/// Version 2 introduced the `(parent, child)` index; derive it from the
/// node rows.
fn rebuild_children_index(tx: &mut WriteTxn) -> Result<()> {
    let raw = tx.raw();
    let nodes = {
        let table = raw.open_table(NODES_TABLE)?;
        load_all_nodes(&table)?
    };
    let mut children = raw.open_table(CHILDREN_TABLE)?;
    let stale: Vec<(String, String)> = children
        .iter()?
        .filter_map(|r| {
            r.ok().map(|(k, _)| {
                let (parent, child) = k.value();
                (parent.to_string(), child.to_string())
            })
        })
        .collect();
    for (parent, child) in &stale {
        children.remove((parent.as_str(), child.as_str()))?;
    }
    for node in &nodes {
        children.insert((node.parent_key(), node.id.as_str()), ())?;
    }
    info!(nodes = nodes.len(), "children index rebuilt");
    Ok(())
}
