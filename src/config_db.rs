use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::Result;

/// Global settings, keyed by `section.field`.
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
/// Per-user overrides, keyed by `(user, section.field)`.
const USER_SETTINGS: TableDefinition<(&str, &str), &str> =
    TableDefinition::new("user_settings");

/// Key-value store for configuration overrides.
///
/// Values are stored as the raw strings the user typed; interpreting them
/// is up to [`RagConfig::apply_setting`](crate::config::RagConfig::apply_setting).
pub struct ConfigDb {
    db: Database,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(SETTINGS)?;
        txn.open_table(USER_SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Global settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }

    // -- Per-user settings --

    pub fn set_user_setting(
        &self,
        user: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USER_SETTINGS)?;
            table.insert((user, key), value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_user_setting(
        &self,
        user: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USER_SETTINGS)?;
        Ok(table.get((user, key))?.map(|v| v.value().to_string()))
    }

    pub fn remove_user_setting(&self, user: &str, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(USER_SETTINGS)?;
            table.remove((user, key))?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// All overrides stored for `user`, ordered by key.
    pub fn user_settings(&self, user: &str) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USER_SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (owner, key) = k.value();
            if owner == user {
                result.push((key.to_string(), v.value().to_string()));
            }
        }
        Ok(result)
    }

    /// Remove every override stored for `user`.
    pub fn clear_user_settings(&self, user: &str) -> Result<usize> {
        let keys: Vec<String> =
            self.user_settings(user)?.into_iter().map(|(k, _)| k).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USER_SETTINGS)?;
            for key in &keys {
                table.remove((user, key.as_str()))?;
            }
        }
        txn.commit()?;
        Ok(keys.len())
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}
