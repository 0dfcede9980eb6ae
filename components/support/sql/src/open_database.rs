/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Open and migrate SQLite databases.
//!
//! Components describe their schema with a [`ConnectionInitializer`]:
//!
//!   - a brand new database gets `init()` run against it;
//!   - an existing database gets `upgrade_from(v)` for each version between
//!     its stored `user_version` and `END_VERSION`;
//!   - `prepare()` runs first on every open (pragmas), `finish()` runs last
//!     (temp tables, sanity checks).
//!
//! The whole init/upgrade sequence runs inside one transaction, so a crash
//! mid-migration leaves the previous version intact.

use crate::ConnExt;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Upgrade functions return this to signal the database is beyond repair.
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Schema description for one database. The init/upgrade functions run
/// inside a transaction managed by `open_database`; they must not commit or
/// roll back themselves.
pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that `init` and the upgrades combined leave the schema at.
    const END_VERSION: u32;

    // Runs immediately after the connection opens, outside the migration
    // transaction. Pragmas only.
    fn prepare(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    // Initialize a fresh database to END_VERSION.
    fn init(&self, conn: &Connection) -> Result<()>;

    // Upgrade from `version` to `version + 1`.
    fn upgrade_from(&self, conn: &Connection, version: u32) -> Result<()>;

    // Runs on every open after init/upgrade, inside the transaction.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(initializer: &CI) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    run_migration_logic(&conn, initializer)?;
    Ok(conn)
}

pub fn open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    initializer: &CI,
) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, open_flags)?;
    run_migration_logic(&conn, initializer)?;
    Ok(conn)
}

fn run_migration_logic<CI: ConnectionInitializer>(
    conn: &Connection,
    initializer: &CI,
) -> Result<()> {
    log::debug!("{}: opening database", CI::NAME);
    initializer.prepare(conn)?;
    let tx = conn.unchecked_transaction_imm()?;
    let mut current = get_schema_version(&tx)?;
    if current == 0 {
        log::debug!("{}: initializing new database", CI::NAME);
        initializer.init(&tx)?;
    } else {
        if current > CI::END_VERSION {
            return Err(Error::IncompatibleVersion(current));
        }
        while current < CI::END_VERSION {
            log::debug!("{}: upgrading from version {}", CI::NAME, current);
            initializer.upgrade_from(&tx, current)?;
            current += 1;
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    initializer.finish(&tx)?;
    tx.commit()?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row_and_then("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
    Ok(())
}
