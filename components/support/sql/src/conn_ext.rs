/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    self, types::FromSql, Connection, Params, Result as SqlResult, Row, Savepoint, Transaction,
    TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

/// Query helpers shared by everything that wraps a `rusqlite::Connection`.
/// Implement `conn()` and the rest comes for free; note that you must import
/// `ConnExt` to call these on a `Connection`/`Transaction` directly.
pub trait ConnExt {
    /// The method you need to implement to opt in to all of this.
    fn conn(&self) -> &Connection;

    /// Like `Connection::execute`, but keeps the prepared statement in the
    /// connection's statement cache.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that
    /// result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row_and_then(sql, [], |row| row.get(0))
    }

    /// Run a query expected to return at most one row; `None` when it
    /// returns no rows at all. Always cached.
    fn try_query_row<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    /// Run a query and collect every mapped row, with a cached statement and
    /// a fallible mapper.
    fn query_rows_and_then_cached<T, E, P, F>(
        &self,
        sql: &str,
        params: P,
        mapper: F,
    ) -> Result<Vec<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnMut(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_and_then(params, mapper)?;
        rows.collect()
    }

    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }

    /// As `unchecked_transaction`, but begins IMMEDIATE - use for write
    /// transactions so lock acquisition fails fast instead of at commit.
    fn unchecked_transaction_imm(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Immediate)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Savepoint<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite, in an attempt to save us from ourselves, requires a mutable
/// reference to a connection to start a transaction. That's a problem for
/// connections owned by structs handed out behind shared references, so we
/// offer this alternative - the responsibility of ensuring there's no nested
/// transaction is on our head.
pub struct UncheckedTransaction<'conn> {
    pub conn: &'conn Connection,
    started_at: Instant,
    finished: bool,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let query = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => unreachable!("unknown transaction behavior"),
        };
        conn.execute_batch(query)
            .map(move |_| UncheckedTransaction {
                conn,
                started_at: Instant::now(),
                finished: false,
            })
    }

    /// Consumes and commits an unchecked transaction.
    pub fn commit(mut self) -> SqlResult<()> {
        self.finished = true;
        self.conn.execute_batch("COMMIT")?;
        log::trace!(
            "Transaction committed after {:?}",
            self.started_at.elapsed()
        );
        Ok(())
    }

    /// Consumes and rolls back an unchecked transaction.
    pub fn rollback(mut self) -> SqlResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            log::warn!("Error rolling back unchecked transaction: {}", e);
        }
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        conn
    }

    #[test]
    fn test_try_query_row() {
        let conn = conn();
        conn.execute("INSERT INTO t (id, name) VALUES (1, 'a')", [])
            .unwrap();
        let got: Option<String> = conn
            .try_query_row(
                "SELECT name FROM t WHERE id = :id",
                rusqlite::named_params! { ":id": 1 },
                |row| row.get(0).map_err(rusqlite::Error::from),
            )
            .unwrap();
        assert_eq!(got.as_deref(), Some("a"));
        let missing: Option<String> = conn
            .try_query_row(
                "SELECT name FROM t WHERE id = :id",
                rusqlite::named_params! { ":id": 2 },
                |row| row.get(0).map_err(rusqlite::Error::from),
            )
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_unchecked_transaction_rolls_back_on_drop() {
        let conn = conn();
        {
            let tx = conn.unchecked_transaction().unwrap();
            tx.execute("INSERT INTO t (id, name) VALUES (1, 'a')", [])
                .unwrap();
            // dropped without commit
        }
        let n: i64 = ConnExt::query_one(&conn, "SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_unchecked_transaction_commit() {
        let conn = conn();
        let tx = conn.unchecked_transaction_imm().unwrap();
        tx.execute("INSERT INTO t (id, name) VALUES (1, 'a')", [])
            .unwrap();
        tx.commit().unwrap();
        let n: i64 = ConnExt::query_one(&conn, "SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(n, 1);
    }
}
