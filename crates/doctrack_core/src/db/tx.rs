//! Write-transaction helper shared by engine and service writes.
//!
//! # Invariants
//! - Work runs inside `BEGIN IMMEDIATE`, so the database write lock is held
//!   from the first statement until commit.
//! - When the caller already has a transaction open, work joins it and the
//!   caller stays responsible for commit or rollback.

use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Runs `work` inside an immediate transaction on `conn`.
///
/// Commits when `work` succeeds and rolls back when it fails. Busy errors
/// surface after the connection busy timeout; nothing is retried.
pub fn with_immediate_transaction<T, E>(
    conn: &Connection,
    work: impl FnOnce(&Connection) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<rusqlite::Error>,
{
    if !conn.is_autocommit() {
        return work(conn);
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = work(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::with_immediate_transaction;
    use rusqlite::Connection;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL);")
            .unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t;", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn commits_on_success() {
        let conn = conn();
        with_immediate_transaction::<_, rusqlite::Error>(&conn, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1);", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&conn), 1);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn rolls_back_on_error() {
        let conn = conn();
        let result = with_immediate_transaction::<(), rusqlite::Error>(&conn, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1);", [])?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn joins_open_transaction() {
        let conn = conn();
        conn.execute_batch("BEGIN;").unwrap();
        with_immediate_transaction::<_, rusqlite::Error>(&conn, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1);", [])?;
            Ok(())
        })
        .unwrap();
        assert!(!conn.is_autocommit());
        conn.execute_batch("ROLLBACK;").unwrap();
        assert_eq!(count(&conn), 0);
    }
}
