//! # Row Store
//!
//! Durable, crash-consistent storage of [`Turn`] records, grouped by `session_id`.
//! This is the system of record: the ANN Index is derived from it and can always be
//! rebuilt from a full scan (see [`crate::ann`]).
//!
//! Backed by SQLite in WAL mode through a pooled set of connections (`diesel` + `r2d2`).
//! Writers serialize at the SQLite level; readers run concurrently against the pool.

use crate::error::{GhostWireError, GhostWireResult};
use crate::models::{NewTurn, Turn};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Open (creating if necessary) the SQLite database at `db_path`, enable WAL mode, run
/// pending migrations, and return a connection pool.
pub fn establish_pool(db_path: &str) -> GhostWireResult<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let mut builder = Pool::builder();
    if db_path == ":memory:" {
        // A pooled `:memory:` database is private per connection; cap the pool at a
        // single connection so all callers see the same in-memory database.
        builder = builder.max_size(1);
    }
    let pool = builder
        .build(manager)
        .map_err(|e| GhostWireError::storage(format!("failed to build connection pool: {e}")))?;

    {
        let mut conn = pool
            .get()
            .map_err(|e| GhostWireError::storage(format!("failed to get connection: {e}")))?;
        diesel::sql_query("PRAGMA journal_mode=WAL;")
            .execute(&mut conn)
            .map_err(|e| GhostWireError::storage(format!("failed to enable WAL: {e}")))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| GhostWireError::storage(format!("migration failed: {e}")))?;
    }

    Ok(pool)
}

/// Encode a slice of `f32` as a raw little-endian byte blob, the on-disk representation
/// of an embedding column.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a raw float32 byte blob back into a vector. Returns `None` if the length is
/// not a multiple of 4 bytes (a corrupt or truncated row).
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

fn now_unix_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Insert a new turn and return the assigned id.
pub fn insert(
    conn: &mut DbConn,
    session_id: &str,
    prompt: &str,
    answer: &str,
    embedding: &[f32],
) -> GhostWireResult<i32> {
    use crate::schema::turns::dsl;

    let new_turn = NewTurn {
        session_id: session_id.to_string(),
        prompt_text: prompt.to_string(),
        answer_text: answer.to_string(),
        timestamp: now_unix_seconds(),
        embedding: encode_embedding(embedding),
        summary_text: None,
    };

    diesel::insert_into(dsl::turns)
        .values(&new_turn)
        .returning(dsl::id)
        .get_result(conn)
        .map_err(|e| GhostWireError::storage(format!("insert failed: {e}")))
}

/// Turns for a session, ordered by timestamp descending, capped at `limit`.
pub fn by_session(conn: &mut DbConn, session_id: &str, limit: i64) -> GhostWireResult<Vec<Turn>> {
    use crate::schema::turns::dsl;

    dsl::turns
        .filter(dsl::session_id.eq(session_id))
        .order(dsl::timestamp.desc())
        .limit(limit)
        .select(Turn::as_select())
        .load(conn)
        .map_err(|e| GhostWireError::storage(format!("by_session failed: {e}")))
}

/// Materialize turns by id, filtered to rows whose session matches. Used to turn ANN
/// neighbor ids into real rows while silently dropping orphans/foreign-session leaks.
pub fn by_ids(conn: &mut DbConn, ids: &[i32], session_id: &str) -> GhostWireResult<Vec<Turn>> {
    use crate::schema::turns::dsl;

    dsl::turns
        .filter(dsl::id.eq_any(ids))
        .filter(dsl::session_id.eq(session_id))
        .select(Turn::as_select())
        .load(conn)
        .map_err(|e| GhostWireError::storage(format!("by_ids failed: {e}")))
}

/// All `(id, embedding blob)` pairs in the store, for ANN warm rebuild. Rows whose
/// blob length doesn't decode cleanly are skipped by the caller, not here.
pub fn all_embeddings(conn: &mut DbConn) -> GhostWireResult<Vec<(i32, Vec<u8>)>> {
    use crate::schema::turns::dsl;

    dsl::turns
        .select((dsl::id, dsl::embedding))
        .load(conn)
        .map_err(|e| GhostWireError::storage(format!("all_embeddings failed: {e}")))
}

/// Delete all rows for `session_id` and record it in the dropped-collection marker set.
/// Returns `true` if any rows existed prior to deletion.
pub fn drop_session(conn: &mut DbConn, session_id: &str) -> GhostWireResult<bool> {
    use crate::schema::dropped_collections::dsl as dropped_dsl;
    use crate::schema::turns::dsl;

    let existing = size_of(conn, session_id)?;

    diesel::delete(dsl::turns.filter(dsl::session_id.eq(session_id)))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("drop failed: {e}")))?;

    diesel::insert_or_ignore_into(dropped_dsl::dropped_collections)
        .values((
            dropped_dsl::name.eq(session_id),
            dropped_dsl::dropped_at.eq(now_unix_seconds()),
        ))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("marker insert failed: {e}")))?;

    Ok(existing > 0)
}

/// Whether `session_id` has been explicitly dropped.
pub fn is_dropped(conn: &mut DbConn, session_id: &str) -> GhostWireResult<bool> {
    use crate::schema::dropped_collections::dsl;

    let count: i64 = dsl::dropped_collections
        .filter(dsl::name.eq(session_id))
        .count()
        .get_result(conn)
        .map_err(|e| GhostWireError::storage(format!("is_dropped failed: {e}")))?;
    Ok(count > 0)
}

/// Number of rows currently stored for a session.
pub fn size_of(conn: &mut DbConn, session_id: &str) -> GhostWireResult<i64> {
    use crate::schema::turns::dsl;

    dsl::turns
        .filter(dsl::session_id.eq(session_id))
        .count()
        .get_result(conn)
        .map_err(|e| GhostWireError::storage(format!("size_of failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> DbPool {
        establish_pool(":memory:").unwrap()
    }

    #[test]
    fn embedding_roundtrips_through_blob_encoding() {
        let v = vec![1.0_f32, -2.5, 0.0, 3.25];
        let blob = encode_embedding(&v);
        assert_eq!(blob.len(), 16);
        let decoded = decode_embedding(&blob).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn truncated_blob_fails_to_decode() {
        let blob = vec![0u8, 1, 2];
        assert!(decode_embedding(&blob).is_none());
    }

    #[test]
    fn insert_then_by_session_round_trips() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        let id = insert(&mut conn, "s1", "hello", "hi there", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(id > 0);

        let rows = by_session(&mut conn, "s1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prompt_text, "hello");
        assert_eq!(rows[0].answer_text, "hi there");
    }

    #[test]
    fn by_ids_filters_foreign_session() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        let id_a = insert(&mut conn, "a", "p1", "a1", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let id_b = insert(&mut conn, "b", "p2", "a2", &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let rows = by_ids(&mut conn, &[id_a, id_b], "a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id, "a");
    }

    #[test]
    fn drop_removes_rows_and_marks_session() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        insert(&mut conn, "gone", "p", "a", &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let had_rows = drop_session(&mut conn, "gone").unwrap();
        assert!(had_rows);
        assert_eq!(size_of(&mut conn, "gone").unwrap(), 0);
        assert!(is_dropped(&mut conn, "gone").unwrap());
    }

    #[test]
    fn all_embeddings_returns_every_row() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        insert(&mut conn, "s", "p1", "a1", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        insert(&mut conn, "s", "p2", "a2", &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let all = all_embeddings(&mut conn).unwrap();
        assert_eq!(all.len(), 2);
    }
}
