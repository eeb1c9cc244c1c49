//! # Cache
//!
//! Two independent stores that let the RAG Orchestrator skip a generation round trip:
//!
//! - the *exact* store, keyed by literal `(session_id, query_text)` — an O(1) lookup;
//! - the *approximate* store, keyed by a fingerprint but matched by a bounded vector
//!   scan over the session's most recent unexpired entries.
//!
//! An exact hit is always preferred over an approximate hit, and both are preferred
//! over invoking the generator — the orchestrator enforces that ordering, not this
//! module; this module just answers "is there a hit" for either kind.

use crate::error::{GhostWireError, GhostWireResult};
use crate::models::{CacheApproxRow, NewCacheApproxRow, NewCacheExactRow};
use crate::store::{decode_embedding, encode_embedding, DbConn};
use diesel::prelude::*;

/// Bound on how many of a session's most recent approximate-cache entries are
/// scanned per lookup, matching the reference system's "100 most recent" window.
const APPROX_SCAN_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: String,
    pub context: Option<String>,
    pub similarity: Option<f32>,
}

fn now_unix_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// SHA-256 fingerprint of `(session_id, query, embedding)`, used as the approximate
/// cache's lookup key. The embedding is serialized with stable key ordering (a plain
/// JSON array) so the same vector always hashes identically.
pub fn fingerprint(session_id: &str, query: &str, embedding: &[f32]) -> String {
    let embedding_json =
        serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string());
    let content = format!("{session_id}:{query}:{embedding_json}");
    sha256::digest(content)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Purge expired rows from both cache tables. Opportunistically called from every
/// lookup, mirroring the "clean expired entries first" step of the reference system.
fn purge_expired(conn: &mut DbConn) -> GhostWireResult<()> {
    use crate::schema::{cache_approx, cache_exact};

    let now = now_unix_seconds();
    diesel::delete(cache_exact::table.filter(cache_exact::expires_at.lt(now)))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("purge cache_exact failed: {e}")))?;
    diesel::delete(cache_approx::table.filter(cache_approx::expires_at.lt(now)))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("purge cache_approx failed: {e}")))?;
    Ok(())
}

/// Exact lookup by `(session_id, query)`.
pub fn get_exact(
    conn: &mut DbConn,
    session_id: &str,
    query: &str,
) -> GhostWireResult<Option<CacheHit>> {
    use crate::schema::cache_exact::dsl;

    purge_expired(conn)?;

    let row: Option<(String, Option<String>)> = dsl::cache_exact
        .filter(dsl::session_id.eq(session_id))
        .filter(dsl::query.eq(query))
        .filter(dsl::expires_at.gt(now_unix_seconds()))
        .select((dsl::response, dsl::context))
        .first(conn)
        .optional()
        .map_err(|e| GhostWireError::storage(format!("get_exact failed: {e}")))?;

    Ok(row.map(|(response, context)| CacheHit {
        response,
        context,
        similarity: None,
    }))
}

/// Insert or replace an exact-cache entry with the given TTL (in minutes).
pub fn put_exact(
    conn: &mut DbConn,
    session_id: &str,
    query: &str,
    response: &str,
    context: Option<&str>,
    ttl_minutes: i64,
) -> GhostWireResult<()> {
    use crate::schema::cache_exact::dsl;

    let now = now_unix_seconds();
    let new_row = NewCacheExactRow {
        session_id: session_id.to_string(),
        query: query.to_string(),
        response: response.to_string(),
        context: context.map(str::to_string),
        created_at: now,
        expires_at: now + (ttl_minutes as f64) * 60.0,
    };

    diesel::insert_into(dsl::cache_exact)
        .values(&new_row)
        .on_conflict((dsl::session_id, dsl::query))
        .do_update()
        .set((
            dsl::response.eq(&new_row.response),
            dsl::context.eq(&new_row.context),
            dsl::created_at.eq(new_row.created_at),
            dsl::expires_at.eq(new_row.expires_at),
        ))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("put_exact failed: {e}")))?;
    Ok(())
}

/// Approximate lookup: scan the session's most recent unexpired entries and return the
/// first whose cosine similarity to `query_vector` meets `max(min_threshold, entry.threshold)`.
pub fn get_similar(
    conn: &mut DbConn,
    session_id: &str,
    query_vector: &[f32],
    min_threshold: f32,
) -> GhostWireResult<Option<CacheHit>> {
    use crate::schema::cache_approx::dsl;

    purge_expired(conn)?;

    let rows: Vec<CacheApproxRow> = dsl::cache_approx
        .filter(dsl::session_id.eq(session_id))
        .filter(dsl::expires_at.gt(now_unix_seconds()))
        .order(dsl::created_at.desc())
        .limit(APPROX_SCAN_LIMIT)
        .select(CacheApproxRow::as_select())
        .load(conn)
        .map_err(|e| GhostWireError::storage(format!("get_similar scan failed: {e}")))?;

    for row in rows {
        let Some(stored_vector) = decode_embedding(&row.query_embedding) else {
            continue;
        };
        let similarity = cosine_similarity(query_vector, &stored_vector);
        let threshold = min_threshold.max(row.similarity_threshold as f32);
        if similarity >= threshold {
            return Ok(Some(CacheHit {
                response: row.response,
                context: row.context,
                similarity: Some(similarity),
            }));
        }
    }

    Ok(None)
}

/// Insert an approximate-cache entry keyed by `fingerprint(session_id, query, query_vector)`.
#[allow(clippy::too_many_arguments)]
pub fn put_similar(
    conn: &mut DbConn,
    session_id: &str,
    query: &str,
    query_vector: &[f32],
    response: &str,
    context: Option<&str>,
    threshold: f32,
    ttl_minutes: i64,
) -> GhostWireResult<()> {
    use crate::schema::cache_approx::dsl;

    let key = fingerprint(session_id, query, query_vector);
    let now = now_unix_seconds();
    let new_row = NewCacheApproxRow {
        cache_key: key,
        session_id: session_id.to_string(),
        query_embedding: encode_embedding(query_vector),
        response: response.to_string(),
        context: context.map(str::to_string),
        similarity_threshold: threshold as f64,
        created_at: now,
        expires_at: now + (ttl_minutes as f64) * 60.0,
    };

    diesel::insert_into(dsl::cache_approx)
        .values(&new_row)
        .on_conflict(dsl::cache_key)
        .do_update()
        .set((
            dsl::response.eq(&new_row.response),
            dsl::context.eq(&new_row.context),
            dsl::similarity_threshold.eq(new_row.similarity_threshold),
            dsl::created_at.eq(new_row.created_at),
            dsl::expires_at.eq(new_row.expires_at),
        ))
        .execute(conn)
        .map_err(|e| GhostWireError::storage(format!("put_similar failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::establish_pool;

    fn test_conn() -> DbConn {
        establish_pool(":memory:").unwrap().get().unwrap()
    }

    #[test]
    fn exact_cache_hits_on_literal_match() {
        let mut conn = test_conn();
        put_exact(&mut conn, "s", "hello", "hi there", None, 60).unwrap();
        let hit = get_exact(&mut conn, "s", "hello").unwrap();
        assert_eq!(hit.unwrap().response, "hi there");
    }

    #[test]
    fn exact_cache_misses_on_different_session() {
        let mut conn = test_conn();
        put_exact(&mut conn, "s", "hello", "hi there", None, 60).unwrap();
        let hit = get_exact(&mut conn, "other", "hello").unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn exact_cache_expires() {
        let mut conn = test_conn();
        put_exact(&mut conn, "s", "hello", "hi there", None, -1).unwrap();
        let hit = get_exact(&mut conn, "s", "hello").unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn approx_cache_hits_above_threshold() {
        let mut conn = test_conn();
        put_similar(&mut conn, "s", "hello", &[1.0, 0.0, 0.0, 0.0], "hi there", None, 0.9, 60)
            .unwrap();
        let hit = get_similar(&mut conn, "s", &[0.99, 0.01, 0.0, 0.0], 0.9).unwrap();
        assert!(hit.is_some());
        assert!(hit.unwrap().similarity.unwrap() > 0.9);
    }

    #[test]
    fn approx_cache_misses_below_threshold() {
        let mut conn = test_conn();
        put_similar(&mut conn, "s", "hello", &[1.0, 0.0, 0.0, 0.0], "hi there", None, 0.99, 60)
            .unwrap();
        let hit = get_similar(&mut conn, "s", &[0.0, 1.0, 0.0, 0.0], 0.9).unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn fingerprint_is_stable_for_same_inputs() {
        let a = fingerprint("s", "hello", &[1.0, 0.0]);
        let b = fingerprint("s", "hello", &[1.0, 0.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_sessions() {
        let a = fingerprint("s1", "hello", &[1.0, 0.0]);
        let b = fingerprint("s2", "hello", &[1.0, 0.0]);
        assert_ne!(a, b);
    }
}
