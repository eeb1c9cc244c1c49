//! Diesel row models for the turns table and its satellite tables (dropped-collection
//! markers, exact cache, approximate cache).

use diesel::prelude::*;

#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::turns)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Turn {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub session_id: String,
    pub prompt_text: String,
    pub answer_text: String,
    pub timestamp: f64,
    pub embedding: Vec<u8>,
    pub summary_text: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::turns)]
pub struct NewTurn {
    pub session_id: String,
    pub prompt_text: String,
    pub answer_text: String,
    pub timestamp: f64,
    pub embedding: Vec<u8>,
    pub summary_text: Option<String>,
}

#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::dropped_collections)]
#[diesel(primary_key(name))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DroppedCollection {
    pub name: String,
    pub dropped_at: f64,
}

#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::cache_exact)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CacheExactRow {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub context: Option<String>,
    pub created_at: f64,
    pub expires_at: f64,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::cache_exact)]
pub struct NewCacheExactRow {
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub context: Option<String>,
    pub created_at: f64,
    pub expires_at: f64,
}

#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::cache_approx)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CacheApproxRow {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub cache_key: String,
    pub session_id: String,
    pub query_embedding: Vec<u8>,
    pub response: String,
    pub context: Option<String>,
    pub similarity_threshold: f64,
    pub created_at: f64,
    pub expires_at: f64,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::cache_approx)]
pub struct NewCacheApproxRow {
    pub cache_key: String,
    pub session_id: String,
    pub query_embedding: Vec<u8>,
    pub response: String,
    pub context: Option<String>,
    pub similarity_threshold: f64,
    pub created_at: f64,
    pub expires_at: f64,
}
