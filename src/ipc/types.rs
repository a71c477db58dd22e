use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::access::Principal;
use crate::cache::QueryCache;
use crate::ipc::handlers::grades::ClassGradebook;
use crate::ipc::handlers::dashboard::StudentClassView;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum CachedReport {
    Class(ClassGradebook),
    Student(StudentClassView),
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Principal>,
    pub cache: QueryCache<CachedReport>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
            cache: QueryCache::new(),
        }
    }
}

/// Borrowed view of the state a handler needs once a workspace is open.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub session: Option<&'a Principal>,
    pub cache: &'a mut QueryCache<CachedReport>,
}
