//! Node mappings and change tokens.
//!
//! A `NodeMapping` binds a local path to the remote object it mirrors, so
//! UPDATE/DELETE/RENAME can target the node directly without a remote
//! lookup. A change token (`"<mtime_ms>:<size>"`) is the cheap content proxy
//! the classifier uses to suppress no-op events.
//!
//! Directory renames rewrite every descendant row's path prefix; the node
//! uids themselves never change, which is what lets child operations land
//! correctly whether or not the rename has executed remotely yet.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::paths;
use crate::store::SyncStore;

/// Persistent binding of a local path to its remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeMapping {
    pub local_path: String,
    pub remote_path: String,
    pub node_uid: String,
    pub parent_node_uid: String,
    pub is_directory: bool,
}

/// Format a change token from file metadata.
pub fn change_token(mtime_ms: i64, size: u64) -> String {
    format!("{}:{}", mtime_ms, size)
}

/// Escape a path for use as a `LIKE <prefix>/% ESCAPE '\'` pattern.
///
/// Paths may legitimately contain `%` and `_`.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 2);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push_str("/%");
    escaped
}

pub fn get_mapping(conn: &Connection, local_path: &str) -> Result<Option<NodeMapping>> {
    conn.query_row(
        "SELECT local_path, remote_path, node_uid, parent_node_uid, is_directory
         FROM node_mappings WHERE local_path = ?1",
        params![local_path],
        |row| {
            Ok(NodeMapping {
                local_path: row.get(0)?,
                remote_path: row.get(1)?,
                node_uid: row.get(2)?,
                parent_node_uid: row.get(3)?,
                is_directory: row.get::<_, i64>(4)? != 0,
            })
        },
    )
    .optional()
    .context("failed to fetch node mapping")
}

pub fn put_mapping(conn: &Connection, mapping: &NodeMapping, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO node_mappings
                (local_path, remote_path, node_uid, parent_node_uid, is_directory, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(local_path) DO UPDATE SET
                remote_path = excluded.remote_path,
                node_uid = excluded.node_uid,
                parent_node_uid = excluded.parent_node_uid,
                is_directory = excluded.is_directory,
                updated_at = excluded.updated_at",
        params![
            mapping.local_path,
            mapping.remote_path,
            mapping.node_uid,
            mapping.parent_node_uid,
            mapping.is_directory as i64,
            now,
        ],
    )
    .context("failed to upsert node mapping")?;
    Ok(())
}

pub fn delete_mapping(conn: &Connection, local_path: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM node_mappings WHERE local_path = ?1",
            params![local_path],
        )
        .context("failed to delete node mapping")?;
    Ok(n > 0)
}

/// Delete the mapping for `local_path` and every descendant.
pub fn delete_mappings_under(conn: &Connection, local_path: &str) -> Result<usize> {
    let n = conn
        .execute(
            "DELETE FROM node_mappings WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\'",
            params![local_path, like_prefix(local_path)],
        )
        .context("failed to delete node mappings under prefix")?;
    Ok(n)
}

/// Re-key the mapping for a renamed/moved subtree.
///
/// Both the local keys and the stored remote paths are rewritten from the
/// old prefix to the new one; uids are untouched. Returns rows rewritten.
pub fn rewrite_mapping_prefix(
    conn: &Connection,
    from_local: &str,
    to_local: &str,
    from_remote: &str,
    to_remote: &str,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT local_path, remote_path FROM node_mappings
         WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\'",
    )?;
    let rows = stmt
        .query_map(params![from_local, like_prefix(from_local)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut rewritten = 0;
    for (old_local, old_remote) in rows {
        let Some(new_local) = paths::rewrite_prefix(&old_local, from_local, to_local) else {
            continue;
        };
        let new_remote = paths::rewrite_prefix(&old_remote, from_remote, to_remote)
            .unwrap_or(old_remote);
        rewritten += conn
            .execute(
                "UPDATE node_mappings SET local_path = ?2, remote_path = ?3
                 WHERE local_path = ?1",
                params![old_local, new_local, new_remote],
            )
            .context("failed to rewrite node mapping prefix")?;
    }
    Ok(rewritten)
}

pub fn mapping_count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT count(*) FROM node_mappings", [], |row| row.get(0))
        .context("failed to count node mappings")
}

pub fn get_token(conn: &Connection, local_path: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT token FROM change_tokens WHERE local_path = ?1",
        params![local_path],
        |row| row.get(0),
    )
    .optional()
    .context("failed to fetch change token")
}

pub fn put_token(conn: &Connection, local_path: &str, token: &str, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO change_tokens (local_path, token, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(local_path) DO UPDATE SET
                token = excluded.token, updated_at = excluded.updated_at",
        params![local_path, token, now],
    )
    .context("failed to upsert change token")?;
    Ok(())
}

pub fn delete_token(conn: &Connection, local_path: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM change_tokens WHERE local_path = ?1",
            params![local_path],
        )
        .context("failed to delete change token")?;
    Ok(n > 0)
}

/// Delete the token for `local_path` and every descendant.
pub fn delete_tokens_under(conn: &Connection, local_path: &str) -> Result<usize> {
    let n = conn
        .execute(
            "DELETE FROM change_tokens WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\'",
            params![local_path, like_prefix(local_path)],
        )
        .context("failed to delete change tokens under prefix")?;
    Ok(n)
}

/// Re-key tokens for a renamed/moved subtree. Returns rows rewritten.
pub fn rewrite_token_prefix(conn: &Connection, from_local: &str, to_local: &str) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT local_path FROM change_tokens
         WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\'",
    )?;
    let rows = stmt
        .query_map(params![from_local, like_prefix(from_local)], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut rewritten = 0;
    for old_local in rows {
        let Some(new_local) = paths::rewrite_prefix(&old_local, from_local, to_local) else {
            continue;
        };
        rewritten += conn
            .execute(
                "UPDATE change_tokens SET local_path = ?2 WHERE local_path = ?1",
                params![old_local, new_local],
            )
            .context("failed to rewrite change token prefix")?;
    }
    Ok(rewritten)
}

pub fn token_count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT count(*) FROM change_tokens", [], |row| row.get(0))
        .context("failed to count change tokens")
}

impl SyncStore {
    pub fn get_mapping(&self, local_path: &str) -> Result<Option<NodeMapping>> {
        get_mapping(self.conn(), local_path)
    }

    pub fn get_token(&self, local_path: &str) -> Result<Option<String>> {
        get_token(self.conn(), local_path)
    }
}
