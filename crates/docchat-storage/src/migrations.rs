//! Database schema migrations.
//!
//! Applies the initial schema: users, auth_sessions, documents,
//! conversations, conversation_messages and schema_migrations.

use rusqlite::Connection;
use tracing::info;

use docchat_core::error::DocchatError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), DocchatError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| DocchatError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| DocchatError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema. Timestamps are Unix milliseconds.
fn apply_v1(conn: &Connection) -> Result<(), DocchatError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT PRIMARY KEY NOT NULL,
            email               TEXT NOT NULL UNIQUE,
            password_hash       TEXT NOT NULL,
            email_confirmed_at  INTEGER,
            confirmation_token  TEXT,
            created_at          INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_confirmation_token
            ON users (confirmation_token)
            WHERE confirmation_token IS NOT NULL;

        CREATE TABLE IF NOT EXISTS auth_sessions (
            token       TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_auth_sessions_user
            ON auth_sessions (user_id);

        CREATE TABLE IF NOT EXISTS documents (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL,
            url             TEXT NOT NULL,
            backend_doc_id  TEXT,
            created_at      INTEGER NOT NULL,
            UNIQUE (user_id, url)
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id           TEXT PRIMARY KEY NOT NULL,
            document_id  TEXT NOT NULL,
            user_id      TEXT NOT NULL,
            created_at   INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations (user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS conversation_messages (
            id               TEXT PRIMARY KEY NOT NULL,
            conversation_id  TEXT NOT NULL,
            role             TEXT NOT NULL
                             CHECK (role IN ('user', 'assistant')),
            content          TEXT NOT NULL,
            created_at       INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
            ON conversation_messages (conversation_id, created_at ASC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| DocchatError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = open();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_role_check_constraint() {
        let conn = open();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO documents (id, user_id, url, created_at) VALUES ('d1', 'u1', 'https://x', 0);
             INSERT INTO conversations (id, document_id, user_id, created_at) VALUES ('c1', 'd1', 'u1', 0);",
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at)
             VALUES ('m1', 'c1', 'system', 'hi', 0)",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_message_requires_existing_conversation() {
        let conn = open();
        run_migrations(&conn).unwrap();
        let orphan = conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at)
             VALUES ('m1', 'missing', 'user', 'hi', 0)",
            [],
        );
        assert!(orphan.is_err());
    }

    #[test]
    fn test_document_url_unique_per_user() {
        let conn = open();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO documents (id, user_id, url, created_at) VALUES ('d1', 'u1', 'https://x', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO documents (id, user_id, url, created_at) VALUES ('d2', 'u1', 'https://x', 0)",
            [],
        );
        assert!(dup.is_err());
        // Same URL for another user is fine.
        conn.execute(
            "INSERT INTO documents (id, user_id, url, created_at) VALUES ('d3', 'u2', 'https://x', 0)",
            [],
        )
        .unwrap();
    }
}
