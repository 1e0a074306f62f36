use rusqlite::{Connection, Result};

/// Open the database file with the pragmas the gateway expects.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=3000;",
    )?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    create_user_tables(conn)?;
    create_conversation_tables(conn)?;
    create_tool_tables(conn)?;
    Ok(())
}

fn create_user_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            username   TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
            user  TEXT NOT NULL,
            key   TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (user, key)
        );
        CREATE TABLE IF NOT EXISTS providers (
            id       TEXT NOT NULL,
            user     TEXT NOT NULL,
            name     TEXT NOT NULL DEFAULT '',
            base_url TEXT NOT NULL,
            api_key  TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (user, id)
        );",
    )
}

fn create_conversation_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id         TEXT PRIMARY KEY,
            user       TEXT NOT NULL,
            title      TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            conv_id      TEXT NOT NULL
                         REFERENCES conversations(id) ON DELETE CASCADE,
            role         TEXT NOT NULL,
            model        TEXT,
            content      TEXT NOT NULL DEFAULT '',
            reasoning    TEXT,
            parent_id    INTEGER NOT NULL DEFAULT 0,
            status       TEXT NOT NULL DEFAULT 'completed',
            error        TEXT,
            token_count  INTEGER NOT NULL DEFAULT 0,
            context_size INTEGER NOT NULL DEFAULT 0,
            speed        REAL NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conv_id);
        CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);

        CREATE TABLE IF NOT EXISTS files (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS attachments (
            id         TEXT PRIMARY KEY,
            message_id INTEGER NOT NULL
                       REFERENCES messages(id) ON DELETE CASCADE,
            file_id    TEXT NOT NULL REFERENCES files(id)
        );",
    )
}

fn create_tool_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tool_calls (
            id         TEXT PRIMARY KEY,
            ref_id     TEXT NOT NULL,
            conv_id    TEXT NOT NULL
                       REFERENCES conversations(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL,
            name       TEXT NOT NULL,
            args       TEXT NOT NULL DEFAULT '',
            output     TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_calls_message
            ON tool_calls(message_id);

        CREATE TABLE IF NOT EXISTS mcp_servers (
            id      TEXT PRIMARY KEY,
            user    TEXT NOT NULL,
            name    TEXT NOT NULL DEFAULT '',
            url     TEXT NOT NULL,
            api_key TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS tools (
            id               TEXT PRIMARY KEY,
            server_id        TEXT NOT NULL,
            user             TEXT NOT NULL,
            name             TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            input_schema     TEXT NOT NULL DEFAULT '{}',
            require_approval INTEGER NOT NULL DEFAULT 0,
            is_enabled       INTEGER NOT NULL DEFAULT 1,
            UNIQUE (user, name)
        );",
    )
}
