use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::*;

/// Thread-safe persistence adapter over a single SQLite connection.
///
/// Wraps the connection in a `Mutex`. For high-concurrency deployments
/// consider a connection pool, but a Mutex is sufficient for the
/// single-node target.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Open the database file, applying pragmas and migrations.
    pub fn open(path: &str) -> Result<Self> {
        let conn = crate::db::open(path)?;
        Ok(Self::new(conn))
    }

    // ── Users ────────────────────────────────────────────────────────────────

    /// Insert the user row if it does not exist yet.
    pub fn ensure_user(&self, username: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO users (username, created_at) VALUES (?1, ?2)",
            rusqlite::params![username, now()],
        )?;
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Insert a conversation. Timestamps are filled server-side.
    pub fn add_conversation(&self, conv: &Conversation) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        let ts = now();
        db.execute(
            "INSERT INTO conversations (id, user, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![conv.id, conv.user, conv.title, ts],
        )?;
        get_conversation_row(&db, &conv.user, &conv.id)
    }

    pub fn get_conversation(&self, user: &str, id: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        get_conversation_row(&db, user, id)
    }

    /// All conversations for a user, most recently updated first.
    pub fn get_all_conversations(&self, user: &str) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user, title, created_at, updated_at
             FROM conversations
             WHERE user = ?1
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![user], row_to_conversation)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn rename_conversation(&self, user: &str, id: &str, title: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2
             WHERE id = ?3 AND user = ?4",
            rusqlite::params![title, now(), id, user],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("conversation", id));
        }
        get_conversation_row(&db, user, id)
    }

    /// Bump `updated_at`. Doubles as a cheap existence + ownership check.
    pub fn touch_conversation(&self, user: &str, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2 AND user = ?3",
            rusqlite::params![now(), id, user],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("conversation", id));
        }
        Ok(())
    }

    /// Delete a conversation; messages, attachments, and tool calls
    /// cascade at the schema level.
    pub fn delete_conversation(&self, user: &str, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM conversations WHERE id = ?1 AND user = ?2",
            rusqlite::params![id, user],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("conversation", id));
        }
        debug!(conv = id, "conversation deleted");
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Insert a message, returning the allocated integer id.
    /// `msg.id`, `msg.children`, and `msg.created_at` are ignored.
    pub fn save_message(&self, msg: &Message) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages
             (conv_id, role, model, content, reasoning, parent_id, status,
              error, token_count, context_size, speed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                msg.conv_id,
                msg.role.to_string(),
                msg.model,
                msg.content,
                msg.reasoning,
                msg.parent_id,
                msg.status.to_string(),
                msg.error,
                msg.token_count,
                msg.context_size,
                msg.speed,
                now(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Fetch one message (owner-checked through its conversation),
    /// children included.
    pub fn get_message(&self, user: &str, id: i64) -> Result<Message> {
        let db = self.db.lock().unwrap();
        get_message_row(&db, user, id)
    }

    /// The whole tree of a conversation as a flat id-keyed map.
    /// Children lists are rebuilt from `parent_id`, ordered by id ascending.
    pub fn get_all_conversation_messages(&self, user: &str, conv_id: &str) -> Result<MessageMap> {
        let db = self.db.lock().unwrap();
        // Ownership check first; an unknown or foreign conversation is a 404.
        get_conversation_row(&db, user, conv_id)?;

        let mut stmt = db.prepare(
            "SELECT id, conv_id, role, model, content, reasoning, parent_id,
                    status, error, token_count, context_size, speed, created_at
             FROM messages WHERE conv_id = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![conv_id], row_to_message)?;

        let mut map: MessageMap = HashMap::new();
        for msg in rows.filter_map(|r| r.ok()) {
            map.insert(msg.id, msg);
        }

        // Derive children from parent pointers.
        let mut by_parent: HashMap<i64, Vec<i64>> = HashMap::new();
        for msg in map.values() {
            by_parent.entry(msg.parent_id).or_default().push(msg.id);
        }
        for (parent, mut kids) in by_parent {
            kids.sort_unstable();
            if let Some(p) = map.get_mut(&parent) {
                p.children = kids;
            }
        }
        Ok(map)
    }

    /// Apply a partial update. Only content, reasoning, error, status, and
    /// usage stats can change; `parent_id`, `conv_id`, and `role` are
    /// preserved. Returns the updated row with its child list.
    pub fn update_message(&self, user: &str, id: i64, upd: &UpdateMessage) -> Result<Message> {
        let db = self.db.lock().unwrap();
        let current = get_message_row(&db, user, id)?;

        let content = upd.content.as_ref().unwrap_or(&current.content);
        let reasoning = upd.reasoning.as_ref().or(current.reasoning.as_ref());
        let error = upd.error.as_ref().or(current.error.as_ref());
        let status = upd.status.unwrap_or(current.status);
        let token_count = upd.token_count.unwrap_or(current.token_count);
        let context_size = upd.context_size.unwrap_or(current.context_size);
        let speed = upd.speed.unwrap_or(current.speed);

        db.execute(
            "UPDATE messages
             SET content = ?1, reasoning = ?2, error = ?3, status = ?4,
                 token_count = ?5, context_size = ?6, speed = ?7
             WHERE id = ?8",
            rusqlite::params![
                content,
                reasoning,
                error,
                status.to_string(),
                token_count,
                context_size,
                speed,
                id
            ],
        )?;
        get_message_row(&db, user, id)
    }

    // ── Attachments & files ──────────────────────────────────────────────────

    /// Insert the file row if unseen. Upload itself is handled elsewhere;
    /// the store only keeps the reference the attachments fk needs.
    pub fn ensure_file(&self, id: &str, name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO files (id, name, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, name, now()],
        )?;
        Ok(())
    }

    pub fn add_attachment(&self, message_id: i64, file_id: &str) -> Result<Attachment> {
        let db = self.db.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO attachments (id, message_id, file_id) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, message_id, file_id],
        )?;
        Ok(Attachment {
            id,
            message_id,
            file_id: file_id.to_string(),
        })
    }

    pub fn get_attachments(&self, message_id: i64) -> Result<Vec<Attachment>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, message_id, file_id FROM attachments WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![message_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                file_id: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Tool calls ───────────────────────────────────────────────────────────

    /// Insert a tool-call row the moment it is first observed in a stream.
    /// Arguments and output are filled in later via `update_tool_call`.
    pub fn save_tool_call(&self, rec: &ToolCallRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tool_calls
             (id, ref_id, conv_id, message_id, name, args, output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                rec.id,
                rec.ref_id,
                rec.conv_id,
                rec.message_id,
                rec.name,
                rec.args,
                rec.output,
                now(),
            ],
        )?;
        Ok(())
    }

    /// Fill in completed arguments and the tool's output.
    pub fn update_tool_call(&self, id: &str, args: &str, output: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE tool_calls SET args = ?1, output = ?2 WHERE id = ?3",
            rusqlite::params![args, output, id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("tool call", id));
        }
        Ok(())
    }

    pub fn get_tool_call(&self, id: &str) -> Result<ToolCallRecord> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, ref_id, conv_id, message_id, name, args, output, created_at
             FROM tool_calls WHERE id = ?1",
            rusqlite::params![id],
            row_to_tool_call,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("tool call", id),
            other => StoreError::Database(other),
        })
    }

    /// Tool calls of one assistant message, in recorded order.
    pub fn get_tool_calls(&self, message_id: i64) -> Result<Vec<ToolCallRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, ref_id, conv_id, message_id, name, args, output, created_at
             FROM tool_calls WHERE message_id = ?1
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![message_id], row_to_tool_call)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All tool calls of a conversation grouped by assistant message id,
    /// recorded order preserved within each group.
    pub fn get_conversation_tool_calls(
        &self,
        conv_id: &str,
    ) -> Result<HashMap<i64, Vec<ToolCallRecord>>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, ref_id, conv_id, message_id, name, args, output, created_at
             FROM tool_calls WHERE conv_id = ?1
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![conv_id], row_to_tool_call)?;
        let mut grouped: HashMap<i64, Vec<ToolCallRecord>> = HashMap::new();
        for rec in rows.filter_map(|r| r.ok()) {
            grouped.entry(rec.message_id).or_default().push(rec);
        }
        Ok(grouped)
    }

    // ── Providers ────────────────────────────────────────────────────────────

    pub fn add_provider(&self, p: &ProviderRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO providers (id, user, name, base_url, api_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![p.id, p.user, p.name, p.base_url, p.api_key],
        )?;
        Ok(())
    }

    pub fn get_provider(&self, user: &str, id: &str) -> Result<ProviderRecord> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user, name, base_url, api_key
             FROM providers WHERE user = ?1 AND id = ?2",
            rusqlite::params![user, id],
            row_to_provider,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("provider", id),
            other => StoreError::Database(other),
        })
    }

    pub fn list_providers(&self, user: &str) -> Result<Vec<ProviderRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user, name, base_url, api_key FROM providers WHERE user = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![user], row_to_provider)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_provider(&self, user: &str, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM providers WHERE user = ?1 AND id = ?2",
            rusqlite::params![user, id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("provider", id));
        }
        Ok(())
    }

    // ── MCP servers & tools ──────────────────────────────────────────────────

    pub fn add_mcp_server(&self, s: &McpServer) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO mcp_servers (id, user, name, url, api_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![s.id, s.user, s.name, s.url, s.api_key],
        )?;
        Ok(())
    }

    pub fn get_mcp_server(&self, user: &str, id: &str) -> Result<McpServer> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user, name, url, api_key
             FROM mcp_servers WHERE user = ?1 AND id = ?2",
            rusqlite::params![user, id],
            row_to_mcp_server,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("mcp server", id),
            other => StoreError::Database(other),
        })
    }

    pub fn list_mcp_servers(&self, user: &str) -> Result<Vec<McpServer>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT id, user, name, url, api_key FROM mcp_servers WHERE user = ?1")?;
        let rows = stmt.query_map(rusqlite::params![user], row_to_mcp_server)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_mcp_server(&self, user: &str, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM mcp_servers WHERE user = ?1 AND id = ?2",
            rusqlite::params![user, id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("mcp server", id));
        }
        // Orphaned tool rows for the server go with it.
        db.execute("DELETE FROM tools WHERE server_id = ?1", rusqlite::params![id])?;
        Ok(())
    }

    pub fn add_tool(&self, t: &ToolEntry) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO tools
             (id, server_id, user, name, description, input_schema,
              require_approval, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                t.id,
                t.server_id,
                t.user,
                t.name,
                t.description,
                t.input_schema.to_string(),
                t.require_approval,
                t.is_enabled,
            ],
        )?;
        Ok(())
    }

    /// Every enabled tool belonging to the user, in name order.
    pub fn get_enabled_tools(&self, user: &str) -> Result<Vec<ToolEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, server_id, user, name, description, input_schema,
                    require_approval, is_enabled
             FROM tools
             WHERE user = ?1 AND is_enabled = 1
             ORDER BY name",
        )?;
        let rows = stmt.query_map(rusqlite::params![user], row_to_tool_entry)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn get_setting(&self, user: &str, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT value FROM settings WHERE user = ?1 AND key = ?2",
            rusqlite::params![user, key],
            |row| row.get(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn set_setting(&self, user: &str, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO settings (user, key, value) VALUES (?1, ?2, ?3)",
            rusqlite::params![user, key, value],
        )?;
        Ok(())
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// Mark assistant placeholders stuck in `streaming`/`pending` older than
    /// the grace period as errored. Run once at startup; counts the rows
    /// swept.
    pub fn sweep_stale_streaming(&self, grace_secs: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(grace_secs)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let swept = db.execute(
            "UPDATE messages
             SET status = 'error', error = 'interrupted by server restart'
             WHERE status IN ('streaming', 'pending') AND created_at < ?1",
            rusqlite::params![cutoff],
        )?;
        if swept > 0 {
            debug!(swept, "recovered stale streaming placeholders");
        }
        Ok(swept)
    }
}

// ── Row mappers ──────────────────────────────────────────────────────────────

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn get_conversation_row(db: &Connection, user: &str, id: &str) -> Result<Conversation> {
    db.query_row(
        "SELECT id, user, title, created_at, updated_at
         FROM conversations WHERE id = ?1 AND user = ?2",
        rusqlite::params![id, user],
        row_to_conversation,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("conversation", id),
        other => StoreError::Database(other),
    })
}

fn get_message_row(db: &Connection, user: &str, id: i64) -> Result<Message> {
    let mut msg = db
        .query_row(
            "SELECT m.id, m.conv_id, m.role, m.model, m.content, m.reasoning,
                    m.parent_id, m.status, m.error, m.token_count,
                    m.context_size, m.speed, m.created_at
             FROM messages m
             JOIN conversations c ON c.id = m.conv_id
             WHERE m.id = ?1 AND c.user = ?2",
            rusqlite::params![id, user],
            row_to_message,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::not_found("message", id.to_string())
            }
            other => StoreError::Database(other),
        })?;

    let mut stmt =
        db.prepare("SELECT id FROM messages WHERE parent_id = ?1 ORDER BY id")?;
    let kids = stmt.query_map(rusqlite::params![id], |row| row.get::<_, i64>(0))?;
    msg.children = kids.filter_map(|r| r.ok()).collect();
    Ok(msg)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let status: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        conv_id: row.get(1)?,
        role: role.parse().unwrap_or(Role::User),
        model: row.get(3)?,
        content: row.get(4)?,
        reasoning: row.get(5)?,
        parent_id: row.get(6)?,
        status: status.parse().unwrap_or(MessageStatus::Completed),
        error: row.get(8)?,
        token_count: row.get(9)?,
        context_size: row.get(10)?,
        speed: row.get(11)?,
        created_at: row.get(12)?,
        children: Vec::new(),
    })
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        ref_id: row.get(1)?,
        conv_id: row.get(2)?,
        message_id: row.get(3)?,
        name: row.get(4)?,
        args: row.get(5)?,
        output: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        id: row.get(0)?,
        user: row.get(1)?,
        name: row.get(2)?,
        base_url: row.get(3)?,
        api_key: row.get(4)?,
    })
}

fn row_to_mcp_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpServer> {
    Ok(McpServer {
        id: row.get(0)?,
        user: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        api_key: row.get(4)?,
    })
}

fn row_to_tool_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolEntry> {
    let schema: String = row.get(5)?;
    Ok(ToolEntry {
        id: row.get(0)?,
        server_id: row.get(1)?,
        user: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        input_schema: serde_json::from_str(&schema).unwrap_or(serde_json::Value::Null),
        require_approval: row.get(6)?,
        is_enabled: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Store::new(conn)
    }

    fn test_conversation(store: &Store, user: &str, id: &str) -> Conversation {
        store.ensure_user(user).unwrap();
        store
            .add_conversation(&Conversation {
                id: id.to_string(),
                user: user.to_string(),
                title: "test".to_string(),
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap()
    }

    #[test]
    fn conversation_round_trip() {
        let store = test_store();
        let conv = test_conversation(&store, "alice", "conv-1");
        assert!(!conv.created_at.is_empty());

        let listed = store.get_all_conversations("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "conv-1");

        store.delete_conversation("alice", "conv-1").unwrap();
        assert!(store.get_all_conversations("alice").unwrap().is_empty());
    }

    #[test]
    fn foreign_user_sees_not_found() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");

        assert!(store.get_conversation("bob", "conv-1").unwrap_err().is_not_found());
        assert!(store.delete_conversation("bob", "conv-1").unwrap_err().is_not_found());
        assert!(store
            .rename_conversation("bob", "conv-1", "stolen")
            .unwrap_err()
            .is_not_found());
        // Still intact for its owner.
        assert_eq!(store.get_conversation("alice", "conv-1").unwrap().title, "test");
    }

    #[test]
    fn message_round_trip_and_children_ordering() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");

        let root = store
            .save_message(&Message::new("conv-1", Role::User, "hello"))
            .unwrap();
        let mut a = Message::new("conv-1", Role::Assistant, "hi");
        a.parent_id = root;
        let first = store.save_message(&a).unwrap();
        let mut b = Message::new("conv-1", Role::Assistant, "hello!");
        b.parent_id = root;
        let second = store.save_message(&b).unwrap();

        let map = store.get_all_conversation_messages("alice", "conv-1").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&root].children, vec![first, second]);
        assert_eq!(map[&first].parent_id, root);

        // Parent/child invariant: every non-root parent exists and lists the child.
        for msg in map.values() {
            if msg.parent_id != 0 {
                let parent = &map[&msg.parent_id];
                assert!(parent.children.contains(&msg.id));
            }
        }
    }

    #[test]
    fn save_then_get_preserves_fields() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");

        let mut msg = Message::new("conv-1", Role::Assistant, "body");
        msg.model = Some("prov/model".to_string());
        msg.reasoning = Some("thinking".to_string());
        msg.status = MessageStatus::Streaming;
        let id = store.save_message(&msg).unwrap();

        let got = store.get_message("alice", id).unwrap();
        assert_eq!(got.content, "body");
        assert_eq!(got.model.as_deref(), Some("prov/model"));
        assert_eq!(got.reasoning.as_deref(), Some("thinking"));
        assert_eq!(got.status, MessageStatus::Streaming);
        assert!(got.children.is_empty());
        assert!(!got.created_at.is_empty());
    }

    #[test]
    fn update_changes_only_allowed_fields() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");

        let root = store
            .save_message(&Message::new("conv-1", Role::User, "hello"))
            .unwrap();
        let mut child = Message::new("conv-1", Role::Assistant, "hi");
        child.parent_id = root;
        let child_id = store.save_message(&child).unwrap();

        let updated = store
            .update_message(
                "alice",
                root,
                &UpdateMessage {
                    content: Some("HELLO".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.content, "HELLO");
        assert_eq!(updated.parent_id, 0);
        assert_eq!(updated.role, Role::User);
        assert_eq!(updated.children, vec![child_id]);
    }

    #[test]
    fn delete_conversation_cascades() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");

        let user_id = store
            .save_message(&Message::new("conv-1", Role::User, "hello"))
            .unwrap();
        let mut a = Message::new("conv-1", Role::Assistant, "hi");
        a.parent_id = user_id;
        let asst_id = store.save_message(&a).unwrap();

        store.ensure_file("file-1", "doc.pdf").unwrap();
        store.add_attachment(user_id, "file-1").unwrap();
        store
            .save_tool_call(&ToolCallRecord {
                id: "tc-1".to_string(),
                ref_id: "call_0".to_string(),
                conv_id: "conv-1".to_string(),
                message_id: asst_id,
                name: "get_weather".to_string(),
                args: "{}".to_string(),
                output: String::new(),
                created_at: String::new(),
            })
            .unwrap();

        store.delete_conversation("alice", "conv-1").unwrap();

        assert!(store.get_message("alice", user_id).unwrap_err().is_not_found());
        assert!(store.get_attachments(user_id).unwrap().is_empty());
        assert!(store.get_tool_call("tc-1").unwrap_err().is_not_found());
    }

    #[test]
    fn tool_calls_keep_recorded_order() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");
        let msg_id = store
            .save_message(&Message::new("conv-1", Role::Assistant, ""))
            .unwrap();

        for (i, name) in ["web_search", "get_weather"].iter().enumerate() {
            store
                .save_tool_call(&ToolCallRecord {
                    id: format!("tc-{i}"),
                    ref_id: format!("call_{i}"),
                    conv_id: "conv-1".to_string(),
                    message_id: msg_id,
                    name: name.to_string(),
                    args: String::new(),
                    output: String::new(),
                    created_at: String::new(),
                })
                .unwrap();
        }
        store.update_tool_call("tc-0", "{\"q\":1}", "result").unwrap();

        let calls = store.get_tool_calls(msg_id).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].output, "result");
        assert_eq!(calls[1].name, "get_weather");
    }

    #[test]
    fn provider_and_mcp_server_round_trips() {
        let store = test_store();
        store.ensure_user("alice").unwrap();

        store
            .add_provider(&ProviderRecord {
                id: "prov-A".to_string(),
                user: "alice".to_string(),
                name: "Provider A".to_string(),
                base_url: "https://api.example.com".to_string(),
                api_key: "k".to_string(),
            })
            .unwrap();
        assert_eq!(store.list_providers("alice").unwrap().len(), 1);
        assert!(store.get_provider("bob", "prov-A").unwrap_err().is_not_found());
        store.delete_provider("alice", "prov-A").unwrap();
        assert!(store.list_providers("alice").unwrap().is_empty());

        store
            .add_mcp_server(&McpServer {
                id: "srv-1".to_string(),
                user: "alice".to_string(),
                name: "tools".to_string(),
                url: "https://mcp.example.com".to_string(),
                api_key: String::new(),
            })
            .unwrap();
        store
            .add_tool(&ToolEntry {
                id: "t1".to_string(),
                server_id: "srv-1".to_string(),
                user: "alice".to_string(),
                name: "lookup".to_string(),
                description: String::new(),
                input_schema: serde_json::json!({"type":"object"}),
                require_approval: false,
                is_enabled: true,
            })
            .unwrap();
        assert_eq!(store.get_enabled_tools("alice").unwrap().len(), 1);
        assert_eq!(store.list_mcp_servers("alice").unwrap().len(), 1);

        // Deleting the server takes its tool rows with it.
        store.delete_mcp_server("alice", "srv-1").unwrap();
        assert!(store.get_enabled_tools("alice").unwrap().is_empty());
        assert!(store.get_mcp_server("alice", "srv-1").unwrap_err().is_not_found());
    }

    #[test]
    fn settings_round_trip() {
        let store = test_store();
        store.ensure_user("alice").unwrap();
        assert!(store.get_setting("alice", setting_keys::SYSTEM_PROMPT).unwrap().is_none());
        store
            .set_setting("alice", setting_keys::SYSTEM_PROMPT, "be brief")
            .unwrap();
        assert_eq!(
            store.get_setting("alice", setting_keys::SYSTEM_PROMPT).unwrap().as_deref(),
            Some("be brief")
        );
    }

    #[test]
    fn sweep_marks_old_streaming_rows() {
        let store = test_store();
        test_conversation(&store, "alice", "conv-1");
        let mut msg = Message::new("conv-1", Role::Assistant, "partial");
        msg.status = MessageStatus::Streaming;
        let id = store.save_message(&msg).unwrap();

        // Fresh placeholder survives the sweep.
        assert_eq!(store.sweep_stale_streaming(300).unwrap(), 0);
        // With a grace of -1s everything qualifies.
        assert_eq!(store.sweep_stale_streaming(-1).unwrap(), 1);
        let swept = store.get_message("alice", id).unwrap();
        assert_eq!(swept.status, MessageStatus::Error);
        assert!(swept.error.is_some());
    }
}
