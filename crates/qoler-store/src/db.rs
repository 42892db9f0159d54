//! Synchronous SQLite access. Every method here runs on the blocking pool
//! via [`crate::Store`].

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{Channel, Message, NewUser, User};

/// Channels created on first open. Not deletable.
pub const DEFAULT_CHANNELS: [&str; 2] = ["連絡", "雑談"];

const MESSAGE_SELECT: &str = "
    SELECT m1.id, m1.channelId, m1.user, m1.text, m1.timestamp, m1.replyToId,
           m2.user AS repliedToUser, m2.text AS repliedToText
    FROM messages AS m1
    LEFT JOIN messages AS m2 ON m1.replyToId = m2.id";

pub struct ChatDb {
    conn: Connection,
}

impl ChatDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let open_err = |source| StoreError::Open { path: path.to_path_buf(), source };
        let conn = Connection::open(path).map_err(open_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(open_err)?;
        let db = Self { conn };
        db.run_migrations().map_err(open_err)?;
        db.seed_default_channels().map_err(open_err)?;
        debug!("database ready at {}", path.display());
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          INTEGER PRIMARY KEY,
                username    TEXT NOT NULL,
                password    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL UNIQUE,
                is_deletable BOOLEAN DEFAULT 1,
                is_group     BOOLEAN DEFAULT 0,
                creator_id   INTEGER REFERENCES users(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS channel_members (
                channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (channel_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                channelId   INTEGER REFERENCES channels(id) ON DELETE CASCADE,
                user        TEXT,
                text        TEXT,
                timestamp   DATETIME DEFAULT (datetime('now', 'localtime')),
                replyToId   INTEGER REFERENCES messages(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS read_receipts (
                user_id              INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                channel_id           INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                last_read_message_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, channel_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channelId, timestamp);
            ",
        )
    }

    fn seed_default_channels(&self) -> Result<(), rusqlite::Error> {
        for name in DEFAULT_CHANNELS {
            self.conn.execute(
                "INSERT OR IGNORE INTO channels (name, is_deletable, is_group) VALUES (?1, 0, 0)",
                params![name],
            )?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    // ── Users ────────────────────────────────────────────────────────────

    /// Returns false when the id is already taken.
    pub fn insert_user(&self, user: &NewUser) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                params![user.id, user.username, user.password_hash],
            )
            .map_err(StoreError::classify)?;
        Ok(changed == 1)
    }

    /// Insert many users in one transaction. Returns how many were new.
    pub fn insert_users(&mut self, users: &[NewUser]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO users (id, username, password) VALUES (?1, ?2, ?3)")?;
            for user in users {
                inserted += stmt.execute(params![user.id, user.username, user.password_hash])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn user_with_password(&self, id: i64) -> Result<Option<(User, String)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, username, password FROM users WHERE id = ?1",
                params![id],
                |row| Ok((User { id: row.get(0)?, username: row.get(1)? }, row.get::<_, String>(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.user_with_password(id)?.map(|(user, _)| user))
    }

    pub fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id, username FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| Ok(User { id: row.get(0)?, username: row.get(1)? }))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn usernames_for(&self, ids: &[i64]) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT username FROM users WHERE id = ?1")?;
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(name) = stmt.query_row(params![id], |row| row.get(0)).optional()? {
                names.push(name);
            }
        }
        Ok(names)
    }

    // ── Channels ─────────────────────────────────────────────────────────

    /// Public channels plus the groups `user_id` belongs to.
    pub fn channels_for(&self, user_id: i64) -> Result<Vec<Channel>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT c.id, c.name, c.is_deletable, c.is_group
             FROM channels c
             LEFT JOIN channel_members cm ON c.id = cm.channel_id
             WHERE c.is_group = 0 OR cm.user_id = ?1
             ORDER BY c.id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], channel_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_channel(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, is_deletable, is_group FROM channels WHERE id = ?1",
                params![id],
                channel_from_row,
            )
            .optional()?)
    }

    pub fn create_channel(&self, name: &str) -> Result<Channel, StoreError> {
        self.conn
            .execute("INSERT INTO channels (name, is_group) VALUES (?1, 0)", params![name])
            .map_err(StoreError::classify)?;
        Ok(Channel {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            is_deletable: true,
            is_group: false,
        })
    }

    /// Create a group channel whose members are `creator_id` plus
    /// `member_ids`, deduplicated.
    pub fn create_group(&mut self, name: &str, creator_id: i64, member_ids: &[i64]) -> Result<Channel, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO channels (name, is_group, creator_id) VALUES (?1, 1, ?2)",
            params![name, creator_id],
        )
        .map_err(StoreError::classify)?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?1, ?2)")?;
            for user_id in std::iter::once(&creator_id).chain(member_ids) {
                stmt.execute(params![id, user_id]).map_err(StoreError::classify)?;
            }
        }
        tx.commit()?;
        Ok(Channel { id, name: name.to_string(), is_deletable: true, is_group: true })
    }

    pub fn rename_channel(&self, id: i64, name: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("UPDATE channels SET name = ?1 WHERE id = ?2", params![name, id])
            .map_err(StoreError::classify)?;
        Ok(changed > 0)
    }

    /// Only channels marked deletable are removed.
    pub fn delete_channel(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM channels WHERE id = ?1 AND is_deletable = 1", params![id])?;
        Ok(changed > 0)
    }

    pub fn channel_members(&self, channel_id: i64) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.username FROM users u
             JOIN channel_members cm ON u.id = cm.user_id
             WHERE cm.channel_id = ?1
             ORDER BY u.id ASC",
        )?;
        let rows = stmt.query_map(params![channel_id], |row| Ok(User { id: row.get(0)?, username: row.get(1)? }))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn add_members(&mut self, channel_id: i64, user_ids: &[i64]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?1, ?2)")?;
            for user_id in user_ids {
                added += stmt.execute(params![channel_id, user_id]).map_err(StoreError::classify)?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn remove_members(&mut self, channel_id: i64, user_ids: &[i64]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2")?;
            for user_id in user_ids {
                removed += stmt.execute(params![channel_id, user_id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Everyone may use public channels; groups require membership.
    pub fn is_channel_member(&self, channel_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM channels c
                 LEFT JOIN channel_members cm ON c.id = cm.channel_id
                 WHERE c.id = ?1 AND (c.is_group = 0 OR cm.user_id = ?2)
                 LIMIT 1",
                params![channel_id, user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub fn messages_in(&self, channel_id: i64) -> Result<Vec<Message>, StoreError> {
        let sql = format!("{MESSAGE_SELECT} WHERE m1.channelId = ?1 ORDER BY m1.timestamp ASC, m1.id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![channel_id], message_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        let sql = format!("{MESSAGE_SELECT} WHERE m1.id = ?1");
        Ok(self.conn.query_row(&sql, params![id], message_from_row).optional()?)
    }

    /// Insert and return the stored row with its reply join resolved.
    pub fn insert_message(
        &self,
        channel_id: i64,
        user: &str,
        text: &str,
        reply_to_id: Option<i64>,
    ) -> Result<Message, StoreError> {
        self.conn
            .execute(
                "INSERT INTO messages (channelId, user, text, replyToId) VALUES (?1, ?2, ?3, ?4)",
                params![channel_id, user, text, reply_to_id],
            )
            .map_err(StoreError::classify)?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?
            .ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn message_author(&self, id: i64) -> Result<Option<String>, StoreError> {
        let author = self
            .conn
            .query_row("SELECT user FROM messages WHERE id = ?1", params![id], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(author.flatten())
    }

    pub fn delete_message(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.conn.execute("DELETE FROM messages WHERE id = ?1", params![id])? > 0)
    }

    // ── Read receipts ────────────────────────────────────────────────────

    pub fn mark_read(&self, user_id: i64, channel_id: i64, last_message_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO read_receipts (user_id, channel_id, last_read_message_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, channel_id) DO UPDATE SET last_read_message_id = excluded.last_read_message_id",
                params![user_id, channel_id, last_message_id],
            )
            .map_err(StoreError::classify)?;
        Ok(())
    }

    pub fn last_read(&self, user_id: i64, channel_id: i64) -> Result<i64, StoreError> {
        let last = self
            .conn
            .query_row(
                "SELECT last_read_message_id FROM read_receipts WHERE user_id = ?1 AND channel_id = ?2",
                params![user_id, channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.unwrap_or(0))
    }

    /// Messages after the user's read marker, per channel.
    pub fn unread_counts(&self, user_id: i64) -> Result<BTreeMap<i64, i64>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id,
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.channelId = c.id AND m.id > IFNULL(rr.last_read_message_id, 0))
             FROM channels c
             LEFT JOIN read_receipts rr ON c.id = rr.channel_id AND rr.user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        is_deletable: row.get(2)?,
        is_group: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        user: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        timestamp: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        reply_to_id: row.get(5)?,
        replied_to_user: row.get(6)?,
        replied_to_text: row.get(7)?,
    })
}
