//! Chat storage for the qoler worker.
//!
//! rusqlite is synchronous, so every call is moved onto the tokio blocking
//! pool behind a mutex. The connection lives in an `Option` so the worker can
//! close it during shutdown while handlers still hold a `Store` clone; calls
//! after close fail with [`StoreError::Closed`].

pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod password;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use db::{ChatDb, DEFAULT_CHANNELS};
pub use error::StoreError;
pub use import::{CsvUser, parse_user_csv};
pub use models::{Channel, ImportSummary, Message, NewUser, User};

/// Async handle to the chat database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Option<ChatDb>>>,
    /// Set as soon as a close begins, before the connection is released.
    closed: Arc<AtomicBool>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) the database at `path`, apply the schema,
    /// and seed the default channels.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let db = tokio::task::spawn_blocking(move || ChatDb::open(&open_path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        info!("Storage opened at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(Some(db))),
            closed: Arc::new(AtomicBool::new(false)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.db.lock().is_some()
    }

    /// Close the connection, waiting at most `budget`.
    ///
    /// Returns true if the close completed in time. On expiry the store is
    /// still considered closed: calls made after this point fail with
    /// [`StoreError::Closed`], even ones queued behind a slow call, and the
    /// blocking task finishes the close on its own.
    pub async fn close(&self, budget: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || match db.lock().take() {
            Some(chat) => chat.close(),
            None => Ok(()),
        });
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(Ok(()))) => {
                info!("Storage closed");
                true
            }
            Ok(Ok(Err(e))) => {
                warn!("Storage close reported an error: {e}");
                true
            }
            Ok(Err(e)) => {
                warn!("Storage close task failed: {e}");
                false
            }
            Err(_) => {
                warn!("Storage close exceeded {} ms, treating as closed", budget.as_millis());
                false
            }
        }
    }

    /// Run a blocking DB operation on the tokio blocking pool.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut ChatDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let db = self.db.clone();
        let closed = self.closed.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock();
            if closed.load(Ordering::SeqCst) {
                return Err(StoreError::Closed);
            }
            let chat = guard.as_mut().ok_or(StoreError::Closed)?;
            f(chat)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ── Users ────────────────────────────────────────────────────────────

    /// Hash `password` and insert the user. Returns false if the id exists.
    pub async fn register_user(&self, id: i64, username: &str, password: &str) -> Result<bool, StoreError> {
        let user = NewUser {
            id,
            username: username.to_string(),
            password_hash: hash_blocking(password.to_string()).await?,
        };
        self.call(move |db| db.insert_user(&user)).await
    }

    /// The user if `password` matches the stored hash.
    pub async fn authenticate(&self, id: i64, password: &str) -> Result<Option<User>, StoreError> {
        let Some((user, stored)) = self.call(move |db| db.user_with_password(id)).await? else {
            return Ok(None);
        };
        let candidate = password.to_string();
        let matches = tokio::task::spawn_blocking(move || password::verify_password(&candidate, &stored))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(matches.then_some(user))
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.call(move |db| db.get_user(id)).await
    }

    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.call(|db| db.list_users()).await
    }

    pub async fn usernames_for(&self, ids: Vec<i64>) -> Result<Vec<String>, StoreError> {
        self.call(move |db| db.usernames_for(&ids)).await
    }

    /// Import `id,username,password` CSV text. Rows whose id already exists
    /// are skipped along with malformed rows.
    pub async fn import_users_csv(&self, text: &str) -> Result<ImportSummary, StoreError> {
        let (rows, malformed) = parse_user_csv(text);
        let total = rows.len();
        let mut users = Vec::with_capacity(total);
        for row in rows {
            users.push(NewUser {
                id: row.id,
                username: row.username,
                password_hash: hash_blocking(row.password).await?,
            });
        }
        let inserted = self.call(move |db| db.insert_users(&users)).await?;
        let summary = ImportSummary { imported: inserted, skipped: malformed + (total - inserted) };
        debug!(imported = summary.imported, skipped = summary.skipped, "csv import");
        Ok(summary)
    }

    // ── Channels ─────────────────────────────────────────────────────────

    pub async fn channels_for(&self, user_id: i64) -> Result<Vec<Channel>, StoreError> {
        self.call(move |db| db.channels_for(user_id)).await
    }

    pub async fn get_channel(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        self.call(move |db| db.get_channel(id)).await
    }

    pub async fn create_channel(&self, name: &str) -> Result<Channel, StoreError> {
        let name = name.to_string();
        self.call(move |db| db.create_channel(&name)).await
    }

    pub async fn create_group(&self, name: &str, creator_id: i64, member_ids: Vec<i64>) -> Result<Channel, StoreError> {
        let name = name.to_string();
        self.call(move |db| db.create_group(&name, creator_id, &member_ids)).await
    }

    pub async fn rename_channel(&self, id: i64, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.call(move |db| db.rename_channel(id, &name)).await
    }

    pub async fn delete_channel(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |db| db.delete_channel(id)).await
    }

    pub async fn channel_members(&self, channel_id: i64) -> Result<Vec<User>, StoreError> {
        self.call(move |db| db.channel_members(channel_id)).await
    }

    pub async fn add_members(&self, channel_id: i64, user_ids: Vec<i64>) -> Result<usize, StoreError> {
        self.call(move |db| db.add_members(channel_id, &user_ids)).await
    }

    pub async fn remove_members(&self, channel_id: i64, user_ids: Vec<i64>) -> Result<usize, StoreError> {
        self.call(move |db| db.remove_members(channel_id, &user_ids)).await
    }

    pub async fn is_channel_member(&self, channel_id: i64, user_id: i64) -> Result<bool, StoreError> {
        self.call(move |db| db.is_channel_member(channel_id, user_id)).await
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub async fn messages_in(&self, channel_id: i64) -> Result<Vec<Message>, StoreError> {
        self.call(move |db| db.messages_in(channel_id)).await
    }

    pub async fn post_message(
        &self,
        channel_id: i64,
        user: &str,
        text: &str,
        reply_to_id: Option<i64>,
    ) -> Result<Message, StoreError> {
        let (user, text) = (user.to_string(), text.to_string());
        self.call(move |db| db.insert_message(channel_id, &user, &text, reply_to_id)).await
    }

    pub async fn message_author(&self, id: i64) -> Result<Option<String>, StoreError> {
        self.call(move |db| db.message_author(id)).await
    }

    pub async fn delete_message(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |db| db.delete_message(id)).await
    }

    // ── Read receipts ────────────────────────────────────────────────────

    pub async fn mark_read(&self, user_id: i64, channel_id: i64, last_message_id: i64) -> Result<(), StoreError> {
        self.call(move |db| db.mark_read(user_id, channel_id, last_message_id)).await
    }

    pub async fn last_read(&self, user_id: i64, channel_id: i64) -> Result<i64, StoreError> {
        self.call(move |db| db.last_read(user_id, channel_id)).await
    }

    pub async fn unread_counts(&self, user_id: i64) -> Result<BTreeMap<i64, i64>, StoreError> {
        self.call(move |db| db.unread_counts(user_id)).await
    }
}

async fn hash_blocking(clear: String) -> Result<String, StoreError> {
    tokio::task::spawn_blocking(move || password::hash_password(&clear))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
