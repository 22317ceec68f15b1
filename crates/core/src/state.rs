use crate::params::TransformParameters;
use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

const SCHEMA_VERSION: i32 = 1;
const STATE_KEY: &str = "persisted_state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub parameters: TransformParameters,
    #[serde(default)]
    pub enhancement_enabled: bool,
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
}

fn default_profile_name() -> String {
    "identity".to_string()
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            parameters: TransformParameters::default(),
            enhancement_enabled: false,
            profile_name: default_profile_name(),
        }
    }
}

enum WriteCommand {
    Update(PersistedState),
    Shutdown,
}

/// In-memory cache of the persisted state with write-behind to SQLite.
pub struct StateManager {
    db_path: PathBuf,
    state: Arc<RwLock<PersistedState>>,
    write_sender: Sender<WriteCommand>,
    write_thread: Option<thread::JoinHandle<()>>,
}

impl StateManager {
    pub fn open(app_data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(app_data_dir)
            .context("Failed to create app data directory")?;
        let db_path = app_data_dir.join("state.db");

        let conn = Connection::open(&db_path).context("Failed to open database")?;
        Self::init_database(&conn)?;

        let initial_state = Self::load_state(&conn)?;
        let state = Arc::new(RwLock::new(initial_state));
        drop(conn);

        let (write_sender, write_receiver): (Sender<WriteCommand>, Receiver<WriteCommand>) = unbounded();

        let db_path_clone = db_path.clone();
        let write_thread = thread::Builder::new()
            .name("state-writer".to_string())
            .spawn(move || Self::write_worker(db_path_clone, write_receiver))
            .context("Failed to spawn state writer thread")?;

        Ok(Self {
            db_path,
            state,
            write_sender,
            write_thread: Some(write_thread),
        })
    }

    fn init_database(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        if current_version.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        }

        Ok(())
    }

    fn load_state(conn: &Connection) -> Result<PersistedState> {
        let json_str: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = ?1", params![STATE_KEY], |row| row.get(0))
            .ok();

        match json_str {
            Some(json) => {
                let state: PersistedState =
                    serde_json::from_str(&json).context("Failed to parse state JSON")?;
                // Rows written by hand or by older builds may hold out-of-range values
                Ok(PersistedState {
                    parameters: state.parameters.clamped(),
                    ..state
                })
            }
            None => Ok(PersistedState::default()),
        }
    }

    fn write_worker(db_path: PathBuf, receiver: Receiver<WriteCommand>) {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                crate::log_error!("Failed to open database in write worker: {}", e);
                return;
            }
        };

        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                WriteCommand::Update(state) => {
                    let json = match serde_json::to_string(&state) {
                        Ok(json) => json,
                        Err(e) => {
                            crate::log_error!("Failed to serialize state: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = conn.execute(
                        "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
                        params![STATE_KEY, json],
                    ) {
                        crate::log_error!("Failed to write state: {}", e);
                    }
                }
                WriteCommand::Shutdown => {
                    break;
                }
            }
        }

        let _ = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&PersistedState) -> R,
    {
        f(&self.state.read())
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut state = self.state.write();
        f(&mut state);
        let _ = self.write_sender.send(WriteCommand::Update(state.clone()));
    }

    /// Drains pending writes and stops the writer thread.
    pub fn shutdown(&mut self) {
        let _ = self.write_sender.send(WriteCommand::Shutdown);
        if let Some(handle) = self.write_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
