use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use sled::Db;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::Encoding;
use crate::routing::GameLog;
use crate::utils::{PubSubError, Result};

/// Player trees live under this prefix so no username can reach sled's own trees.
const TREE_PREFIX: &str = "logs/";

pub(crate) fn tree_name(username: &str) -> String {
    format!("{TREE_PREFIX}{username}")
}

#[derive(Clone)]
pub struct GameLogStore {
    db: Db,
    max_logs_per_player: Option<usize>,
    // records per player tree, loaded on first append
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl GameLogStore {
    /// Open or create a sled database at `path`, keeping at most
    /// `max_logs_per_player` records per player when set.
    pub fn open(path: &str, max_logs_per_player: Option<usize>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            max_logs_per_player,
            counts: Arc::default(),
        })
    }

    /// Append a log record to its player's tree, dropping the oldest ones past the cap.
    pub fn append(&self, log: &GameLog) -> Result<()> {
        let value = Encoding::Binary.encode(log).map_err(PubSubError::Encode)?;
        let name = tree_name(&log.username);
        let tree = self.db.open_tree(&name)?;

        let millis = log.current_time.timestamp_millis().max(0);
        let key = format!("{millis:020}_{}", Uuid::new_v4());

        let Some(max) = self.max_logs_per_player else {
            tree.insert(key.as_bytes(), value)?;
            debug!(username = %log.username, "game log stored");
            return Ok(());
        };

        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = match counts.get(&name) {
            Some(count) => *count,
            None => tree.len(),
        };
        let mut count = stored + usize::from(tree.insert(key.as_bytes(), value)?.is_none());
        while count > max {
            if tree.pop_min()?.is_none() {
                break;
            }
            count -= 1;
        }
        counts.insert(name, count);

        debug!(username = %log.username, "game log stored");
        Ok(())
    }

    /// Every stored log for `username`, oldest first.
    pub fn logs_for(&self, username: &str) -> Result<Vec<GameLog>> {
        let tree = self.db.open_tree(tree_name(username))?;
        let mut logs = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match Encoding::Binary.decode::<GameLog>(&value) {
                Ok(log) => logs.push(log),
                Err(e) => warn!(%username, "Skipping unreadable game log: {e}"),
            }
        }
        Ok(logs)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for GameLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameLogStore")
            .field("db", &"sled::Db")
            .field("max_logs_per_player", &self.max_logs_per_player)
            .finish()
    }
}
