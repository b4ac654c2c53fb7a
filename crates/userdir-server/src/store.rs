//! In-memory user record table
//!
//! Seeded once at startup and read-only afterwards, so concurrent lookups
//! need no synchronization beyond sharing the store behind an `Arc`.

use std::collections::HashMap;

/// The user lookup table.
#[derive(Debug)]
pub struct RecordStore {
    users: HashMap<u32, String>,
}

impl RecordStore {
    /// Store with the fixed seed entry.
    pub fn with_seed_data() -> Self {
        let mut users = HashMap::new();
        users.insert(1, "Nicolas".to_string());
        Self { users }
    }

    /// Look up a user's display name.
    pub fn get(&self, id: u32) -> Option<&str> {
        self.users.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
