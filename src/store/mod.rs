use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::models::user::UserRecord;

pub mod postgres;

/// User-record lookup consumed by the authentication middleware.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<UserRecord>>;
}

/// In-process user directory, used by tests and local tooling.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<DashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn set_active(&self, id: &str, active: bool) -> bool {
        match self.users.get_mut(id) {
            Some(mut user) => {
                user.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<UserRecord> {
        self.users.remove(id).map(|(_, user)| user)
    }
}

#[async_trait]
impl UserLookup for MemoryUserStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }
}
