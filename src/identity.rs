use std::sync::{Arc, Mutex, PoisonError};

use crate::storage::Storage;

/// Storage key holding the visitor id.
pub const USER_ID_KEY: &str = "experiment-user-id";

/// Visitor id reported outside of a client context.
pub const SERVER_USER_ID: &str = "server";

/// Where the code is running.
///
/// Visitor-level state only makes sense on a client. On a server there is no visitor to attribute
/// anything to, so identity resolution returns [`SERVER_USER_ID`] and tracking is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionContext {
    #[default]
    Client,
    Server,
}

/// Produces a stable per-visitor identifier, persisted in [`Storage`].
pub struct IdentityResolver {
    storage: Arc<dyn Storage + Send + Sync>,
    context: ExecutionContext,
    /// Serializes the read, generate, write sequence so concurrent callers agree on one id.
    create_lock: Mutex<()>,
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn Storage + Send + Sync>, context: ExecutionContext) -> Self {
        IdentityResolver {
            storage,
            context,
            create_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Return the visitor id, creating and persisting a new one on first use.
    pub fn get_user_id(&self) -> String {
        if self.context == ExecutionContext::Server {
            return SERVER_USER_ID.to_owned();
        }

        if let Some(user_id) = self.stored_user_id() {
            return user_id;
        }

        // The guard protects no data, so a poisoned lock is still usable.
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(user_id) = self.stored_user_id() {
            return user_id;
        }

        let user_id = uuid::Uuid::new_v4().to_string();
        if let Err(err) = self.storage.set(USER_ID_KEY, &user_id) {
            // The id is still usable for this call; it just won't survive the session.
            log::warn!(target: "edge_experiments", "failed to persist visitor id: {:?}", err);
        }
        log::debug!(target: "edge_experiments", user_id:display = user_id; "created visitor id");
        user_id
    }

    fn stored_user_id(&self) -> Option<String> {
        self.storage.get(USER_ID_KEY).filter(|it| !it.is_empty())
    }
}
