use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::util::AsyncQueue;

/// The identity the client operates as. Pending mutations and overlays are
/// partitioned per user, so a user change swaps the visible local state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which this user's mutation queue and overlays are stored.
    pub fn storage_key(&self) -> String {
        match &self.uid {
            Some(uid) => format!("uid:{uid}"),
            None => "anonymous".to_string(),
        }
    }
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Source of auth tokens and user-change notifications.
///
/// Streams fetch a fresh token before every (re)connect. After the backend
/// rejects a token the caller invalidates it and retries exactly once with
/// `force_refresh`.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// The token for the current user, or `None` when unauthenticated.
    async fn get_token(&self, force_refresh: bool) -> SyncResult<Option<String>>;

    /// Marks any cached token as unusable.
    fn invalidate_token(&self);

    fn current_user(&self) -> User;

    /// Begins observing user changes. `on_user_change` fires on `queue`,
    /// first with the current user.
    fn start(&self, queue: AsyncQueue, on_user_change: UserChangeListener);

    fn shutdown(&self);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

/// Permanently unauthenticated provider; tokens are absent.
#[derive(Default)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> SyncResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn current_user(&self) -> User {
        User::unauthenticated()
    }

    fn start(&self, queue: AsyncQueue, on_user_change: UserChangeListener) {
        queue.enqueue_and_forget(async move {
            on_user_change(User::unauthenticated());
        });
    }

    fn shutdown(&self) {}
}

struct StaticCredentialsState {
    user: User,
    token: Option<String>,
    queue: Option<AsyncQueue>,
    listener: Option<UserChangeListener>,
}

/// Provider with a fixed token per user, switchable at runtime. Embedders
/// with their own auth plumbing (and tests) drive user changes through
/// [`StaticCredentialsProvider::set_user`].
pub struct StaticCredentialsProvider {
    state: StdMutex<StaticCredentialsState>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: StdMutex::new(StaticCredentialsState {
                user,
                token,
                queue: None,
                listener: None,
            }),
        }
    }

    /// Switches the active user and notifies the registered listener on the
    /// queue.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let (queue, listener) = {
            let mut state = self.state.lock().unwrap();
            state.user = user.clone();
            state.token = token;
            (state.queue.clone(), state.listener.clone())
        };
        if let (Some(queue), Some(listener)) = (queue, listener) {
            queue.enqueue_and_forget(async move {
                listener(user);
            });
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> SyncResult<Option<String>> {
        Ok(self.state.lock().unwrap().token.clone())
    }

    fn invalidate_token(&self) {}

    fn current_user(&self) -> User {
        self.state.lock().unwrap().user.clone()
    }

    fn start(&self, queue: AsyncQueue, on_user_change: UserChangeListener) {
        let user = {
            let mut state = self.state.lock().unwrap();
            state.queue = Some(queue.clone());
            state.listener = Some(on_user_change.clone());
            state.user.clone()
        };
        queue.enqueue_and_forget(async move {
            on_user_change(user);
        });
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue = None;
        state.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn storage_keys_distinguish_users() {
        assert_eq!(User::unauthenticated().storage_key(), "anonymous");
        assert_eq!(User::new("alice").storage_key(), "uid:alice");
        assert_ne!(User::new("alice"), User::new("bob"));
    }

    #[tokio::test]
    async fn static_provider_reports_user_changes_on_queue() {
        let queue = AsyncQueue::new();
        let provider = StaticCredentialsProvider::new(User::unauthenticated(), None);
        let seen: Arc<Mutex<Vec<User>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        provider.start(
            queue.clone(),
            Arc::new(move |user| sink.lock().unwrap().push(user)),
        );
        provider.set_user(User::new("alice"), Some("token-1".to_string()));
        queue.drain().await;

        let users = seen.lock().unwrap().clone();
        assert_eq!(users, vec![User::unauthenticated(), User::new("alice")]);
        assert_eq!(
            provider.get_token(false).await.unwrap(),
            Some("token-1".to_string())
        );
    }
}
