//! In-process credential store and transaction coordinator
//!
//! Both share one [`MemoryDatabase`]. Users created while an
//! [`InMemoryTransactionCoordinator`] scope is active stay pending: only the
//! creating scope sees them, and a competing create for the same email or
//! username waits until that scope settles. The scope's guard publishes its
//! rows on commit and removes them otherwise, so failures, panics and dropped
//! futures all roll back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::auth::crypto::{self, BCRYPT_COST, CONFIRMATION_TOKEN_TTL_HOURS};
use crate::core::auth::models::UserIdentity;
use crate::core::auth::outcome::{AuthFailure, Outcome};
use crate::core::auth::ports::{CredentialStore, TransactionCoordinator, TransactionScope};
use crate::core::auth::validation::{normalize_email, validate_registration};

type ScopeId = u64;

#[derive(Debug, Clone)]
struct StoredUser {
    id: Uuid,
    username: String,
    email: String,
    password_hash: String,
    email_confirmed: bool,
    /// Scope that created the row and has not committed yet
    pending_in: Option<ScopeId>,
}

impl StoredUser {
    fn identity(&self) -> UserIdentity {
        UserIdentity {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            email_confirmed: self.email_confirmed,
        }
    }
}

#[derive(Debug, Clone)]
struct UsernameClaim {
    email_key: String,
    pending_in: Option<ScopeId>,
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    token_hash: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CreatedUser {
    email_key: String,
    username: String,
}

/// State of one open transaction scope
#[derive(Debug)]
struct ActiveScope {
    id: ScopeId,
    created: Mutex<Vec<CreatedUser>>,
}

impl ActiveScope {
    fn record(&self, created: CreatedUser) {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(created);
    }

    fn take(&self) -> Vec<CreatedUser> {
        std::mem::take(&mut *self.created.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

tokio::task_local! {
    static ACTIVE_SCOPE: Arc<ActiveScope>;
}

fn current_scope() -> Option<Arc<ActiveScope>> {
    ACTIVE_SCOPE.try_with(Arc::clone).ok()
}

fn current_scope_id() -> Option<ScopeId> {
    ACTIVE_SCOPE.try_with(|scope| scope.id).ok()
}

/// Committed rows are visible everywhere, pending rows only to their scope
fn visible_to(pending_in: Option<ScopeId>, scope: Option<ScopeId>) -> bool {
    pending_in.is_none() || pending_in == scope
}

enum Conflict {
    Duplicate(AuthFailure),
    /// The key is held by another scope that has not settled yet
    Pending,
}

fn conflict(
    pending_in: Option<ScopeId>,
    scope: Option<ScopeId>,
    duplicate: fn() -> AuthFailure,
) -> Conflict {
    match pending_in {
        Some(owner) if Some(owner) != scope => Conflict::Pending,
        _ => Conflict::Duplicate(duplicate()),
    }
}

/// Shared state behind the in-memory adapters
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    /// normalized email -> user
    users: DashMap<String, StoredUser>,
    usernames: DashMap<String, UsernameClaim>,
    /// normalized email -> the live confirmation for that address
    confirmations: DashMap<String, PendingConfirmation>,
    /// Woken whenever a scope commits or rolls back
    settled: Notify,
    next_scope: AtomicU64,
}

impl MemoryDatabase {
    fn insert_user(
        &self,
        user: StoredUser,
        email_key: &str,
        scope: Option<ScopeId>,
    ) -> Result<(), Conflict> {
        match self.usernames.entry(user.username.clone()) {
            Entry::Occupied(claim) => {
                return Err(conflict(
                    claim.get().pending_in,
                    scope,
                    AuthFailure::duplicate_username,
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(UsernameClaim {
                    email_key: email_key.to_string(),
                    pending_in: scope,
                });
            }
        }

        let taken = match self.users.entry(email_key.to_string()) {
            Entry::Occupied(existing) => {
                conflict(existing.get().pending_in, scope, AuthFailure::duplicate_email)
            }
            Entry::Vacant(slot) => {
                slot.insert(user);
                return Ok(());
            }
        };

        self.usernames.remove(&user.username);
        Err(taken)
    }

    fn visible_user(&self, email_key: &str, scope: Option<ScopeId>) -> Option<StoredUser> {
        self.users
            .get(email_key)
            .filter(|user| visible_to(user.pending_in, scope))
            .map(|user| user.clone())
    }

    fn user_by_login(&self, username_or_email: &str, scope: Option<ScopeId>) -> Option<StoredUser> {
        if let Some(user) = self.visible_user(&normalize_email(username_or_email), scope) {
            return Some(user);
        }

        let email_key = self
            .usernames
            .get(username_or_email)
            .filter(|claim| visible_to(claim.pending_in, scope))?
            .email_key
            .clone();
        self.visible_user(&email_key, scope)
    }

    fn publish(&self, created: Vec<CreatedUser>) {
        for row in created {
            if let Some(mut user) = self.users.get_mut(&row.email_key) {
                user.pending_in = None;
            }
            if let Some(mut claim) = self.usernames.get_mut(&row.username) {
                claim.pending_in = None;
            }
        }
        self.settled.notify_waiters();
    }

    fn revert(&self, created: Vec<CreatedUser>) {
        for row in created.into_iter().rev() {
            self.users.remove(&row.email_key);
            self.usernames.remove(&row.username);
            self.confirmations.remove(&row.email_key);
        }
        self.settled.notify_waiters();
    }

    /// Rows stored, pending ones included
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// [`CredentialStore`] over a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct InMemoryCredentialStore {
    db: Arc<MemoryDatabase>,
    bcrypt_cost: u32,
}

impl InMemoryCredentialStore {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            bcrypt_cost: BCRYPT_COST,
        }
    }

    /// Override the bcrypt cost (tests use the minimum)
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn verify_password(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> Outcome<UserIdentity> {
        let user = self
            .db
            .user_by_login(username_or_email, current_scope_id())
            .ok_or_else(AuthFailure::user_not_found)?;

        if !crypto::verify_password(password, &user.password_hash).await? {
            return Err(AuthFailure::invalid_credentials());
        }

        Ok(user.identity())
    }

    async fn create(&self, username: &str, email: &str, password: &str) -> Outcome<UserIdentity> {
        validate_registration(username, email, password)?;

        let password_hash = crypto::hash_password(password, self.bcrypt_cost).await?;
        let email_key = normalize_email(email);
        let scope = current_scope();
        let scope_id = scope.as_ref().map(|scope| scope.id);

        let user = StoredUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.trim().to_string(),
            password_hash,
            email_confirmed: false,
            pending_in: scope_id,
        };

        loop {
            // Registered before the attempt so a settle in between is not missed
            let settled = self.db.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            match self.db.insert_user(user.clone(), &email_key, scope_id) {
                Ok(()) => break,
                Err(Conflict::Duplicate(failure)) => return Err(failure),
                Err(Conflict::Pending) => {
                    tracing::debug!(username, "waiting for a pending registration to settle");
                    settled.await;
                }
            }
        }

        if let Some(scope) = scope {
            scope.record(CreatedUser {
                email_key,
                username: user.username.clone(),
            });
        }

        tracing::debug!(user_id = %user.id, "user created");
        Ok(user.identity())
    }

    async fn find_by_email(&self, email: &str) -> Outcome<UserIdentity> {
        self.db
            .visible_user(&normalize_email(email), current_scope_id())
            .map(|user| user.identity())
            .ok_or_else(AuthFailure::user_not_found)
    }

    async fn find_by_id(&self, id: Uuid) -> Outcome<UserIdentity> {
        let scope = current_scope_id();
        self.db
            .users
            .iter()
            .find(|user| user.id == id && visible_to(user.pending_in, scope))
            .map(|user| user.identity())
            .ok_or_else(AuthFailure::user_not_found)
    }

    async fn confirm_email(&self, email: &str, token: &str) -> Outcome<UserIdentity> {
        let scope = current_scope_id();
        let email_key = normalize_email(email);
        if self.db.visible_user(&email_key, scope).is_none() {
            return Err(AuthFailure::user_not_found());
        }

        let token_hash = crypto::hash_token(token);
        let (_, pending) = self
            .db
            .confirmations
            .remove_if(&email_key, |_, pending| pending.token_hash == token_hash)
            .ok_or_else(AuthFailure::invalid_or_expired_token)?;

        if pending.expires_at <= Utc::now() {
            return Err(AuthFailure::invalid_or_expired_token());
        }

        let mut user = self
            .db
            .users
            .get_mut(&email_key)
            .ok_or_else(AuthFailure::user_not_found)?;
        user.email_confirmed = true;

        tracing::debug!(user_id = %user.id, "email confirmed");
        Ok(user.identity())
    }

    async fn generate_confirmation_token(&self, email: &str) -> Outcome<String> {
        let email_key = normalize_email(email);
        if self.db.visible_user(&email_key, current_scope_id()).is_none() {
            return Err(AuthFailure::user_not_found());
        }

        let token = crypto::generate_confirmation_token();

        // One slot per address: a new token replaces any earlier one
        self.db.confirmations.insert(
            email_key,
            PendingConfirmation {
                token_hash: crypto::hash_token(&token),
                expires_at: Utc::now() + Duration::hours(CONFIRMATION_TOKEN_TTL_HOURS),
            },
        );

        Ok(token)
    }
}

/// Publishes the scope's rows on commit, removes them otherwise
struct ScopeGuard {
    db: Arc<MemoryDatabase>,
    scope: Arc<ActiveScope>,
    committed: bool,
}

impl ScopeGuard {
    fn commit(mut self) {
        self.committed = true;
        self.db.publish(self.scope.take());
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let created = self.scope.take();
        let count = created.len();
        self.db.revert(created);
        tracing::debug!(reverted = count, "in-memory transaction rolled back");
    }
}

/// [`TransactionCoordinator`] for [`InMemoryCredentialStore`]
#[derive(Debug, Clone)]
pub struct InMemoryTransactionCoordinator {
    db: Arc<MemoryDatabase>,
}

impl InMemoryTransactionCoordinator {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionCoordinator for InMemoryTransactionCoordinator {
    async fn run<'a>(&'a self, scope: TransactionScope<'a>) -> Outcome<()> {
        // Nested scopes join the outer transaction
        if current_scope().is_some() {
            return scope.await;
        }

        let active = Arc::new(ActiveScope {
            id: self.db.next_scope.fetch_add(1, Ordering::Relaxed),
            created: Mutex::default(),
        });
        let guard = ScopeGuard {
            db: Arc::clone(&self.db),
            scope: Arc::clone(&active),
            committed: false,
        };

        let result = ACTIVE_SCOPE.scope(active, scope).await;

        if result.is_ok() {
            guard.commit();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::outcome::FailureKind;
    use crate::core::auth::ports::transactional;
    use futures::FutureExt;

    fn store() -> InMemoryCredentialStore {
        InMemoryCredentialStore::new(Arc::new(MemoryDatabase::default())).with_bcrypt_cost(4)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = store();
        let user = store
            .create("alice", "Alice@X.com", "Password1")
            .await
            .unwrap();

        assert_eq!(user.username, "alice");
        assert!(!user.email_confirmed);

        let found = store.find_by_email("alice@x.com").await.unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(store.find_by_id(user.id).await.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let err = store()
            .create("alice", "not-an-email", "Password1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[tokio::test]
    async fn test_create_duplicates() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();

        let err = store
            .create("alice2", "ALICE@x.com", "Password1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DuplicateEmail);
        // The username reservation of the failed attempt is released
        assert!(store.create("alice2", "other@x.com", "Password1").await.is_ok());

        let err = store
            .create("alice", "third@x.com", "Password1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DuplicateUsername);
    }

    #[tokio::test]
    async fn test_verify_password_by_email_or_username() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();

        assert!(store.verify_password("alice", "Password1").await.is_ok());
        assert!(store.verify_password("alice@x.com", "Password1").await.is_ok());

        let err = store.verify_password("alice", "Wrong1234").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidCredentials);

        let err = store.verify_password("bob", "Password1").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::UserNotFound);
    }

    #[tokio::test]
    async fn test_confirmation_token_single_use() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();

        let token = store.generate_confirmation_token("alice@x.com").await.unwrap();
        let confirmed = store.confirm_email("alice@x.com", &token).await.unwrap();
        assert!(confirmed.email_confirmed);

        let err = store.confirm_email("alice@x.com", &token).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidOrExpiredToken);
    }

    #[tokio::test]
    async fn test_new_confirmation_token_supersedes_old_one() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();

        let first = store.generate_confirmation_token("alice@x.com").await.unwrap();
        let second = store.generate_confirmation_token("alice@x.com").await.unwrap();

        let err = store.confirm_email("alice@x.com", &first).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidOrExpiredToken);
        assert!(store.confirm_email("alice@x.com", &second).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirmation_token_bound_to_email() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();
        store.create("bobby", "bob@x.com", "Password1").await.unwrap();

        let token = store.generate_confirmation_token("alice@x.com").await.unwrap();
        let err = store.confirm_email("bob@x.com", &token).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidOrExpiredToken);

        // Still usable by its owner
        assert!(store.confirm_email("alice@x.com", &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_confirmation_for_unknown_user() {
        let store = store();
        let err = store
            .generate_confirmation_token("ghost@x.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::UserNotFound);

        let err = store.confirm_email("ghost@x.com", "t").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::UserNotFound);
    }

    #[tokio::test]
    async fn test_transaction_commits_on_success() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));

        let user = transactional(&coordinator, store.create("alice", "alice@x.com", "Password1"))
            .await
            .unwrap();

        assert_eq!(store.find_by_email("alice@x.com").await.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_failure() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));

        let result: Outcome<()> = transactional(&coordinator, async {
            store.create("alice", "alice@x.com", "Password1").await?;
            Err(AuthFailure::issuance("signing key unavailable"))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::IssuanceError);
        let err = store.find_by_email("alice@x.com").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::UserNotFound);
        // Username is free again
        assert!(store.create("alice", "alice@x.com", "Password1").await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_panic() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));

        fn fault() -> Outcome<()> {
            panic!("unexpected fault")
        }

        let outcome = std::panic::AssertUnwindSafe(transactional(&coordinator, async {
            store.create("alice", "alice@x.com", "Password1").await?;
            fault()
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(store.database().user_count(), 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_when_cancelled() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));

        let work = transactional(&coordinator, async {
            store.create("alice", "alice@x.com", "Password1").await?;
            futures::future::pending::<()>().await;
            Ok::<(), AuthFailure>(())
        });

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), work).await;

        assert!(timed_out.is_err());
        assert_eq!(store.database().user_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_user_is_visible_only_inside_its_scope() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let scoped = {
            let store = store.clone();
            tokio::spawn(async move {
                transactional(&coordinator, async {
                    store.create("alice", "alice@x.com", "Password1").await?;
                    let own = store.find_by_email("alice@x.com").await?;
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, AuthFailure>(own.id)
                })
                .await
            })
        };

        entered_rx.await.unwrap();
        for lookup in [
            store.find_by_email("alice@x.com").await,
            store.verify_password("alice", "Password1").await,
        ] {
            assert_eq!(lookup.unwrap_err().kind(), FailureKind::UserNotFound);
        }
        let err = store
            .generate_confirmation_token("alice@x.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::UserNotFound);

        release_tx.send(()).unwrap();
        let id = scoped.await.unwrap().unwrap();
        assert_eq!(store.find_by_email("alice@x.com").await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_competing_create_waits_for_pending_scope() {
        let store = store();
        let coordinator = InMemoryTransactionCoordinator::new(Arc::clone(store.database()));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let scoped = {
            let store = store.clone();
            tokio::spawn(async move {
                transactional(&coordinator, async {
                    store.create("alice", "alice@x.com", "Password1").await?;
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Err::<(), _>(AuthFailure::issuance("signing key unavailable"))
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let competing = {
            let store = store.clone();
            tokio::spawn(async move { store.create("alice", "alice@x.com", "Password1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!competing.is_finished());

        release_tx.send(()).unwrap();
        assert!(scoped.await.unwrap().is_err());
        let created = competing.await.unwrap().unwrap();
        assert_eq!(store.find_by_email("alice@x.com").await.unwrap().id, created.id);
    }

    #[tokio::test]
    async fn test_concurrent_confirmation_tokens_leave_one_live() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();

        let (first, second) = tokio::join!(
            store.generate_confirmation_token("alice@x.com"),
            store.generate_confirmation_token("alice@x.com"),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let confirmed = [
            store.confirm_email("alice@x.com", &first).await.is_ok(),
            store.confirm_email("alice@x.com", &second).await.is_ok(),
        ];
        assert_eq!(confirmed.iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn test_writes_outside_transaction_are_final() {
        let store = store();
        store.create("alice", "alice@x.com", "Password1").await.unwrap();
        assert_eq!(store.database().user_count(), 1);
    }
}
