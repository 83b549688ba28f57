//! Profile persistence behind the `ProfileStore` trait.
//!
//! [`MemoryProfileStore`] is the default backend. [`PgProfileStore`] (feature
//! `postgres`) keeps the same contract on top of a `sqlx` pool. Both are
//! initialized once at startup and closed once by the shutdown sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::context::Principal;

/// First identifier handed out by `create_user`.
const FIRST_USER_ID: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found")]
    NotFound,
    #[error("user already exists")]
    AlreadyExists,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("store is closed")]
    Closed,
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
}

impl User {
    /// Profile synthesized from identity data when nothing is stored yet.
    fn from_principal(principal: &Principal) -> Self {
        Self {
            id: principal.id.clone(),
            username: principal.username.clone(),
            email: principal.email.clone(),
            name: format!("User {}", principal.id),
            phone: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Prepares the backend. Failure is fatal at startup.
    async fn initialize(&self) -> Result<(), StoreError>;

    async fn get_user(&self, id: &str) -> Result<User, StoreError>;

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError>;

    /// Stored profile for the caller, or one derived from the principal.
    async fn get_profile(&self, principal: &Principal) -> Result<User, StoreError>;

    /// Creates or updates the caller's profile.
    async fn update_profile(
        &self,
        principal: &Principal,
        update: ProfileUpdate,
    ) -> Result<User, StoreError>;

    /// Releases the backend. Later calls fail with `Closed`.
    async fn close(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryProfileStore
// ---------------------------------------------------------------------------

/// Uniqueness index key: usernames and emails share one map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    Username(String),
    Email(String),
}

impl Identity {
    fn value(&self) -> &str {
        match self {
            Self::Username(v) | Self::Email(v) => v,
        }
    }
}

#[derive(Debug)]
pub struct MemoryProfileStore {
    users: DashMap<String, User>,
    /// Claimed usernames and emails, mapped to the owning user id.
    identities: DashMap<Identity, String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            identities: DashMap::new(),
            next_id: AtomicU64::new(FIRST_USER_ID),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Claims `key` for `id`; false if another user already holds it.
    fn claim(&self, key: Identity, id: &str) -> bool {
        match self.identities.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(id.to_owned());
                true
            }
            Entry::Occupied(_) => false,
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        self.ensure_open()?;
        self.users
            .get(id)
            .map(|u| u.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        self.ensure_open()?;
        if !new_user.email.contains('@') {
            return Err(StoreError::InvalidEmail);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let username = Identity::Username(new_user.username.clone());
        if !self.claim(username.clone(), &id) {
            return Err(StoreError::AlreadyExists);
        }
        if !self.claim(Identity::Email(new_user.email.clone()), &id) {
            self.identities.remove(&username);
            return Err(StoreError::AlreadyExists);
        }

        let user = User {
            id: id.clone(),
            username: new_user.username,
            email: new_user.email,
            name: new_user.name,
            phone: String::new(),
        };
        self.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_profile(&self, principal: &Principal) -> Result<User, StoreError> {
        self.ensure_open()?;
        Ok(self
            .users
            .get(&principal.id)
            .map_or_else(|| User::from_principal(principal), |u| u.value().clone()))
    }

    async fn update_profile(
        &self,
        principal: &Principal,
        update: ProfileUpdate,
    ) -> Result<User, StoreError> {
        self.ensure_open()?;
        let mut entry = self.users.entry(principal.id.clone()).or_insert_with(|| {
            for key in [
                Identity::Username(principal.username.clone()),
                Identity::Email(principal.email.clone()),
            ] {
                if !key.value().is_empty() {
                    self.identities
                        .entry(key)
                        .or_insert_with(|| principal.id.clone());
                }
            }
            User::from_principal(principal)
        });
        if !update.name.trim().is_empty() {
            entry.name = update.name;
        }
        entry.phone = update.phone;
        Ok(entry.value().clone())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PgProfileStore
// ---------------------------------------------------------------------------

#[cfg(feature = "postgres")]
pub use postgres::PgProfileStore;

#[cfg(feature = "postgres")]
mod postgres {
    use std::time::Duration;

    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;

    use super::{NewUser, Principal, ProfileStore, ProfileUpdate, StoreError, User, FIRST_USER_ID};

    const SCHEMA: &[&str] = &[
        "CREATE SEQUENCE IF NOT EXISTS user_profile_id_seq",
        r"CREATE TABLE IF NOT EXISTS user_profiles (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            email TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT ''
        )",
    ];

    #[derive(Debug, sqlx::FromRow)]
    struct UserRow {
        id: String,
        username: String,
        email: String,
        name: String,
        phone: String,
    }

    impl From<UserRow> for User {
        fn from(row: UserRow) -> Self {
            Self {
                id: row.id,
                username: row.username,
                email: row.email,
                name: row.name,
                phone: row.phone,
            }
        }
    }

    fn backend(err: sqlx::Error) -> StoreError {
        match err {
            sqlx::Error::PoolClosed => StoreError::Closed,
            other => StoreError::Backend(other.into()),
        }
    }

    /// PostgreSQL-backed store. The pool connects lazily; `initialize`
    /// verifies connectivity and creates the table.
    #[derive(Debug, Clone)]
    pub struct PgProfileStore {
        pool: PgPool,
    }

    impl PgProfileStore {
        /// # Errors
        ///
        /// Returns an error if `database_url` cannot be parsed.
        pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect_lazy(database_url)
                .map_err(backend)?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl ProfileStore for PgProfileStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(backend)?;
            }
            Ok(())
        }

        async fn get_user(&self, id: &str) -> Result<User, StoreError> {
            sqlx::query_as::<_, UserRow>(
                "SELECT id, username, email, name, phone FROM user_profiles WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(User::from)
            .ok_or(StoreError::NotFound)
        }

        async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
            if !new_user.email.contains('@') {
                return Err(StoreError::InvalidEmail);
            }
            let exists: Option<String> = sqlx::query_scalar(
                "SELECT id FROM user_profiles WHERE username = $1 OR email = $2",
            )
            .bind(&new_user.username)
            .bind(&new_user.email)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
            if exists.is_some() {
                return Err(StoreError::AlreadyExists);
            }

            #[allow(clippy::cast_possible_wrap)]
            let offset = FIRST_USER_ID as i64;
            sqlx::query_as::<_, UserRow>(
                r"INSERT INTO user_profiles (id, username, email, name)
                  VALUES ((nextval('user_profile_id_seq') + $1 - 1)::text, $2, $3, $4)
                  RETURNING id, username, email, name, phone",
            )
            .bind(offset)
            .bind(&new_user.username)
            .bind(&new_user.email)
            .bind(&new_user.name)
            .fetch_one(&self.pool)
            .await
            .map(User::from)
            .map_err(backend)
        }

        async fn get_profile(&self, principal: &Principal) -> Result<User, StoreError> {
            match self.get_user(&principal.id).await {
                Err(StoreError::NotFound) => Ok(User::from_principal(principal)),
                other => other,
            }
        }

        async fn update_profile(
            &self,
            principal: &Principal,
            update: ProfileUpdate,
        ) -> Result<User, StoreError> {
            let fallback = User::from_principal(principal);
            let name = if update.name.trim().is_empty() {
                None
            } else {
                Some(update.name)
            };
            sqlx::query_as::<_, UserRow>(
                r"INSERT INTO user_profiles (id, username, email, name, phone)
                  VALUES ($1, $2, $3, COALESCE($4, $5), $6)
                  ON CONFLICT (id) DO UPDATE
                  SET name = COALESCE($4, user_profiles.name), phone = EXCLUDED.phone
                  RETURNING id, username, email, name, phone",
            )
            .bind(&fallback.id)
            .bind(&fallback.username)
            .bind(&fallback.email)
            .bind(name)
            .bind(&fallback.name)
            .bind(&update.phone)
            .fetch_one(&self.pool)
            .await
            .map(User::from)
            .map_err(backend)
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.pool.close().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal {
            id: "42".into(),
            username: "alice".into(),
            email: "alice@example.com".into(),
        }
    }

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: email.into(),
            name: "Some One".into(),
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryProfileStore::new();
        store.initialize().await.unwrap();

        let created = store.create_user(new_user("bob", "bob@example.com")).await.unwrap();
        assert_eq!(created.id, "100");
        assert_eq!(store.get_user("100").await.unwrap(), created);
    }

    #[tokio::test]
    async fn duplicate_username_or_email_conflicts() {
        let store = MemoryProfileStore::new();
        store.create_user(new_user("bob", "bob@example.com")).await.unwrap();

        assert!(matches!(
            store.create_user(new_user("bob", "other@example.com")).await,
            Err(StoreError::AlreadyExists)
        ));
        assert!(matches!(
            store.create_user(new_user("robert", "bob@example.com")).await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_admit_one_owner_per_username() {
        let store = std::sync::Arc::new(MemoryProfileStore::new());
        let attempts: Vec<_> = (0..32)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .create_user(new_user("racer", &format!("racer{n}@example.com")))
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, StoreError::AlreadyExists)),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn rejected_create_releases_its_username() {
        let store = MemoryProfileStore::new();
        store.create_user(new_user("bob", "bob@example.com")).await.unwrap();

        // Username free, email taken: the username claim is rolled back.
        assert!(store.create_user(new_user("carol", "bob@example.com")).await.is_err());
        store
            .create_user(new_user("carol", "carol@example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upserted_profile_reserves_principal_identity() {
        let store = MemoryProfileStore::new();
        store
            .update_profile(&alice(), ProfileUpdate { name: "Alice".into(), phone: String::new() })
            .await
            .unwrap();

        assert!(matches!(
            store.create_user(new_user("alice", "someone@example.com")).await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn email_without_at_is_invalid() {
        let store = MemoryProfileStore::new();
        assert!(matches!(
            store.create_user(new_user("bob", "nope")).await,
            Err(StoreError::InvalidEmail)
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let store = MemoryProfileStore::new();
        assert!(matches!(store.get_user("999").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn profile_falls_back_to_principal() {
        let store = MemoryProfileStore::new();
        let profile = store.get_profile(&alice()).await.unwrap();
        assert_eq!(profile.id, "42");
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.name, "User 42");
    }

    #[tokio::test]
    async fn update_profile_upserts() {
        let store = MemoryProfileStore::new();
        let update = ProfileUpdate {
            name: "Alice Liddell".into(),
            phone: "555-0100".into(),
        };
        let updated = store.update_profile(&alice(), update).await.unwrap();
        assert_eq!(updated.name, "Alice Liddell");
        assert_eq!(updated.phone, "555-0100");

        let blank_name = ProfileUpdate {
            name: String::new(),
            phone: "555-0199".into(),
        };
        let again = store.update_profile(&alice(), blank_name).await.unwrap();
        assert_eq!(again.name, "Alice Liddell");
        assert_eq!(store.get_profile(&alice()).await.unwrap().phone, "555-0199");
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryProfileStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get_user("1").await, Err(StoreError::Closed)));
        assert!(matches!(store.initialize().await, Err(StoreError::Closed)));
    }

    #[test]
    fn empty_phone_is_omitted_from_json() {
        let user = User::from_principal(&alice());
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("phone").is_none());
    }
}
