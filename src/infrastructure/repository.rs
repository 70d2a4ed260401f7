use crate::domain::UserRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store corrupt: {0}")]
    Corrupt(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate: {0}")]
    Duplicate(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    #[must_use]
    async fn get(&self, username: &str) -> Result<UserRecord, RepositoryError>;
    /// Fails with `Duplicate` when the username is already taken.
    #[must_use]
    async fn insert(&self, user: &UserRecord) -> Result<(), RepositoryError>;
    #[must_use]
    async fn upsert(&self, user: &UserRecord) -> Result<(), RepositoryError>;
    /// Lookup for cancellation-class webhook events whose correlation
    /// value no longer resolves.
    #[must_use]
    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserRecord>, RepositoryError>;
    #[must_use]
    async fn count(&self) -> Result<usize, RepositoryError>;
}

/// Whole-collection JSON store on disk. Every mutation is a full
/// load-mutate-save cycle; writes go through one async mutex so two
/// tasks can never interleave their save cycles. This is a throughput
/// ceiling; the expected load is a single parent, occasionally.
#[derive(Debug)]
pub struct JsonFileUserStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileUserStore {
    /// Opens the store, performing one validating load. A file that
    /// exists but cannot be parsed is a startup error, never an empty
    /// store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let store = Self {
            path,
            write_lock: Mutex::new(()),
        };
        let users = store.load().await?;
        info!(
            "User store opened with {} record(s) at {}",
            users.len(),
            store.path.display()
        );
        Ok(store)
    }

    /// Missing file means first run: an empty store. Any other failure
    /// surfaces as-is.
    pub async fn load(&self) -> Result<BTreeMap<String, UserRecord>, RepositoryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RepositoryError::Corrupt(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the full mapping to a uniquely named temporary file in
    /// the same directory, then renames over the store path. A crash
    /// mid-write leaves the previous store intact.
    pub async fn save(&self, users: &BTreeMap<String, UserRecord>) -> Result<(), RepositoryError> {
        let bytes = serde_json::to_vec_pretty(users)
            .map_err(|e| RepositoryError::InvalidData(format!("serialize store: {}", e)))?;

        let tmp = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        match tokio::fs::rename(&tmp, &self.path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl UserRepository for JsonFileUserStore {
    async fn get(&self, username: &str) -> Result<UserRecord, RepositoryError> {
        let users = self.load().await?;
        users
            .get(username)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("User {}", username)))
    }

    async fn insert(&self, user: &UserRecord) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        if users.contains_key(&user.username) {
            return Err(RepositoryError::Duplicate(format!("User {}", user.username)));
        }
        users.insert(user.username.clone(), user.clone());
        self.save(&users).await
    }

    async fn upsert(&self, user: &UserRecord) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        users.insert(user.username.clone(), user.clone());
        self.save(&users).await
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserRecord>, RepositoryError> {
        let users = self.load().await?;
        Ok(users
            .into_values()
            .find(|u| u.subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.load().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir().join(format!("socratic-users-{}.json", Uuid::new_v4()))
    }

    fn test_user(username: &str) -> UserRecord {
        UserRecord::new(
            username.to_string(),
            "pbkdf2-sha256$1$c2FsdA$aGFzaA".to_string(),
            format!("{}@example.com", username),
            3,
        )
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_store() {
        let path = temp_store_path();
        let store = JsonFileUserStore::open(&path)
            .await
            .expect("Failed to open store");
        assert_eq!(store.count().await.expect("Failed to count"), 0);
    }

    #[tokio::test]
    async fn save_load_round_trip_preserves_content() {
        let path = temp_store_path();
        let store = JsonFileUserStore::open(&path)
            .await
            .expect("Failed to open store");

        store
            .insert(&test_user("ada"))
            .await
            .expect("Failed to insert");
        store
            .insert(&test_user("grace"))
            .await
            .expect("Failed to insert");

        let first = store.load().await.expect("Failed to load");
        store.save(&first).await.expect("Failed to save");
        let second = store.load().await.expect("Failed to reload");

        assert_eq!(first, second);
        assert_eq!(
            second.keys().cloned().collect::<Vec<_>>(),
            vec!["ada".to_string(), "grace".to_string()]
        );

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let path = temp_store_path();
        let store = JsonFileUserStore::open(&path)
            .await
            .expect("Failed to open store");

        store
            .insert(&test_user("ada"))
            .await
            .expect("Failed to insert");
        let err = store
            .insert(&test_user("ada"))
            .await
            .expect_err("Duplicate insert should fail");
        assert!(matches!(err, RepositoryError::Duplicate(_)));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn upsert_replaces_existing_record() {
        let path = temp_store_path();
        let store = JsonFileUserStore::open(&path)
            .await
            .expect("Failed to open store");

        let mut user = test_user("ada");
        store.insert(&user).await.expect("Failed to insert");

        user.is_premium = true;
        user.subscription_id = Some("sub_42".to_string());
        store.upsert(&user).await.expect("Failed to upsert");

        let fetched = store.get("ada").await.expect("Failed to get");
        assert!(fetched.is_premium);
        assert_eq!(fetched.subscription_id.as_deref(), Some("sub_42"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn corrupt_file_fails_open() {
        let path = temp_store_path();
        tokio::fs::write(&path, b"{not json")
            .await
            .expect("Failed to seed corrupt file");

        let err = JsonFileUserStore::open(&path)
            .await
            .expect_err("Corrupt store should not open");
        assert!(matches!(err, RepositoryError::Corrupt(_)));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn find_by_subscription_id_matches_only_subscribers() {
        let path = temp_store_path();
        let store = JsonFileUserStore::open(&path)
            .await
            .expect("Failed to open store");

        let mut premium = test_user("ada");
        premium.subscription_id = Some("sub_42".to_string());
        store.insert(&premium).await.expect("Failed to insert");
        store
            .insert(&test_user("grace"))
            .await
            .expect("Failed to insert");

        let found = store
            .find_by_subscription_id("sub_42")
            .await
            .expect("Failed to query");
        assert_eq!(found.map(|u| u.username), Some("ada".to_string()));

        let missing = store
            .find_by_subscription_id("sub_unknown")
            .await
            .expect("Failed to query");
        assert!(missing.is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn user_record_json_uses_snake_case_fields() {
        let user = test_user("ada");
        let value = serde_json::to_value(&user).expect("Failed to serialize");
        assert!(value.get("daily_scans_left").is_some());
        assert!(value.get("last_reset").is_some());
        assert!(value.get("subscription_id").is_some());
    }
}
