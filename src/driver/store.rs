use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ConcurrencyToken, PortMapping};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Last configuration applied by a portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    pub token: ConcurrencyToken,
    pub ports: Vec<PortMapping>,
    pub applied_at: DateTime<Utc>,
}

impl DriverState {
    pub fn new(token: ConcurrencyToken, ports: Vec<PortMapping>) -> Self {
        Self {
            token,
            ports,
            applied_at: Utc::now(),
        }
    }
}

/// JSON file holding the [`DriverState`]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored state, `None` if nothing was ever saved
    pub async fn load(&self) -> Result<Option<DriverState>, StoreError> {
        let full = match tokio::fs::read(&self.path).await {
            Ok(full) => full,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        Ok(Some(serde_json::from_slice(&full)?))
    }

    /// Replace the stored state
    ///
    /// The new content is written next to the state file and renamed over it, so readers see
    /// either the previous state or the new one.
    pub async fn save(&self, state: &DriverState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let full = serde_json::to_vec_pretty(state)?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &full).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(path = %self.path.display(), token = %state.token, "saved driver state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{ChipType, Ledstrip, LedstripId};

    fn temp_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ledhub-store-{}", Uuid::new_v4()));
        path.push("state.json");
        path
    }

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let store = StateStore::new(temp_path());
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_replaces_state() {
        let path = temp_path();
        let store = StateStore::new(&path);

        let ledstrip = Ledstrip {
            id: LedstripId(Uuid::new_v4()),
            pixel_count: 120,
            chip_type: ChipType::Ws2805,
            name: Some("stairs".to_owned()),
        };
        let ports = vec![PortMapping { bus: 3, ledstrip }];

        let first = DriverState::new(ConcurrencyToken::new("first").unwrap(), ports.clone());
        store.save(&first).await.unwrap();

        let second = DriverState::new(ConcurrencyToken::new("second").unwrap(), ports);
        store.save(&second).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(second));

        // No temporary file left behind
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupted_file_is_an_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            StateStore::new(&path).load().await,
            Err(StoreError::Json(_))
        ));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
