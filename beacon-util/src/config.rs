use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::store::{Store, StoreError};

/// A configuration document persisted as JSON in the config directory
pub trait StoredConfig
where
    Self: Serialize,
    Self: DeserializeOwned,
{
    fn kind() -> &'static str;

    /// This config's preferred file name exluding the extension.
    fn default_name() -> &'static str {
        Self::kind()
    }
}

/// Load and decode a config stored under its default name.
pub async fn get<C: StoredConfig>(store: &Store) -> Result<Option<C>, StoreError> {
    debug!("reading {} config", C::kind());
    store.read("/", C::default_name()).await
}

/// Encode and store a config under its default name.
pub async fn put<C: StoredConfig>(store: &Store, config: &C) -> Result<(), StoreError> {
    debug!("storing {} config", C::kind());
    store.write("/", C::default_name(), config).await
}

/// Load a config, writing the defaults first if the document does not exist
///
/// A fresh install thus leaves an editable document behind.
pub async fn get_or_init<C: StoredConfig + Default>(store: &Store) -> Result<C, StoreError> {
    if let Some(config) = get(store).await? {
        return Ok(config);
    }

    warn!(
        "no {} config found, creating one with defaults at {}",
        C::kind(),
        store.root().display()
    );
    let config = C::default();
    put(store, &config).await?;
    Ok(config)
}
