//! The long-lived keys of a relay node.

use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Directory below the home directory holding identity stores.
const STORE_DIR: &str = ".navi-relay";

/// Failures loading or storing a [`ServerIdentity`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum IdentityError {
    #[snafu(display("the operating environment provides no home directory"))]
    NoHomeDir {},
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write {}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid identity store {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("failed to serialize the identity"))]
    Serialize { source: toml::ser::Error },
    #[snafu(display("invalid {field} in identity store"))]
    InvalidKey { field: &'static str },
}

/// The node key and the control key of a relay node.
///
/// The node key identifies the relay to its clients, the control key authenticates it to
/// the fleet controller.
#[derive(Clone)]
pub struct ServerIdentity {
    node_key: SigningKey,
    control_key: SigningKey,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("node_key", &public_hex(&self.node_key))
            .field("control_key", &public_hex(&self.control_key))
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    node_key: String,
    control_key: String,
}

impl ServerIdentity {
    /// Creates an identity with fresh random keys.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            node_key: SigningKey::generate(&mut rng),
            control_key: SigningKey::generate(&mut rng),
        }
    }

    /// The key identifying the relay to its clients.
    pub fn node_key(&self) -> &SigningKey {
        &self.node_key
    }

    /// The key authenticating the relay to the fleet controller.
    pub fn control_key(&self) -> &SigningKey {
        &self.control_key
    }

    /// The default store path, `~/.navi-relay/navi.store` or `navi-<id>.store` for a
    /// managed node.
    pub fn default_path(node_id: Option<&str>) -> Result<PathBuf, IdentityError> {
        let home = dirs_next::home_dir().context(NoHomeDirSnafu)?;
        let file = match node_id {
            Some(id) => format!("navi-{id}.store"),
            None => "navi.store".to_string(),
        };
        Ok(home.join(STORE_DIR).join(file))
    }

    /// Loads the identity stored at `path`, or stores a newly generated one there.
    pub async fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(path)
                .await
                .context(ReadSnafu { path })?;
            let stored: StoredIdentity = toml::from_str(&contents).context(ParseSnafu { path })?;
            return Ok(Self {
                node_key: decode_key(&stored.node_key, "node_key")?,
                control_key: decode_key(&stored.control_key, "control_key")?,
            });
        }

        let identity = Self::generate();
        identity.store(path).await?;
        info!(path = %path.display(), "created new identity");
        Ok(identity)
    }

    async fn store(&self, path: &Path) -> Result<(), IdentityError> {
        let stored = StoredIdentity {
            node_key: data_encoding::HEXLOWER.encode(&self.node_key.to_bytes()),
            control_key: data_encoding::HEXLOWER.encode(&self.control_key.to_bytes()),
        };
        let contents = toml::to_string_pretty(&stored).context(SerializeSnafu)?;

        // Try to canonicalize if possible
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .context(WriteSnafu { path: parent })?;

        // write to tempfile
        let (file, temp_path) = tempfile::NamedTempFile::new_in(parent)
            .context(WriteSnafu { path: parent })?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        file.write_all(contents.as_bytes())
            .await
            .context(WriteSnafu { path: &path })?;
        file.flush().await.context(WriteSnafu { path: &path })?;
        drop(file);

        // move file
        temp_path
            .persist(&path)
            .map_err(|err| err.error)
            .context(WriteSnafu { path: &path })?;
        Ok(())
    }
}

/// Hex of the public half of `key`.
pub(crate) fn public_hex(key: &SigningKey) -> String {
    data_encoding::HEXLOWER.encode(key.verifying_key().as_bytes())
}

fn decode_key(hex: &str, field: &'static str) -> Result<SigningKey, IdentityError> {
    let bytes = data_encoding::HEXLOWER_PERMISSIVE
        .decode(hex.trim().as_bytes())
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .context(InvalidKeySnafu { field })?;
    Ok(SigningKey::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};

    use super::*;

    #[tokio::test]
    async fn test_identity_persists() -> Result {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("nested").join("navi.store");

        let created = ServerIdentity::load_or_create(&path).await?;
        let loaded = ServerIdentity::load_or_create(&path).await?;
        assert_eq!(created.node_key().to_bytes(), loaded.node_key().to_bytes());
        assert_eq!(
            created.control_key().to_bytes(),
            loaded.control_key().to_bytes()
        );
        assert_ne!(
            created.node_key().to_bytes(),
            created.control_key().to_bytes()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_store() -> Result {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("navi.store");
        tokio::fs::write(&path, "node_key = \"abcd\"\ncontrol_key = \"00\"\n")
            .await
            .e()?;
        let err = ServerIdentity::load_or_create(&path).await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKey { field: "node_key", .. }));
        Ok(())
    }

    #[test]
    fn test_default_path() -> Result {
        let path = ServerIdentity::default_path(Some("relay-eu"))?;
        assert!(path.ends_with(".navi-relay/navi-relay-eu.store"));
        let path = ServerIdentity::default_path(None)?;
        assert!(path.ends_with(".navi-relay/navi.store"));
        Ok(())
    }
}
