use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
#[cfg(not(unix))]
use log::warn;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{AccountStore, CertInfo, CertificateStore, StoreError, cert_info_from_pkcs12};
use crate::issuance::acme::{Account, AccountDetails, SigningKey};

const ARCHIVE_EXTENSION: &str = "pfx";
const ACCOUNT_DETAILS_FILE: &str = "account.json";
const ACCOUNT_KEY_FILE: &str = "account.secret";

/// Stores PKCS#12 archives as `<root>/<identifier>.pfx`.
#[derive(Debug, Clone)]
pub struct FileSystemCertificateStore {
    root: PathBuf,
}

impl FileSystemCertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, identifier: &str) -> Result<PathBuf, StoreError> {
        validate_identifier(identifier)?;
        Ok(self
            .root
            .join(format!("{identifier}.{ARCHIVE_EXTENSION}")))
    }
}

#[async_trait]
impl CertificateStore for FileSystemCertificateStore {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn get_cert_info(&self, identifier: &str) -> Result<Option<CertInfo>, StoreError> {
        let path = self.archive_path(identifier)?;
        let archive = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("[store] no archive at {}", path.display());
                return Ok(None);
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        cert_info_from_pkcs12(identifier, &archive).map(Some)
    }

    async fn store_certificate(
        &self,
        identifier: &str,
        archive: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.archive_path(identifier)?;
        create_dir(&self.root).await?;
        write_secure_file(&path, archive).await?;
        info!("[store] wrote {} ({} bytes)", path.display(), archive.len());
        Ok(())
    }
}

/// Keeps the ACME registration in `account.json` and its key in `account.secret`.
#[derive(Debug, Clone)]
pub struct FileSystemAccountStore {
    root: PathBuf,
}

impl FileSystemAccountStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn details_path(&self) -> PathBuf {
        self.root.join(ACCOUNT_DETAILS_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.root.join(ACCOUNT_KEY_FILE)
    }
}

#[async_trait]
impl AccountStore for FileSystemAccountStore {
    async fn get_account(&self) -> Result<Option<Account>, StoreError> {
        let Some(details) = read_optional(&self.details_path()).await? else {
            return Ok(None);
        };
        let Some(key) = read_optional(&self.key_path()).await? else {
            return Ok(None);
        };
        let details: AccountDetails = serde_json::from_slice(&details)?;
        let key: SigningKey = serde_json::from_slice(&key)?;
        Ok(Some(Account { details, key }))
    }

    async fn store_account(
        &self,
        details: &AccountDetails,
        key: &SigningKey,
    ) -> Result<(), StoreError> {
        let key_bytes = serde_json::to_vec(key)?;
        let details_bytes = serde_json::to_vec_pretty(details)?;
        create_dir(&self.root).await?;

        // Both files are staged before either replaces the stored account.
        let staged_key = stage_secure_file(&self.key_path(), &key_bytes).await?;
        let staged_details = match stage_secure_file(&self.details_path(), &details_bytes).await {
            Ok(staged) => staged,
            Err(err) => {
                let _ = fs::remove_file(&staged_key).await;
                return Err(err);
            }
        };
        commit_staged(&staged_key, &self.key_path()).await?;
        commit_staged(&staged_details, &self.details_path()).await?;
        info!("[store] saved ACME account {}", details.kid);
        Ok(())
    }
}

fn validate_identifier(identifier: &str) -> Result<(), StoreError> {
    if identifier.trim().is_empty() {
        return Err(StoreError::InvalidIdentifier(identifier.to_string()));
    }
    let mut components = Path::new(identifier).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::InvalidIdentifier(identifier.to_string())),
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn create_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Replaces `path` only once the full content is on disk.
async fn write_secure_file(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let staged = stage_secure_file(path, content).await?;
    commit_staged(&staged, path).await
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Writes `content` next to `path` with owner-only permissions and returns the staged path.
async fn stage_secure_file(path: &Path, content: &[u8]) -> Result<PathBuf, StoreError> {
    let staged = staging_path(path);
    match write_private_file(&staged, content).await {
        Ok(()) => Ok(staged),
        Err(err) => {
            let _ = fs::remove_file(&staged).await;
            Err(err)
        }
    }
}

async fn write_private_file(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await.map_err(io_error)?;
    file.write_all(content).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)?;
    file.sync_all().await.map_err(io_error)?;
    ensure_permissions(path).await
}

/// A leftover staging file from an interrupted run keeps its old mode, so tighten it.
async fn ensure_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let io_error = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let current = fs::metadata(path).await.map_err(io_error)?.permissions();
        if current.mode() & 0o777 != 0o600 {
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(io_error)?;
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = fs::metadata(path).await {
            warn!(
                "[store] unable to confirm permissions for {}: {}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}

async fn commit_staged(staged: &Path, path: &Path) -> Result<(), StoreError> {
    if let Err(source) = fs::rename(staged, path).await {
        let _ = fs::remove_file(staged).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
