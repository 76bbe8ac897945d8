//! Credential storage: one JSON file per account
//!
//! The tokens directory holds `token-*.json` files dropped in by the
//! registration tool or by `import`. The filename is the account's stable
//! id. A separate "current token" file is what the IDE actually reads; it is
//! only ever replaced through `install_current`, which keeps a timestamped
//! backup of the previous one.
//!
//! A malformed account file is logged and skipped so one bad file never
//! hides the rest of the pool. Write failures always surface as errors.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use common::Secret;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::constants::{
    CLIENT_REGISTRATION_TTL_DAYS, DEFAULT_AUTH_METHOD, DEFAULT_PROVIDER, DEFAULT_REGION,
    MAX_EXPIRES_IN_SECS, TOKEN_FILE_PREFIX, TOKEN_FILE_SUFFIX,
};
use crate::error::{Error, Result};
use crate::expiry;
use crate::persist::{read_json_optional, write_bytes_atomic, write_json_atomic};
use crate::token::RefreshedToken;

/// One account's stored OIDC credentials and current token.
///
/// Field spellings follow the files the registration tool writes
/// (`_clientId`, `_clientSecret`, `accountName`); the plainer `clientId`,
/// `clientSecret` and `accountLabel` are accepted on read. Unknown fields are
/// kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Filename inside the tokens directory; not part of the file body
    #[serde(skip)]
    pub id: String,
    pub access_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_iso",
        deserialize_with = "de_iso_lenient"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(
        default,
        rename = "_clientId",
        alias = "clientId",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_id: Option<String>,
    #[serde(
        default,
        rename = "_clientSecret",
        alias = "clientSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<Secret<String>>,
    #[serde(
        default,
        rename = "_clientSecretExpiresAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret_expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(
        default,
        rename = "accountName",
        alias = "accountLabel",
        skip_serializing_if = "Option::is_none"
    )]
    pub account_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_hash: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_iso",
        deserialize_with = "de_iso_lenient"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CredentialRecord {
    /// A record with just an id and access token; remaining fields empty.
    pub fn new(id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            expires_at: None,
            expires_in: None,
            client_id: None,
            client_secret: None,
            client_secret_expires_at: None,
            region: None,
            account_label: None,
            email: None,
            provider: None,
            auth_method: None,
            client_id_hash: None,
            created_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Refresh token, client id and client secret are all present and
    /// non-empty. Records failing this are permanently credential-incomplete.
    pub fn is_refreshable(&self) -> bool {
        let present = |s: &Option<Secret<String>>| s.as_ref().is_some_and(|s| !s.is_empty());
        present(&self.refresh_token)
            && present(&self.client_secret)
            && self.client_id.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Region for endpoint selection.
    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
    }

    /// Display name: account label, else email, else the file id.
    pub fn label(&self) -> &str {
        self.account_label
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }

    /// Email used as a lookup alias. Falls back to the claims of the access
    /// token when the file itself carries no email.
    pub fn email_alias(&self) -> Option<String> {
        self.email
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| email_from_jwt(self.access_token.expose()))
    }

    /// Hash identifying the OIDC client registration, as the IDE expects it:
    /// the stored value if present, else SHA-1 hex of the client id.
    pub fn client_id_hash(&self) -> Option<String> {
        self.client_id_hash
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| self.client_id.as_deref().map(client_id_hash))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        expiry::is_expired(self.expires_at, now)
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        expiry::needs_refresh(self.expires_at, now)
    }

    pub fn is_truly_invalid(&self, now: DateTime<Utc>) -> bool {
        expiry::is_truly_invalid(self.expires_at, now)
    }

    /// Apply a successful refresh. The refresh token is only rotated when
    /// the provider returned a new one. Lifetimes are capped at
    /// [`MAX_EXPIRES_IN_SECS`].
    pub fn apply_refresh(&mut self, token: &RefreshedToken, now: DateTime<Utc>) {
        self.access_token = token.access_token.clone();
        if let Some(refresh) = &token.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        let expires_in = token.expires_in.min(MAX_EXPIRES_IN_SECS);
        self.expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        self.expires_in = Some(expires_in);
    }
}

/// A record as found on disk, with its resolved creation time.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub record: CredentialRecord,
    pub path: PathBuf,
    /// `createdAt` from the file body, else the file's creation/modification time
    pub created_at: DateTime<Utc>,
}

/// The token file the IDE reads. Written only by `install_current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledToken {
    pub access_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "ser_iso",
        deserialize_with = "de_iso_lenient"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_id_hash: String,
    #[serde(default)]
    pub auth_method: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InstalledToken {
    fn from_record(record: &CredentialRecord) -> Self {
        let non_empty = |v: &Option<String>, default: &str| {
            v.clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            access_token: record.access_token.clone(),
            refresh_token: record.refresh_token.clone(),
            expires_at: record.expires_at,
            client_id_hash: record.client_id_hash().unwrap_or_default(),
            auth_method: non_empty(&record.auth_method, DEFAULT_AUTH_METHOD),
            provider: non_empty(&record.provider, DEFAULT_PROVIDER),
            region: record.region().to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// OIDC client registration file the IDE looks up by `clientIdHash`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration<'a> {
    client_id: &'a str,
    client_secret: &'a Secret<String>,
    expires_at: String,
}

/// File-per-account credential store.
pub struct CredentialStore {
    tokens_dir: PathBuf,
    current_token_path: PathBuf,
}

impl CredentialStore {
    pub fn new(tokens_dir: PathBuf, current_token_path: PathBuf) -> Self {
        Self {
            tokens_dir,
            current_token_path,
        }
    }

    pub fn tokens_dir(&self) -> &Path {
        &self.tokens_dir
    }

    pub fn current_token_path(&self) -> &Path {
        &self.current_token_path
    }

    /// Path of an account file.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.tokens_dir.join(id)
    }

    /// Load every `token-*.json` file, sorted by id.
    ///
    /// A missing tokens directory is an empty store. Files that fail to read
    /// or parse are logged and skipped.
    pub async fn list_all(&self) -> Result<Vec<StoredCredential>> {
        let mut entries = match tokio::fs::read_dir(&self.tokens_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.tokens_dir.display(), "tokens directory missing, store is empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Error::Io(format!(
                    "listing {}: {e}",
                    self.tokens_dir.display()
                )));
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(format!("listing {}: {e}", self.tokens_dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_token_file_name(&name) {
                ids.push(name);
            }
        }
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_file(&id).await {
                Ok(stored) => records.push(stored),
                Err(e) => warn!(account_id = %id, error = %e, "skipping unreadable credential file"),
            }
        }
        Ok(records)
    }

    /// Load a single account by id. `Ok(None)` if the file does not exist.
    pub async fn get(&self, id: &str) -> Result<Option<StoredCredential>> {
        validate_id(id)?;
        if !tokio::fs::try_exists(self.path_for(id)).await.unwrap_or(false) {
            return Ok(None);
        }
        self.load_file(id).await.map(Some)
    }

    async fn load_file(&self, id: &str) -> Result<StoredCredential> {
        let path = self.path_for(id);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
        let mut record: CredentialRecord = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))?;
        record.id = id.to_string();

        let created_at = match record.created_at {
            Some(at) => at,
            None => file_time(&path).await,
        };
        Ok(StoredCredential {
            record,
            path,
            created_at,
        })
    }

    /// Atomically overwrite one account file.
    pub async fn write(&self, record: &CredentialRecord) -> Result<()> {
        validate_id(&record.id)?;
        write_json_atomic(&self.path_for(&record.id), record).await?;
        debug!(account_id = %record.id, "wrote credential file");
        Ok(())
    }

    /// Remove an account file. Returns whether a file was removed; an
    /// already-absent file is not an error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(account_id = %id, "deleted credential file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(format!("removing {}: {e}", path.display()))),
        }
    }

    /// The token currently installed for the IDE, if readable.
    pub async fn read_current(&self) -> Option<InstalledToken> {
        match read_json_optional(&self.current_token_path).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "installed token unreadable, treating as absent");
                None
            }
        }
    }

    /// Install `record` as the IDE's current token.
    ///
    /// The previous file is first copied to
    /// `<stem>.backup.<YYYY-MM-DDTHH-MM-SS>.json` beside it. When the client
    /// id and secret are known, the matching client registration file is
    /// written as well.
    pub async fn install_current(&self, record: &CredentialRecord) -> Result<()> {
        let current = &self.current_token_path;
        let dir = current
            .parent()
            .ok_or_else(|| Error::Io(format!("{} has no parent directory", current.display())))?;

        if tokio::fs::try_exists(current).await.unwrap_or(false) {
            let backup = dir.join(backup_file_name(current, Utc::now()));
            tokio::fs::copy(current, &backup)
                .await
                .map_err(|e| Error::Io(format!("backing up {}: {e}", current.display())))?;
            debug!(backup = %backup.display(), "backed up installed token");
        }

        let installed = InstalledToken::from_record(record);
        write_json_atomic(current, &installed).await?;

        if let (Some(client_id), Some(client_secret)) = (&record.client_id, &record.client_secret)
            && !installed.client_id_hash.is_empty()
        {
            let expires_at = record.client_secret_expires_at.clone().unwrap_or_else(|| {
                (Utc::now() + Duration::days(CLIENT_REGISTRATION_TTL_DAYS))
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
            });
            let registration = ClientRegistration {
                client_id,
                client_secret,
                expires_at,
            };
            let path = dir.join(format!("{}.json", installed.client_id_hash));
            write_json_atomic(&path, &registration).await?;
        }

        info!(account_id = %record.id, "installed current token");
        Ok(())
    }

    /// Copy an external credential file into the store and return its id.
    ///
    /// The file must parse as a credential record with a non-empty access
    /// token. The stored name gets the `token-` prefix and `.json` suffix if
    /// it lacks them. The original bytes are kept as-is.
    pub async fn import(&self, source: &Path) -> Result<String> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", source.display())))?;
        let record: CredentialRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", source.display())))?;
        if record.access_token.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "{} has no accessToken",
                source.display()
            )));
        }

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidRecord(format!("{} has no file name", source.display())))?;
        let id = normalize_token_file_name(&name);
        validate_id(&id)?;

        let dest = self.path_for(&id);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            warn!(account_id = %id, "import overwrites an existing credential file");
        }
        write_bytes_atomic(&dest, &bytes).await?;
        info!(account_id = %id, source = %source.display(), "imported credential file");
        Ok(id)
    }
}

/// SHA-1 hex digest of an OIDC client id.
pub fn client_id_hash(client_id: &str) -> String {
    format!("{:x}", Sha1::digest(client_id.as_bytes()))
}

/// Extract an email from a JWT access token's claims.
///
/// Priority: `email`, then `preferred_username` or `sub` when they look like
/// an address. Opaque (non-JWT) tokens yield `None`.
pub fn email_from_jwt(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Claims {
        email: Option<String>,
        preferred_username: Option<String>,
        sub: Option<String>,
    }

    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;

    claims
        .email
        .filter(|e| !e.is_empty())
        .or(claims.preferred_username.filter(|u| u.contains('@')))
        .or(claims.sub.filter(|s| s.contains('@')))
}

fn is_token_file_name(name: &str) -> bool {
    name.starts_with(TOKEN_FILE_PREFIX) && name.ends_with(TOKEN_FILE_SUFFIX)
}

fn normalize_token_file_name(name: &str) -> String {
    let mut id = name.to_string();
    if !id.starts_with(TOKEN_FILE_PREFIX) {
        id = format!("{TOKEN_FILE_PREFIX}{id}");
    }
    if !id.ends_with(TOKEN_FILE_SUFFIX) {
        id.push_str(TOKEN_FILE_SUFFIX);
    }
    id
}

/// Ids are bare file names: no separators, no traversal.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(Error::InvalidRecord(format!("invalid account id {id:?}")));
    }
    Ok(())
}

fn backup_file_name(current: &Path, now: DateTime<Utc>) -> String {
    let stem = current
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "current-token".into());
    format!("{stem}.backup.{}.json", now.format("%Y-%m-%dT%H-%M-%S"))
}

async fn file_time(path: &Path) -> DateTime<Utc> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta
            .created()
            .or_else(|_| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH),
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

fn ser_iso<S: Serializer>(
    value: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => serializer.serialize_none(),
    }
}

/// Unparseable timestamps read as absent rather than failing the record.
fn de_iso_lenient<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|at| at.with_timezone(&Utc))
            .ok(),
        _ => None,
    })
}
