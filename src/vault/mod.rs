//! Credential vault.
//!
//! Stores per-user provider links with encrypted secret columns. Writes never
//! mutate credential columns in place: a new link soft-deletes the previous
//! row and inserts a fresh one, so concurrent readers always observe a
//! complete row. Decryption failures surface as missing credentials and force
//! a relink.

pub mod crypto;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crypto::CredentialCipher;

/// Authentication protocol of a provider link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    #[serde(rename = "oauth1")]
    OAuth1,
    #[serde(rename = "oauth2")]
    OAuth2,
    Customized,
    /// No stored credentials (e.g. user-pushed exports)
    None,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::OAuth1 => "oauth1",
            AuthKind::OAuth2 => "oauth2",
            AuthKind::Customized => "customized",
            AuthKind::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password" => Some(AuthKind::Password),
            "oauth1" => Some(AuthKind::OAuth1),
            // Legacy alias kept for stored rows written before the split
            "oauth" | "oauth2" => Some(AuthKind::OAuth2),
            "customized" => Some(AuthKind::Customized),
            "none" => Some(AuthKind::None),
            _ => None,
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted credential payload, one variant per auth kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialBundle {
    Password {
        username: String,
        password: String,
    },
    OAuth1 {
        access_token: String,
        token_secret: String,
        username: Option<String>,
    },
    OAuth2 {
        access_token: String,
        refresh_token: String,
        /// Unix seconds
        expires_at: Option<i64>,
        username: Option<String>,
    },
    Customized {
        connect_info: serde_json::Value,
    },
}

impl CredentialBundle {
    pub fn auth_kind(&self) -> AuthKind {
        match self {
            CredentialBundle::Password { .. } => AuthKind::Password,
            CredentialBundle::OAuth1 { .. } => AuthKind::OAuth1,
            CredentialBundle::OAuth2 { .. } => AuthKind::OAuth2,
            CredentialBundle::Customized { .. } => AuthKind::Customized,
        }
    }
}

/// A decrypted credential together with its owner.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub user_id: String,
    pub bundle: CredentialBundle,
}

/// Per-link status surfaced to the platform layer.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub llm_access: i64,
    pub reconnect: bool,
}

/// Encrypted per-user provider credential storage.
#[derive(Clone)]
pub struct CredentialVault {
    conn: Arc<Mutex<Connection>>,
    cipher: CredentialCipher,
}

impl CredentialVault {
    pub fn new(conn: Arc<Mutex<Connection>>, cipher: CredentialCipher) -> Self {
        Self { conn, cipher }
    }

    fn now() -> String {
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// Persist a new link, soft-deleting any prior row for the
    /// `(user_id, provider)` pair. The fresh row starts with `reconnect = 0`.
    pub async fn save_link(&self, user_id: &str, provider: &str, bundle: &CredentialBundle) -> Result<()> {
        let (username, password, access_token, token_secret, refresh_token, expires_at, connect_info) =
            match bundle {
                CredentialBundle::Password { username, password } => {
                    if username.is_empty() || password.is_empty() {
                        bail!("Missing username/password for password link");
                    }
                    (
                        Some(username.clone()),
                        Some(self.cipher.encrypt(password)?),
                        None,
                        None,
                        None,
                        None,
                        None,
                    )
                }
                CredentialBundle::OAuth1 {
                    access_token,
                    token_secret,
                    username,
                } => {
                    if access_token.is_empty() || token_secret.is_empty() {
                        bail!("Missing access_token/token_secret for oauth1 link");
                    }
                    (
                        username.clone(),
                        None,
                        Some(self.cipher.encrypt(access_token)?),
                        Some(self.cipher.encrypt(token_secret)?),
                        None,
                        None,
                        None,
                    )
                }
                CredentialBundle::OAuth2 {
                    access_token,
                    refresh_token,
                    expires_at,
                    username,
                } => {
                    if access_token.is_empty() {
                        bail!("Missing access_token for oauth2 link");
                    }
                    (
                        username.clone(),
                        None,
                        Some(self.cipher.encrypt(access_token)?),
                        None,
                        Some(self.cipher.encrypt(refresh_token)?),
                        *expires_at,
                        None,
                    )
                }
                CredentialBundle::Customized { connect_info } => {
                    if connect_info.is_null() {
                        bail!("Missing connect_info for customized link");
                    }
                    (None, None, None, None, None, None, Some(connect_info.to_string()))
                }
            };

        let auth_kind = bundle.auth_kind().as_str();
        let now = Self::now();
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            UPDATE health_user_provider SET is_del = 1, update_at = ?3
            WHERE user_id = ?1 AND provider = ?2 AND is_del = 0
            "#,
            params![user_id, provider, now],
        )?;

        tx.execute(
            r#"
            INSERT INTO health_user_provider
                (user_id, provider, auth_kind, username, password, access_token, access_token_secret,
                 refresh_token, expires_at, connect_info, llm_access, reconnect, is_del, create_at, update_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 0, 0, ?11, ?11)
            "#,
            params![
                user_id,
                provider,
                auth_kind,
                username,
                password,
                access_token,
                token_secret,
                refresh_token,
                expires_at,
                connect_info,
                now
            ],
        )?;

        tx.commit().context("Failed to commit link save")?;
        info!(user_id, provider, auth_kind, "Saved provider link");
        Ok(())
    }

    fn decrypt_row(
        &self,
        auth_kind: AuthKind,
        user_id: &str,
        username: Option<String>,
        password: Option<String>,
        access_token: Option<String>,
        token_secret: Option<String>,
        refresh_token: Option<String>,
        expires_at: Option<i64>,
        connect_info: Option<String>,
    ) -> Option<CredentialBundle> {
        let decrypt = |field: Option<String>, name: &str| -> Option<String> {
            let stored = field?;
            match self.cipher.decrypt(&stored) {
                Some(plain) => Some(plain),
                None => {
                    error!(user_id, field = name, "Credential decryption failed, treating as missing");
                    None
                }
            }
        };

        match auth_kind {
            AuthKind::Password => Some(CredentialBundle::Password {
                username: username.unwrap_or_default(),
                password: decrypt(password, "password")?,
            }),
            AuthKind::OAuth1 => Some(CredentialBundle::OAuth1 {
                access_token: decrypt(access_token, "access_token")?,
                token_secret: decrypt(token_secret, "access_token_secret")?,
                username,
            }),
            AuthKind::OAuth2 => Some(CredentialBundle::OAuth2 {
                access_token: decrypt(access_token, "access_token")?,
                refresh_token: decrypt(refresh_token, "refresh_token")?,
                expires_at,
                username,
            }),
            AuthKind::Customized => {
                let raw = connect_info?;
                match serde_json::from_str(&raw) {
                    Ok(value) => Some(CredentialBundle::Customized { connect_info: value }),
                    Err(e) => {
                        error!(user_id, error = %e, "Malformed connect_info, treating as missing");
                        None
                    }
                }
            }
            AuthKind::None => None,
        }
    }

    /// Fetch the latest non-deleted credentials for one link.
    /// Returns `None` when no row exists or any secret fails to decrypt.
    pub async fn get_credentials(
        &self,
        user_id: &str,
        provider: &str,
        auth_kind: AuthKind,
    ) -> Result<Option<CredentialBundle>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
                SELECT username, password, access_token, access_token_secret, refresh_token, expires_at, connect_info
                FROM health_user_provider
                WHERE user_id = ?1 AND provider = ?2 AND is_del = 0
                ORDER BY create_at DESC, id DESC LIMIT 1
                "#,
                params![user_id, provider],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let Some((username, password, access_token, token_secret, refresh_token, expires_at, connect_info)) = row
        else {
            return Ok(None);
        };

        Ok(self.decrypt_row(
            auth_kind,
            user_id,
            username,
            password,
            access_token,
            token_secret,
            refresh_token,
            expires_at,
            connect_info,
        ))
    }

    /// All decryptable credentials for a provider, excluding rows flagged for
    /// reconnection. Rows whose secrets fail to decrypt are skipped with a log.
    pub async fn list_credentials_for_provider(
        &self,
        provider: &str,
        auth_kind: AuthKind,
    ) -> Result<Vec<UserCredential>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, username, password, access_token, access_token_secret, refresh_token, expires_at, connect_info
            FROM health_user_provider
            WHERE provider = ?1 AND is_del = 0 AND reconnect = 0
            ORDER BY create_at DESC
            "#,
        )?;
        let rows: Vec<_> = stmt
            .query_map(params![provider], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        let mut credentials = Vec::new();
        for (user_id, username, password, access_token, token_secret, refresh_token, expires_at, connect_info) in rows
        {
            match self.decrypt_row(
                auth_kind,
                &user_id,
                username,
                password,
                access_token,
                token_secret,
                refresh_token,
                expires_at,
                connect_info,
            ) {
                Some(bundle) => credentials.push(UserCredential { user_id, bundle }),
                None => {
                    warn!(user_id, provider, "Skipping link with undecryptable credentials");
                }
            }
        }

        info!(provider, count = credentials.len(), "Listed provider credentials");
        Ok(credentials)
    }

    /// Soft-delete a link.
    pub async fn delete_link(&self, user_id: &str, provider: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE health_user_provider SET is_del = 1, update_at = ?3
            WHERE user_id = ?1 AND provider = ?2 AND is_del = 0
            "#,
            params![user_id, provider, Self::now()],
        )?;
        info!(user_id, provider, "Deleted provider link");
        Ok(())
    }

    /// Invalidate a link after a terminal auth failure: secrets are cleared and
    /// the row is flagged so scheduled pulls skip it until the user relinks.
    pub async fn invalidate_credentials(&self, user_id: &str, provider: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE health_user_provider
            SET reconnect = 1, password = NULL, access_token = NULL,
                access_token_secret = NULL, refresh_token = NULL, update_at = ?3
            WHERE user_id = ?1 AND provider = ?2 AND is_del = 0
            "#,
            params![user_id, provider, Self::now()],
        )?;
        warn!(user_id, provider, "Invalidated credentials, relink required");
        Ok(())
    }

    pub async fn set_llm_access(&self, user_id: &str, provider: &str, level: i64) -> Result<bool> {
        if !(0..=2).contains(&level) {
            bail!("Invalid llm_access value: {}. Must be 0, 1, or 2", level);
        }
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE health_user_provider SET llm_access = ?3, update_at = ?4
            WHERE user_id = ?1 AND provider = ?2 AND is_del = 0
            "#,
            params![user_id, provider, level, Self::now()],
        )?;
        Ok(updated > 0)
    }

    /// Rotate OAuth2 tokens after a refresh. Goes through `save_link`, so the
    /// operation is idempotent and readers never see a half-written row.
    pub async fn update_oauth2_tokens(
        &self,
        user_id: &str,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        self.save_link(
            user_id,
            provider,
            &CredentialBundle::OAuth2 {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                expires_at,
                username: None,
            },
        )
        .await
    }

    /// All of a user's non-deleted links with their access/reconnect state.
    pub async fn list_user_links(&self, user_id: &str) -> Result<HashMap<String, LinkInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT provider, llm_access, reconnect
            FROM health_user_provider
            WHERE user_id = ?1 AND is_del = 0
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut links = HashMap::new();
        for row in rows {
            let (provider, llm_access, reconnect) = row?;
            links.insert(
                provider,
                LinkInfo {
                    llm_access,
                    reconnect: reconnect != 0,
                },
            );
        }
        Ok(links)
    }
}
