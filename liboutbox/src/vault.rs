//! Credential vault: encrypted OAuth token storage per tenant
//!
//! Writes go through a single atomic UPSERT so concurrent OAuth
//! callbacks and token refreshes never interleave a read-modify-write.
//! Reads decrypt on the way out and lazily migrate legacy plaintext
//! rows, guarded by optimistic concurrency on the `is_encrypted` flag.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::Credential;

/// Dispatcher-facing seam over credential storage.
///
/// The token service depends on this trait rather than on the vault
/// directly, so tests can substitute an in-memory source.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn get(&self, tenant_id: &str, provider: &str) -> Result<Option<Credential>>;

    /// Persist a credential atomically (insert or replace)
    async fn save(&self, credential: &Credential) -> Result<()>;
}

#[derive(Clone)]
pub struct CredentialVault {
    pool: SqlitePool,
    cipher: Arc<TokenCipher>,
}

impl CredentialVault {
    pub fn new(db: &Database, cipher: Arc<TokenCipher>) -> Self {
        Self {
            pool: db.pool(),
            cipher,
        }
    }

    /// Lookup by provider-side identity (OAuth callback path, where the
    /// provider tells us the URN before we know the tenant)
    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, provider, external_id, access_token, refresh_token,
                   expires_at, scopes, is_encrypted
            FROM credentials WHERE external_id = ?
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        match row {
            Some(r) => Ok(Some(self.decrypt_row(r).await?)),
            None => Ok(None),
        }
    }

    /// Remove a tenant's credential (account disconnect)
    pub async fn delete(&self, tenant_id: &str, provider: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM credentials WHERE tenant_id = ? AND provider = ?
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn decrypt_row(&self, r: sqlx::sqlite::SqliteRow) -> Result<Credential> {
        let stored_access: String = r.get("access_token");
        let stored_refresh: Option<String> = r.get("refresh_token");
        let is_encrypted = r.get::<i64, _>("is_encrypted") != 0;

        let credential = Credential {
            tenant_id: r.get("tenant_id"),
            provider: r.get("provider"),
            external_id: r.get("external_id"),
            access_token: self.cipher.decrypt(&stored_access)?,
            refresh_token: stored_refresh
                .as_deref()
                .map(|v| self.cipher.decrypt(v))
                .transpose()?,
            expires_at: r.get("expires_at"),
            scopes: r.get("scopes"),
            is_encrypted,
        };

        // Legacy plaintext row while a key is active: re-write encrypted.
        // Failure here never fails the read; the caller already has the
        // plaintext values.
        if !is_encrypted && self.cipher.is_active() {
            if let Err(e) = self.migrate_row(&credential).await {
                warn!(
                    tenant_id = %credential.tenant_id,
                    "failed to migrate plaintext credential row: {}", e
                );
            }
        }

        Ok(credential)
    }

    /// Encrypt a plaintext row in place.
    ///
    /// The `is_encrypted = 0` guard makes concurrent migrations safe:
    /// whoever updates first wins, the loser's update matches no row.
    async fn migrate_row(&self, credential: &Credential) -> Result<()> {
        let access = self.cipher.encrypt(&credential.access_token)?;
        let refresh = credential
            .refresh_token
            .as_deref()
            .map(|v| self.cipher.encrypt(v))
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?, refresh_token = ?, is_encrypted = 1, updated_at = ?
            WHERE tenant_id = ? AND provider = ? AND is_encrypted = 0
            "#,
        )
        .bind(&access)
        .bind(&refresh)
        .bind(chrono::Utc::now().timestamp())
        .bind(&credential.tenant_id)
        .bind(&credential.provider)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() > 0 {
            info!(tenant_id = %credential.tenant_id, "migrated credential row to encrypted storage");
        } else {
            debug!(tenant_id = %credential.tenant_id, "credential row already migrated");
        }

        Ok(())
    }
}

#[async_trait]
impl CredentialSource for CredentialVault {
    async fn get(&self, tenant_id: &str, provider: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, provider, external_id, access_token, refresh_token,
                   expires_at, scopes, is_encrypted
            FROM credentials WHERE tenant_id = ? AND provider = ?
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        match row {
            Some(r) => Ok(Some(self.decrypt_row(r).await?)),
            None => Ok(None),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let access = self.cipher.encrypt(&credential.access_token)?;
        let refresh = credential
            .refresh_token
            .as_deref()
            .map(|v| self.cipher.encrypt(v))
            .transpose()?;
        let is_encrypted = if self.cipher.is_active() { 1 } else { 0 };

        sqlx::query(
            r#"
            INSERT INTO credentials
                (tenant_id, provider, external_id, access_token, refresh_token,
                 expires_at, scopes, is_encrypted, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, provider) DO UPDATE SET
                external_id = excluded.external_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                is_encrypted = excluded.is_encrypted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.tenant_id)
        .bind(&credential.provider)
        .bind(&credential.external_id)
        .bind(&access)
        .bind(&refresh)
        .bind(credential.expires_at)
        .bind(&credential.scopes)
        .bind(is_encrypted)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoMode, TokenCipher, ENC_PREFIX};
    use crate::db::test_support::test_db;
    use tempfile::TempDir;

    fn sample_credential(tenant: &str) -> Credential {
        Credential {
            tenant_id: tenant.to_string(),
            provider: "linkedin".to_string(),
            external_id: format!("urn:li:person:{}", tenant),
            access_token: "access-token-value".to_string(),
            refresh_token: Some("refresh-token-value".to_string()),
            expires_at: Some(1_700_000_000),
            scopes: Some("w_member_social".to_string()),
            is_encrypted: false,
        }
    }

    async fn encrypted_vault() -> (CredentialVault, Database, TempDir) {
        let (db, dir) = test_db().await;
        let cipher = Arc::new(
            TokenCipher::new(CryptoMode::Strict, Some("vault-test-key".to_string())).unwrap(),
        );
        (CredentialVault::new(&db, cipher), db, dir)
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let (vault, _db, _dir) = encrypted_vault().await;

        vault.save(&sample_credential("tenant-1")).await.unwrap();

        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "access-token-value");
        assert_eq!(cred.refresh_token, Some("refresh-token-value".to_string()));
        assert_eq!(cred.external_id, "urn:li:person:tenant-1");
        assert!(cred.is_encrypted);
    }

    #[tokio::test]
    async fn test_tokens_encrypted_at_rest() {
        let (vault, db, _dir) = encrypted_vault().await;
        vault.save(&sample_credential("tenant-1")).await.unwrap();

        let row = sqlx::query("SELECT access_token, refresh_token, is_encrypted FROM credentials")
            .fetch_one(&db.pool())
            .await
            .unwrap();
        let access: String = row.get("access_token");
        let refresh: String = row.get("refresh_token");

        assert!(access.starts_with(ENC_PREFIX));
        assert!(refresh.starts_with(ENC_PREFIX));
        assert!(!access.contains("access-token-value"));
        assert_eq!(row.get::<i64, _>("is_encrypted"), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let (vault, db, _dir) = encrypted_vault().await;

        vault.save(&sample_credential("tenant-1")).await.unwrap();

        let mut updated = sample_credential("tenant-1");
        updated.access_token = "rotated-access".to_string();
        updated.refresh_token = Some("rotated-refresh".to_string());
        updated.expires_at = Some(1_800_000_000);
        vault.save(&updated).await.unwrap();

        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "rotated-access");
        assert_eq!(cred.expires_at, Some(1_800_000_000));

        // Still a single row
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM credentials")
            .fetch_one(&db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let (vault, _db, _dir) = encrypted_vault().await;

        vault.save(&sample_credential("tenant-1")).await.unwrap();
        let mut other = sample_credential("tenant-2");
        other.access_token = "other-token".to_string();
        vault.save(&other).await.unwrap();

        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "access-token-value");

        assert!(vault.get("tenant-3", "linkedin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_by_external_id() {
        let (vault, _db, _dir) = encrypted_vault().await;
        vault.save(&sample_credential("tenant-1")).await.unwrap();

        let cred = vault
            .get_by_external_id("urn:li:person:tenant-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cred.tenant_id, "tenant-1");
        assert_eq!(cred.access_token, "access-token-value");

        assert!(vault
            .get_by_external_id("urn:li:person:unknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (vault, _db, _dir) = encrypted_vault().await;
        vault.save(&sample_credential("tenant-1")).await.unwrap();

        assert!(vault.delete("tenant-1", "linkedin").await.unwrap());
        assert!(vault.get("tenant-1", "linkedin").await.unwrap().is_none());
        assert!(!vault.delete("tenant-1", "linkedin").await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_plaintext_migrates_on_read() {
        let (vault, db, _dir) = encrypted_vault().await;

        // Simulate a row written before encryption was enabled
        sqlx::query(
            r#"
            INSERT INTO credentials
                (tenant_id, provider, external_id, access_token, refresh_token,
                 expires_at, scopes, is_encrypted, updated_at)
            VALUES ('tenant-1', 'linkedin', 'urn:li:person:x', 'plain-access',
                    'plain-refresh', 1700000000, NULL, 0, 0)
            "#,
        )
        .execute(&db.pool())
        .await
        .unwrap();

        // Read returns plaintext values
        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "plain-access");
        assert_eq!(cred.refresh_token, Some("plain-refresh".to_string()));
        assert!(!cred.is_encrypted);

        // The row is now encrypted on disk
        let row = sqlx::query("SELECT access_token, is_encrypted FROM credentials")
            .fetch_one(&db.pool())
            .await
            .unwrap();
        assert!(row.get::<String, _>("access_token").starts_with(ENC_PREFIX));
        assert_eq!(row.get::<i64, _>("is_encrypted"), 1);

        // Subsequent reads decrypt back to the same values
        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "plain-access");
        assert!(cred.is_encrypted);
    }

    #[tokio::test]
    async fn test_concurrent_reads_migrate_exactly_once() {
        let (db, dir) = test_db().await;
        let cipher = Arc::new(
            TokenCipher::new(CryptoMode::Strict, Some("vault-test-key".to_string())).unwrap(),
        );

        // Two vaults over the same database file, as two processes
        // reading the same legacy row would be
        let vault_a = CredentialVault::new(&db, cipher.clone());
        let db_b = Database::new(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let vault_b = CredentialVault::new(&db_b, cipher);

        sqlx::query(
            r#"
            INSERT INTO credentials
                (tenant_id, provider, external_id, access_token, refresh_token,
                 expires_at, scopes, is_encrypted, updated_at)
            VALUES ('tenant-1', 'linkedin', 'urn:li:person:x', 'plain-access',
                    'plain-refresh', 1700000000, NULL, 0, 0)
            "#,
        )
        .execute(&db.pool())
        .await
        .unwrap();

        let (a, b) = tokio::join!(
            vault_a.get("tenant-1", "linkedin"),
            vault_b.get("tenant-1", "linkedin")
        );

        // Both readers get the plaintext values regardless of who won
        // the guarded update
        assert_eq!(a.unwrap().unwrap().access_token, "plain-access");
        assert_eq!(b.unwrap().unwrap().access_token, "plain-access");

        // The row was encrypted once, not double-encrypted
        let row = sqlx::query("SELECT access_token, is_encrypted FROM credentials")
            .fetch_one(&db.pool())
            .await
            .unwrap();
        assert!(row.get::<String, _>("access_token").starts_with(ENC_PREFIX));
        assert_eq!(row.get::<i64, _>("is_encrypted"), 1);

        let cred = vault_a.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "plain-access");
        assert_eq!(cred.refresh_token, Some("plain-refresh".to_string()));
    }

    #[tokio::test]
    async fn test_no_migration_without_key() {
        let (db, _dir) = test_db().await;
        let cipher = Arc::new(TokenCipher::new(CryptoMode::Permissive, None).unwrap());
        let vault = CredentialVault::new(&db, cipher);

        sqlx::query(
            r#"
            INSERT INTO credentials
                (tenant_id, provider, external_id, access_token, refresh_token,
                 expires_at, scopes, is_encrypted, updated_at)
            VALUES ('tenant-1', 'linkedin', 'urn:li:person:x', 'plain-access',
                    NULL, NULL, NULL, 0, 0)
            "#,
        )
        .execute(&db.pool())
        .await
        .unwrap();

        let cred = vault.get("tenant-1", "linkedin").await.unwrap().unwrap();
        assert_eq!(cred.access_token, "plain-access");

        // Row untouched: no key, nothing to migrate with
        let row = sqlx::query("SELECT access_token, is_encrypted FROM credentials")
            .fetch_one(&db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("access_token"), "plain-access");
        assert_eq!(row.get::<i64, _>("is_encrypted"), 0);
    }
}
