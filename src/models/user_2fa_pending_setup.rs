use serde::Serialize;
use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// 確認待ちの2FA設定
///
/// ユーザーごとに最大1件（新しい設定が古い設定を上書きする）。
/// バックアップコードは SHA-256 ハッシュの下書きとして保持し、確認成功時に確定する。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User2faPendingSetup {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip)]
    pub secret_encrypted: Vec<u8>,
    #[serde(skip)]
    pub backup_code_hashes: Vec<String>,
    pub created_at: OffsetDateTime,
}

impl User2faPendingSetup {
    pub fn new(
        user_id: &str,
        secret_encrypted: Vec<u8>,
        backup_code_hashes: Vec<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            secret_encrypted,
            backup_code_hashes,
            created_at,
        }
    }

    /// 有効期限切れか（経過時間が TTL を超えた場合）
    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }
}
