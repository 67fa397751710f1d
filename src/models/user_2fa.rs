use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// ユーザーの二要素認証（TOTP）登録レコード
///
/// レコードが存在するユーザーはログイン時に2FAが必須となる。
/// シークレットは AES-256-GCM で暗号化されて保存される
/// 平文シークレットはログに出力禁止
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User2faEnrollment {
    pub user_id: String,
    #[serde(skip)]
    pub secret_encrypted: Vec<u8>,
    pub enabled_at: OffsetDateTime,
    pub backup_codes_used: i32,
}
