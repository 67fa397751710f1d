use std::collections::HashSet;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::repositories::TwoFactorStore;

/// バックアップコードの長さ
pub const BACKUP_CODE_LEN: usize = 8;

/// 使用する文字（大文字英数字）
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// バックアップコードを生成
///
/// 同一バッチ内の重複は再生成する
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);

    while codes.len() < count {
        let code: String = (0..BACKUP_CODE_LEN)
            .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
            .collect();
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    codes
}

/// 入力を正規化（前後の空白除去、大文字化）
///
/// # Returns
/// バックアップコード形式（8文字の英数字）でなければ `None`
pub fn normalize_backup_code(code: &str) -> Option<String> {
    let normalized = code.trim().to_ascii_uppercase();
    if normalized.len() == BACKUP_CODE_LEN
        && normalized.bytes().all(|b| BACKUP_CODE_CHARSET.contains(&b))
    {
        Some(normalized)
    } else {
        None
    }
}

/// 正規化済みコードをSHA256でハッシュ化
pub fn hash_backup_code(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// バックアップコード管理
///
/// # Security
/// - ストアにはハッシュのみを保存する
/// - コード平文はログに出力しない
#[derive(Clone)]
pub struct BackupCodeManager<S> {
    store: S,
    count: usize,
}

impl<S: TwoFactorStore> BackupCodeManager<S> {
    pub fn new(store: S, count: usize) -> Self {
        Self { store, count }
    }

    /// 新しいコード一式を発行
    ///
    /// # Returns
    /// (平文コード, ハッシュ)
    pub fn issue(&self) -> (Vec<String>, Vec<String>) {
        let codes = generate_backup_codes(self.count);
        let hashes = codes.iter().map(|code| hash_backup_code(code)).collect();
        (codes, hashes)
    }

    /// バックアップコードを消費
    ///
    /// 大文字小文字を区別しない。一致した場合のみ削除し `true` を返す
    pub async fn consume(&self, user_id: &str, code: &str) -> Result<bool, AppError> {
        let Some(normalized) = normalize_backup_code(code) else {
            return Ok(false);
        };

        let consumed = self
            .store
            .consume_backup_code(user_id, &hash_backup_code(&normalized))
            .await?;

        if consumed {
            tracing::info!(user_id = %user_id, "バックアップコード使用");
        }

        Ok(consumed)
    }

    /// 残りのバックアップコード数
    pub async fn remaining_count(&self, user_id: &str) -> Result<i64, AppError> {
        Ok(self.store.count_backup_codes(user_id).await?)
    }

    /// バックアップコードを再生成（既存のコードはすべて無効化）
    pub async fn regenerate(&self, user_id: &str) -> Result<Vec<String>, AppError> {
        let (codes, hashes) = self.issue();

        if !self.store.replace_backup_codes(user_id, hashes).await? {
            return Err(AppError::NotEnrolled);
        }

        tracing::info!(user_id = %user_id, count = codes.len(), "バックアップコード再生成");

        Ok(codes)
    }
}
