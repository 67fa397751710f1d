use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::AppError;
use crate::models::{User2faEnrollment, User2faPendingSetup};
use crate::repositories::TwoFactorStore;
use crate::services::backup_code::BackupCodeManager;
use crate::services::totp::{TotpService, unix_seconds};

const MAX_USER_ID_LEN: usize = 255;

/// ユーザーごとの2FA状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorState {
    NotEnrolled,
    PendingSetup,
    Enrolled,
}

#[derive(Debug, Clone)]
pub struct TwoFactorStatus {
    pub state: TwoFactorState,
    pub enabled_at: Option<OffsetDateTime>,
    pub backup_codes_remaining: i64,
    pub backup_codes_used: i32,
}

/// 設定開始時に返却するプロビジョニング情報
///
/// # Security
/// シークレットとバックアップコードを含むためログ出力禁止
pub struct SetupProvisioning {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

/// 二要素認証サービス
///
/// 状態遷移:
/// - 未登録 → 確認待ち (`begin_setup`)
/// - 確認待ち → 登録済み (`confirm_setup`)
/// - 確認待ち → 未登録（期限切れ / `cancel_setup`）
/// - 登録済み → 未登録 (`disable`)
#[derive(Clone)]
pub struct TwoFactorService<S> {
    store: S,
    totp: TotpService,
    backup_codes: BackupCodeManager<S>,
    setup_ttl: Duration,
}

impl<S: TwoFactorStore> TwoFactorService<S> {
    pub fn new(store: S, totp: TotpService, setup_ttl: Duration, backup_code_count: usize) -> Self {
        Self {
            backup_codes: BackupCodeManager::new(store.clone(), backup_code_count),
            store,
            totp,
            setup_ttl,
        }
    }

    pub fn totp(&self) -> &TotpService {
        &self.totp
    }

    /// 2FA設定を開始
    ///
    /// シークレットとバックアップコードの下書きを生成し、確認待ち設定として保存する。
    /// 既存の確認待ち設定は上書きされる。
    pub async fn begin_setup(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Result<SetupProvisioning, AppError> {
        validate_user_id(user_id)?;

        let secret = TotpService::generate_secret();
        let secret_base32 = self.totp.encode_secret(&secret);
        let account = self.totp.account_name(user_id);
        let provisioning_uri = self.totp.provisioning_uri(&account, &secret_base32);
        let qr_code = TotpService::generate_qr_code(&provisioning_uri)?;

        let (backup_codes, backup_code_hashes) = self.backup_codes.issue();

        let encrypted = self.totp.encrypt_secret(&secret)?;

        // 登録済みの判定は保存と同じ操作で行う
        let stored = self
            .store
            .put_pending_setup(User2faPendingSetup::new(
                user_id,
                encrypted,
                backup_code_hashes,
                now,
            ))
            .await?;
        if !stored {
            return Err(AppError::AlreadyEnabled);
        }

        tracing::info!(user_id = %user_id, "2FA設定開始");

        Ok(SetupProvisioning {
            secret: secret_base32,
            provisioning_uri,
            qr_code: format!("data:image/png;base64,{}", qr_code),
            backup_codes,
        })
    }

    /// 2FA設定を確認（初回コード検証で有効化）
    ///
    /// # Errors
    /// - `NoPendingSetup`: 確認待ち設定がない、または新しい設定に置き換えられた
    /// - `SetupExpired`: 有効期限切れ（確認待ち設定は破棄される）
    /// - `InvalidCode`: コード不一致（確認待ち設定は有効期限まで保持）
    pub async fn confirm_setup(
        &self,
        user_id: &str,
        code: &str,
        now: OffsetDateTime,
    ) -> Result<User2faEnrollment, AppError> {
        let setup = self
            .store
            .find_pending_setup(user_id)
            .await?
            .ok_or(AppError::NoPendingSetup)?;

        if setup.is_expired(now, self.setup_ttl) {
            self.store
                .delete_pending_setup(user_id, Some(setup.id))
                .await?;
            tracing::warn!(user_id = %user_id, "2FA設定の有効期限切れ");
            return Err(AppError::SetupExpired);
        }

        let secret = self.totp.decrypt_secret(&setup.secret_encrypted)?;
        if !self.totp.verify_code(&secret, code, unix_seconds(now))? {
            tracing::warn!(user_id = %user_id, "2FA設定確認: コード不一致");
            return Err(AppError::InvalidCode);
        }

        let enrollment = self
            .store
            .finalize_setup(&setup, now)
            .await?
            .ok_or_else(|| {
                tracing::warn!(user_id = %user_id, "2FA設定確認: 設定が置き換えられた");
                AppError::NoPendingSetup
            })?;

        tracing::info!(user_id = %user_id, "2FA有効化完了");

        Ok(enrollment)
    }

    /// 確認待ちの設定を取り消し
    pub async fn cancel_setup(&self, user_id: &str) -> Result<bool, AppError> {
        let cancelled = self.store.delete_pending_setup(user_id, None).await?;
        if cancelled {
            tracing::info!(user_id = %user_id, "2FA設定取り消し");
        }
        Ok(cancelled)
    }

    /// ログイン時の2FAコード検証
    ///
    /// 2FA未登録ユーザーは常に `true`。
    /// バックアップコード（8文字英数字）を先に照合し、一致しなければTOTP（6桁数字）で検証する。
    pub async fn verify_login_code(
        &self,
        user_id: &str,
        code: &str,
        now: OffsetDateTime,
    ) -> Result<bool, AppError> {
        let Some(enrollment) = self.store.find_enrollment(user_id).await? else {
            tracing::debug!(user_id = %user_id, "2FA未登録（検証不要）");
            return Ok(true);
        };

        if self.backup_codes.consume(user_id, code).await? {
            return Ok(true);
        }

        let secret = self.totp.decrypt_secret(&enrollment.secret_encrypted)?;
        let verified = self.totp.verify_code(&secret, code, unix_seconds(now))?;

        if !verified {
            tracing::warn!(user_id = %user_id, "2FAログイン検証失敗");
        }

        Ok(verified)
    }

    /// 2FAを無効化（未登録ユーザーに対しては何もしない）
    pub async fn disable(&self, user_id: &str) -> Result<(), AppError> {
        if self.store.delete_enrollment(user_id).await? {
            tracing::info!(user_id = %user_id, "2FA無効化完了");
        }
        Ok(())
    }

    pub async fn is_enabled(&self, user_id: &str) -> Result<bool, AppError> {
        Ok(self.store.find_enrollment(user_id).await?.is_some())
    }

    pub async fn remaining_backup_codes(&self, user_id: &str) -> Result<i64, AppError> {
        self.backup_codes.remaining_count(user_id).await
    }

    /// # Errors
    /// - `NotEnrolled`: 2FA未登録
    pub async fn regenerate_backup_codes(&self, user_id: &str) -> Result<Vec<String>, AppError> {
        self.backup_codes.regenerate(user_id).await
    }

    /// 期限切れの確認待ち設定を一括削除
    pub async fn purge_expired_setups(&self, now: OffsetDateTime) -> Result<u64, AppError> {
        let purged = self
            .store
            .purge_expired_setups(now - self.setup_ttl)
            .await?;

        if purged > 0 {
            tracing::info!(count = purged, "期限切れの2FA設定を削除");
        }

        Ok(purged)
    }

    /// 2FA状態を取得（期限切れの確認待ち設定は削除して未登録扱い）
    pub async fn status(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Result<TwoFactorStatus, AppError> {
        if let Some(enrollment) = self.store.find_enrollment(user_id).await? {
            return Ok(TwoFactorStatus {
                state: TwoFactorState::Enrolled,
                enabled_at: Some(enrollment.enabled_at),
                backup_codes_remaining: self.backup_codes.remaining_count(user_id).await?,
                backup_codes_used: enrollment.backup_codes_used,
            });
        }

        let mut pending = self.store.find_pending_setup(user_id).await?;
        if let Some(setup) = pending.take_if(|setup| setup.is_expired(now, self.setup_ttl)) {
            self.store
                .delete_pending_setup(user_id, Some(setup.id))
                .await?;
        }

        Ok(TwoFactorStatus {
            state: if pending.is_some() {
                TwoFactorState::PendingSetup
            } else {
                TwoFactorState::NotEnrolled
            },
            enabled_at: None,
            backup_codes_remaining: 0,
            backup_codes_used: 0,
        })
    }
}

/// ユーザーIDバリデーション
///
/// otpauth ラベルの区切り文字 `:` と制御文字は使用不可
fn validate_user_id(user_id: &str) -> Result<(), AppError> {
    if user_id.trim().is_empty() {
        return Err(AppError::Validation("ユーザーIDは必須です".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(AppError::Validation(
            "ユーザーIDは255文字以内で入力してください".to_string(),
        ));
    }
    if user_id.chars().any(|c| c == ':' || c.is_control()) {
        return Err(AppError::Validation(
            "ユーザーIDに使用できない文字が含まれています".to_string(),
        ));
    }
    Ok(())
}
