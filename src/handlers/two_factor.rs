use axum::{
    Json,
    extract::{Path, State},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::AppError;
use crate::repositories::TwoFactorStore;
use crate::services::TwoFactorState;
use crate::services::totp::is_totp_format;
use crate::state::AppState;

// NOTE: いずれのエンドポイントも認証済みセッションの内側で呼び出されることを前提とする
// （user_id の本人確認は呼び出し側の責務）

// === 2FA Setup ===

#[derive(Debug, Deserialize, Validate)]
pub struct SetupRequest {
    #[garde(length(min = 1, max = 255))]
    pub user_id: String,
}

#[derive(Serialize)]
pub struct SetupResponse {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

/// POST /api/2fa/setup
///
/// 2FA設定を開始（シークレット生成、QRコード・バックアップコード返却）
///
/// # Security
/// - シークレット平文・バックアップコードはログ出力禁止
pub async fn setup_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    validate_request(&request)?;

    let provisioning = state
        .two_factor
        .begin_setup(&request.user_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(SetupResponse {
        secret: provisioning.secret,
        provisioning_uri: provisioning.provisioning_uri,
        qr_code: provisioning.qr_code,
        backup_codes: provisioning.backup_codes,
    }))
}

// === 2FA Verify ===

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyRequest {
    #[garde(length(min = 1, max = 255))]
    pub user_id: String,
    #[garde(custom(totp_code_format))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub enabled: bool,
}

/// POST /api/2fa/verify
///
/// 2FA設定確認（初回コード検証で有効化）
///
/// # Security
/// - コードはログ出力禁止
pub async fn verify_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    validate_request(&request)?;

    state
        .two_factor
        .confirm_setup(&request.user_id, &request.code, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(VerifyResponse { enabled: true }))
}

// === 2FA Cancel ===

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// POST /api/2fa/cancel
///
/// 確認待ちの2FA設定を取り消し
pub async fn cancel_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<CancelResponse>, AppError> {
    validate_request(&request)?;

    let cancelled = state.two_factor.cancel_setup(&request.user_id).await?;

    Ok(Json(CancelResponse { cancelled }))
}

// === 2FA Login Verify ===

#[derive(Debug, Deserialize, Validate)]
pub struct LoginVerifyRequest {
    #[garde(length(min = 1, max = 255))]
    pub user_id: String,
    /// TOTPコード（6桁数字）またはバックアップコード（8文字英数字）
    ///
    /// 形式の判定は検証処理に任せる（2FA未登録ユーザーは任意の入力で成功するため）
    #[garde(length(max = 64))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct LoginVerifyResponse {
    pub verified: bool,
}

/// POST /api/2fa/login/verify
///
/// ログイン時の2FAコード検証（2FA未登録ユーザーは常に成功）
///
/// # Security
/// - コードはログ出力禁止
pub async fn login_verify_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<LoginVerifyRequest>,
) -> Result<Json<LoginVerifyResponse>, AppError> {
    validate_request(&request)?;

    let verified = state
        .two_factor
        .verify_login_code(&request.user_id, &request.code, OffsetDateTime::now_utc())
        .await?;

    if !verified {
        return Err(AppError::InvalidCode);
    }

    Ok(Json(LoginVerifyResponse { verified }))
}

// === 2FA Disable ===

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub disabled: bool,
}

/// POST /api/2fa/disable
///
/// 2FA無効化（未登録でも成功）
pub async fn disable_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<DisableResponse>, AppError> {
    validate_request(&request)?;

    state.two_factor.disable(&request.user_id).await?;

    Ok(Json(DisableResponse { disabled: true }))
}

// === Backup Codes ===

#[derive(Serialize)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

/// POST /api/2fa/backup-codes/regenerate
///
/// バックアップコードを再生成（既存のコードはすべて無効化）
pub async fn regenerate_backup_codes<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<BackupCodesResponse>, AppError> {
    validate_request(&request)?;

    let backup_codes = state
        .two_factor
        .regenerate_backup_codes(&request.user_id)
        .await?;

    Ok(Json(BackupCodesResponse { backup_codes }))
}

// === 2FA Status ===

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: TwoFactorState,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub enabled_at: Option<OffsetDateTime>,
    pub backup_codes_remaining: i64,
    pub backup_codes_used: i32,
}

/// GET /api/2fa/status/{user_id}
pub async fn status_2fa<S: TwoFactorStore>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let status = state
        .two_factor
        .status(&user_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(StatusResponse {
        state: status.state,
        enabled: status.state == TwoFactorState::Enrolled,
        enabled_at: status.enabled_at,
        backup_codes_remaining: status.backup_codes_remaining,
        backup_codes_used: status.backup_codes_used,
    }))
}

// === Helper Functions ===

/// garde によるリクエストバリデーション
fn validate_request<T>(request: &T) -> Result<(), AppError>
where
    T: Validate,
    T::Context: Default,
{
    request
        .validate()
        .map_err(|report| AppError::Validation(report.to_string()))
}

/// TOTPコード形式（6桁の数字）の garde カスタムルール
fn totp_code_format(code: &str, _context: &()) -> garde::Result {
    if is_totp_format(code) {
        Ok(())
    } else {
        Err(garde::Error::new("認証コードは6桁の数字で入力してください"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_request(code: &str) -> VerifyRequest {
        VerifyRequest {
            user_id: "u1".to_string(),
            code: code.to_string(),
        }
    }

    #[test]
    fn test_verify_request_requires_six_digits() {
        assert!(validate_request(&verify_request("123456")).is_ok());

        for code in ["", "12345", "1234567", "12345a", "１２３４５６"] {
            assert!(
                validate_request(&verify_request(code)).is_err(),
                "code = {code:?}"
            );
        }
    }

    #[test]
    fn test_setup_request_requires_user_id() {
        let request = SetupRequest {
            user_id: String::new(),
        };
        assert!(validate_request(&request).is_err());

        let request = SetupRequest {
            user_id: "u1".to_string(),
        };
        assert!(validate_request(&request).is_ok());
    }

    #[test]
    fn test_login_verify_request_leaves_format_to_verifier() {
        for code in ["", "123456", "AB12CD34", "anything", "AB12-D34"] {
            let request = LoginVerifyRequest {
                user_id: "u1".to_string(),
                code: code.to_string(),
            };
            assert!(validate_request(&request).is_ok(), "code = {code:?}");
        }

        let too_long = LoginVerifyRequest {
            user_id: "u1".to_string(),
            code: "A".repeat(65),
        };
        assert!(validate_request(&too_long).is_err());
    }
}
