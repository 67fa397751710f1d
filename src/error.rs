use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::services::hotp::OtpError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("ワンタイムパスワード計算エラー")]
    Otp(#[from] OtpError),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("進行中の二要素認証設定がありません")]
    NoPendingSetup,

    #[error("二要素認証の設定有効期限が切れました")]
    SetupExpired,

    #[error("認証コードが無効です")]
    InvalidCode,

    #[error("二要素認証が有効化されていません")]
    NotEnrolled,

    #[error("二要素認証は既に有効です")]
    AlreadyEnabled,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Otp(e) => {
                tracing::error!(error = %e, "ワンタイムパスワード計算エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                )
            }
            Self::NoPendingSetup => (
                StatusCode::NOT_FOUND,
                "進行中の二要素認証設定がありません".to_string(),
            ),
            Self::SetupExpired => (
                StatusCode::GONE,
                "設定の有効期限が切れました。最初からやり直してください".to_string(),
            ),
            Self::InvalidCode => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません".to_string(),
            ),
            Self::NotEnrolled => (
                StatusCode::BAD_REQUEST,
                "二要素認証が有効化されていません".to_string(),
            ),
            Self::AlreadyEnabled => {
                (StatusCode::CONFLICT, "二要素認証は既に有効です".to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
