use std::sync::Arc;

use secrecy::ExposeSecret;
use time::Duration;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::TwoFactorStore;
use crate::services::{TotpService, TwoFactorService};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState<S> {
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// 二要素認証サービス
    pub two_factor: TwoFactorService<S>,
}

impl<S: TwoFactorStore> AppState<S> {
    /// 新しい AppState を作成
    pub fn new(store: S, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let totp_service = TotpService::new(
            config.totp_issuer.clone(),
            config.encryption_key.expose_secret(),
        )?
        .with_account_domain(config.totp_account_domain.clone())
        .with_time_step(config.totp_step_secs, config.totp_window_steps)?;

        if config.setup_ttl_secs <= 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "setup ttl must be greater than zero"
            )));
        }

        let two_factor = TwoFactorService::new(
            store,
            totp_service,
            Duration::seconds(config.setup_ttl_secs),
            config.backup_code_count,
        );

        tracing::info!(
            issuer = %config.totp_issuer,
            step_secs = config.totp_step_secs,
            window_steps = config.totp_window_steps,
            setup_ttl_secs = config.setup_ttl_secs,
            "二要素認証サービスを初期化"
        );

        Ok(Self { config, two_factor })
    }
}
