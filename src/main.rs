use std::net::SocketAddr;

use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use otpgate::{
    config::Config,
    repositories::{MemoryTwoFactorStore, TwoFactorStore, User2faRepository},
    router::create_router,
    services::TwoFactorService,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化（JSON形式、環境変数でレベル制御）
    init_tracing();

    tracing::info!("otpgate 起動中...");

    let config = Config::load().map_err(|e| {
        tracing::error!(error = ?e, "設定の読み込みに失敗");
        anyhow::anyhow!("Failed to load config: {}", e)
    })?;

    tracing::info!(host = %config.host, port = %config.port, "設定読み込み完了");

    // サーバーアドレスを先に構築（config が move される前に）
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            tracing::error!(error = ?e, "アドレスのパースに失敗");
            anyhow::anyhow!("Failed to parse address: {}", e)
        })?;

    // DATABASE_URL の有無でストアを切り替える
    let database_url = config
        .database_url
        .as_ref()
        .map(|url| url.expose_secret().to_string());

    match database_url {
        Some(database_url) => {
            let db_pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .map_err(|e| {
                    tracing::error!(error = ?e, "データベース接続に失敗");
                    anyhow::anyhow!("Failed to connect to database: {}", e)
                })?;

            tracing::info!("データベース接続完了");

            sqlx::migrate!("./migrations")
                .run(&db_pool)
                .await
                .map_err(|e| {
                    tracing::error!(error = ?e, "マイグレーションに失敗");
                    anyhow::anyhow!("Failed to run migrations: {}", e)
                })?;

            tracing::info!("マイグレーション完了");

            serve(User2faRepository::new(db_pool), config, addr).await
        }
        None => {
            tracing::warn!("DATABASE_URL 未設定のためインメモリストアで起動（再起動で登録情報は失われる）");
            serve(MemoryTwoFactorStore::new(), config, addr).await
        }
    }
}

/// AppState を構築してサーバーを起動
async fn serve<S: TwoFactorStore>(store: S, config: Config, addr: SocketAddr) -> anyhow::Result<()> {
    let state = AppState::new(store, config).map_err(|e| {
        tracing::error!(error = ?e, "AppState の構築に失敗");
        anyhow::anyhow!("Failed to create AppState: {}", e)
    })?;

    spawn_setup_sweeper(state.two_factor.clone(), state.config.setup_ttl_secs);

    let app = create_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(error = ?e, addr = %addr, "ポートのバインドに失敗");
        anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
    })?;

    tracing::info!(addr = %addr, storage = S::BACKEND, "サーバー起動");

    // Graceful shutdown 対応
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "サーバーエラー");
            anyhow::anyhow!("Server error: {}", e)
        })?;

    tracing::info!("サーバー終了");

    Ok(())
}

/// 期限切れの確認待ち設定を定期的に削除
fn spawn_setup_sweeper<S: TwoFactorStore>(two_factor: TwoFactorService<S>, period_secs: i64) {
    let period = std::time::Duration::from_secs(u64::try_from(period_secs).unwrap_or(1).max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = two_factor
                .purge_expired_setups(OffsetDateTime::now_utc())
                .await
            {
                tracing::error!(error = ?e, "期限切れ設定の削除に失敗");
            }
        }
    });
}

/// tracing の初期化（JSON形式）
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,otpgate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Graceful shutdown シグナル待機
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Ctrl+C ハンドラーのインストールに失敗");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "SIGTERM ハンドラーのインストールに失敗");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, starting graceful shutdown");
        }
    }
}
