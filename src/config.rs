use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// 未設定の場合はインメモリストアで起動する
    #[serde(default)]
    pub database_url: Option<SecretBox<String>>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    #[serde(default = "default_totp_issuer")]
    pub totp_issuer: String,
    /// アカウント名のドメイン部（設定時は `<user_id>@<domain>`）
    #[serde(default)]
    pub totp_account_domain: Option<String>,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    #[serde(default = "default_totp_step_secs")]
    pub totp_step_secs: u64,
    /// 前後に許容するステップ数
    #[serde(default = "default_totp_window_steps")]
    pub totp_window_steps: u64,
    /// 設定開始から確認までの有効期限（秒）
    #[serde(default = "default_setup_ttl_secs")]
    pub setup_ttl_secs: i64,
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,

    // CORS 設定（カンマ区切り）
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TOTP_ISSUER: &str = "otpgate";
const DEFAULT_TOTP_STEP_SECS: u64 = 30;
const DEFAULT_TOTP_WINDOW_STEPS: u64 = 1;
const DEFAULT_SETUP_TTL_SECS: i64 = 300;
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_totp_issuer() -> String {
    DEFAULT_TOTP_ISSUER.to_string()
}

fn default_totp_step_secs() -> u64 {
    DEFAULT_TOTP_STEP_SECS
}

fn default_totp_window_steps() -> u64 {
    DEFAULT_TOTP_WINDOW_STEPS
}

fn default_setup_ttl_secs() -> i64 {
    DEFAULT_SETUP_TTL_SECS
}

fn default_backup_code_count() -> usize {
    DEFAULT_BACKUP_CODE_COUNT
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// CORS 許可オリジンの一覧
    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
