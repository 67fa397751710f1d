use std::io::Cursor;
use std::ops::RangeInclusive;

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use rand::RngCore;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::AppError;
use crate::services::base32::Base32Codec;
use crate::services::hotp::{CODE_DIGITS, Hotp, KeyedHash, OtpError, Sha1Hmac};

/// シークレット長（160ビット）
pub const SECRET_LEN: usize = 20;

/// 受け付ける最小シークレット長（128ビット）
const MIN_SECRET_LEN: usize = 16;

const DEFAULT_STEP_SECS: u64 = 30;
const DEFAULT_WINDOW_STEPS: u64 = 1;

/// `OffsetDateTime` を UNIX 秒に変換（エポック以前は 0）
pub fn unix_seconds(now: OffsetDateTime) -> u64 {
    u64::try_from(now.unix_timestamp()).unwrap_or(0)
}

/// TOTP (RFC 6238) クロックアダプタ
///
/// 時刻をステップ数（カウンタ）に変換し、前後 `window_steps` の範囲で照合する。
#[derive(Debug, Clone)]
pub struct TotpClock<H = Sha1Hmac> {
    hotp: Hotp<H>,
    step_secs: u64,
    window_steps: u64,
}

impl<H: KeyedHash> TotpClock<H> {
    pub fn new(hash: H, step_secs: u64, window_steps: u64) -> Result<Self, AppError> {
        if step_secs == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "totp step must be greater than zero"
            )));
        }

        Ok(Self {
            hotp: Hotp::new(hash),
            step_secs,
            window_steps,
        })
    }

    pub fn step_secs(&self) -> u64 {
        self.step_secs
    }

    pub fn window_steps(&self) -> u64 {
        self.window_steps
    }

    pub fn counter_for(&self, timestamp: u64) -> u64 {
        timestamp / self.step_secs
    }

    /// 許容するカウンタ（負のカウンタは存在しないため除外）
    pub fn acceptable_counters(&self, timestamp: u64) -> RangeInclusive<u64> {
        let current = self.counter_for(timestamp);
        current.saturating_sub(self.window_steps)..=current.saturating_add(self.window_steps)
    }

    pub fn generate(&self, secret: &[u8], timestamp: u64) -> Result<String, OtpError> {
        self.hotp.generate(secret, self.counter_for(timestamp))
    }

    /// コードを検証
    ///
    /// カウンタごとに個別にHMACを計算し、定数時間で比較する。
    pub fn verify(&self, secret: &[u8], candidate: &str, timestamp: u64) -> Result<bool, OtpError> {
        if !is_totp_format(candidate) {
            return Ok(false);
        }

        for counter in self.acceptable_counters(timestamp) {
            let expected = self.hotp.generate(secret, counter)?;
            if bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// TOTPコード形式（6桁の数字）
pub fn is_totp_format(code: &str) -> bool {
    code.len() == CODE_DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

/// TOTP (Time-based One-Time Password) サービス
///
/// # Security
/// - シークレットはAES-256-GCMで暗号化して保存
/// - シークレット平文はログに出力しない
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    account_domain: Option<String>,
    encryption_key: [u8; 32],
    codec: Base32Codec,
    clock: TotpClock,
}

impl TotpService {
    /// 新しい TotpService を作成（30秒ステップ、前後1ステップ許容）
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）
    /// * `encryption_key_base64` - Base64エンコードされた32バイトの暗号化キー
    pub fn new(issuer: String, encryption_key_base64: &str) -> Result<Self, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let key_bytes = STANDARD.decode(encryption_key_base64).map_err(|e| {
            tracing::error!(error = ?e, "TOTP暗号化キーのBase64デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid encryption key format"))
        })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "TOTP暗号化キーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption key must be 32 bytes"
            )));
        }

        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&key_bytes);

        let codec = Base32Codec::new().map_err(|e| {
            tracing::error!(error = ?e, "Base32コーデックの初期化エラー");
            AppError::Internal(anyhow::anyhow!("base32 codec initialization error"))
        })?;

        Ok(Self {
            issuer,
            account_domain: None,
            encryption_key,
            codec,
            clock: TotpClock::new(Sha1Hmac, DEFAULT_STEP_SECS, DEFAULT_WINDOW_STEPS)?,
        })
    }

    /// アカウント名のドメイン部を設定
    pub fn with_account_domain(mut self, account_domain: Option<String>) -> Self {
        self.account_domain = account_domain.filter(|domain| !domain.trim().is_empty());
        self
    }

    /// ステップ秒数と許容ウィンドウを設定
    pub fn with_time_step(mut self, step_secs: u64, window_steps: u64) -> Result<Self, AppError> {
        self.clock = TotpClock::new(Sha1Hmac, step_secs, window_steps)?;
        Ok(self)
    }

    pub fn clock(&self) -> &TotpClock {
        &self.clock
    }

    /// 20バイトのランダムシークレットを生成
    pub fn generate_secret() -> Vec<u8> {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// シークレットをBase32でエンコード
    pub fn encode_secret(&self, secret: &[u8]) -> String {
        self.codec.encode(secret)
    }

    /// Base32シークレットをデコード
    ///
    /// # Note
    /// 空白や小文字は許容する。128ビット未満になる場合はエラー
    pub fn decode_secret(&self, secret: &str) -> Result<Vec<u8>, AppError> {
        let bytes = self.codec.decode(secret);
        if bytes.len() < MIN_SECRET_LEN {
            return Err(AppError::Validation(
                "シークレットの形式が正しくありません".to_string(),
            ));
        }
        Ok(bytes)
    }

    /// シークレットをAES-256-GCMで暗号化
    ///
    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文
    pub fn encrypt_secret(&self, secret: &[u8]) -> Result<Vec<u8>, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, secret).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut result = Vec::with_capacity(12 + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// 暗号化されたシークレットを復号
    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<Vec<u8>, AppError> {
        if encrypted.len() < 12 {
            tracing::error!(len = encrypted.len(), "暗号化データが短すぎる");
            return Err(AppError::Internal(anyhow::anyhow!(
                "encrypted data too short"
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher.decrypt(nonce, ciphertext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット復号エラー");
            AppError::Internal(anyhow::anyhow!("decryption error"))
        })
    }

    /// 認証アプリに表示するアカウント名
    pub fn account_name(&self, user_id: &str) -> String {
        match &self.account_domain {
            Some(domain) => format!("{}@{}", user_id, domain),
            None => user_id.to_string(),
        }
    }

    /// プロビジョニングURI（otpauth://）を構築
    pub fn provisioning_uri(&self, account: &str, secret_base32: &str) -> String {
        let issuer = urlencoding::encode(&self.issuer);
        format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}",
            issuer = issuer,
            account = urlencoding::encode(account),
            secret = secret_base32,
        )
    }

    /// プロビジョニングURIのQRコードを生成（PNG形式、Base64エンコード）
    ///
    /// QRコードには `provisioning_uri` と同じ文字列を埋め込む
    pub fn generate_qr_code(provisioning_uri: &str) -> Result<String, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let code = QrCode::new(provisioning_uri.as_bytes()).map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })?;
        let image = code.render::<Luma<u8>>().min_dimensions(200, 200).build();

        // image 0.25: write_to は Write + Seek が必要
        let mut cursor = Cursor::new(Vec::<u8>::new());
        DynamicImage::ImageLuma8(image)
            .write_to(&mut cursor, ImageFormat::Png)
            .map_err(|e| {
                tracing::error!(error = %e, "QRコードのPNGエンコードエラー");
                AppError::Internal(anyhow::anyhow!("qr code encoding error"))
            })?;

        Ok(STANDARD.encode(cursor.into_inner()))
    }

    /// 指定時刻のコードを生成
    pub fn generate_code(&self, secret: &[u8], timestamp: u64) -> Result<String, AppError> {
        Ok(self.clock.generate(secret, timestamp)?)
    }

    /// TOTPコードを検証
    ///
    /// # Note
    /// 前後 `window_steps` ステップの時間ウィンドウを許容
    pub fn verify_code(&self, secret: &[u8], code: &str, timestamp: u64) -> Result<bool, AppError> {
        Ok(self.clock.verify(secret, code.trim(), timestamp)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use totp_rs::{Algorithm, TOTP};

    const RFC_SECRET: &[u8] = b"12345678901234567890";

    fn create_test_service() -> TotpService {
        // テスト用の32バイトキー
        let key = [0u8; 32];
        let key_base64 = STANDARD.encode(key);
        TotpService::new("TestApp".to_string(), &key_base64).unwrap()
    }

    fn clock() -> TotpClock {
        TotpClock::new(Sha1Hmac, 30, 1).unwrap()
    }

    #[test]
    fn test_rfc6238_sha1_vectors() {
        let clock = clock();
        let cases = [
            (59u64, "287082"),
            (1_111_111_109, "081804"),
            (1_111_111_111, "050471"),
            (1_234_567_890, "005924"),
            (2_000_000_000, "279037"),
            (20_000_000_000, "353130"),
        ];
        for (time, expected) in cases {
            assert_eq!(clock.generate(RFC_SECRET, time).unwrap(), expected, "t = {time}");
        }
    }

    #[test]
    fn test_matches_totp_rs() {
        let clock = clock();
        let secret = TotpService::generate_secret();
        let reference = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret.clone(),
            Some("TestApp".to_string()),
            "user@example.com".to_string(),
        )
        .unwrap();

        for time in [0u64, 29, 30, 1_700_000_000, 1_700_000_015, 4_102_444_800] {
            assert_eq!(clock.generate(&secret, time).unwrap(), reference.generate(time));
        }
    }

    #[test]
    fn test_counter_for() {
        let clock = clock();
        assert_eq!(clock.counter_for(0), 0);
        assert_eq!(clock.counter_for(29), 0);
        assert_eq!(clock.counter_for(30), 1);
        assert_eq!(clock.counter_for(59), 1);
        assert_eq!(clock.counter_for(1_111_111_109), 37_037_036);
    }

    #[test]
    fn test_acceptable_counters() {
        let clock = clock();
        assert_eq!(
            clock.acceptable_counters(300).collect::<Vec<_>>(),
            vec![9, 10, 11]
        );
        // エポック直後は負のカウンタを含まない
        assert_eq!(clock.acceptable_counters(10).collect::<Vec<_>>(), vec![0, 1]);

        let wide = TotpClock::new(Sha1Hmac, 30, 2).unwrap();
        assert_eq!(
            wide.acceptable_counters(300).collect::<Vec<_>>(),
            vec![8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn test_verify_window_boundaries() {
        let clock = clock();
        let t = 1_700_000_010u64;
        let code = clock.generate(RFC_SECRET, t).unwrap();
        let counter = clock.counter_for(t);
        let step_start = counter * 30;

        assert!(clock.verify(RFC_SECRET, &code, t).unwrap());
        // 1ステップ前後は許容
        assert!(clock.verify(RFC_SECRET, &code, step_start + 30).unwrap());
        assert!(clock.verify(RFC_SECRET, &code, step_start + 59).unwrap());
        assert!(clock.verify(RFC_SECRET, &code, step_start - 30).unwrap());
        // 2ステップ離れると拒否
        assert!(!clock.verify(RFC_SECRET, &code, step_start + 60).unwrap());
        assert!(!clock.verify(RFC_SECRET, &code, step_start - 31).unwrap());
    }

    #[test]
    fn test_verify_far_outside_window() {
        let clock = clock();
        let t = 1_700_000_000u64;
        let code = clock.generate(RFC_SECRET, t).unwrap();
        assert!(clock.verify(RFC_SECRET, &code, t).unwrap());
        assert!(!clock.verify(RFC_SECRET, &code, t + 31 * 60).unwrap());
    }

    #[test]
    fn test_verify_rejects_invalid_format() {
        let clock = clock();
        assert!(!clock.verify(RFC_SECRET, "12345", 59).unwrap());
        assert!(!clock.verify(RFC_SECRET, "12345a", 59).unwrap());
        assert!(!clock.verify(RFC_SECRET, "2870820", 59).unwrap());
        assert!(clock.verify(RFC_SECRET, "287082", 59).unwrap());
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(TotpClock::new(Sha1Hmac, 0, 1).is_err());
    }

    #[test]
    fn test_generate_secret() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();
        assert_eq!(secret.len(), SECRET_LEN);

        // Base32エンコードされた20バイト = 32文字
        let encoded = service.encode_secret(&secret);
        assert_eq!(encoded.len(), 32);
        assert!(
            encoded
                .chars()
                .all(|c| "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567".contains(c))
        );
        assert_eq!(service.decode_secret(&encoded).unwrap(), secret);
    }

    #[test]
    fn test_decode_secret_too_short() {
        let service = create_test_service();
        assert!(service.decode_secret("MZXW6YTBOI").is_err());
    }

    #[test]
    fn test_encrypt_decrypt_secret() {
        let service = create_test_service();
        let original = TotpService::generate_secret();

        let encrypted = service.encrypt_secret(&original).unwrap();
        // 12バイトnonce + 暗号文 + 16バイトtag
        assert_eq!(encrypted.len(), 12 + SECRET_LEN + 16);

        let decrypted = service.decrypt_secret(&encrypted).unwrap();
        assert_eq!(original, decrypted);
    }

    #[test]
    fn test_decrypt_tampered_secret_fails() {
        let service = create_test_service();
        let mut encrypted = service
            .encrypt_secret(&TotpService::generate_secret())
            .unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(service.decrypt_secret(&encrypted).is_err());
        assert!(service.decrypt_secret(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_provisioning_uri() {
        let service = create_test_service();
        let uri = service.provisioning_uri("u1", "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP");
        assert_eq!(
            uri,
            "otpauth://totp/TestApp:u1?secret=JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP&issuer=TestApp"
        );
    }

    #[test]
    fn test_provisioning_uri_encodes_label() {
        let key_base64 = STANDARD.encode([0u8; 32]);
        let service = TotpService::new("Learning Assure".to_string(), &key_base64)
            .unwrap()
            .with_account_domain(Some("learningassure.com".to_string()));
        let account = service.account_name("u1");
        assert_eq!(account, "u1@learningassure.com");
        assert_eq!(
            service.provisioning_uri(&account, "ABC"),
            "otpauth://totp/Learning%20Assure:u1%40learningassure.com?secret=ABC&issuer=Learning%20Assure"
        );
    }

    #[test]
    fn test_generate_qr_code() {
        let service = create_test_service();
        let secret = service.encode_secret(&TotpService::generate_secret());
        let uri = service.provisioning_uri("test@example.com", &secret);

        let qr_base64 = TotpService::generate_qr_code(&uri).unwrap();
        // Base64エンコードされたPNG
        let png = STANDARD.decode(&qr_base64).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");

        // 同じURIからは同じ画像、異なるURIからは異なる画像
        assert_eq!(TotpService::generate_qr_code(&uri).unwrap(), qr_base64);
        let other = service.provisioning_uri("other@example.com", &secret);
        assert_ne!(TotpService::generate_qr_code(&other).unwrap(), qr_base64);
    }

    #[test]
    fn test_verify_code_trims_input() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();
        let code = service.generate_code(&secret, 1_700_000_000).unwrap();
        assert!(
            service
                .verify_code(&secret, &format!(" {code} "), 1_700_000_000)
                .unwrap()
        );
    }

    #[test]
    fn test_new_with_invalid_key_length() {
        let short_key = STANDARD.encode([0u8; 16]); // 16バイト（短すぎる）
        let result = TotpService::new("TestApp".to_string(), &short_key);
        assert!(result.is_err());
    }

    #[test]
    fn test_new_with_invalid_base64() {
        let result = TotpService::new("TestApp".to_string(), "not-valid-base64!!!");
        assert!(result.is_err());
    }
}
