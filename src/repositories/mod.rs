pub mod memory;
pub mod user_2fa;

use std::future::Future;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{User2faEnrollment, User2faPendingSetup};

pub use memory::MemoryTwoFactorStore;
pub use user_2fa::User2faRepository;

/// 2FAレコードのストア
///
/// 確認待ち設定・登録レコード・バックアップコードをユーザーIDをキーに保持する。
/// 各操作はユーザー単位でアトミックに実行されること。
pub trait TwoFactorStore: Clone + Send + Sync + 'static {
    /// ストア種別（ヘルスチェック用）
    const BACKEND: &'static str;

    /// 確認待ち設定を保存（既存の設定は上書き）
    ///
    /// # Returns
    /// 登録レコードが既に存在する場合は `false`（何も変更しない）。
    /// 登録レコードの確認と保存は `finalize_setup` と競合しないこと。
    fn put_pending_setup(
        &self,
        setup: User2faPendingSetup,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn find_pending_setup(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<User2faPendingSetup>, sqlx::Error>> + Send;

    /// 確認待ち設定を削除
    ///
    /// `setup_id` を指定した場合は一致する設定のみ削除する
    fn delete_pending_setup(
        &self,
        user_id: &str,
        setup_id: Option<Uuid>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// `cutoff` より前に作成された確認待ち設定をすべて削除
    fn purge_expired_setups(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;

    /// 確認待ち設定を登録レコードとバックアップコードに確定
    ///
    /// # Returns
    /// 設定が既に置き換え・削除されていた場合は `None`（何も変更しない）
    fn finalize_setup(
        &self,
        setup: &User2faPendingSetup,
        enabled_at: OffsetDateTime,
    ) -> impl Future<Output = Result<Option<User2faEnrollment>, sqlx::Error>> + Send;

    fn find_enrollment(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<User2faEnrollment>, sqlx::Error>> + Send;

    /// 登録レコードとバックアップコードを削除
    fn delete_enrollment(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// バックアップコードを消費（一致した場合のみ削除し、使用回数を加算）
    fn consume_backup_code(
        &self,
        user_id: &str,
        code_hash: &str,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn count_backup_codes(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<i64, sqlx::Error>> + Send;

    /// バックアップコードを全件置き換え
    ///
    /// # Returns
    /// 登録レコードが存在しない場合は `false`（何も変更しない）
    fn replace_backup_codes(
        &self,
        user_id: &str,
        code_hashes: Vec<String>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}
