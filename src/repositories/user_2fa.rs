use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{User2faEnrollment, User2faPendingSetup};
use crate::repositories::TwoFactorStore;

/// PostgreSQL による2FAストア
///
/// 複数行にまたがる更新は1トランザクションで実行する。
#[derive(Clone)]
pub struct User2faRepository {
    pool: PgPool,
}

impl User2faRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// ユーザー単位のトランザクションロック
///
/// 確認待ち設定の保存と確定を直列化する（コミットまたはロールバックで解放）
async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

impl TwoFactorStore for User2faRepository {
    const BACKEND: &'static str = "postgres";

    async fn put_pending_setup(&self, setup: User2faPendingSetup) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, &setup.user_id).await?;

        let enrolled = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id
            FROM user_2fa_enrollments
            WHERE user_id = $1
            "#,
        )
        .bind(&setup.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if enrolled.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO user_2fa_pending_setups
                (user_id, id, secret_encrypted, backup_code_hashes, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET id = EXCLUDED.id,
                secret_encrypted = EXCLUDED.secret_encrypted,
                backup_code_hashes = EXCLUDED.backup_code_hashes,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&setup.user_id)
        .bind(setup.id)
        .bind(&setup.secret_encrypted)
        .bind(&setup.backup_code_hashes)
        .bind(setup.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(true)
    }

    async fn find_pending_setup(
        &self,
        user_id: &str,
    ) -> Result<Option<User2faPendingSetup>, sqlx::Error> {
        sqlx::query_as::<_, User2faPendingSetup>(
            r#"
            SELECT id, user_id, secret_encrypted, backup_code_hashes, created_at
            FROM user_2fa_pending_setups
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete_pending_setup(
        &self,
        user_id: &str,
        setup_id: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_2fa_pending_setups
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR id = $2)
            "#,
        )
        .bind(user_id)
        .bind(setup_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired_setups(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_2fa_pending_setups
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn finalize_setup(
        &self,
        setup: &User2faPendingSetup,
        enabled_at: OffsetDateTime,
    ) -> Result<Option<User2faEnrollment>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, &setup.user_id).await?;

        // 同じ設定IDの場合のみ取り出す（新しい設定に置き換えられていれば何もしない）
        let taken = sqlx::query(
            r#"
            DELETE FROM user_2fa_pending_setups
            WHERE user_id = $1 AND id = $2
            "#,
        )
        .bind(&setup.user_id)
        .bind(setup.id)
        .execute(&mut *tx)
        .await?;

        if taken.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let enrollment = sqlx::query_as::<_, User2faEnrollment>(
            r#"
            INSERT INTO user_2fa_enrollments
                (user_id, secret_encrypted, enabled_at, backup_codes_used)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (user_id) DO UPDATE
            SET secret_encrypted = EXCLUDED.secret_encrypted,
                enabled_at = EXCLUDED.enabled_at,
                backup_codes_used = 0
            RETURNING user_id, secret_encrypted, enabled_at, backup_codes_used
            "#,
        )
        .bind(&setup.user_id)
        .bind(&setup.secret_encrypted)
        .bind(enabled_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM user_2fa_backup_codes WHERE user_id = $1")
            .bind(&setup.user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO user_2fa_backup_codes (user_id, code_hash)
            SELECT $1, UNNEST($2::text[])
            "#,
        )
        .bind(&setup.user_id)
        .bind(&setup.backup_code_hashes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(enrollment))
    }

    async fn find_enrollment(
        &self,
        user_id: &str,
    ) -> Result<Option<User2faEnrollment>, sqlx::Error> {
        sqlx::query_as::<_, User2faEnrollment>(
            r#"
            SELECT user_id, secret_encrypted, enabled_at, backup_codes_used
            FROM user_2fa_enrollments
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// # Note
    /// バックアップコードは外部キーの ON DELETE CASCADE で削除される
    async fn delete_enrollment(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_2fa_enrollments
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn consume_backup_code(&self, user_id: &str, code_hash: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // 同時実行時は行ロックにより1件のみ削除に成功する
        let deleted = sqlx::query(
            r#"
            DELETE FROM user_2fa_backup_codes
            WHERE user_id = $1 AND code_hash = $2
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE user_2fa_enrollments
            SET backup_codes_used = backup_codes_used + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(true)
    }

    async fn count_backup_codes(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM user_2fa_backup_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    async fn replace_backup_codes(
        &self,
        user_id: &str,
        code_hashes: Vec<String>,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let enrolled = sqlx::query_scalar::<_, String>(
            r#"
            SELECT user_id
            FROM user_2fa_enrollments
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if enrolled.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM user_2fa_backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO user_2fa_backup_codes (user_id, code_hash)
            SELECT $1, UNNEST($2::text[])
            "#,
        )
        .bind(user_id)
        .bind(&code_hashes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(true)
    }
}
