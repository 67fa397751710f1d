use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{User2faEnrollment, User2faPendingSetup};
use crate::repositories::TwoFactorStore;

/// ユーザー1人分の2FA状態
#[derive(Debug, Default)]
struct UserSlot {
    pending: Option<User2faPendingSetup>,
    enrollment: Option<User2faEnrollment>,
    backup_code_hashes: HashSet<String>,
    /// マップから取り除かれたスロット（書き込みは新しいスロットに行う）
    detached: bool,
}

impl UserSlot {
    fn is_empty(&self) -> bool {
        self.pending.is_none() && self.enrollment.is_none() && self.backup_code_hashes.is_empty()
    }
}

/// インメモリ2FAストア
///
/// ユーザーごとに `Mutex` を持ち、同一ユーザーへの操作を直列化する。
/// 空になったスロットはマップから取り除く。
/// DATABASE_URL 未設定時とテストで使用する。
#[derive(Clone, Default)]
pub struct MemoryTwoFactorStore {
    slots: Arc<RwLock<HashMap<String, Arc<Mutex<UserSlot>>>>>,
}

impl MemoryTwoFactorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存のスロットを取得
    async fn existing_slot(&self, user_id: &str) -> Option<Arc<Mutex<UserSlot>>> {
        self.slots.read().await.get(user_id).cloned()
    }

    /// スロットを取得（なければ作成）
    async fn slot(&self, user_id: &str) -> Arc<Mutex<UserSlot>> {
        if let Some(slot) = self.existing_slot(user_id).await {
            return slot;
        }

        self.slots
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// 既存のスロットをロックして `f` を適用
    ///
    /// # Returns
    /// スロットがなければ `None`
    async fn update<F, R>(&self, user_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut UserSlot) -> R + Send,
        R: Send,
    {
        let slot = self.existing_slot(user_id).await?;

        let (result, empty) = {
            let mut guard = slot.lock().await;
            let result = f(&mut *guard);
            (result, guard.is_empty() && !guard.detached)
        };

        if empty {
            self.release_if_empty(user_id, &slot).await;
        }

        Some(result)
    }

    /// 空のスロットをマップから取り除く
    ///
    /// 他のタスクがロック中の場合はそのタスクに任せる
    async fn release_if_empty(&self, user_id: &str, slot: &Arc<Mutex<UserSlot>>) {
        let mut slots = self.slots.write().await;

        let attached = slots
            .get(user_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if !attached {
            return;
        }

        let Ok(mut guard) = slot.try_lock() else {
            return;
        };
        if guard.is_empty() {
            guard.detached = true;
            drop(guard);
            slots.remove(user_id);
        }
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

impl TwoFactorStore for MemoryTwoFactorStore {
    const BACKEND: &'static str = "memory";

    async fn put_pending_setup(&self, setup: User2faPendingSetup) -> Result<bool, sqlx::Error> {
        loop {
            let slot = self.slot(&setup.user_id).await;
            let mut guard = slot.lock().await;

            // 取得後に取り除かれたスロットには書き込まない
            if guard.detached {
                continue;
            }
            if guard.enrollment.is_some() {
                return Ok(false);
            }

            guard.pending = Some(setup);
            return Ok(true);
        }
    }

    async fn find_pending_setup(
        &self,
        user_id: &str,
    ) -> Result<Option<User2faPendingSetup>, sqlx::Error> {
        Ok(self
            .update(user_id, |slot| slot.pending.clone())
            .await
            .flatten())
    }

    async fn delete_pending_setup(
        &self,
        user_id: &str,
        setup_id: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let deleted = self
            .update(user_id, |slot| {
                let matches = match (&slot.pending, setup_id) {
                    (Some(pending), Some(id)) => pending.id == id,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matches {
                    slot.pending = None;
                }
                matches
            })
            .await;

        Ok(deleted.unwrap_or(false))
    }

    async fn purge_expired_setups(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let user_ids: Vec<String> = self.slots.read().await.keys().cloned().collect();

        let mut purged = 0;
        for user_id in user_ids {
            let removed = self
                .update(&user_id, |slot| {
                    let expired = slot
                        .pending
                        .as_ref()
                        .is_some_and(|pending| pending.created_at < cutoff);
                    if expired {
                        slot.pending = None;
                    }
                    expired
                })
                .await;

            if removed == Some(true) {
                purged += 1;
            }
        }

        Ok(purged)
    }

    async fn finalize_setup(
        &self,
        setup: &User2faPendingSetup,
        enabled_at: OffsetDateTime,
    ) -> Result<Option<User2faEnrollment>, sqlx::Error> {
        let enrollment = self
            .update(&setup.user_id, |slot| {
                if slot.pending.as_ref().map(|pending| pending.id) != Some(setup.id) {
                    return None;
                }

                let enrollment = User2faEnrollment {
                    user_id: setup.user_id.clone(),
                    secret_encrypted: setup.secret_encrypted.clone(),
                    enabled_at,
                    backup_codes_used: 0,
                };

                slot.pending = None;
                slot.enrollment = Some(enrollment.clone());
                slot.backup_code_hashes = setup.backup_code_hashes.iter().cloned().collect();

                Some(enrollment)
            })
            .await;

        Ok(enrollment.flatten())
    }

    async fn find_enrollment(
        &self,
        user_id: &str,
    ) -> Result<Option<User2faEnrollment>, sqlx::Error> {
        Ok(self
            .update(user_id, |slot| slot.enrollment.clone())
            .await
            .flatten())
    }

    async fn delete_enrollment(&self, user_id: &str) -> Result<bool, sqlx::Error> {
        let deleted = self
            .update(user_id, |slot| {
                slot.backup_code_hashes.clear();
                slot.enrollment.take().is_some()
            })
            .await;

        Ok(deleted.unwrap_or(false))
    }

    async fn consume_backup_code(&self, user_id: &str, code_hash: &str) -> Result<bool, sqlx::Error> {
        let consumed = self
            .update(user_id, |slot| {
                if !slot.backup_code_hashes.remove(code_hash) {
                    return false;
                }

                // レコードは置き換えで更新する
                slot.enrollment = slot.enrollment.take().map(|enrollment| User2faEnrollment {
                    backup_codes_used: enrollment.backup_codes_used + 1,
                    ..enrollment
                });
                true
            })
            .await;

        Ok(consumed.unwrap_or(false))
    }

    async fn count_backup_codes(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        let count = self
            .update(user_id, |slot| slot.backup_code_hashes.len())
            .await
            .unwrap_or(0);
        Ok(count as i64)
    }

    async fn replace_backup_codes(
        &self,
        user_id: &str,
        code_hashes: Vec<String>,
    ) -> Result<bool, sqlx::Error> {
        let replaced = self
            .update(user_id, |slot| {
                if slot.enrollment.is_none() {
                    return false;
                }
                slot.backup_code_hashes = code_hashes.into_iter().collect();
                true
            })
            .await;

        Ok(replaced.unwrap_or(false))
    }
}
