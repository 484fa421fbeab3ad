//! LocalBackend - プロセス内の結果ストア
//!
//! # 実装詳細
//! - HashMap + tokio Mutex で排他制御
//! - エントリごとに期限（TTL）を持ち、読み出し時に期限切れを削除
//! - store 時に Notify で wait 中のタスクを起こす
//!
//! Results only live as long as the process, so this backend is meant for
//! tests and for running client and workers in one process.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{GroupId, MessageId, Outcome};
use crate::error::SpindleError;
use crate::ports::ResultBackend;

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }
}

/// Look up a live entry, evicting it first if it has expired.
fn live_mut<'a, K: Eq + Hash, T>(
    map: &'a mut HashMap<K, Expiring<T>>,
    key: &K,
) -> Option<&'a mut Expiring<T>> {
    let now = Instant::now();
    if map.get(key).is_some_and(|entry| entry.expires_at <= now) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[derive(Default)]
struct LocalState {
    results: HashMap<MessageId, Expiring<Outcome>>,
    group_message_ids: HashMap<GroupId, Expiring<Vec<MessageId>>>,
    group_completions: HashMap<GroupId, Expiring<u64>>,
}

#[derive(Default)]
pub struct LocalBackend {
    state: Mutex<LocalState>,
    stored: Notify,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBackend for LocalBackend {
    async fn store(
        &self,
        message_id: MessageId,
        outcome: Outcome,
        ttl: Duration,
    ) -> Result<(), SpindleError> {
        {
            let mut state = self.state.lock().await;
            state.results.insert(message_id, Expiring::new(outcome, ttl));
        }
        // ロック解放後に通知
        self.stored.notify_waiters();
        Ok(())
    }

    async fn get(
        &self,
        message_id: MessageId,
        forget: bool,
    ) -> Result<Option<Outcome>, SpindleError> {
        let mut state = self.state.lock().await;
        let Some(entry) = live_mut(&mut state.results, &message_id) else {
            return Ok(None);
        };
        let outcome = if forget {
            std::mem::replace(&mut entry.value, Outcome::Forgotten)
        } else {
            entry.value.clone()
        };
        Ok(Some(outcome))
    }

    async fn wait(
        &self,
        message_id: MessageId,
        timeout: Duration,
        forget: bool,
    ) -> Result<Outcome, SpindleError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent store is not missed.
            let notified = self.stored.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.get(message_id, forget).await? {
                return Ok(outcome);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self
                    .get(message_id, forget)
                    .await?
                    .ok_or_else(|| SpindleError::ResultTimeout(message_id.to_string()));
            }
        }
    }

    async fn set_group_message_ids(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        ttl: Duration,
    ) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        state
            .group_message_ids
            .insert(group_id, Expiring::new(message_ids.to_vec(), ttl));
        Ok(())
    }

    async fn get_group_message_ids(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<MessageId>, SpindleError> {
        let mut state = self.state.lock().await;
        live_mut(&mut state.group_message_ids, &group_id)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| SpindleError::MessageIdsMissing(group_id.to_string()))
    }

    async fn delete_group_message_ids(&self, group_id: GroupId) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        state.group_message_ids.remove(&group_id);
        state.group_completions.remove(&group_id);
        Ok(())
    }

    async fn increment_group_completion(
        &self,
        group_id: GroupId,
        ttl: Duration,
    ) -> Result<u64, SpindleError> {
        let mut state = self.state.lock().await;
        let count = match live_mut(&mut state.group_completions, &group_id) {
            Some(entry) => {
                entry.value += 1;
                entry.expires_at = Instant::now() + ttl;
                entry.value
            }
            None => {
                state.group_completions.insert(group_id, Expiring::new(1, ttl));
                1
            }
        };
        Ok(count)
    }
}
