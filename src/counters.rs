//! In-memory sliding minute windows, one pair of sample sequences per user.
//! Samples are transient: a restart only under-counts the minute dimensions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MINUTE_WINDOW_SECS: u64 = 60;

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        crate::store::now_epoch_seconds()
    }
}

/// Process-wide counter bank. The mutex is only ever held for prune + push;
/// never across an await.
#[derive(Debug, Default)]
pub struct WindowCounters {
    inner: Mutex<HashMap<String, UserWindows>>,
}

#[derive(Debug, Default)]
struct UserWindows {
    requests: VecDeque<u64>,
    tokens: VecDeque<(u64, u64)>,
}

impl UserWindows {
    fn prune(&mut self, cutoff: u64) {
        while self.requests.front().is_some_and(|ts| *ts <= cutoff) {
            self.requests.pop_front();
        }
        while self.tokens.front().is_some_and(|(ts, _)| *ts <= cutoff) {
            self.tokens.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.tokens.is_empty()
    }
}

impl WindowCounters {
    pub fn record_request(&self, user_id: &str, now: u64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(user_id.to_string())
            .or_default()
            .requests
            .push_back(now);
    }

    pub fn record_tokens(&self, user_id: &str, tokens: u64, now: u64) {
        if tokens == 0 {
            return;
        }
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(user_id.to_string())
            .or_default()
            .tokens
            .push_back((now, tokens));
    }

    /// Requests in the strictly sliding window `(now - 60s, now]`.
    pub fn requests_in_window(&self, user_id: &str, now: u64) -> u64 {
        let cutoff = now.saturating_sub(MINUTE_WINDOW_SECS);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(windows) = map.get_mut(user_id) else {
            return 0;
        };
        windows.prune(cutoff);
        windows.requests.len() as u64
    }

    /// Token sum over the strictly sliding window `(now - 60s, now]`.
    pub fn tokens_in_window(&self, user_id: &str, now: u64) -> u64 {
        let cutoff = now.saturating_sub(MINUTE_WINDOW_SECS);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(windows) = map.get_mut(user_id) else {
            return 0;
        };
        windows.prune(cutoff);
        windows
            .tokens
            .iter()
            .fold(0u64, |sum, (_, tokens)| sum.saturating_add(*tokens))
    }

    /// Drops idle users so the map stays bounded by the active set.
    pub fn prune_idle(&self, now: u64) {
        let cutoff = now.saturating_sub(MINUTE_WINDOW_SECS);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, windows| {
            windows.prune(cutoff);
            !windows.is_empty()
        });
    }

    pub fn tracked_users(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    /// Low-frequency background walk over idle users.
    pub fn spawn_pruner(
        counters: Arc<WindowCounters>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                counters.prune_idle(SystemClock.now_epoch_seconds());
            }
        })
    }
}
