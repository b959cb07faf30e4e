use cyder_tools::log::debug;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use super::cache::types::CacheChannel;
use super::classifier::Verdict;
use super::registry::ChannelSnapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no available channel for model {model} in group {group}")]
    NoChannel { group: String, model: String },
    #[error("pinned channel {0} is not available")]
    PinnedUnavailable(i64),
}

/// Per-request channel choice and retry bookkeeping.
///
/// Lives for one request only; `tried` never shrinks and never holds a
/// channel twice.
#[derive(Debug)]
pub struct ChannelSelector {
    tried: Vec<i64>,
    skipped: HashSet<i64>,
    pinned: Option<i64>,
    retry_times: u32,
}

impl ChannelSelector {
    pub fn new(pinned: Option<i64>, retry_times: u32) -> Self {
        Self {
            tried: Vec::new(),
            skipped: HashSet::new(),
            pinned,
            retry_times,
        }
    }

    pub fn tried(&self) -> &[i64] {
        &self.tried
    }

    pub fn attempts(&self) -> u32 {
        self.tried.len() as u32
    }

    fn excluded(&self, id: i64) -> bool {
        self.tried.contains(&id) || self.skipped.contains(&id)
    }

    /// Picks the channel for the next attempt.
    ///
    /// The first attempt of a pinned request goes to the pinned channel. Every
    /// other attempt asks the snapshot for the best tier not yet tried.
    pub fn select<R: Rng + ?Sized>(
        &self,
        snapshot: &ChannelSnapshot,
        group: &str,
        model: &str,
        eligible: impl Fn(&CacheChannel) -> bool,
        rng: &mut R,
    ) -> Result<Arc<CacheChannel>, SelectError> {
        if let Some(id) = self.pinned {
            return match snapshot.get(id) {
                Some(channel) if !self.excluded(id) && channel.is_enabled() && eligible(channel.as_ref()) => Ok(channel),
                _ => Err(SelectError::PinnedUnavailable(id)),
            };
        }
        snapshot
            .pick(group, model, |c| !self.excluded(c.id) && eligible(c), rng)
            .ok_or_else(|| SelectError::NoChannel {
                group: group.to_string(),
                model: model.to_string(),
            })
    }

    /// Marks `id` as used by an attempt.
    pub fn record(&mut self, id: i64) {
        if !self.tried.contains(&id) {
            self.tried.push(id);
        }
    }

    /// Excludes `id` for this request without spending an attempt.
    pub fn skip(&mut self, id: i64) {
        debug!("skipping saturated channel {}", id);
        self.skipped.insert(id);
    }

    /// Consulted after a failed attempt.
    pub fn should_retry(&self, verdict: &Verdict) -> bool {
        if self.pinned.is_some() || !verdict.retry {
            return false;
        }
        self.attempts() <= self.retry_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::enum_def::ChannelStatus;
    use crate::service::registry::tests::channel;
    use rand::{rngs::StdRng, SeedableRng};

    fn retryable() -> Verdict {
        Verdict { retry: true, disable: None }
    }

    #[test]
    fn test_tried_channels_strictly_grow() {
        let snapshot = ChannelSnapshot::build(vec![
            channel(1, 100, 1),
            channel(2, 100, 1),
            channel(3, 50, 1),
            channel(4, 10, 1),
        ]);
        let mut rng = StdRng::seed_from_u64(7);
        let mut selector = ChannelSelector::new(None, 10);
        let mut seen = HashSet::new();

        while let Ok(c) = selector.select(&snapshot, "g_default", "m", |_| true, &mut rng) {
            let before = selector.tried().len();
            selector.record(c.id);
            assert_eq!(selector.tried().len(), before + 1);
            assert!(seen.insert(c.id), "channel {} picked twice", c.id);
        }
        assert_eq!(seen.len(), 4);
        // top tier is exhausted before stepping down
        assert!(selector.tried()[..2].iter().all(|id| *id == 1 || *id == 2));
        assert_eq!(selector.tried()[2..].to_vec(), vec![3, 4]);
    }

    #[test]
    fn test_pinned_channel_used_and_never_retried() {
        let snapshot = ChannelSnapshot::build(vec![channel(1, 100, 1), channel(2, 1, 1)]);
        let mut rng = StdRng::seed_from_u64(1);
        let mut selector = ChannelSelector::new(Some(2), 3);

        let picked = selector.select(&snapshot, "g_default", "m", |_| true, &mut rng).unwrap();
        assert_eq!(picked.id, 2);
        selector.record(picked.id);
        assert!(!selector.should_retry(&retryable()));
        assert_eq!(
            selector.select(&snapshot, "g_default", "m", |_| true, &mut rng).err(),
            Some(SelectError::PinnedUnavailable(2))
        );
    }

    #[test]
    fn test_pinned_disabled_channel_is_unavailable() {
        let mut disabled = channel(5, 1, 1);
        disabled.status = ChannelStatus::ManuallyDisabled;
        let snapshot = ChannelSnapshot::build(vec![disabled]);
        let selector = ChannelSelector::new(Some(5), 3);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            selector.select(&snapshot, "g_default", "m", |_| true, &mut rng).err(),
            Some(SelectError::PinnedUnavailable(5))
        );
    }

    #[test]
    fn test_retry_budget() {
        let mut selector = ChannelSelector::new(None, 2);
        selector.record(1);
        assert!(selector.should_retry(&retryable()));
        selector.record(2);
        assert!(selector.should_retry(&retryable()));
        selector.record(3);
        assert!(!selector.should_retry(&retryable()));

        let fresh = ChannelSelector::new(None, 2);
        assert!(!fresh.should_retry(&Verdict { retry: false, disable: None }));
    }

    #[test]
    fn test_skip_does_not_spend_an_attempt() {
        let snapshot = ChannelSnapshot::build(vec![channel(1, 100, 1), channel(2, 50, 1)]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut selector = ChannelSelector::new(None, 0);
        selector.skip(1);
        let picked = selector.select(&snapshot, "g_default", "m", |_| true, &mut rng).unwrap();
        assert_eq!(picked.id, 2);
        assert_eq!(selector.attempts(), 0);
    }
}
