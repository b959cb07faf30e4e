use arc_swap::ArcSwap;
use cyder_tools::log::{debug, info};
use dashmap::DashMap;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use super::cache::types::{CacheChannel, ChannelExtra};
use super::store::{Store, StoreError};
use crate::schema::enum_def::{ChannelStatus, ChannelType, MultiKeyMode};

pub const AUTO_GROUP: &str = "auto";
const EMA_ALPHA: f64 = 0.3;

/// Derived `(group, model) -> channel` row.
#[derive(Debug, Clone, PartialEq)]
pub struct Ability {
    pub channel_id: i64,
    pub priority: i64,
    pub weight: u32,
    pub enabled: bool,
}

/// Immutable view of every channel plus the indexes built from it.
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    channels: HashMap<i64, Arc<CacheChannel>>,
    // Sorted by priority descending, then id.
    abilities: HashMap<(String, String), Vec<Ability>>,
    type_count: HashMap<ChannelType, usize>,
}

impl ChannelSnapshot {
    pub fn build(channels: Vec<CacheChannel>) -> Self {
        let mut by_id = HashMap::with_capacity(channels.len());
        let mut abilities: HashMap<(String, String), Vec<Ability>> = HashMap::new();
        let mut type_count = HashMap::new();

        for channel in channels {
            *type_count.entry(channel.channel_type).or_insert(0) += 1;
            for group in &channel.groups {
                for model in &channel.models {
                    abilities
                        .entry((group.clone(), model.clone()))
                        .or_default()
                        .push(Ability {
                            channel_id: channel.id,
                            priority: channel.priority,
                            weight: channel.weight,
                            enabled: channel.is_enabled(),
                        });
                }
            }
            by_id.insert(channel.id, Arc::new(channel));
        }
        for rows in abilities.values_mut() {
            rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.channel_id.cmp(&b.channel_id)));
            rows.dedup_by_key(|a| a.channel_id);
        }

        Self {
            channels: by_id,
            abilities,
            type_count,
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<CacheChannel>> {
        self.channels.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel count per provider type, ordered by type name.
    pub fn type_counts(&self) -> Vec<(ChannelType, usize)> {
        let mut counts: Vec<(ChannelType, usize)> = self.type_count.iter().map(|(t, n)| (*t, *n)).collect();
        counts.sort_by_key(|(t, _)| t.to_string());
        counts
    }

    /// Enabled abilities for `(group, model)`, highest priority first.
    pub fn candidates(&self, group: &str, model: &str) -> Vec<Ability> {
        self.abilities
            .get(&(group.to_string(), model.to_string()))
            .map(|rows| rows.iter().filter(|a| a.enabled).cloned().collect())
            .unwrap_or_default()
    }

    /// Channels ordered by id. Feeding this back into [`ChannelSnapshot::build`] yields an equal snapshot.
    pub fn dump(&self) -> Vec<CacheChannel> {
        let mut channels: Vec<CacheChannel> = self.channels.values().map(|c| (**c).clone()).collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    pub fn all(&self) -> Vec<Arc<CacheChannel>> {
        let mut channels: Vec<_> = self.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    /// Models reachable through at least one enabled channel of `group`.
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let models: BTreeSet<&String> = self
            .abilities
            .iter()
            .filter(|((g, _), rows)| g == group && rows.iter().any(|a| a.enabled))
            .map(|((_, m), _)| m)
            .collect();
        models.into_iter().cloned().collect()
    }

    /// Priority-tier + weighted-random pick.
    ///
    /// Tiers whose candidates are all rejected by `eligible` are skipped, so the
    /// caller's exclusion set steps selection down to the next tier.
    pub fn pick<R: Rng + ?Sized>(
        &self,
        group: &str,
        model: &str,
        eligible: impl Fn(&CacheChannel) -> bool,
        rng: &mut R,
    ) -> Option<Arc<CacheChannel>> {
        let candidates = self.candidates(group, model);
        let mut start = 0;
        while start < candidates.len() {
            let priority = candidates[start].priority;
            let end = candidates[start..]
                .iter()
                .position(|a| a.priority != priority)
                .map_or(candidates.len(), |offset| start + offset);

            let tier: Vec<(&Ability, Arc<CacheChannel>)> = candidates[start..end]
                .iter()
                .filter_map(|a| self.channels.get(&a.channel_id).map(|c| (a, c.clone())))
                .filter(|(_, c)| eligible(c.as_ref()))
                .collect();
            if !tier.is_empty() {
                return Some(weighted_choice(&tier, rng));
            }
            start = end;
        }
        None
    }
}

fn weighted_choice<R: Rng + ?Sized>(tier: &[(&Ability, Arc<CacheChannel>)], rng: &mut R) -> Arc<CacheChannel> {
    let total: u64 = tier.iter().map(|(a, _)| a.weight as u64).sum();
    if total == 0 {
        return tier[rng.random_range(0..tier.len())].1.clone();
    }
    let mut roll = rng.random_range(0..total);
    for (ability, channel) in tier {
        let weight = ability.weight as u64;
        if roll < weight {
            return channel.clone();
        }
        roll -= weight;
    }
    tier[tier.len() - 1].1.clone()
}

/// Owner of the channel snapshot. Readers load the current `Arc`; writers swap a rebuilt one.
pub struct ChannelRegistry {
    snapshot: ArcSwap<ChannelSnapshot>,
    write_lock: Mutex<()>,
    cursors: DashMap<i64, Arc<Mutex<usize>>>,
    response_times: DashMap<i64, f64>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ChannelRegistry {
    pub fn new(channels: Vec<CacheChannel>) -> Self {
        let response_times = channels
            .iter()
            .filter(|c| c.response_time_ms > 0)
            .map(|c| (c.id, c.response_time_ms as f64))
            .collect();
        Self {
            snapshot: ArcSwap::from_pointee(ChannelSnapshot::build(channels)),
            write_lock: Mutex::new(()),
            cursors: DashMap::new(),
            response_times,
        }
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: i64) -> Option<Arc<CacheChannel>> {
        self.snapshot.load().get(id)
    }

    /// Replaces every channel at once.
    pub fn load(&self, channels: Vec<CacheChannel>) {
        let snapshot = ChannelSnapshot::build(channels);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let live: Vec<i64> = snapshot.channels.keys().copied().collect();
        self.cursors.retain(|id, _| live.contains(id));
        self.snapshot.store(Arc::new(snapshot));
    }

    pub async fn refresh(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let channels = store.list_channels().await?;
        let count = channels.len();
        self.load(channels);
        info!("Channel registry refreshed: {} channels", count);
        Ok(count)
    }

    /// Copy-on-write edit of one channel. Returns the updated channel.
    pub fn update_channel(&self, id: i64, edit: impl FnOnce(&mut CacheChannel)) -> Option<Arc<CacheChannel>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load();
        let mut channels: Vec<CacheChannel> = current.channels.values().map(|c| (**c).clone()).collect();
        let target = channels.iter_mut().find(|c| c.id == id)?;
        edit(target);
        let next = ChannelSnapshot::build(channels);
        let updated = next.get(id);
        self.snapshot.store(Arc::new(next));
        updated
    }

    pub fn set_status(&self, id: i64, status: ChannelStatus, extra: ChannelExtra) -> Option<Arc<CacheChannel>> {
        debug!("channel {} -> {}", id, status);
        self.update_channel(id, |c| {
            c.status = status;
            c.extra = extra;
        })
    }

    /// Folds a latency sample into the channel's moving average and returns it in millis.
    pub fn record_response_time(&self, id: i64, millis: u64) -> i64 {
        let mut entry = self.response_times.entry(id).or_insert(millis as f64);
        *entry = EMA_ALPHA * millis as f64 + (1.0 - EMA_ALPHA) * *entry;
        entry.round() as i64
    }

    pub fn response_time(&self, id: i64) -> Option<i64> {
        self.response_times.get(&id).map(|v| v.round() as i64)
    }

    /// Picks the credential for the next call on `channel`, skipping disabled keys.
    pub fn next_key<R: Rng + ?Sized>(&self, channel: &CacheChannel, rng: &mut R) -> Option<(usize, String)> {
        let usable = channel.usable_key_indices();
        if usable.is_empty() {
            return None;
        }
        let index = if !channel.is_multi_key || usable.len() == 1 {
            usable[0]
        } else {
            match channel.multi_key_mode {
                MultiKeyMode::Random => usable[rng.random_range(0..usable.len())],
                MultiKeyMode::RoundRobin => {
                    let cursor = self
                        .cursors
                        .entry(channel.id)
                        .or_insert_with(|| Arc::new(Mutex::new(0)))
                        .clone();
                    let mut position = cursor.lock().unwrap_or_else(|e| e.into_inner());
                    let picked = usable[*position % usable.len()];
                    *position = position.wrapping_add(1);
                    picked
                }
            }
        };
        channel.keys.get(index).map(|k| (index, k.clone()))
    }
}

/// The group used for selection: `auto` means the user's own group.
pub fn effective_group<'a>(using_group: &'a str, user_group: &'a str) -> &'a str {
    if using_group == AUTO_GROUP { user_group } else { using_group }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::{BTreeMap, HashSet};

    pub(crate) fn channel(id: i64, priority: i64, weight: u32) -> CacheChannel {
        CacheChannel {
            id,
            channel_type: ChannelType::OpenAI,
            name: format!("c{}", id),
            base_url: "http://127.0.0.1:1".to_string(),
            keys: vec![format!("key-{}", id)],
            status: ChannelStatus::Enabled,
            priority,
            weight,
            models: vec!["m".to_string()],
            groups: vec!["g_default".to_string()],
            model_mapping: BTreeMap::new(),
            test_model: None,
            auto_ban: true,
            rate_limit_overrides: BTreeMap::new(),
            is_multi_key: false,
            multi_key_mode: MultiKeyMode::Random,
            tag: None,
            extra: ChannelExtra::default(),
            used_quota: 0,
            response_time_ms: 0,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_type_counts() {
        let mut azure = channel(3, 0, 1);
        azure.channel_type = ChannelType::Azure;
        let mut disabled = channel(4, 0, 1);
        disabled.status = ChannelStatus::ManuallyDisabled;
        let registry = ChannelRegistry::new(vec![channel(1, 0, 1), channel(2, 0, 1), azure, disabled]);
        assert_eq!(
            registry.snapshot().type_counts(),
            vec![(ChannelType::Azure, 1), (ChannelType::OpenAI, 3)]
        );
        assert!(ChannelSnapshot::build(Vec::new()).type_counts().is_empty());
    }

    #[test]
    fn test_dump_load_is_identity() {
        let mut a = channel(2, 10, 1);
        a.groups.push("vip".to_string());
        a.models.push("n".to_string());
        let mut b = channel(1, 5, 0);
        b.status = ChannelStatus::AutoDisabled;
        let registry = ChannelRegistry::new(vec![a, b]);

        let dumped = registry.snapshot().dump();
        let reloaded = ChannelRegistry::new(dumped.clone());
        assert_eq!(reloaded.snapshot().dump(), dumped);
        assert_eq!(dumped.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_enabled_channel_is_always_found_on_first_attempt() {
        let mut disabled = channel(1, 100, 5);
        disabled.status = ChannelStatus::ManuallyDisabled;
        let snapshot = ChannelSnapshot::build(vec![disabled, channel(2, 1, 1)]);
        let mut rng = rng();
        for _ in 0..50 {
            let picked = snapshot.pick("g_default", "m", |_| true, &mut rng).unwrap();
            assert_eq!(picked.id, 2);
        }
        assert!(snapshot.pick("other", "m", |_| true, &mut rng).is_none());
    }

    #[test]
    fn test_top_tier_only_then_step_down() {
        let snapshot = ChannelSnapshot::build(vec![channel(1, 100, 1), channel(2, 100, 1), channel(3, 50, 1)]);
        let mut rng = rng();
        for _ in 0..50 {
            let picked = snapshot.pick("g_default", "m", |_| true, &mut rng).unwrap();
            assert!(picked.id == 1 || picked.id == 2);
        }
        let excluded: HashSet<i64> = [1, 2].into_iter().collect();
        let picked = snapshot
            .pick("g_default", "m", |c| !excluded.contains(&c.id), &mut rng)
            .unwrap();
        assert_eq!(picked.id, 3);
    }

    #[test]
    fn test_zero_weight_only_when_sole_candidate() {
        let mut rng = rng();
        let snapshot = ChannelSnapshot::build(vec![channel(1, 100, 0), channel(2, 100, 3)]);
        for _ in 0..200 {
            assert_eq!(snapshot.pick("g_default", "m", |_| true, &mut rng).unwrap().id, 2);
        }
        let sole = ChannelSnapshot::build(vec![channel(1, 100, 0), channel(2, 10, 3)]);
        assert_eq!(sole.pick("g_default", "m", |_| true, &mut rng).unwrap().id, 1);
    }

    #[test]
    fn test_priority_tie_is_weighted() {
        let snapshot = ChannelSnapshot::build(vec![channel(1, 100, 1), channel(2, 100, 3)]);
        let mut rng = rng();
        let mut hits = [0u32; 3];
        for _ in 0..4_000 {
            hits[snapshot.pick("g_default", "m", |_| true, &mut rng).unwrap().id as usize] += 1;
        }
        let share = hits[2] as f64 / 4_000.0;
        assert!((share - 0.75).abs() < 0.05, "share {}", share);
    }

    #[test]
    fn test_status_update_swaps_snapshot() {
        let registry = ChannelRegistry::new(vec![channel(1, 100, 1)]);
        let before = registry.snapshot();
        registry.set_status(1, ChannelStatus::AutoDisabled, ChannelExtra::default());

        assert!(before.get(1).unwrap().is_enabled());
        assert!(registry.snapshot().candidates("g_default", "m").is_empty());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_round_robin_skips_disabled_keys() {
        let registry = ChannelRegistry::default();
        let mut c = channel(9, 1, 1);
        c.is_multi_key = true;
        c.multi_key_mode = MultiKeyMode::RoundRobin;
        c.keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        c.extra.disabled_keys.insert(1, "revoked".to_string());

        let mut rng = rng();
        let picks: Vec<String> = (0..4).map(|_| registry.next_key(&c, &mut rng).unwrap().1).collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_response_time_ema() {
        let registry = ChannelRegistry::default();
        assert_eq!(registry.record_response_time(1, 100), 100);
        assert_eq!(registry.record_response_time(1, 200), 130);
    }

    #[test]
    fn test_auto_group_resolves_to_user_group() {
        assert_eq!(effective_group("auto", "vip"), "vip");
        assert_eq!(effective_group("g1", "vip"), "g1");
    }
}
