use async_trait::async_trait;
use bytes::Bytes;
use cyder_tools::log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use super::adapter::adapter_for;
use super::cache::types::{CacheChannel, ChannelExtra, DisableKind, HealthState};
use super::classifier::{ErrorClassifier, UpstreamFailure};
use super::metrics::RelayMetrics;
use super::registry::ChannelRegistry;
use super::relay_info::RelayInfo;
use super::store::{Store, StoreError};
use super::upstream::{parse_error_body, read_body, Upstream};
use crate::config::{HealthConfig, RelayConfig};
use crate::schema::enum_def::ChannelStatus;
use crate::utils::{now_ms, ID_GENERATOR};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("test already running")]
    AlreadyRunning,
    #[error("channel {0} not found")]
    ChannelNotFound(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success { latency_ms: u64 },
    Failed { latency_ms: u64, status: u16, message: String },
    /// The channel has nothing to probe with (task vendors, no usable key).
    Skipped { reason: String },
}

impl ProbeOutcome {
    fn failed(failure: UpstreamFailure, latency_ms: u64) -> (Self, Option<UpstreamFailure>) {
        let outcome = ProbeOutcome::Failed {
            latency_ms,
            status: failure.status,
            message: failure.message.clone(),
        };
        (outcome, Some(failure))
    }
}

/// Sends the synthetic request for one channel.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the outcome and, on failure, the failure for classification.
    async fn probe(&self, channel: &CacheChannel, model: &str) -> (ProbeOutcome, Option<UpstreamFailure>);
}

/// Real forward through the channel's adapter. Billing and limits are bypassed.
pub struct UpstreamProber {
    upstream: Upstream,
    registry: Arc<ChannelRegistry>,
    timeout: std::time::Duration,
}

impl UpstreamProber {
    pub fn new(upstream: Upstream, registry: Arc<ChannelRegistry>, timeout: std::time::Duration) -> Self {
        Self { upstream, registry, timeout }
    }
}

#[async_trait]
impl Prober for UpstreamProber {
    async fn probe(&self, channel: &CacheChannel, model: &str) -> (ProbeOutcome, Option<UpstreamFailure>) {
        let adapter = adapter_for(channel.channel_type);
        let Some(probe) = adapter.probe_request(model) else {
            return (ProbeOutcome::Skipped { reason: format!("{} channels are not probed", adapter.name()) }, None);
        };
        let Some((key_index, key)) = self.registry.next_key(channel, &mut rand::rng()) else {
            return (ProbeOutcome::Skipped { reason: "no usable key".to_string() }, None);
        };

        let request_id = format!("probe-{}", ID_GENERATOR.generate_id());
        let mut info = RelayInfo::for_probe(request_id, channel, model, probe.format, probe.path, now_ms());
        if let Some(meta) = info.channel.as_mut() {
            meta.key_index = key_index;
        }
        adapter.init(&mut info);
        let body = match serde_json::to_vec(&probe.body) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => return ProbeOutcome::failed(UpstreamFailure::local(e.to_string()), 0),
        };
        let body = match adapter.convert_request(&info, &body) {
            Ok(body) => body,
            Err(e) => return ProbeOutcome::failed(UpstreamFailure::local(e.to_string()), 0),
        };

        let started = Instant::now();
        let response = match self.upstream.send(adapter, &info, &key, body, self.timeout).await {
            Ok(response) => response,
            Err(failure) => return ProbeOutcome::failed(failure, started.elapsed().as_millis() as u64),
        };
        let buffered = match read_body(response, self.timeout).await {
            Ok(buffered) => buffered,
            Err(failure) => return ProbeOutcome::failed(failure, started.elapsed().as_millis() as u64),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        if !buffered.status.is_success() {
            return ProbeOutcome::failed(parse_error_body(buffered.status, &buffered.body), latency_ms);
        }
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&buffered.body) {
            if let Some(message) = adapter.sentinel(&info, &value) {
                return ProbeOutcome::failed(UpstreamFailure::sentinel(message), latency_ms);
            }
        }
        (ProbeOutcome::Success { latency_ms }, None)
    }
}

/// Knobs of one monitor, resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub priority_threshold: i64,
    pub fatal_cooldown_secs: i64,
    pub throttle_cooldown_secs: i64,
    pub max_retries: u32,
    /// 0 disables the latency check.
    pub latency_threshold_ms: u64,
    pub automatic_disable: bool,
    pub automatic_enable: bool,
    pub default_test_model: String,
}

impl HealthSettings {
    pub fn from_config(health: &HealthConfig, relay: &RelayConfig) -> Self {
        Self {
            priority_threshold: health.priority_threshold,
            fatal_cooldown_secs: health.fatal_cooldown_secs(),
            throttle_cooldown_secs: health.throttle_cooldown_secs(),
            max_retries: health.max_retries,
            latency_threshold_ms: health.latency_threshold_ms,
            automatic_disable: relay.automatic_disable,
            automatic_enable: relay.automatic_enable,
            default_test_model: health.default_test_model.clone(),
        }
    }

    fn cooldown_for(&self, kind: DisableKind) -> i64 {
        match kind {
            DisableKind::Fatal => self.fatal_cooldown_secs,
            DisableKind::Throttle => self.throttle_cooldown_secs,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub probed: Vec<i64>,
    pub disabled: Vec<i64>,
    pub enabled: Vec<i64>,
    pub failed: Vec<i64>,
    pub cooling: Vec<i64>,
    pub exhausted: Vec<i64>,
    pub skipped: Vec<i64>,
}

/// Takes an enabled channel out of rotation and stamps its health state.
/// Returns `false` when the channel was not enabled (already handled elsewhere)
/// or the new status could not be persisted; the registry is left untouched then.
pub async fn auto_disable(
    registry: &ChannelRegistry,
    store: &dyn Store,
    metrics: &RelayMetrics,
    channel_id: i64,
    kind: DisableKind,
    reason: &str,
    now_secs: i64,
) -> bool {
    let Some(channel) = registry.get(channel_id) else {
        return false;
    };
    if !channel.is_enabled() || !channel.auto_ban {
        return false;
    }
    let mut extra = channel.extra.clone();
    extra.health = Some(HealthState {
        disabled_at: now_secs,
        disabled_reason: reason.to_string(),
        retry_count: 0,
        last_check: now_secs,
        kind,
    });
    if let Err(e) = store.save_channel_status(channel_id, ChannelStatus::AutoDisabled, &extra).await {
        error!("failed to persist auto-disable of channel {}, keeping it enabled: {}", channel_id, e);
        return false;
    }
    registry.set_status(channel_id, ChannelStatus::AutoDisabled, extra);
    metrics.record_channel_disabled();
    warn!("channel {} ({}) auto-disabled: {}", channel_id, channel.name, reason);
    true
}

pub struct HealthMonitor {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn Store>,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<RelayMetrics>,
    prober: Arc<dyn Prober>,
    settings: HealthSettings,
    running: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn Store>,
        classifier: Arc<ErrorClassifier>,
        metrics: Arc<RelayMetrics>,
        prober: Arc<dyn Prober>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            registry,
            store,
            classifier,
            metrics,
            prober,
            settings,
            running: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Round A over enabled channels, then round B over auto-disabled ones.
    pub async fn run_once(&self, now_secs: i64) -> Result<HealthReport, HealthError> {
        let _running = self.running.try_lock().map_err(|_| HealthError::AlreadyRunning)?;
        let mut report = HealthReport::default();
        self.check_enabled(now_secs, &mut report).await;
        if self.settings.automatic_enable {
            self.recover_disabled(now_secs, &mut report).await;
        }
        info!(
            "health tick: probed {}, disabled {:?}, enabled {:?}, failed {:?}",
            report.probed.len(),
            report.disabled,
            report.enabled,
            report.failed
        );
        Ok(report)
    }

    /// Round B only.
    pub async fn run_recovery(&self, now_secs: i64) -> Result<HealthReport, HealthError> {
        let _running = self.running.try_lock().map_err(|_| HealthError::AlreadyRunning)?;
        let mut report = HealthReport::default();
        if self.settings.automatic_enable {
            self.recover_disabled(now_secs, &mut report).await;
        }
        Ok(report)
    }

    /// Probes one channel on demand. Status is left alone.
    pub async fn test_channel(&self, channel_id: i64) -> Result<ProbeOutcome, HealthError> {
        let channel = self
            .registry
            .get(channel_id)
            .ok_or(HealthError::ChannelNotFound(channel_id))?;
        let model = channel.probe_model(&self.settings.default_test_model);
        let (outcome, _) = self.prober.probe(&channel, &model).await;
        if let ProbeOutcome::Success { latency_ms } = outcome {
            self.record_latency(channel_id, latency_ms).await;
        }
        Ok(outcome)
    }

    fn in_scope(&self, channel: &CacheChannel) -> bool {
        channel.priority >= self.settings.priority_threshold
    }

    async fn record_latency(&self, channel_id: i64, latency_ms: u64) {
        let average = self.registry.record_response_time(channel_id, latency_ms);
        self.metrics.observe_channel_latency(channel_id, latency_ms);
        if let Err(e) = self.store.save_channel_response_time(channel_id, average).await {
            warn!("failed to save response time of channel {}: {}", channel_id, e);
        }
    }

    /// Disable decision for one finished probe.
    fn disable_decision(&self, channel: &CacheChannel, outcome: &ProbeOutcome, failure: Option<&UpstreamFailure>) -> Option<(DisableKind, String)> {
        match outcome {
            ProbeOutcome::Success { latency_ms } => {
                let limit = self.settings.latency_threshold_ms;
                (limit > 0 && *latency_ms > limit).then(|| {
                    (DisableKind::Fatal, format!("response time {}ms exceeds {}ms", latency_ms, limit))
                })
            }
            ProbeOutcome::Failed { message, .. } => {
                let failure = failure?;
                let verdict = self.classifier.classify(failure, channel.channel_type);
                verdict.disable.map(|kind| (kind, message.clone()))
            }
            ProbeOutcome::Skipped { .. } => None,
        }
    }

    async fn check_enabled(&self, now_secs: i64, report: &mut HealthReport) {
        let channels: Vec<_> = self
            .registry
            .snapshot()
            .all()
            .into_iter()
            .filter(|c| c.is_enabled() && self.in_scope(c))
            .collect();

        for channel in channels {
            let model = channel.probe_model(&self.settings.default_test_model);
            let (outcome, failure) = self.prober.probe(&channel, &model).await;
            debug!("probe channel {} with {}: {:?}", channel.id, model, outcome);
            match &outcome {
                ProbeOutcome::Skipped { .. } => {
                    report.skipped.push(channel.id);
                    continue;
                }
                ProbeOutcome::Success { latency_ms } => self.record_latency(channel.id, *latency_ms).await,
                ProbeOutcome::Failed { .. } => report.failed.push(channel.id),
            }
            report.probed.push(channel.id);

            let Some((kind, reason)) = self.disable_decision(&channel, &outcome, failure.as_ref()) else {
                continue;
            };
            if !channel.auto_ban || !self.settings.automatic_disable {
                info!("channel {} should be disabled ({}) but auto-ban is off", channel.id, reason);
                continue;
            }
            if auto_disable(&self.registry, self.store.as_ref(), &self.metrics, channel.id, kind, &reason, now_secs).await {
                report.disabled.push(channel.id);
            }
        }
    }

    async fn recover_disabled(&self, now_secs: i64, report: &mut HealthReport) {
        let channels: Vec<_> = self
            .registry
            .snapshot()
            .all()
            .into_iter()
            .filter(|c| c.status == ChannelStatus::AutoDisabled && c.auto_ban && self.in_scope(c))
            .collect();

        for channel in channels {
            let state = channel.extra.health.clone().unwrap_or_default();
            if now_secs - state.disabled_at < self.settings.cooldown_for(state.kind) {
                report.cooling.push(channel.id);
                continue;
            }
            if state.retry_count >= self.settings.max_retries {
                report.exhausted.push(channel.id);
                continue;
            }

            let model = channel.probe_model(&self.settings.default_test_model);
            let (outcome, failure) = self.prober.probe(&channel, &model).await;
            if matches!(outcome, ProbeOutcome::Skipped { .. }) {
                report.skipped.push(channel.id);
                continue;
            }
            report.probed.push(channel.id);

            let healthy = matches!(outcome, ProbeOutcome::Success { .. })
                && self.disable_decision(&channel, &outcome, failure.as_ref()).is_none();
            if healthy {
                if let ProbeOutcome::Success { latency_ms } = outcome {
                    self.record_latency(channel.id, latency_ms).await;
                }
                self.enable(&channel).await;
                report.enabled.push(channel.id);
            } else {
                report.failed.push(channel.id);
                let reason = match &outcome {
                    ProbeOutcome::Failed { message, .. } => message.clone(),
                    _ => state.disabled_reason.clone(),
                };
                let mut extra = channel.extra.clone();
                extra.health = Some(HealthState {
                    disabled_at: now_secs,
                    disabled_reason: reason,
                    retry_count: state.retry_count + 1,
                    last_check: now_secs,
                    kind: state.kind,
                });
                if let Err(e) = self.store.save_channel_extra(channel.id, &extra).await {
                    warn!("failed to save health state of channel {}: {}", channel.id, e);
                }
                self.registry.update_channel(channel.id, |c| c.extra = extra);
                debug!("channel {} still unhealthy, retry {}", channel.id, state.retry_count + 1);
            }
        }
    }

    async fn enable(&self, channel: &CacheChannel) {
        let extra = ChannelExtra {
            health: None,
            ..channel.extra.clone()
        };
        if let Err(e) = self.store.save_channel_status(channel.id, ChannelStatus::Enabled, &extra).await {
            error!("failed to persist re-enable of channel {}: {}", channel.id, e);
        }
        self.registry.set_status(channel.id, ChannelStatus::Enabled, extra);
        info!("channel {} ({}) recovered and re-enabled", channel.id, channel.name);
    }

    /// Periodic ticks until the process exits. `disabled_interval_secs` adds a
    /// faster recovery-only loop.
    pub fn spawn(self: Arc<Self>, interval_secs: u64, disabled_interval_secs: u64) {
        if interval_secs > 0 {
            let monitor = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = monitor.run_once(crate::utils::now_secs()).await {
                        warn!("health tick skipped: {}", e);
                    }
                }
            });
        }
        if disabled_interval_secs > 0 {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(disabled_interval_secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = self.run_recovery(crate::utils::now_secs()).await {
                        debug!("recovery tick skipped: {}", e);
                    }
                }
            });
        }
    }
}
