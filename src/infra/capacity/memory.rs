//! In-memory capacity manager.
//!
//! All counters live behind one `parking_lot::Mutex`, which makes multi-resource
//! acquisition atomic. Concurrency units are held by live leases; rate-limit and
//! throttle units are metered with GCRA and only come back as time passes.
//! Expired leases are reclaimed lazily at the start of every operation and
//! periodically by [`InMemoryCapacityManager::spawn_scavenger`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::CapacityConfig;
use crate::core::{
    CapacityCheckResponse, CapacityError, CapacityLeaseRequest, CapacityLeaseResponse,
    CapacityManager, CapacityResource, LeaseAction, LeaseAuditEvent, LeaseAuditSink, LeaseId,
    ResourceKey, ResourceUsage, ScavengeResult,
};
use crate::util::clock::{Clock, SystemClock};

#[derive(Debug)]
struct Lease {
    /// Every resource the lease was granted for.
    keys: Vec<ResourceKey>,
    /// Concurrency units only; metered units are not returned on release.
    holdings: Vec<(ResourceKey, u32)>,
    idempotency_key: Option<String>,
}

#[derive(Debug)]
struct CachedResponse {
    stored_at_ms: u64,
    response: CapacityLeaseResponse,
}

/// Generic cell rate parameters of a metered resource.
#[derive(Debug, Clone, Copy)]
struct Gcra {
    emission_interval_ms: u64,
    tolerance_ms: u64,
    capacity: u32,
}

impl Gcra {
    /// `None` when the resource admits nothing.
    fn of(resource: &CapacityResource) -> Option<Self> {
        if resource.limit == 0 {
            return None;
        }
        let emission_interval_ms = (resource.period_ms / u64::from(resource.limit)).max(1);
        let capacity = resource.burst.saturating_add(1);
        Some(Self {
            emission_interval_ms,
            tolerance_ms: emission_interval_ms.saturating_mul(u64::from(capacity)),
            capacity,
        })
    }

    /// Units admissible at `now_ms` for the theoretical arrival time `tat_ms`.
    fn available(self, tat_ms: u64, now_ms: u64) -> u32 {
        let slack = now_ms
            .saturating_add(self.tolerance_ms)
            .saturating_sub(tat_ms.max(now_ms));
        u32::try_from(slack / self.emission_interval_ms)
            .unwrap_or(u32::MAX)
            .min(self.capacity)
    }

    /// Theoretical arrival time after taking `amount` units.
    fn advance(self, tat_ms: u64, now_ms: u64, amount: u32) -> u64 {
        tat_ms
            .max(now_ms)
            .saturating_add(self.emission_interval_ms.saturating_mul(u64::from(amount)))
    }

    /// Wait until `amount` units are admissible; `None` if they never are.
    fn wait(self, tat_ms: u64, now_ms: u64, amount: u32) -> Option<Duration> {
        if amount > self.capacity {
            return None;
        }
        let allow_at = self
            .advance(tat_ms, now_ms, amount)
            .saturating_sub(self.tolerance_ms);
        Some(Duration::from_millis(allow_at.saturating_sub(now_ms)))
    }
}

#[derive(Debug, Default)]
struct State {
    in_use: HashMap<ResourceKey, u32>,
    /// Theoretical arrival time per metered key. Absent means a full bucket.
    arrivals: HashMap<ResourceKey, u64>,
    /// Ordered by expiry through the ULID timestamp.
    leases: BTreeMap<LeaseId, Lease>,
    idempotency: HashMap<String, CachedResponse>,
}

impl State {
    fn in_use(&self, key: &ResourceKey) -> u32 {
        self.in_use.get(key).copied().unwrap_or(0)
    }

    fn arrival(&self, key: &ResourceKey, now_ms: u64) -> u64 {
        self.arrivals.get(key).copied().unwrap_or(now_ms).max(now_ms)
    }

    fn release_holdings(&mut self, holdings: &[(ResourceKey, u32)]) -> u64 {
        let mut released = 0;
        for (key, amount) in holdings {
            if let Some(held) = self.in_use.get_mut(key) {
                *held = held.saturating_sub(*amount);
                if *held == 0 {
                    self.in_use.remove(key);
                }
            }
            released += u64::from(*amount);
        }
        released
    }

    /// Drop the cached grant of a lease that no longer exists.
    fn forget_cached(&mut self, lease_id: LeaseId, lease: &Lease) {
        if let Some(key) = &lease.idempotency_key {
            let cached_here = self
                .idempotency
                .get(key)
                .is_some_and(|cached| cached.response.lease_id == Some(lease_id));
            if cached_here {
                self.idempotency.remove(key);
            }
        }
    }

    /// Remove every lease with expiry `<= now` and every refilled bucket.
    fn reap(&mut self, now_ms: u64) -> Vec<(LeaseId, Lease)> {
        let live = self.leases.split_off(&LeaseId::lower_bound(now_ms.saturating_add(1)));
        let expired = std::mem::replace(&mut self.leases, live);
        let mut reaped = Vec::with_capacity(expired.len());
        for (lease_id, lease) in expired {
            self.release_holdings(&lease.holdings);
            self.forget_cached(lease_id, &lease);
            reaped.push((lease_id, lease));
        }
        self.arrivals.retain(|_, tat| *tat > now_ms);
        reaped
    }

    /// Availability of `resources`, accounting for keys repeated in one request.
    fn evaluate(&self, resources: &[CapacityResource], now_ms: u64) -> Evaluation {
        let mut claimed: HashMap<ResourceKey, u32> = HashMap::new();
        let mut projected: HashMap<ResourceKey, u64> = HashMap::new();
        let mut evaluation = Evaluation {
            allowed: u32::MAX,
            usage: Vec::with_capacity(resources.len()),
            limiting: Vec::new(),
            metered_waits: Vec::new(),
            arrivals: Vec::new(),
        };

        for resource in resources {
            let key = resource.key();
            let (available, in_use, limit) = if resource.kind.is_metered() {
                let tat = projected
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| self.arrival(&key, now_ms));
                match Gcra::of(resource) {
                    None => {
                        evaluation.metered_waits.push(None);
                        (0, 0, 0)
                    }
                    Some(gcra) => {
                        let available = gcra.available(tat, now_ms);
                        if available < resource.amount {
                            evaluation.metered_waits.push(gcra.wait(tat, now_ms, resource.amount));
                        }
                        projected.insert(key.clone(), gcra.advance(tat, now_ms, resource.amount));
                        (available, gcra.capacity - available, gcra.capacity)
                    }
                }
            } else {
                let pending = claimed.entry(key.clone()).or_insert(0);
                let in_use = self.in_use(&key).saturating_add(*pending);
                *pending = pending.saturating_add(resource.amount);
                (resource.limit.saturating_sub(in_use), in_use, resource.limit)
            };

            evaluation.allowed = evaluation.allowed.min(resource.amount.min(available));
            if available < resource.amount {
                evaluation.limiting.push(key.clone());
            }
            evaluation.usage.push(ResourceUsage { key, in_use, limit });
        }
        evaluation.arrivals = projected.into_iter().collect();
        evaluation
    }

    /// Time until every limiting resource could admit the request.
    fn retry_after(&self, evaluation: &Evaluation, now_ms: u64) -> Option<Duration> {
        let mut wait = Duration::ZERO;
        for key in evaluation.limiting.iter().filter(|key| !key.kind.is_metered()) {
            let (lease_id, _) = self
                .leases
                .iter()
                .find(|(_, lease)| lease.holdings.iter().any(|(held, _)| held == key))?;
            wait = wait.max(Duration::from_millis(
                lease_id.expires_at_ms().saturating_sub(now_ms),
            ));
        }
        for metered in &evaluation.metered_waits {
            wait = wait.max((*metered)?);
        }
        Some(wait)
    }
}

struct Evaluation {
    allowed: u32,
    usage: Vec<ResourceUsage>,
    limiting: Vec<ResourceKey>,
    /// Wait of each limiting metered resource.
    metered_waits: Vec<Option<Duration>>,
    /// Arrival times to store if the request is granted.
    arrivals: Vec<(ResourceKey, u64)>,
}

/// Capacity manager keeping all counters in process memory.
pub struct InMemoryCapacityManager {
    config: CapacityConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    shutdown: AtomicBool,
    audit: Option<Arc<dyn LeaseAuditSink>>,
}

impl InMemoryCapacityManager {
    /// Create a manager driven by the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::InvalidRequest`] when `config` does not validate.
    pub fn new(config: CapacityConfig) -> Result<Self, CapacityError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager driven by `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError::InvalidRequest`] when `config` does not validate.
    pub fn with_clock(config: CapacityConfig, clock: Arc<dyn Clock>) -> Result<Self, CapacityError> {
        config.validate().map_err(CapacityError::InvalidRequest)?;
        Ok(Self {
            config,
            clock,
            state: Mutex::new(State::default()),
            shutdown: AtomicBool::new(false),
            audit: None,
        })
    }

    /// Record lease transitions to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<dyn LeaseAuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Refuse new leases and extensions. Releases keep working.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("capacity manager shutting down");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Concurrency units currently held on `key` by live leases.
    ///
    /// Metered keys hold nothing; their usage is reported by
    /// [`check_capacity`](CapacityManager::check_capacity).
    pub fn in_use(&self, key: &ResourceKey) -> u32 {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);
        state.in_use(key)
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);
        state.leases.len()
    }

    /// Reclaim every expired lease.
    pub fn scavenge(&self) -> ScavengeResult {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let result = self.reap_locked(&mut state, now);
        let ttl = self.config.idempotency_ttl_ms;
        state
            .idempotency
            .retain(|_, cached| now.saturating_sub(cached.stored_at_ms) < ttl);
        drop(state);

        if result.expired_leases > 0 {
            debug!(
                expired_leases = result.expired_leases,
                released_units = result.released_units,
                "scavenged expired leases"
            );
        }
        result
    }

    /// Run [`scavenge`](Self::scavenge) every `scavenge_interval` until `cancel` fires.
    pub fn spawn_scavenger(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.scavenge_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.scavenge();
                    }
                }
            }
            debug!("lease scavenger stopped");
        })
    }

    fn reap_locked(&self, state: &mut State, now_ms: u64) -> ScavengeResult {
        let reaped = state.reap(now_ms);
        let mut result = ScavengeResult {
            expired_leases: reaped.len(),
            released_units: 0,
        };
        for (lease_id, lease) in reaped {
            result.released_units += lease.holdings.iter().map(|(_, n)| u64::from(*n)).sum::<u64>();
            trace!(lease_id = %lease_id, "lease expired");
            self.audit(LeaseAction::Expired, Some(lease_id), None, lease.keys, now_ms);
        }
        result
    }

    fn lease_duration(&self, requested: Option<Duration>) -> Result<u64, CapacityError> {
        let requested = requested.unwrap_or_else(|| self.config.default_lease_duration());
        let ms = u64::try_from(requested.as_millis())
            .unwrap_or(u64::MAX)
            .min(self.config.max_lease_duration_ms);
        if ms == 0 {
            return Err(CapacityError::InvalidRequest(
                "lease duration must be greater than 0".into(),
            ));
        }
        Ok(ms)
    }

    fn audit(
        &self,
        action: LeaseAction,
        lease_id: Option<LeaseId>,
        replaced_by: Option<LeaseId>,
        resources: Vec<ResourceKey>,
        now_ms: u64,
    ) {
        if let Some(sink) = &self.audit {
            sink.record(LeaseAuditEvent {
                lease_id,
                replaced_by,
                action,
                resources,
                created_at_ms: now_ms,
            });
        }
    }
}

fn validate_resources(resources: &[CapacityResource]) -> Result<(), CapacityError> {
    if resources.is_empty() {
        return Err(CapacityError::InvalidRequest(
            "at least one resource is required".into(),
        ));
    }
    if let Some(resource) = resources.iter().find(|r| r.amount == 0) {
        return Err(CapacityError::InvalidRequest(format!(
            "amount for {} must be greater than 0",
            resource.key()
        )));
    }
    Ok(())
}

#[async_trait]
impl CapacityManager for InMemoryCapacityManager {
    async fn lease_capacity(
        &self,
        request: CapacityLeaseRequest,
    ) -> Result<CapacityLeaseResponse, CapacityError> {
        if self.is_shutdown() {
            return Err(CapacityError::Shutdown);
        }
        validate_resources(&request.resources)?;
        let duration_ms = self.lease_duration(request.duration)?;

        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);

        if let Some(key) = &request.idempotency_key {
            let ttl = self.config.idempotency_ttl_ms;
            match state.idempotency.get(key) {
                Some(cached) if now.saturating_sub(cached.stored_at_ms) < ttl => {
                    trace!(idempotency_key = %key, "returning cached lease response");
                    return Ok(cached.response.clone());
                }
                Some(_) => {
                    state.idempotency.remove(key);
                }
                None => {}
            }
        }

        let evaluation = state.evaluate(&request.resources, now);
        if !evaluation.limiting.is_empty() {
            let retry_after = state.retry_after(&evaluation, now);
            drop(state);
            debug!(
                allowed = evaluation.allowed,
                limiting = evaluation.limiting.len(),
                "lease denied"
            );
            self.audit(LeaseAction::Denied, None, None, evaluation.limiting.clone(), now);
            return Ok(CapacityLeaseResponse {
                lease_id: None,
                allowed: evaluation.allowed,
                limiting: evaluation.limiting,
                retry_after,
            });
        }

        let holdings: Vec<(ResourceKey, u32)> = request
            .resources
            .iter()
            .filter(|resource| !resource.kind.is_metered())
            .map(|resource| (resource.key(), resource.amount))
            .collect();
        for (key, amount) in &holdings {
            let held = state.in_use.entry(key.clone()).or_insert(0);
            *held = held.saturating_add(*amount);
        }
        state.arrivals.extend(evaluation.arrivals);

        let lease_id = LeaseId::expiring_at(now.saturating_add(duration_ms));
        let keys: Vec<ResourceKey> = request.resources.iter().map(CapacityResource::key).collect();
        state.leases.insert(
            lease_id,
            Lease {
                keys: keys.clone(),
                holdings,
                idempotency_key: request.idempotency_key.clone(),
            },
        );

        let response = CapacityLeaseResponse {
            lease_id: Some(lease_id),
            allowed: evaluation.allowed,
            limiting: Vec::new(),
            retry_after: None,
        };
        if let Some(key) = request.idempotency_key {
            state.idempotency.insert(
                key,
                CachedResponse {
                    stored_at_ms: now,
                    response: response.clone(),
                },
            );
        }
        drop(state);

        debug!(lease_id = %lease_id, duration_ms, resources = keys.len(), "lease granted");
        self.audit(LeaseAction::Granted, Some(lease_id), None, keys, now);
        Ok(response)
    }

    async fn extend_capacity_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
    ) -> Result<LeaseId, CapacityError> {
        if self.is_shutdown() {
            return Err(CapacityError::Shutdown);
        }
        let duration_ms = self.lease_duration(Some(duration))?;

        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);

        let lease = state
            .leases
            .remove(lease_id)
            .ok_or_else(|| CapacityError::LeaseNotFound(lease_id.to_string()))?;
        let keys = lease.keys.clone();
        let renewed = LeaseId::expiring_at(now.saturating_add(duration_ms));
        let cached = match &lease.idempotency_key {
            Some(key) => state.idempotency.get_mut(key),
            None => None,
        };
        if let Some(cached) = cached.filter(|c| c.response.lease_id == Some(*lease_id)) {
            cached.response.lease_id = Some(renewed);
        }
        state.leases.insert(renewed, lease);
        drop(state);

        debug!(lease_id = %lease_id, renewed = %renewed, duration_ms, "lease extended");
        self.audit(LeaseAction::Extended, Some(*lease_id), Some(renewed), keys, now);
        Ok(renewed)
    }

    async fn release_capacity(&self, lease_id: &LeaseId) -> Result<(), CapacityError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);

        let Some(lease) = state.leases.remove(lease_id) else {
            trace!(lease_id = %lease_id, "release of unknown lease ignored");
            return Ok(());
        };
        let released = state.release_holdings(&lease.holdings);
        state.forget_cached(*lease_id, &lease);
        drop(state);

        debug!(lease_id = %lease_id, released_units = released, "lease released");
        self.audit(LeaseAction::Released, Some(*lease_id), None, lease.keys, now);
        Ok(())
    }

    async fn check_capacity(
        &self,
        resources: &[CapacityResource],
    ) -> Result<CapacityCheckResponse, CapacityError> {
        validate_resources(resources)?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.reap_locked(&mut state, now);
        let evaluation = state.evaluate(resources, now);

        Ok(CapacityCheckResponse {
            available: evaluation.allowed,
            usage: evaluation.usage,
            limiting: evaluation.limiting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CapacityIdentifier, CapacityKind, InMemoryLeaseAuditSink};
    use crate::util::clock::ManualClock;
    use uuid::Uuid;

    fn manager() -> (InMemoryCapacityManager, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let manager =
            InMemoryCapacityManager::with_clock(CapacityConfig::default(), Arc::new(clock.clone()))
                .unwrap();
        (manager, clock)
    }

    fn concurrency(limit: u32) -> CapacityResource {
        CapacityResource::new(
            CapacityKind::Concurrency,
            CapacityIdentifier::new(Uuid::nil(), Uuid::nil()),
            limit,
        )
    }

    #[test]
    fn gcra_emits_one_unit_per_interval() {
        let resource = CapacityResource::new(
            CapacityKind::RateLimit,
            CapacityIdentifier::new(Uuid::nil(), Uuid::nil()),
            10,
        )
        .with_period(Duration::from_secs(60))
        .with_burst(2);
        let gcra = Gcra::of(&resource).unwrap();
        assert_eq!(gcra.emission_interval_ms, 6_000);
        assert_eq!(gcra.capacity, 3);

        let now = 100_000;
        assert_eq!(gcra.available(now, now), 3);
        let tat = gcra.advance(now, now, 3);
        assert_eq!(gcra.available(tat, now), 0);
        assert_eq!(gcra.wait(tat, now, 1), Some(Duration::from_secs(6)));
        assert_eq!(gcra.available(tat, now + 6_000), 1);
        assert_eq!(gcra.wait(tat, now, 4), None);

        let closed = CapacityResource { limit: 0, ..resource };
        assert!(Gcra::of(&closed).is_none());
    }

    #[tokio::test]
    async fn repeated_key_in_one_request_is_counted_twice() {
        let (manager, _) = manager();
        let request = CapacityLeaseRequest::new(vec![concurrency(1), concurrency(1)]);
        let response = manager.lease_capacity(request).await.unwrap();
        assert!(!response.granted());
        assert_eq!(response.allowed, 0);
        assert_eq!(manager.lease_count(), 0);
    }

    #[tokio::test]
    async fn durations_are_capped() {
        let (manager, _) = manager();
        let request = CapacityLeaseRequest::new(vec![concurrency(1)])
            .with_duration(Duration::from_secs(3_600));
        let lease_id = manager.lease_capacity(request).await.unwrap().lease_id.unwrap();
        assert_eq!(
            lease_id.expires_at_ms(),
            1_000_000 + CapacityConfig::DEFAULT_MAX_LEASE_DURATION_MS
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (manager, _) = manager();
        let empty = manager.lease_capacity(CapacityLeaseRequest::default()).await;
        assert!(matches!(empty, Err(CapacityError::InvalidRequest(_))));

        let zero = CapacityLeaseRequest::new(vec![concurrency(1).with_amount(0)]);
        assert!(matches!(
            manager.lease_capacity(zero).await,
            Err(CapacityError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn audit_records_lifecycle() {
        let (manager, clock) = manager();
        let audit = Arc::new(InMemoryLeaseAuditSink::new(16));
        let manager = manager.with_audit(audit.clone());

        let first = manager
            .lease_capacity(CapacityLeaseRequest::new(vec![concurrency(1)]))
            .await
            .unwrap()
            .lease_id
            .unwrap();
        manager
            .lease_capacity(CapacityLeaseRequest::new(vec![concurrency(1)]))
            .await
            .unwrap();
        let renewed = manager
            .extend_capacity_lease(&first, Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        manager.scavenge();
        manager.release_capacity(&renewed).await.unwrap();

        assert_eq!(
            audit.actions(),
            vec![
                LeaseAction::Granted,
                LeaseAction::Denied,
                LeaseAction::Extended,
                LeaseAction::Expired,
            ]
        );
    }
}
