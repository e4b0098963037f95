//! Lease-based capacity admission.
//!
//! A [`CapacityManager`] grants short-lived, renewable leases over one or more
//! [`CapacityResource`]s. Acquisition is all-or-nothing: when any resource would
//! exceed its limit no lease is issued and
//! [`CapacityLeaseResponse::allowed`] reports how much could have been granted.
//!
//! Lease identifiers are ULIDs whose timestamp component is the lease expiry, so a
//! set of leases ordered by id is ordered by expiry and expired leases form a prefix.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use super::error::CapacityError;

/// Kind of capacity a resource represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityKind {
    /// Admission before scheduling, metered over time.
    RateLimit,
    /// Cap on in-flight work after scheduling.
    Concurrency,
    /// Soft rate; excess work backs up instead of being rejected.
    Throttle,
}

impl CapacityKind {
    /// Whether units are metered over a period instead of held by leases.
    #[must_use]
    pub const fn is_metered(self) -> bool {
        matches!(self, Self::RateLimit | Self::Throttle)
    }
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RateLimit => "rate-limit",
            Self::Concurrency => "concurrency",
            Self::Throttle => "throttle",
        })
    }
}

/// Owner of a capacity resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapacityIdentifier {
    /// Account the function belongs to.
    pub account_id: Uuid,
    /// Function being gated.
    pub function_id: Uuid,
}

impl CapacityIdentifier {
    /// Create an identifier.
    #[must_use]
    pub const fn new(account_id: Uuid, function_id: Uuid) -> Self {
        Self {
            account_id,
            function_id,
        }
    }
}

/// What a custom concurrency key counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Concurrently executing steps.
    Step,
    /// Concurrently active runs.
    Run,
}

/// Where a custom concurrency key applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Shared by all runs of one function.
    Function,
    /// Shared across an environment.
    Environment,
    /// Shared across an account.
    Account,
}

/// User-defined concurrency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomConcurrencyKey {
    /// Counting mode.
    pub mode: ConcurrencyMode,
    /// Sharing scope.
    pub scope: ConcurrencyScope,
    /// Key value after evaluating the expression against the event.
    pub evaluated_key: String,
    /// Hash of the unevaluated key expression.
    pub key_expression_hash: String,
}

/// Key of a throttle resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThrottleKey {
    /// Key value after evaluating the expression.
    pub evaluated_key: String,
    /// Hash of the unevaluated key expression.
    pub key_expression_hash: String,
}

/// Identity of one counter in the capacity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: CapacityKind,
    /// Account and function scope.
    pub identifier: CapacityIdentifier,
    /// Custom concurrency keys narrowing the scope.
    pub custom_keys: Vec<CustomConcurrencyKey>,
    /// Throttle key narrowing the scope.
    pub throttle_key: Option<ThrottleKey>,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind, self.identifier.account_id, self.identifier.function_id
        )?;
        for key in &self.custom_keys {
            write!(f, ":ck:{}:{}", key.key_expression_hash, key.evaluated_key)?;
        }
        if let Some(throttle) = &self.throttle_key {
            write!(f, ":th:{}:{}", throttle.key_expression_hash, throttle.evaluated_key)?;
        }
        Ok(())
    }
}

const fn default_amount() -> u32 {
    1
}

const fn default_period_ms() -> u64 {
    60_000
}

/// One resource requested by a lease.
///
/// Concurrency resources hold `amount` units until the lease is released or
/// expires. Rate-limit and throttle resources are metered with GCRA: `limit`
/// units are emitted per `period_ms`, at most `burst + 1` may be taken at once,
/// and releasing a lease does not give them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityResource {
    /// Resource kind.
    pub kind: CapacityKind,
    /// Account and function scope.
    pub identifier: CapacityIdentifier,
    /// Custom concurrency keys.
    #[serde(default)]
    pub custom_keys: Vec<CustomConcurrencyKey>,
    /// Throttle key.
    #[serde(default)]
    pub throttle_key: Option<ThrottleKey>,
    /// Units requested.
    #[serde(default = "default_amount")]
    pub amount: u32,
    /// Maximum concurrently held units, or units per period for metered kinds.
    pub limit: u32,
    /// Metering period in milliseconds. Ignored for concurrency.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Units a metered resource may take beyond one emission interval.
    #[serde(default)]
    pub burst: u32,
}

impl CapacityResource {
    /// A resource requesting one unit out of `limit`.
    #[must_use]
    pub const fn new(kind: CapacityKind, identifier: CapacityIdentifier, limit: u32) -> Self {
        Self {
            kind,
            identifier,
            custom_keys: Vec::new(),
            throttle_key: None,
            amount: default_amount(),
            limit,
            period_ms: default_period_ms(),
            burst: 0,
        }
    }

    /// Set the metering period.
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the metering burst.
    #[must_use]
    pub const fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Set the requested amount.
    #[must_use]
    pub const fn with_amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    /// Add a custom concurrency key.
    #[must_use]
    pub fn with_custom_key(mut self, key: CustomConcurrencyKey) -> Self {
        self.custom_keys.push(key);
        self
    }

    /// Set the throttle key.
    #[must_use]
    pub fn with_throttle_key(mut self, key: ThrottleKey) -> Self {
        self.throttle_key = Some(key);
        self
    }

    /// Counter this resource is accounted against.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind,
            identifier: self.identifier,
            custom_keys: self.custom_keys.clone(),
            throttle_key: self.throttle_key.clone(),
        }
    }
}

/// Identifier of a granted lease.
///
/// The ULID timestamp is the lease's expiry in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(Ulid);

impl LeaseId {
    /// Fresh identifier expiring at `expires_at_ms`.
    #[must_use]
    pub fn expiring_at(expires_at_ms: u64) -> Self {
        Self(Ulid::from_parts(expires_at_ms, Ulid::new().random()))
    }

    /// Smallest identifier whose expiry is `expires_at_ms`.
    #[must_use]
    pub fn lower_bound(expires_at_ms: u64) -> Self {
        Self(Ulid::from_parts(expires_at_ms, 0))
    }

    /// Expiry encoded in the identifier.
    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| CapacityError::InvalidRequest(format!("lease id {s:?}: {e}")))
    }
}

/// Request to lease one or more resources atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLeaseRequest {
    /// Repeating a request with the same key inside the idempotency window returns
    /// the cached response.
    pub idempotency_key: Option<String>,
    /// Resources to acquire together.
    pub resources: Vec<CapacityResource>,
    /// Lease duration; the manager default when unset.
    pub duration: Option<Duration>,
}

impl CapacityLeaseRequest {
    /// Request the given resources with the default duration.
    #[must_use]
    pub const fn new(resources: Vec<CapacityResource>) -> Self {
        Self {
            idempotency_key: None,
            resources,
            duration: None,
        }
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the lease duration.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Outcome of a lease request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLeaseResponse {
    /// Set only when every resource was acquired.
    pub lease_id: Option<LeaseId>,
    /// Units that could be granted: the minimum over resources of
    /// `min(amount, available)`.
    pub allowed: u32,
    /// Resources that prevented the grant.
    pub limiting: Vec<ResourceKey>,
    /// Time until every limiting resource could admit the request: the first
    /// expiry of a lease holding a concurrency key, or the next emission of a
    /// metered key.
    pub retry_after: Option<Duration>,
}

impl CapacityLeaseResponse {
    /// Whether a lease was issued.
    #[must_use]
    pub const fn granted(&self) -> bool {
        self.lease_id.is_some()
    }
}

/// Usage of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resource counter.
    pub key: ResourceKey,
    /// Units currently held by live leases, or consumed and not yet re-emitted
    /// for metered kinds.
    pub in_use: u32,
    /// Limit supplied with the check. For metered kinds, the burst capacity
    /// `burst + 1`.
    pub limit: u32,
}

impl ResourceUsage {
    /// Units still available.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.limit.saturating_sub(self.in_use)
    }
}

/// Non-mutating view of capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCheckResponse {
    /// Units a lease request for these resources would be allowed right now.
    pub available: u32,
    /// Per-resource usage, in request order.
    pub usage: Vec<ResourceUsage>,
    /// Resources with less available than requested.
    pub limiting: Vec<ResourceKey>,
}

/// Result of reclaiming expired leases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeResult {
    /// Leases removed.
    pub expired_leases: usize,
    /// Units returned to their resources.
    pub released_units: u64,
}

/// Lease-based capacity admission.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    /// Acquire every resource in `request` or none of them.
    async fn lease_capacity(
        &self,
        request: CapacityLeaseRequest,
    ) -> Result<CapacityLeaseResponse, CapacityError>;

    /// Renew a live lease; the returned identifier replaces `lease_id`.
    async fn extend_capacity_lease(
        &self,
        lease_id: &LeaseId,
        duration: Duration,
    ) -> Result<LeaseId, CapacityError>;

    /// Release a lease. Unknown, expired, and already released leases are a no-op.
    async fn release_capacity(&self, lease_id: &LeaseId) -> Result<(), CapacityError>;

    /// Report availability without acquiring anything.
    async fn check_capacity(
        &self,
        resources: &[CapacityResource],
    ) -> Result<CapacityCheckResponse, CapacityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_ids_order_by_expiry() {
        let later = LeaseId::expiring_at(2_000);
        let earlier = LeaseId::expiring_at(1_000);
        assert!(earlier < later);
        assert!(LeaseId::lower_bound(1_001) > earlier);
        assert_eq!(later.expires_at_ms(), 2_000);
    }

    #[test]
    fn lease_id_parses_its_display_form() {
        let id = LeaseId::expiring_at(42);
        let parsed: LeaseId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(matches!(
            "not-a-ulid".parse::<LeaseId>(),
            Err(CapacityError::InvalidRequest(_))
        ));
    }

    #[test]
    fn resource_defaults_to_one_unit() {
        let json = serde_json::json!({
            "kind": "concurrency",
            "identifier": {
                "account_id": Uuid::nil(),
                "function_id": Uuid::nil(),
            },
            "limit": 3,
        });
        let resource: CapacityResource = serde_json::from_value(json).unwrap();
        assert_eq!(resource.amount, 1);
        assert_eq!(resource.kind, CapacityKind::Concurrency);
        assert_eq!(resource.period_ms, 60_000);
        assert_eq!(resource.burst, 0);
    }

    #[test]
    fn only_rates_are_metered() {
        assert!(CapacityKind::RateLimit.is_metered());
        assert!(CapacityKind::Throttle.is_metered());
        assert!(!CapacityKind::Concurrency.is_metered());
    }

    #[test]
    fn resource_key_display_includes_scopes() {
        let ident = CapacityIdentifier::new(Uuid::nil(), Uuid::nil());
        let resource = CapacityResource::new(CapacityKind::Throttle, ident, 1).with_throttle_key(
            ThrottleKey {
                evaluated_key: "user-1".into(),
                key_expression_hash: "h1".into(),
            },
        );
        let key = resource.key().to_string();
        assert!(key.starts_with("throttle:"));
        assert!(key.ends_with(":th:h1:user-1"));
    }
}
