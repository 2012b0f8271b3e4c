use crate::config::Config;
use crate::config::Policy;
use crate::config::format_duration;
use crate::schedule::TimeOfDay;
use crate::schedule::TimeRange;
use crate::url_match::UrlMatch;
use crate::url_match::strip_wildcard;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;
use tracing::info;

/// Runtime state for one configured [`Policy`].
///
/// `id` and `policy` are immutable after load; the clock-dependent fields
/// live behind their own lock because the management listener writes them
/// while the data path reads them.
#[derive(Debug)]
pub struct PolicyEntry {
    pub id: u32,
    pub policy: Policy,
    state: Mutex<EntryState>,
}

#[derive(Debug, Clone)]
struct EntryState {
    expire_time: Option<OffsetDateTime>,
    used_duration: Duration,
    last_access: OffsetDateTime,
}

impl PolicyEntry {
    fn new(id: u32, policy: Policy, now: OffsetDateTime) -> Self {
        Self {
            id,
            policy,
            state: Mutex::new(EntryState {
                expire_time: None,
                used_duration: Duration::ZERO,
                last_access: now,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a temporary grant is active.
    pub fn grant_active(&self, now: OffsetDateTime) -> bool {
        self.lock().expire_time.is_some_and(|t| t > now)
    }

    /// Installs a temporary grant expiring at `until`.
    pub fn grant_until(&self, until: OffsetDateTime) {
        self.lock().expire_time = Some(until);
    }

    fn touch(&self, now: OffsetDateTime) {
        self.lock().last_access = now;
    }

    pub fn view(&self) -> EntryView {
        let state = self.lock().clone();
        EntryView {
            id: self.id,
            path: self.policy.path.clone(),
            allowed_range: self.policy.allowed_range.clone(),
            max_allowed: format_duration(self.policy.max_allowed),
            self_managed: self.policy.self_managed,
            expire_time: state.expire_time.map(OffsetDateTime::unix_timestamp),
            used_duration_seconds: state.used_duration.as_secs(),
            last_access: state.last_access.unix_timestamp(),
        }
    }
}

/// JSON projection of an entry for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub id: u32,
    pub path: String,
    pub allowed_range: Vec<TimeRange>,
    pub max_allowed: String,
    pub self_managed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<i64>,
    pub used_duration_seconds: u64,
    pub last_access: i64,
}

/// Outcome of the per-request decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Skip-listed: tunnel the bytes untouched, do not intercept.
    Skip,
    /// Hard-blocked site.
    Blocked,
    Allowed,
    /// Denied by the policy with this entry id; the client is redirected to
    /// the block page carrying the id as its fragment.
    Denied { id: u32 },
}

/// The per-request decision pipeline: skip, block and policy lookups over
/// the configured rule set.
#[derive(Debug)]
pub struct Filter {
    entries: Vec<Arc<PolicyEntry>>,
    policies: UrlMatch<Arc<PolicyEntry>>,
    skip: UrlMatch<()>,
    blocked: UrlMatch<()>,
}

impl Filter {
    pub fn new(config: &Config, now: OffsetDateTime) -> Self {
        let mut entries = Vec::with_capacity(config.policies.len());
        let mut policies = UrlMatch::new();
        for (id, policy) in config.policies.iter().enumerate() {
            info!("loading policy {id}: {}", policy.path);
            let entry = Arc::new(PolicyEntry::new(id as u32, policy.clone(), now));
            policies.add(strip_wildcard(&policy.path), entry.clone());
            entries.push(entry);
        }

        let mut skip = UrlMatch::new();
        for host in &config.skip_proxy {
            skip.add(strip_wildcard(host), ());
        }

        let mut blocked = UrlMatch::new();
        for host in &config.blocked {
            blocked.add(strip_wildcard(host), ());
        }

        Self {
            entries,
            policies,
            skip,
            blocked,
        }
    }

    pub fn is_skipped(&self, host: &str, path: &str) -> bool {
        self.skip.find(host, path).is_some()
    }

    pub fn is_blocked(&self, host: &str, path: &str) -> bool {
        self.blocked.find(host, path).is_some()
    }

    /// Runs the full decision pipeline for one request. `api_host` is the
    /// proxy's own management hostname, which is never filtered.
    pub fn evaluate(
        &self,
        method: &str,
        host: &str,
        path: &str,
        api_host: &str,
        now: OffsetDateTime,
    ) -> Access {
        if self.is_skipped(host, path) {
            debug!("skipping host {host}");
            return Access::Skip;
        }
        if self.is_blocked(host, path) {
            return Access::Blocked;
        }
        if method == "CONNECT" || host == api_host {
            return Access::Allowed;
        }

        // Walk every matching rule from the most general to the most
        // specific. An allow ends the walk; a deny is only a candidate, so a
        // deeper rule can still override it.
        let time_of_day = TimeOfDay::from(now);
        let mut denied: Option<u32> = None;
        let mut decided = false;
        self.policies.walk_matches(host, path, |key, entry| {
            if decided {
                return;
            }
            entry.touch(now);
            if entry.grant_active(now) {
                debug!("path {key} allowed by temporary grant");
                denied = None;
                decided = true;
                return;
            }
            if entry
                .policy
                .allowed_range
                .iter()
                .any(|range| range.contains(time_of_day))
            {
                debug!("path {key} allowed by time of day");
                denied = None;
                decided = true;
                return;
            }
            denied = Some(entry.id);
        });

        match denied {
            Some(id) => Access::Denied { id },
            None => Access::Allowed,
        }
    }

    pub fn entry(&self, id: u32) -> Option<&Arc<PolicyEntry>> {
        self.entries.get(id as usize)
    }

    pub fn entry_views(&self) -> Vec<EntryView> {
        self.entries.iter().map(|entry| entry.view()).collect()
    }
}

/// Normalizes host fragments for matching: trim, strip brackets and a
/// single `:port`, lowercase, drop trailing dots.
pub(crate) fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with('[')
        && let Some(end) = host.find(']')
    {
        return normalize_dns_host(&host[1..end]);
    }

    // Strip `:port` only when there is exactly one `:`, so unbracketed IPv6
    // literals survive.
    if host.bytes().filter(|b| *b == b':').count() == 1 {
        let host = host.split(':').next().unwrap_or_default();
        return normalize_dns_host(host);
    }

    normalize_dns_host(host)
}

fn normalize_dns_host(host: &str) -> String {
    host.to_ascii_lowercase().trim_end_matches('.').to_string()
}
