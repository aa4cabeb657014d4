//! Advertisement, discovery and remote name sighting tables.

use meshbus_protocol::{Guid, ReplyCode, TransportMask};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// TTL value meaning "never expires".
pub const TTL_INFINITE: u8 = 255;

/// Names advertised by local clients.
#[derive(Debug, Default)]
pub(crate) struct AdvertiseMap {
    entries: BTreeMap<String, Vec<(TransportMask, String)>>,
}

impl AdvertiseMap {
    /// Record that `owner` advertises `name` over `mask`.
    pub(crate) fn advertise(&mut self, name: &str, mask: TransportMask, owner: &str) -> Result<(), ReplyCode> {
        let owners = self.entries.entry(name.to_string()).or_default();
        if let Some(entry) = owners.iter_mut().find(|(_, o)| o == owner) {
            if entry.0 & mask != 0 {
                return Err(ReplyCode::AlreadyAdvertising);
            }
            entry.0 |= mask;
        } else {
            owners.push((mask, owner.to_string()));
        }
        Ok(())
    }

    /// Withdraw `owner`'s advertisement of `name` over `mask`.
    ///
    /// Returns the transport bits nobody advertises the name on anymore, or
    /// `None` if `owner` was not advertising it.
    pub(crate) fn cancel(&mut self, name: &str, mask: TransportMask, owner: &str) -> Option<TransportMask> {
        let owners = self.entries.get_mut(name)?;
        let entry = owners.iter_mut().find(|(_, o)| o == owner)?;
        entry.0 &= !mask;
        owners.retain(|(m, _)| *m != 0);
        let remaining = owners.iter().fold(0, |acc, (m, _)| acc | m);
        if owners.is_empty() {
            self.entries.remove(name);
        }
        Some(mask & !remaining)
    }

    /// Names advertised by `owner`, with their masks.
    pub(crate) fn owned_by(&self, owner: &str) -> Vec<(String, TransportMask)> {
        self.entries
            .iter()
            .flat_map(|(name, owners)| {
                owners
                    .iter()
                    .filter(move |(_, o)| o == owner)
                    .map(move |(mask, _)| (name.clone(), *mask))
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Name prefixes local clients are looking for.
#[derive(Debug, Default)]
pub(crate) struct DiscoverMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl DiscoverMap {
    /// Returns `false` if `owner` is already looking for `prefix`.
    pub(crate) fn add(&mut self, prefix: &str, owner: &str) -> bool {
        let owners = self.entries.entry(prefix.to_string()).or_default();
        if owners.iter().any(|o| o == owner) {
            return false;
        }
        owners.push(owner.to_string());
        true
    }

    /// Stop `owner` looking for `prefix`.
    ///
    /// Returns whether someone else still looks for it, or `None` if
    /// `owner` was not looking.
    pub(crate) fn remove(&mut self, prefix: &str, owner: &str) -> Option<bool> {
        let owners = self.entries.get_mut(prefix)?;
        let pos = owners.iter().position(|o| o == owner)?;
        owners.remove(pos);
        if owners.is_empty() {
            self.entries.remove(prefix);
            Some(false)
        } else {
            Some(true)
        }
    }

    pub(crate) fn owned_by(&self, owner: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, owners)| owners.iter().any(|o| o == owner))
            .map(|(prefix, _)| prefix.clone())
            .collect()
    }

    /// `(prefix, owner)` pairs interested in `name`.
    pub(crate) fn matching(&self, name: &str) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .flat_map(|(prefix, owners)| owners.iter().map(move |o| (prefix.clone(), o.clone())))
            .collect()
    }
}

/// A name seen on some transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NameSighting {
    pub(crate) name: String,
    pub(crate) transport: TransportMask,
}

impl NameSighting {
    fn new(name: &str, transport: TransportMask) -> Self {
        Self {
            name: name.to_string(),
            transport,
        }
    }
}

/// Outcome of one discovery report.
#[derive(Debug, Default)]
pub(crate) struct NameDelta {
    pub(crate) found: Vec<NameSighting>,
    pub(crate) lost: Vec<NameSighting>,
    /// Whether the table changed in a way the reaper cares about.
    pub(crate) touched: bool,
}

#[derive(Debug, Clone)]
struct NameMapEntry {
    bus_addr: String,
    guid: Guid,
    transport: TransportMask,
    timestamp: Instant,
    ttl: Option<Duration>,
}

impl NameMapEntry {
    fn expires_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.timestamp + ttl)
    }
}

/// Names advertised by other daemons, as reported by the transports.
#[derive(Debug, Default)]
pub(crate) struct NameMap {
    entries: BTreeMap<String, Vec<NameMapEntry>>,
}

impl NameMap {
    /// Apply a discovery report from the daemon `guid` at `bus_addr`.
    pub(crate) fn found(
        &mut self,
        bus_addr: &str,
        guid: &Guid,
        mask: TransportMask,
        names: Option<&[String]>,
        ttl: u8,
        now: Instant,
    ) -> NameDelta {
        let mut delta = NameDelta::default();
        let Some(names) = names else {
            if ttl == 0 {
                delta.lost = self.remove_where(|e| e.bus_addr == bus_addr && e.guid == *guid);
                delta.touched = !delta.lost.is_empty();
            }
            return delta;
        };

        for name in names {
            let known = self.entries.get(name.as_str()).and_then(|entries| {
                entries
                    .iter()
                    .position(|e| e.guid == *guid && e.transport & mask != 0)
            });
            match (known, ttl) {
                (None, 0) => {}
                (None, ttl) => {
                    trace!(name = %name, bus_addr, ttl, "New advertised name");
                    self.entries.entry(name.clone()).or_default().push(NameMapEntry {
                        bus_addr: bus_addr.to_string(),
                        guid: *guid,
                        transport: mask,
                        timestamp: now,
                        ttl: (ttl != TTL_INFINITE).then(|| Duration::from_secs(u64::from(ttl))),
                    });
                    delta.found.push(NameSighting::new(name, mask));
                    delta.touched = true;
                }
                (Some(pos), 0) => {
                    let Some(entries) = self.entries.get_mut(name.as_str()) else {
                        continue;
                    };
                    let entry = entries.remove(pos);
                    if entries.is_empty() {
                        self.entries.remove(name.as_str());
                    }
                    delta.lost.push(NameSighting::new(name, entry.transport));
                    delta.touched = true;
                }
                (Some(pos), _) => {
                    let Some(entry) = self.entries.get_mut(name.as_str()).and_then(|e| e.get_mut(pos)) else {
                        continue;
                    };
                    if entry.bus_addr == bus_addr {
                        entry.timestamp = now;
                        delta.touched = true;
                    }
                }
            }
        }
        delta
    }

    /// Forget every name learned from `bus_addr`.
    pub(crate) fn expire_address(&mut self, bus_addr: &str) -> Vec<NameSighting> {
        self.remove_where(|e| e.bus_addr == bus_addr)
    }

    /// Drop expired names. Returns them with the delay until the next expiry.
    pub(crate) fn reap(&mut self, now: Instant) -> (Vec<NameSighting>, Option<Duration>) {
        let lost = self.remove_where(|e| e.expires_at().is_some_and(|at| at <= now));
        if !lost.is_empty() {
            debug!(expired = lost.len(), "Advertised names expired");
        }
        let next = self
            .entries
            .values()
            .flatten()
            .filter_map(NameMapEntry::expires_at)
            .min()
            .map(|at| at.saturating_duration_since(now));
        (lost, next)
    }

    /// Addresses `name` was seen at over any of `transports`.
    pub(crate) fn addresses(&self, name: &str, transports: TransportMask) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for entry in self.entries.get(name).into_iter().flatten() {
            if entry.transport & transports != 0 && !out.contains(&entry.bus_addr) {
                out.push(entry.bus_addr.clone());
            }
        }
        out
    }

    /// Known names starting with `prefix`, once per transport.
    pub(crate) fn matching(&self, prefix: &str) -> Vec<NameSighting> {
        let mut out: Vec<NameSighting> = self
            .entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .flat_map(|(name, entries)| entries.iter().map(move |e| NameSighting::new(name, e.transport)))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Whether `name` was reported from `bus_addr`.
    pub(crate) fn seen_at(&self, name: &str, bus_addr: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entries| entries.iter().any(|e| e.bus_addr == bus_addr))
    }

    /// Number of sightings.
    pub(crate) fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn remove_where(&mut self, doomed: impl Fn(&NameMapEntry) -> bool) -> Vec<NameSighting> {
        let mut lost = Vec::new();
        self.entries.retain(|name, entries| {
            entries.retain(|e| {
                if doomed(e) {
                    lost.push(NameSighting::new(name, e.transport));
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        lost
    }
}
