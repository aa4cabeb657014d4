//! Name advertisement and discovery.
//!
//! Local clients advertise well-known names over a transport mask and look
//! for names by prefix. Transports report what they see through
//! [`BusInner::found_names`]; sightings live in the name map until their TTL
//! runs out, which the reaper task enforces. Names advertised over the
//! `LOCAL` transport are fed back as if seen at [`LOCAL_ADDRESS`], so local
//! discoverers find them too.

use crate::bus::{BusInner, Deferred, Locked};
use crate::endpoint::EndpointKind;
use crate::name_map::{NameSighting, TTL_INFINITE};
use meshbus_protocol::names::is_legal_bus_name;
use meshbus_protocol::{transport, Guid, Message, ReplyCode, TransportMask};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pseudo address of names advertised over the local transport.
pub(crate) const LOCAL_ADDRESS: &str = "local:";

impl BusInner {
    pub(crate) fn advertise_name(&self, owner: &str, name: &str, mask: TransportMask) -> ReplyCode {
        if !is_legal_bus_name(name) {
            return ReplyCode::Failed;
        }
        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            if l.names.kind(owner) != Some(EndpointKind::Client) {
                return ReplyCode::Failed;
            }
            if let Err(code) = l.state.advertise.advertise(name, mask, owner) {
                return code;
            }
            deferred.push(Deferred::Advertise {
                name: name.to_string(),
                mask,
            });
            if mask & transport::LOCAL != 0 {
                deferred.push(Deferred::LocalNames {
                    names: vec![name.to_string()],
                    ttl: TTL_INFINITE,
                });
            }
        }
        self.apply(deferred);
        info!(name, owner, mask, "Advertising name");
        ReplyCode::Success
    }

    pub(crate) fn cancel_advertise_name(&self, owner: &str, name: &str, mask: TransportMask) -> ReplyCode {
        let mut deferred = Vec::new();
        let code = {
            let mut l = self.lock();
            self.withdraw_advertisement(&mut l, owner, name, mask, &mut deferred)
        };
        self.apply(deferred);
        code
    }

    pub(crate) fn withdraw_advertisement(
        &self,
        l: &mut Locked<'_>,
        owner: &str,
        name: &str,
        mask: TransportMask,
        deferred: &mut Vec<Deferred>,
    ) -> ReplyCode {
        let Some(released) = l.state.advertise.cancel(name, mask, owner) else {
            return ReplyCode::Failed;
        };
        debug!(name, owner, mask, released, "Advertisement cancelled");
        if released != 0 {
            deferred.push(Deferred::CancelAdvertise {
                name: name.to_string(),
                mask: released,
            });
        }
        if mask & transport::LOCAL != 0 {
            deferred.push(Deferred::LocalNames {
                names: vec![name.to_string()],
                ttl: 0,
            });
        }
        ReplyCode::Success
    }

    pub(crate) fn find_advertised_name(&self, owner: &str, prefix: &str) -> ReplyCode {
        {
            let mut l = self.lock();
            if l.names.kind(owner) != Some(EndpointKind::Client) {
                return ReplyCode::Failed;
            }
            if !l.state.discover.add(prefix, owner) {
                return ReplyCode::AlreadyDiscovering;
            }
            for sighting in l.state.name_map.matching(prefix) {
                let msg = Message::found_advertised_name(
                    &self.controller,
                    owner,
                    &sighting.name,
                    sighting.transport,
                    prefix,
                );
                if let Err(e) = l.names.push(owner, msg, 0) {
                    debug!(endpoint = %owner, error = %e, "FoundAdvertisedName not delivered");
                }
            }
        }
        self.apply(vec![Deferred::Discover(prefix.to_string())]);
        info!(prefix, owner, "Looking for advertised names");
        ReplyCode::Success
    }

    pub(crate) fn cancel_find_advertised_name(&self, owner: &str, prefix: &str) -> ReplyCode {
        let mut deferred = Vec::new();
        let code = {
            let mut l = self.lock();
            self.withdraw_find(&mut l, owner, prefix, &mut deferred)
        };
        self.apply(deferred);
        code
    }

    pub(crate) fn withdraw_find(
        &self,
        l: &mut Locked<'_>,
        owner: &str,
        prefix: &str,
        deferred: &mut Vec<Deferred>,
    ) -> ReplyCode {
        match l.state.discover.remove(prefix, owner) {
            None => ReplyCode::Failed,
            Some(still_wanted) => {
                if !still_wanted {
                    deferred.push(Deferred::CancelDiscover(prefix.to_string()));
                }
                ReplyCode::Success
            }
        }
    }

    /// A transport saw `names` at `bus_addr`, or withdrew them with a zero TTL.
    pub(crate) fn found_names(
        &self,
        bus_addr: &str,
        guid: &Guid,
        mask: TransportMask,
        names: Option<Vec<String>>,
        ttl: u8,
    ) {
        let touched = {
            let mut l = self.lock();
            let delta = l.state.name_map.found(
                bus_addr,
                guid,
                mask,
                names.as_deref(),
                ttl,
                Instant::now(),
            );
            self.report_found(&l, &delta.found);
            self.report_lost(&l, &delta.lost);
            delta.touched
        };
        if touched {
            self.reaper_wake.notify_one();
        }
    }

    /// The daemon at `bus_addr` is gone; forget what it advertised.
    pub(crate) fn bus_connection_lost(&self, bus_addr: &str) {
        let mut l = self.lock();
        let lost = l.state.name_map.expire_address(bus_addr);
        if !lost.is_empty() {
            info!(bus_addr, names = lost.len(), "Names of unreachable daemon expired");
        }
        self.report_lost(&l, &lost);
    }

    /// Expire stale sightings. Returns the delay until the next expiry.
    fn reap_names(&self) -> Option<Duration> {
        let mut l = self.lock();
        let (lost, next) = l.state.name_map.reap(Instant::now());
        self.report_lost(&l, &lost);
        next
    }

    fn report_found(&self, l: &Locked<'_>, found: &[NameSighting]) {
        let mut sent = BTreeSet::new();
        for sighting in found {
            for (prefix, dest) in l.state.discover.matching(&sighting.name) {
                if !sent.insert((sighting.name.clone(), prefix.clone(), dest.clone())) {
                    continue;
                }
                let msg = Message::found_advertised_name(
                    &self.controller,
                    &dest,
                    &sighting.name,
                    sighting.transport,
                    &prefix,
                );
                if let Err(e) = l.names.push(&dest, msg, 0) {
                    debug!(endpoint = %dest, error = %e, "FoundAdvertisedName not delivered");
                }
            }
        }
    }

    fn report_lost(&self, l: &Locked<'_>, lost: &[NameSighting]) {
        for sighting in lost {
            let dests: BTreeSet<String> = l
                .state
                .discover
                .matching(&sighting.name)
                .into_iter()
                .map(|(_, dest)| dest)
                .collect();
            for dest in dests {
                let msg = Message::lost_advertised_name(
                    &self.controller,
                    &dest,
                    &sighting.name,
                    sighting.transport,
                );
                if let Err(e) = l.names.push(&dest, msg, 0) {
                    debug!(endpoint = %dest, error = %e, "LostAdvertisedName not delivered");
                }
            }
        }
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Expire name sightings as their TTLs run out.
///
/// Sleeps until the earliest expiry, or until woken because the name map changed.
pub(crate) async fn run_reaper(bus: Weak<BusInner>, wake: Arc<Notify>, cancel: CancellationToken) {
    loop {
        let next = match bus.upgrade() {
            Some(bus) => bus.reap_names(),
            None => break,
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            () = wake.notified() => {}
            () = sleep_for(next) => {}
        }
    }
    debug!("Name reaper stopped");
}
