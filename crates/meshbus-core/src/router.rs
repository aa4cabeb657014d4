//! Message routing.
//!
//! A message entering the daemon, from a client or over a link, is handed to
//! [`BusInner::route`] together with the name of the endpoint it came from.
//! Directed messages go to their destination; untargeted ones fan out to
//! matching rules, to every link for global broadcasts, and to the session
//! routes of their sender for session multicast.

use crate::bus::BusInner;
use crate::endpoint::EndpointKind;
use crate::error::BusError;
use crate::registry::NameTable;
use meshbus_protocol::{error_names, Message};
use tracing::{debug, trace, warn};

/// Keep the first failure, ignoring endpoints that are merely closing.
fn merge(status: &mut Result<(), BusError>, result: Result<(), BusError>) {
    if let Err(e) = result {
        if e.is_closing() {
            debug!(error = %e, "Endpoint closing, message dropped");
            return;
        }
        warn!(error = %e, "Delivery failed");
        if status.is_ok() {
            *status = Err(e);
        }
    }
}

impl BusInner {
    /// Deliver `msg`, which arrived from the endpoint named `from`.
    ///
    /// Delivery continues past individual failures; the first one that is
    /// not a closing endpoint is returned.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure, or a policy violation.
    pub(crate) fn route(&self, msg: Message, from: &str) -> Result<(), BusError> {
        let mut status = Ok(());
        let mut replies = Vec::new();
        let mut parked = None;
        {
            let names = self.read_names();
            let from_link = names.kind(from) == Some(EndpointKind::BusToBus);

            if from != self.controller && !self.policy.ok_to_send(&msg, from) {
                debug!(sender = %msg.sender, "Policy denies sending");
                return Err(BusError::PolicyViolation(msg.sender.clone()));
            }

            let mut delivered_to = None;
            if !msg.is_untargeted() {
                match names.resolve(&msg.destination).map(str::to_string) {
                    Some(dest) => {
                        self.route_directed(&names, &msg, from, from_link, &dest, &mut status, &mut replies);
                        delivered_to = Some(dest);
                    }
                    None if msg.auto_start && !from_link && self.launcher.is_some() => {
                        debug!(destination = %msg.destination, "Parking message until its service starts");
                        parked = Some(msg.clone());
                    }
                    None if msg.is_reply_expected() => {
                        debug!(destination = %msg.destination, serial = msg.serial, "No route, returning error");
                        replies.push(msg.error_reply(
                            &self.controller,
                            error_names::SERVICE_UNKNOWN,
                            format!("Unknown bus name: {}", msg.destination),
                        ));
                    }
                    None => {
                        debug!(destination = %msg.destination, session_id = msg.session_id, "Discarding message without route");
                    }
                }
            }

            let eavesdrop = self.policy.eavesdrop_enabled();
            if (msg.is_untargeted() && msg.session_id == 0) || eavesdrop {
                self.route_by_rules(&names, &msg, from, from_link, eavesdrop, delivered_to.as_deref(), &mut status);
            }

            if msg.is_untargeted() && msg.session_id == 0 && msg.global_broadcast {
                for link in names.links() {
                    if link.unique_name() == from {
                        continue;
                    }
                    trace!(link = %link.unique_name(), serial = msg.serial, "Global broadcast");
                    merge(&mut status, link.push(msg.clone()).map_err(BusError::from));
                }
            }

            if msg.is_untargeted() && msg.session_id != 0 {
                let mut last_link: Option<&str> = None;
                for cast in names.session_casts(msg.session_id, &msg.sender) {
                    if cast.b2b.is_some() && cast.b2b.as_deref() == last_link {
                        continue;
                    }
                    trace!(session_id = msg.session_id, dest = %cast.dest, "Session multicast");
                    merge(&mut status, names.push(&cast.dest, msg.clone(), msg.session_id));
                    last_link = cast.b2b.as_deref();
                }
            }
        }

        for reply in replies {
            if let Err(e) = self.route(reply, &self.controller.clone()) {
                debug!(error = %e, "Could not return error reply");
            }
        }
        if let Some(msg) = parked {
            self.park_for_service(msg, from);
        }
        status
    }

    #[allow(clippy::too_many_arguments)]
    fn route_directed(
        &self,
        names: &NameTable,
        msg: &Message,
        from: &str,
        from_link: bool,
        dest: &str,
        status: &mut Result<(), BusError>,
        replies: &mut Vec<Message>,
    ) {
        let reply_expected = msg.is_reply_expected();
        let from_daemon = from == self.controller;
        if !from_daemon && dest != self.controller && !self.policy.ok_to_receive(msg, dest) {
            debug!(receiver = %dest, "Policy denies receiving");
            if reply_expected {
                replies.push(msg.error_reply(
                    &self.controller,
                    error_names::ACCESS_DENIED,
                    format!("Policy denies delivery to {}", msg.destination),
                ));
            }
            merge(status, Err(BusError::PolicyViolation(dest.to_string())));
            return;
        }

        if from_link && !names.allows_remote_messages(dest) {
            debug!(receiver = %dest, serial = msg.serial, "Receiver does not allow remote messages");
            if reply_expected {
                replies.push(msg.error_reply(
                    &self.controller,
                    error_names::BLOCKED,
                    format!("Remote method calls blocked for bus name: {}", msg.destination),
                ));
            }
            return;
        }

        if names.kind(dest) == Some(EndpointKind::Virtual)
            && reply_expected
            && !names.allows_remote_messages(from)
        {
            debug!(sender = %msg.sender, receiver = %dest, "Caller does not allow remote messages");
            replies.push(msg.error_reply(
                &self.controller,
                error_names::BLOCKED,
                "Method reply would be blocked because caller does not allow remote messages",
            ));
            return;
        }

        trace!(receiver = %dest, serial = msg.serial, "Directed delivery");
        merge(status, names.push(dest, msg.clone(), msg.session_id));
    }

    #[allow(clippy::too_many_arguments)]
    fn route_by_rules(
        &self,
        names: &NameTable,
        msg: &Message,
        from: &str,
        from_link: bool,
        eavesdrop: bool,
        skip: Option<&str>,
        status: &mut Result<(), BusError>,
    ) {
        for entry in self.rules.iter() {
            let endpoint = entry.key();
            if skip == Some(endpoint.as_str()) || !entry.value().iter().any(|r| r.matches(msg)) {
                continue;
            }
            let allowed = *endpoint == self.controller
                || self.policy.ok_to_receive(msg, endpoint)
                || (eavesdrop && self.policy.ok_to_eavesdrop(msg, from, endpoint));
            if !allowed {
                continue;
            }
            if !eavesdrop && from_link && !names.allows_remote_messages(endpoint) {
                continue;
            }
            trace!(receiver = %endpoint, serial = msg.serial, "Rule match");
            merge(status, names.push(endpoint, msg.clone(), msg.session_id));
        }
    }

    /// Hold `msg` until the launcher has started its destination, then route it.
    fn park_for_service(&self, msg: Message, from: &str) {
        let (Some(bus), Some(launcher)) = (self.arc(), self.launcher.clone()) else {
            return;
        };
        let from = from.to_string();
        self.tasks.spawn(async move {
            match launcher.start_service(&msg.destination).await {
                Ok(()) => {
                    if let Err(e) = bus.route(msg, &from) {
                        debug!(error = %e, "Delivery after service start failed");
                    }
                }
                Err(e) => {
                    warn!(destination = %msg.destination, error = %e, "Service start failed");
                    if msg.is_reply_expected() {
                        let reply = msg.error_reply(
                            &bus.controller,
                            error_names::SERVICE_UNKNOWN,
                            format!("Unknown bus name: {}", msg.destination),
                        );
                        let _ = bus.route(reply, &bus.controller);
                    }
                }
            }
        });
    }
}
