//! Router core (C5).
//!
//! Holds the endpoint directory and drives message fan-out: a message with
//! an explicit destination goes straight to that endpoint; everything else
//! is matched against every other endpoint's rule table and delivered to
//! each match at most once. Delivery is a non-blocking hand-off over a
//! bounded channel per endpoint — a full channel is reported back to the
//! caller rather than blocking the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::rules::{Candidate, RuleTable};

const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A message as seen by the router: enough of a DBus-style envelope to
/// drive destination lookup and rule matching. Body marshalling is out of
/// scope for this core (§1); callers carry the payload alongside this.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub sender: EndpointId,
    pub message_type: String,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
    pub sessionless: bool,
}

/// An opaque, hashable handle to a connected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

/// A connected participant: its unique name, its subscription rule table,
/// and the channel its outbound messages are handed off on.
pub struct Endpoint {
    pub id: EndpointId,
    pub unique_name: String,
    pub rules: RuleTable,
    sender: mpsc::Sender<RoutedMessage>,
}

/// Why a delivery attempt to one endpoint didn't result in an enqueued
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The endpoint's outbound queue is full; its own flow-control handling
    /// owns what happens next (§4.5).
    FlowControlled,
    /// `destination` named an endpoint this router doesn't know about.
    NoSuchDestination,
}

/// The result of routing one message.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub delivered: Vec<EndpointId>,
    pub failed: Vec<(EndpointId, DeliveryFailure)>,
}

/// A minimal in-memory stand-in for the sessionless message store (§4.5's
/// "external collaborator"): messages marked sessionless are retained here
/// in addition to being routed, so a later-connecting endpoint could in
/// principle be backfilled from it.
#[derive(Default)]
struct SessionlessStore {
    messages: Vec<RoutedMessage>,
}

/// For an inbound message: deliver to an explicit destination, or fan out
/// to every other endpoint whose rule table matches.
pub struct Router {
    endpoints: Mutex<HashMap<EndpointId, Endpoint>>,
    by_name: Mutex<HashMap<String, EndpointId>>,
    sessionless: Mutex<SessionlessStore>,
    next_id: AtomicU64,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            sessionless: Mutex::new(SessionlessStore::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a newly connected endpoint, returning its id and the
    /// receiver side of its outbound queue.
    pub fn connect(&self, unique_name: impl Into<String>) -> (EndpointId, mpsc::Receiver<RoutedMessage>) {
        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let unique_name = unique_name.into();
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        self.by_name.lock().unwrap().insert(unique_name.clone(), id);
        self.endpoints.lock().unwrap().insert(
            id,
            Endpoint {
                id,
                unique_name,
                rules: RuleTable::new(),
                sender,
            },
        );
        (id, receiver)
    }

    /// Remove an endpoint and every rule it held.
    pub fn disconnect(&self, id: EndpointId) {
        if let Some(endpoint) = self.endpoints.lock().unwrap().remove(&id) {
            self.by_name.lock().unwrap().remove(&endpoint.unique_name);
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    /// Route `message`: direct delivery if it names a destination,
    /// otherwise rule-matched fan-out to every other endpoint.
    pub fn route(&self, message: RoutedMessage) -> RouteOutcome {
        if message.sessionless {
            self.sessionless.lock().unwrap().messages.push(message.clone());
        }

        if let Some(destination) = &message.destination {
            return self.route_direct(destination, &message);
        }
        self.route_broadcast(&message)
    }

    fn route_direct(&self, destination: &str, message: &RoutedMessage) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        let target = self.by_name.lock().unwrap().get(destination).copied();
        let Some(target) = target else {
            outcome.failed.push((message.sender, DeliveryFailure::NoSuchDestination));
            return outcome;
        };

        let sender = {
            let endpoints = self.endpoints.lock().unwrap();
            endpoints.get(&target).map(|e| e.sender.clone())
        };
        match sender {
            Some(sender) => self.hand_off(target, sender, message.clone(), &mut outcome),
            None => outcome.failed.push((message.sender, DeliveryFailure::NoSuchDestination)),
        }
        outcome
    }

    fn route_broadcast(&self, message: &RoutedMessage) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        let candidates: Vec<(EndpointId, mpsc::Sender<RoutedMessage>)> = {
            let endpoints = self.endpoints.lock().unwrap();
            let candidate = Candidate {
                message_type: Some(message.message_type.as_str()),
                sender: None,
                interface: message.interface.as_deref(),
                member: message.member.as_deref(),
                path: message.path.as_deref(),
                destination: None,
                sessionless: message.sessionless,
            };
            endpoints
                .values()
                .filter(|e| e.id != message.sender)
                .filter(|e| e.rules.matches_any(&candidate))
                .map(|e| (e.id, e.sender.clone()))
                .collect()
        };

        for (id, sender) in candidates {
            self.hand_off(id, sender, message.clone(), &mut outcome);
        }
        outcome
    }

    fn hand_off(
        &self,
        id: EndpointId,
        sender: mpsc::Sender<RoutedMessage>,
        message: RoutedMessage,
        outcome: &mut RouteOutcome,
    ) {
        match sender.try_send(message) {
            Ok(()) => outcome.delivered.push(id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?id, "endpoint outbound queue full, flow-controlled");
                outcome.failed.push((id, DeliveryFailure::FlowControlled));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                outcome.failed.push((id, DeliveryFailure::NoSuchDestination));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(sender: EndpointId) -> RoutedMessage {
        RoutedMessage {
            sender,
            message_type: "signal".into(),
            interface: Some("org.example".into()),
            member: Some("Foo".into()),
            path: None,
            destination: None,
            sessionless: false,
        }
    }

    #[test]
    fn direct_destination_delivers_only_there() {
        let router = Router::new();
        let (a, _rx_a) = router.connect("a");
        let (b, mut rx_b) = router.connect("b");
        let (_c, mut rx_c) = router.connect("c");

        let message = RoutedMessage {
            destination: Some("b".into()),
            ..signal(a)
        };
        let outcome = router.route(message);
        assert_eq!(outcome.delivered, vec![b]);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn unknown_destination_fails_with_no_such_destination() {
        let router = Router::new();
        let (a, _rx) = router.connect("a");
        let message = RoutedMessage {
            destination: Some("ghost".into()),
            ..signal(a)
        };
        let outcome = router.route(message);
        assert_eq!(outcome.delivered, Vec::new());
        assert_eq!(outcome.failed, vec![(a, DeliveryFailure::NoSuchDestination)]);
    }

    #[test]
    fn broadcast_delivers_to_every_matching_endpoint_except_sender() {
        let router = Router::new();
        let (a, _rx_a) = router.connect("a");
        let (b, mut rx_b) = router.connect("b");
        let (c, mut rx_c) = router.connect("c");

        router
            .endpoints
            .lock()
            .unwrap()
            .get(&b)
            .unwrap()
            .rules
            .add("interface='org.example',member='Foo'")
            .unwrap();
        router
            .endpoints
            .lock()
            .unwrap()
            .get(&c)
            .unwrap()
            .rules
            .add("interface='org.other'")
            .unwrap();

        let outcome = router.route(signal(a));
        assert_eq!(outcome.delivered, vec![b]);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn sender_never_receives_its_own_broadcast() {
        let router = Router::new();
        let (a, mut rx_a) = router.connect("a");
        router
            .endpoints
            .lock()
            .unwrap()
            .get(&a)
            .unwrap()
            .rules
            .add("interface='org.example'")
            .unwrap();

        router.route(signal(a));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn disconnect_removes_endpoint_and_name_mapping() {
        let router = Router::new();
        let (a, _rx) = router.connect("a");
        router.disconnect(a);
        assert_eq!(router.endpoint_count(), 0);

        let message = RoutedMessage {
            destination: Some("a".into()),
            ..signal(a)
        };
        let outcome = router.route(message);
        assert_eq!(outcome.failed, vec![(a, DeliveryFailure::NoSuchDestination)]);
    }

    #[test]
    fn full_outbound_queue_reports_flow_controlled() {
        let router = Router::new();
        let (a, _rx_a) = router.connect("a");
        let (b, _rx_b) = router.connect("b");
        {
            let endpoints = router.endpoints.lock().unwrap();
            let endpoint = endpoints.get(&b).unwrap();
            endpoint.rules.add("interface='org.example'").unwrap();
            for _ in 0..OUTBOUND_QUEUE_DEPTH {
                endpoint.sender.try_send(signal(a)).unwrap();
            }
        }

        let outcome = router.route(signal(a));
        assert_eq!(outcome.failed, vec![(b, DeliveryFailure::FlowControlled)]);
    }

    #[test]
    fn closed_receiver_reports_no_such_destination() {
        let router = Router::new();
        let (a, _rx_a) = router.connect("a");
        let (b, rx_b) = router.connect("b");
        router
            .endpoints
            .lock()
            .unwrap()
            .get(&b)
            .unwrap()
            .rules
            .add("interface='org.example'")
            .unwrap();
        drop(rx_b);

        let outcome = router.route(signal(a));
        assert_eq!(outcome.failed, vec![(b, DeliveryFailure::NoSuchDestination)]);
    }
}
