//! Name-service engine (C3).
//!
//! Drives the multicast discovery protocol: keeps per-transport advertised
//! and sought name sets, answers WhoHas queries, emits periodic IsAt
//! advertisements, ages out remotes that have gone silent, and publishes
//! found/lost notifications to subscribers. One worker task owns all of
//! this; callers only ever touch shared, mutex-protected state and a
//! `Notify` used to wake the worker between ticks.

pub mod glob;
pub mod timers;

pub use timers::{DURATION_INFINITE, Timers};

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::iface::{self, Monitor};
use crate::wire::{IsAt, NS_MESSAGE_MAX, NsMessage, WhoHas};

/// When to stop retransmitting a `find_advertised_name` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindPolicy {
    /// Keep retransmitting on schedule regardless of answers received.
    AlwaysRetry,
    /// Stop once any matching name has been heard.
    RetryUntilPartial,
    /// Stop once a remote's *complete* advertisement set contains a match.
    RetryUntilComplete,
}

/// Which address families a transport has enabled for discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnableFlags {
    pub ipv4: bool,
    pub ipv6: bool,
}

/// A found/lost notification delivered to a [`Engine::set_callback`] subscriber.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub bus_address: String,
    pub guid: Guid,
    pub names: Vec<String>,
    pub ttl: u8,
}

impl DiscoveryEvent {
    pub fn is_lost(&self) -> bool {
        self.ttl == 0
    }
}

/// The engine worker's lifecycle stage (§4.3.3). A freshly [`Engine::init`]ed
/// engine starts in `Initializing`; there is no representable `Invalid`
/// state once a value exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Running,
    Stopping,
    Shutdown,
}

#[derive(Debug, Clone)]
struct FindEntry {
    pattern: String,
    #[allow(dead_code)]
    policy: FindPolicy,
}

struct RetryEntry {
    transport: u16,
    pattern: String,
    policy: FindPolicy,
    deadline: Instant,
    retries_left: u32,
}

struct RemoteEntry {
    guid: Guid,
    names: HashSet<String>,
    last_seen: Instant,
    ttl: u8,
    last_probed: Option<Instant>,
}

#[derive(Default)]
struct TransportState {
    reliable_ipv4_port: u16,
    reliable_ipv6_port: u16,
    unreliable_ipv4_port: u16,
    unreliable_ipv6_port: u16,
    flags: EnableFlags,
    advertised: HashSet<String>,
    advertised_quietly: HashSet<String>,
    finds: Vec<FindEntry>,
    next_retransmit: Option<Instant>,
}

struct Shared {
    guid: Guid,
    loopback: bool,
    transports: Mutex<HashMap<u16, TransportState>>,
    retries: Mutex<Vec<RetryEntry>>,
    remotes: Mutex<HashMap<(u16, Guid), RemoteEntry>>,
    subscribers: Mutex<HashMap<u16, broadcast::Sender<DiscoveryEvent>>>,
    timers: Mutex<Timers>,
    state: Mutex<EngineState>,
    suspended: Mutex<bool>,
    wake: Notify,
    interfaces: Arc<Monitor>,
}

/// The name-service engine's public contract (§4.3.1).
pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

fn require_single_transport(mask: u16) -> Result<()> {
    if mask.count_ones() != 1 {
        return Err(Error::InvalidArgument(format!(
            "transport mask {mask:#06x} must select exactly one transport"
        )));
    }
    Ok(())
}

impl Engine {
    /// Construct an engine for `guid`. `loopback` makes the engine deliver
    /// its own transmissions back to itself, for single-process testing.
    pub fn init(guid: Guid, loopback: bool) -> Arc<Engine> {
        let shared = Arc::new(Shared {
            guid,
            loopback,
            transports: Mutex::new(HashMap::new()),
            retries: Mutex::new(Vec::new()),
            remotes: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            timers: Mutex::new(Timers::default()),
            state: Mutex::new(EngineState::Initializing),
            suspended: Mutex::new(false),
            wake: Notify::new(),
            interfaces: Arc::new(Monitor::new()),
        });
        Arc::new(Engine {
            shared,
            worker: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn guid(&self) -> Guid {
        self.shared.guid
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock().unwrap()
    }

    /// Advance `Initializing` → `Running` and spawn the worker task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != EngineState::Initializing {
                return Ok(());
            }
            *state = EngineState::Running;
        }

        let reconcile_handle = tokio::spawn(self.shared.interfaces.clone().run());
        let netlink_handle = {
            let interfaces = self.shared.interfaces.clone();
            tokio::spawn(async move {
                if let Err(e) = interfaces.watch_netlink().await {
                    warn!(error = %e, "netlink watcher exited");
                }
            })
        };
        let worker_handle = tokio::spawn(run_worker(self.shared.clone()));

        *self.worker.lock().unwrap() = Some(worker_handle);
        *self.background.lock().unwrap() = vec![reconcile_handle, netlink_handle];
        Ok(())
    }

    /// Advance `Running` → `Stopping`, sending the terminal burst (§4.3.3,
    /// property 3) synchronously before returning.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != EngineState::Running {
                return Ok(());
            }
            *state = EngineState::Stopping;
        }

        let bursts: Vec<(u16, Vec<String>)> = {
            let transports = self.shared.transports.lock().unwrap();
            transports
                .iter()
                .filter_map(|(&transport, state)| {
                    let mut names: Vec<String> = state.advertised.iter().cloned().collect();
                    names.extend(state.advertised_quietly.iter().cloned());
                    (!names.is_empty()).then_some((transport, names))
                })
                .collect()
        };

        for (transport, names) in bursts {
            let message = NsMessage::new(
                vec![],
                vec![IsAt {
                    transport_mask: transport,
                    complete: true,
                    ttl: 0,
                    guid: self.shared.guid,
                    reliable_ipv4: None,
                    reliable_ipv6: None,
                    unreliable_ipv4: None,
                    unreliable_ipv6: None,
                    names,
                }],
            );
            send_active(&self.shared, transport, &message).await;
        }
        Ok(())
    }

    /// Block until the worker has observed `Stopping` and exited, then
    /// advance to `Shutdown`.
    pub async fn join(&self) -> Result<()> {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        *self.shared.state.lock().unwrap() = EngineState::Shutdown;
        Ok(())
    }

    /// Process suspend (§4.3.4 step 1): release every live socket immediately
    /// and have the worker skip queue/socket work until [`resume`](Self::resume).
    pub fn suspend(&self) {
        *self.shared.suspended.lock().unwrap() = true;
        self.shared.interfaces.suspend();
        self.shared.wake.notify_one();
    }

    /// Undo [`suspend`](Self::suspend): the worker reconciles interfaces and
    /// resumes normal queue/socket processing on its next tick.
    pub fn resume(&self) {
        *self.shared.suspended.lock().unwrap() = false;
        self.shared.interfaces.resume();
        self.shared.wake.notify_one();
    }

    /// Tell the engine which ports `transport` listens on.
    #[allow(clippy::too_many_arguments)]
    pub async fn enable(
        &self,
        transport: u16,
        reliable_ipv4_port: u16,
        reliable_ipv6_port: u16,
        unreliable_ipv4_port: u16,
        unreliable_ipv6_port: u16,
        flags: EnableFlags,
    ) -> Result<()> {
        require_single_transport(transport)?;
        {
            let mut transports = self.shared.transports.lock().unwrap();
            let state = transports.entry(transport).or_default();
            state.reliable_ipv4_port = reliable_ipv4_port;
            state.reliable_ipv6_port = reliable_ipv6_port;
            state.unreliable_ipv4_port = unreliable_ipv4_port;
            state.unreliable_ipv6_port = unreliable_ipv6_port;
            state.flags = flags;
        }
        self.shared.interfaces.open(transport, None, None);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Express interest in `pattern` on `transport`.
    pub async fn find_advertised_name(
        &self,
        transport: u16,
        pattern: &str,
        policy: FindPolicy,
    ) -> Result<()> {
        require_single_transport(transport)?;
        {
            let mut transports = self.shared.transports.lock().unwrap();
            let state = transports.entry(transport).or_default();
            state.finds.push(FindEntry {
                pattern: pattern.to_string(),
                policy,
            });
        }
        {
            let retries_left = self.shared.timers.lock().unwrap().retries + 1;
            self.shared.retries.lock().unwrap().push(RetryEntry {
                transport,
                pattern: pattern.to_string(),
                policy,
                deadline: Instant::now(),
                retries_left,
            });
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Withdraw a previously registered find (added, §4.3.1).
    pub async fn cancel_find(&self, transport: u16, pattern: &str) -> Result<()> {
        require_single_transport(transport)?;
        if let Some(state) = self.shared.transports.lock().unwrap().get_mut(&transport) {
            state.finds.retain(|f| f.pattern != pattern);
        }
        self.shared
            .retries
            .lock()
            .unwrap()
            .retain(|r| !(r.transport == transport && r.pattern == pattern));
        Ok(())
    }

    /// Add `names` to the advertised set for `transport`.
    pub async fn advertise(&self, transport: u16, names: Vec<String>, quietly: bool) -> Result<()> {
        require_single_transport(transport)?;
        {
            let mut transports = self.shared.transports.lock().unwrap();
            let state = transports.entry(transport).or_default();
            if quietly {
                state.advertised_quietly.extend(names);
            } else {
                state.advertised.extend(names);
                state.next_retransmit = Some(Instant::now());
            }
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Remove `names` from both advertised sets for `transport`.
    pub async fn cancel_advertise(&self, transport: u16, names: &[String]) -> Result<()> {
        require_single_transport(transport)?;
        if let Some(state) = self.shared.transports.lock().unwrap().get_mut(&transport) {
            for name in names {
                state.advertised.remove(name);
                state.advertised_quietly.remove(name);
            }
        }
        Ok(())
    }

    /// Subscribe to found/lost notifications for `transport`. The callback
    /// runs in its own task, draining a broadcast channel the worker
    /// publishes to after releasing its locks (§5).
    pub fn set_callback<F>(&self, transport: u16, callback: F)
    where
        F: Fn(DiscoveryEvent) + Send + 'static,
    {
        let mut receiver = {
            let mut subscribers = self.shared.subscribers.lock().unwrap();
            let sender = subscribers
                .entry(transport)
                .or_insert_with(|| broadcast::channel(64).0);
            sender.subscribe()
        };
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Drop every subscription; their tasks exit on the next channel close.
    pub fn clear_callbacks(&self) {
        self.shared.subscribers.lock().unwrap().clear();
    }

    /// Override the default timing constants (§4.3.2).
    pub fn set_critical_parameters(&self, timers: Timers) {
        *self.shared.timers.lock().unwrap() = timers;
    }

    /// Request an interface/transport pairing from the underlying monitor
    /// (C2), without waiting for the next reconciliation.
    pub fn open_interface(&self, transport_mask: u16, name: Option<String>, address: Option<IpAddr>) {
        self.shared.interfaces.open(transport_mask, name, address);
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.wake.notified() => {}
        }

        if *shared.state.lock().unwrap() == EngineState::Stopping {
            break;
        }

        if *shared.suspended.lock().unwrap() {
            shared.interfaces.suspend();
            continue;
        }

        drain_retries(&shared).await;
        drain_retransmits(&shared).await;
        probe_silent_remotes(&shared).await;
        poll_sockets(&shared).await;
        evict_stale_remotes(&shared).await;
    }
}

async fn drain_retries(shared: &Arc<Shared>) {
    let now = Instant::now();
    let interval = Duration::from_secs(shared.timers.lock().unwrap().retry_interval_secs);

    let due: Vec<(u16, String)> = {
        let mut retries = shared.retries.lock().unwrap();
        let mut due = Vec::new();
        for entry in retries.iter_mut() {
            if entry.deadline <= now && entry.retries_left > 0 {
                due.push((entry.transport, entry.pattern.clone()));
                entry.retries_left -= 1;
                entry.deadline = now + interval;
            }
        }
        retries.retain(|e| e.retries_left > 0);
        due
    };

    for (transport, pattern) in due {
        let message = NsMessage::new(
            vec![WhoHas {
                transport_mask: transport,
                ipv4: true,
                ipv6: true,
                reliable: true,
                unreliable: true,
                names: vec![pattern],
            }],
            vec![],
        );
        send_active(shared, transport, &message).await;
    }
}

async fn drain_retransmits(shared: &Arc<Shared>) {
    let now = Instant::now();
    let timers = *shared.timers.lock().unwrap();

    let due: Vec<(u16, Vec<String>)> = {
        let mut transports = shared.transports.lock().unwrap();
        let mut due = Vec::new();
        for (&transport, state) in transports.iter_mut() {
            if state.advertised.is_empty() {
                continue;
            }
            let is_due = state.next_retransmit.is_some_and(|t| t <= now);
            if is_due {
                let mut names: Vec<String> = state.advertised.iter().cloned().collect();
                names.extend(state.advertised_quietly.iter().cloned());
                due.push((transport, names));
                state.next_retransmit = Some(now + Duration::from_secs(timers.retransmit_secs));
            }
        }
        due
    };

    for (transport, names) in due {
        let message = NsMessage::new(
            vec![],
            vec![IsAt {
                transport_mask: transport,
                complete: true,
                ttl: timers.duration,
                guid: shared.guid,
                reliable_ipv4: None,
                reliable_ipv6: None,
                unreliable_ipv4: None,
                unreliable_ipv6: None,
                names,
            }],
        );
        send_active(shared, transport, &message).await;
    }
}

/// Probe remotes that have gone quiet (§4.3.2's `QUESTION`/`QUESTION_MODULUS`
/// pair): once a remote hasn't been heard from for `question_secs`, reissue a
/// WhoHas for its known names every `question_modulus_secs` until it answers
/// (refreshing `last_seen`, §4.3.6) or the full `duration` silence elapses
/// and [`evict_stale_remotes`] reclaims it.
async fn probe_silent_remotes(shared: &Arc<Shared>) {
    let now = Instant::now();
    let (question, modulus) = {
        let timers = shared.timers.lock().unwrap();
        (
            Duration::from_secs(timers.question_secs),
            Duration::from_secs(timers.question_modulus_secs),
        )
    };

    let due: Vec<(u16, Vec<String>)> = {
        let mut remotes = shared.remotes.lock().unwrap();
        let mut due = Vec::new();
        for ((transport, _guid), entry) in remotes.iter_mut() {
            if entry.ttl == DURATION_INFINITE {
                continue;
            }
            if now.duration_since(entry.last_seen) < question {
                continue;
            }
            let should_probe = entry.last_probed.is_none_or(|t| now.duration_since(t) >= modulus);
            if should_probe {
                due.push((*transport, entry.names.iter().cloned().collect()));
                entry.last_probed = Some(now);
            }
        }
        due
    };

    for (transport, names) in due {
        if names.is_empty() {
            continue;
        }
        let message = NsMessage::new(
            vec![WhoHas {
                transport_mask: transport,
                ipv4: true,
                ipv6: true,
                reliable: true,
                unreliable: true,
                names,
            }],
            vec![],
        );
        send_active(shared, transport, &message).await;
    }
}

/// Send `message` out every live interface whose transport bit overlaps
/// `transport`, rewriting IsAt address fields per §4.3.7 and deduplicating
/// IPv4 sends across interfaces the same-network check considers identical
/// (the accepted false-positive tradeoff documented alongside
/// [`same_network`]).
async fn send_active(shared: &Arc<Shared>, transport: u16, message: &NsMessage) {
    let ports = {
        let transports = shared.transports.lock().unwrap();
        transports.get(&transport).map(|s| {
            (
                s.reliable_ipv4_port,
                s.reliable_ipv6_port,
                s.unreliable_ipv4_port,
                s.unreliable_ipv6_port,
                s.flags,
            )
        })
    };
    let Some((r4, r6, u4, u6, flags)) = ports else {
        return;
    };

    let mut sent_v4_subnets: Vec<(Ipv4Addr, u8)> = Vec::new();

    for (mask, addr, prefix_len, socket) in shared.interfaces.live_sockets() {
        if mask & transport == 0 {
            continue;
        }
        if let IpAddr::V4(v4) = addr
            && sent_v4_subnets
                .iter()
                .any(|(seen, seen_prefix)| same_network(v4, prefix_len, *seen, *seen_prefix))
        {
            continue;
        }

        let rewritten = rewrite_is_at_addresses(message, addr, r4, r6, u4, u6, flags);
        for chunk in split_to_fit(&rewritten) {
            match chunk.encode() {
                Ok(bytes) => {
                    let dest = match addr {
                        IpAddr::V4(_) => {
                            SocketAddr::new(IpAddr::V4(iface::NS_IPV4_MULTICAST_GROUP), iface::NS_MULTICAST_PORT)
                        }
                        IpAddr::V6(_) => {
                            SocketAddr::new(IpAddr::V6(iface::NS_IPV6_MULTICAST_GROUP), iface::NS_MULTICAST_PORT)
                        }
                    };
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        warn!(error = %e, "name-service send failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outgoing name-service message"),
            }
        }

        if let IpAddr::V4(v4) = addr {
            sent_v4_subnets.push((v4, prefix_len));
        }
    }
}

fn rewrite_is_at_addresses(
    message: &NsMessage,
    addr: IpAddr,
    r4: u16,
    r6: u16,
    u4: u16,
    u6: u16,
    flags: EnableFlags,
) -> NsMessage {
    let mut out = message.clone();
    for is_at in out.is_at.iter_mut() {
        is_at.reliable_ipv4 = None;
        is_at.reliable_ipv6 = None;
        is_at.unreliable_ipv4 = None;
        is_at.unreliable_ipv6 = None;
        match addr {
            IpAddr::V4(v4) if flags.ipv4 => {
                if r4 != 0 {
                    is_at.reliable_ipv4 = Some((v4, r4));
                }
                if u4 != 0 {
                    is_at.unreliable_ipv4 = Some((v4, u4));
                }
            }
            IpAddr::V6(v6) if flags.ipv6 => {
                if r6 != 0 {
                    is_at.reliable_ipv6 = Some((v6, r6));
                }
                if u6 != 0 {
                    is_at.unreliable_ipv6 = Some((v6, u6));
                }
            }
            _ => {}
        }
    }
    out
}

/// Split a message that doesn't fit [`NS_MESSAGE_MAX`] into several that do
/// (S6). Each IsAt's name list is chunked to a conservative byte budget;
/// WhoHas records (always short: one pattern) are never split.
fn split_to_fit(message: &NsMessage) -> Vec<NsMessage> {
    if message.encode().is_ok() {
        return vec![message.clone()];
    }

    let mut out = Vec::new();
    for is_at in &message.is_at {
        let mut remaining: Vec<String> = is_at.names.clone();
        while !remaining.is_empty() {
            let mut budget_names = Vec::new();
            let mut size = 32usize;
            while let Some(name) = remaining.first() {
                let needed = 1 + name.len();
                if size + needed > NS_MESSAGE_MAX - 32 && !budget_names.is_empty() {
                    break;
                }
                budget_names.push(remaining.remove(0));
                size += needed;
            }
            let mut piece = is_at.clone();
            piece.names = budget_names;
            out.push(NsMessage::new(vec![], vec![piece]));
        }
    }
    for who_has in &message.who_has {
        out.push(NsMessage::new(vec![who_has.clone()], vec![]));
    }
    out
}

async fn poll_sockets(shared: &Arc<Shared>) {
    for (mask, addr, _prefix_len, socket) in shared.interfaces.live_sockets() {
        let mut buf = vec![0u8; NS_MESSAGE_MAX];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Ok(message) = NsMessage::decode(&buf[..n]) {
                        handle_incoming(shared, mask, addr, &socket, from, message).await;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "name-service recv failed");
                    break;
                }
            }
        }
    }
}

async fn handle_incoming(
    shared: &Arc<Shared>,
    iface_mask: u16,
    local_addr: IpAddr,
    socket: &UdpSocket,
    from: SocketAddr,
    message: NsMessage,
) {
    if !message.who_has.is_empty() {
        respond_to_who_has(shared, iface_mask, local_addr, socket, from, &message.who_has).await;
    }
    for is_at in message.is_at {
        if !shared.loopback && is_at.guid == shared.guid {
            continue;
        }
        record_is_at(shared, iface_mask, is_at);
    }
}

async fn respond_to_who_has(
    shared: &Arc<Shared>,
    iface_mask: u16,
    local_addr: IpAddr,
    socket: &UdpSocket,
    from: SocketAddr,
    who_has_list: &[WhoHas],
) {
    let duration = shared.timers.lock().unwrap().duration;

    let answers: Vec<IsAt> = {
        let transports = shared.transports.lock().unwrap();
        let mut answers = Vec::new();
        for who_has in who_has_list {
            for (&transport, state) in transports.iter() {
                if who_has.transport_mask & transport == 0 || iface_mask & transport == 0 {
                    continue;
                }
                let mut matched: Vec<String> = Vec::new();
                for pattern in &who_has.names {
                    for name in state.advertised.iter().chain(state.advertised_quietly.iter()) {
                        if glob::matches(pattern, name) && !matched.contains(name) {
                            matched.push(name.clone());
                        }
                    }
                }
                if matched.is_empty() {
                    continue;
                }
                answers.push(IsAt {
                    transport_mask: transport,
                    complete: true,
                    ttl: duration,
                    guid: shared.guid,
                    reliable_ipv4: match local_addr {
                        IpAddr::V4(v4) if state.reliable_ipv4_port != 0 => Some((v4, state.reliable_ipv4_port)),
                        _ => None,
                    },
                    reliable_ipv6: match local_addr {
                        IpAddr::V6(v6) if state.reliable_ipv6_port != 0 => Some((v6, state.reliable_ipv6_port)),
                        _ => None,
                    },
                    unreliable_ipv4: match local_addr {
                        IpAddr::V4(v4) if state.unreliable_ipv4_port != 0 => Some((v4, state.unreliable_ipv4_port)),
                        _ => None,
                    },
                    unreliable_ipv6: match local_addr {
                        IpAddr::V6(v6) if state.unreliable_ipv6_port != 0 => Some((v6, state.unreliable_ipv6_port)),
                        _ => None,
                    },
                    names: matched,
                });
            }
        }
        answers
    };

    for is_at in answers {
        let message = NsMessage::new(vec![], vec![is_at]);
        if let Ok(bytes) = message.encode()
            && let Err(e) = socket.send_to(&bytes, from).await
        {
            warn!(error = %e, "name-service reply failed");
        }
    }
}

fn record_is_at(shared: &Arc<Shared>, iface_mask: u16, is_at: IsAt) {
    let transport = is_at.transport_mask & iface_mask;
    if transport == 0 {
        return;
    }

    let key = (transport, is_at.guid);
    let now = Instant::now();

    if is_at.is_lost() {
        shared.remotes.lock().unwrap().remove(&key);
    } else {
        let mut remotes = shared.remotes.lock().unwrap();
        let entry = remotes.entry(key).or_insert_with(|| RemoteEntry {
            guid: is_at.guid,
            names: HashSet::new(),
            last_seen: now,
            ttl: is_at.ttl,
            last_probed: None,
        });
        entry.last_seen = now;
        entry.last_probed = None;
        entry.ttl = is_at.ttl;
        entry.names.extend(is_at.names.iter().cloned());
    }

    satisfy_retries(shared, transport, &is_at);
    publish_discovery_events(shared, transport, &is_at);
}

fn satisfy_retries(shared: &Arc<Shared>, transport: u16, is_at: &IsAt) {
    let mut retries = shared.retries.lock().unwrap();
    retries.retain(|entry| {
        if entry.transport != transport {
            return true;
        }
        let any_match = is_at.names.iter().any(|n| glob::matches(&entry.pattern, n));
        match entry.policy {
            FindPolicy::AlwaysRetry => true,
            FindPolicy::RetryUntilPartial => !any_match,
            FindPolicy::RetryUntilComplete => !(any_match && is_at.complete),
        }
    });
}

fn publish_discovery_events(shared: &Arc<Shared>, transport: u16, is_at: &IsAt) {
    let sender = shared.subscribers.lock().unwrap().get(&transport).cloned();
    let Some(sender) = sender else {
        return;
    };

    let mut addresses: Vec<String> = Vec::new();
    if let Some((addr, port)) = is_at.reliable_ipv4 {
        addresses.push(format!("tcp:addr={addr},port={port}"));
    }
    if let Some((addr, port)) = is_at.reliable_ipv6 {
        addresses.push(format!("tcp:addr={addr},port={port},family=ipv6"));
    }
    if let Some((addr, port)) = is_at.unreliable_ipv4 {
        addresses.push(format!("udp:addr={addr},port={port}"));
    }
    if let Some((addr, port)) = is_at.unreliable_ipv6 {
        addresses.push(format!("udp:addr={addr},port={port},family=ipv6"));
    }
    if addresses.is_empty() {
        addresses.push(format!("null:guid={}", is_at.guid));
    }

    for bus_address in addresses {
        let _ = sender.send(DiscoveryEvent {
            bus_address,
            guid: is_at.guid,
            names: is_at.names.clone(),
            ttl: is_at.ttl,
        });
    }
}

async fn evict_stale_remotes(shared: &Arc<Shared>) {
    let duration = Duration::from_secs(shared.timers.lock().unwrap().duration as u64);
    let now = Instant::now();

    let expired: Vec<(u16, RemoteEntry)> = {
        let mut remotes = shared.remotes.lock().unwrap();
        let stale_keys: Vec<(u16, Guid)> = remotes
            .iter()
            .filter(|(_, entry)| {
                entry.ttl != DURATION_INFINITE && now.duration_since(entry.last_seen) > duration
            })
            .map(|(k, _)| *k)
            .collect();
        stale_keys
            .into_iter()
            .filter_map(|key| remotes.remove(&key).map(|entry| (key.0, entry)))
            .collect()
    };

    for (transport, entry) in expired {
        publish_discovery_events(
            shared,
            transport,
            &IsAt {
                transport_mask: transport,
                complete: true,
                ttl: 0,
                guid: entry.guid,
                reliable_ipv4: None,
                reliable_ipv6: None,
                unreliable_ipv4: None,
                unreliable_ipv6: None,
                names: entry.names.into_iter().collect(),
            },
        );
    }
}

/// Whether two IPv4 addresses are on the same subnet, comparing address bits
/// under the longer of the two prefix lengths. Interface index is not
/// consulted: two distinct private networks that happen to use the same
/// address range are accepted as a false positive here, matching the
/// original implementation's documented tradeoff (§9, open question a).
pub fn same_network(a: Ipv4Addr, a_prefix: u8, b: Ipv4Addr, b_prefix: u8) -> bool {
    let prefix = a_prefix.max(b_prefix).min(32);
    let mask: u32 = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_multi_bit_transport_masks() {
        assert!(require_single_transport(0x0003).is_err());
        assert!(require_single_transport(0x0001).is_ok());
        assert!(require_single_transport(0x0000).is_err());
    }

    #[test]
    fn same_network_matches_under_longer_prefix() {
        let a = Ipv4Addr::new(192, 168, 1, 5);
        let b = Ipv4Addr::new(192, 168, 1, 200);
        assert!(same_network(a, 24, b, 24));
        assert!(!same_network(a, 24, Ipv4Addr::new(192, 168, 2, 5), 24));
    }

    #[test]
    fn same_network_accepts_duplicate_private_subnets() {
        // Two genuinely distinct private networks that happen to reuse the
        // same RFC1918 block: the documented false positive.
        let a = Ipv4Addr::new(192, 168, 1, 5);
        let b = Ipv4Addr::new(192, 168, 1, 200);
        assert!(same_network(a, 24, b, 24));
    }

    #[tokio::test]
    async fn enable_requires_single_transport_bit() {
        let engine = Engine::init(Guid::generate(), true);
        let err = engine
            .enable(0x0003, 9955, 0, 0, 0, EnableFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn find_advertised_name_queues_a_retry_entry() {
        let engine = Engine::init(Guid::generate(), true);
        engine
            .find_advertised_name(0x0001, "org.example.*", FindPolicy::AlwaysRetry)
            .await
            .unwrap();
        assert_eq!(engine.shared.retries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_find_removes_the_retry_entry() {
        let engine = Engine::init(Guid::generate(), true);
        engine
            .find_advertised_name(0x0001, "org.example.*", FindPolicy::AlwaysRetry)
            .await
            .unwrap();
        engine.cancel_find(0x0001, "org.example.*").await.unwrap();
        assert!(engine.shared.retries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn advertise_then_cancel_clears_the_name() {
        let engine = Engine::init(Guid::generate(), true);
        engine
            .advertise(0x0001, vec!["org.example.svc".into()], false)
            .await
            .unwrap();
        {
            let transports = engine.shared.transports.lock().unwrap();
            assert!(transports[&0x0001].advertised.contains("org.example.svc"));
        }
        engine
            .cancel_advertise(0x0001, &["org.example.svc".to_string()])
            .await
            .unwrap();
        let transports = engine.shared.transports.lock().unwrap();
        assert!(!transports[&0x0001].advertised.contains("org.example.svc"));
    }

    #[tokio::test]
    async fn terminal_burst_sends_ttl_zero_for_every_advertised_name() {
        let engine = Engine::init(Guid::generate(), true);
        engine
            .advertise(0x0001, vec!["org.example.svc".into()], false)
            .await
            .unwrap();
        // No live sockets in this test, so stop() just needs to complete
        // without panicking while computing the burst.
        assert!(engine.start().await.is_ok());
        assert!(engine.stop().await.is_ok());
        assert_eq!(engine.state(), EngineState::Stopping);
        engine.join().await.unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
    }

    #[tokio::test]
    async fn silent_remote_is_probed_once_the_question_window_opens() {
        let engine = Engine::init(Guid::generate(), true);
        engine.set_critical_parameters(Timers {
            question_secs: 0,
            question_modulus_secs: 0,
            ..Timers::default()
        });

        let key = (0x0001u16, Guid::generate());
        {
            let mut remotes = engine.shared.remotes.lock().unwrap();
            remotes.insert(
                key,
                RemoteEntry {
                    guid: key.1,
                    names: ["org.example.svc".to_string()].into_iter().collect(),
                    last_seen: Instant::now() - Duration::from_secs(1),
                    ttl: 120,
                    last_probed: None,
                },
            );
        }

        probe_silent_remotes(&engine.shared).await;

        let remotes = engine.shared.remotes.lock().unwrap();
        assert!(remotes.get(&key).unwrap().last_probed.is_some());
    }

    #[tokio::test]
    async fn infinite_ttl_remote_is_never_probed() {
        let engine = Engine::init(Guid::generate(), true);
        engine.set_critical_parameters(Timers {
            question_secs: 0,
            question_modulus_secs: 0,
            ..Timers::default()
        });

        let key = (0x0001u16, Guid::generate());
        {
            let mut remotes = engine.shared.remotes.lock().unwrap();
            remotes.insert(
                key,
                RemoteEntry {
                    guid: key.1,
                    names: ["org.example.svc".to_string()].into_iter().collect(),
                    last_seen: Instant::now() - Duration::from_secs(1),
                    ttl: DURATION_INFINITE,
                    last_probed: None,
                },
            );
        }

        probe_silent_remotes(&engine.shared).await;

        let remotes = engine.shared.remotes.lock().unwrap();
        assert!(remotes.get(&key).unwrap().last_probed.is_none());
    }

    #[tokio::test]
    async fn suspend_sets_the_flag_and_releases_sockets() {
        let engine = Engine::init(Guid::generate(), true);
        engine.start().await.unwrap();

        engine.suspend();
        assert!(*engine.shared.suspended.lock().unwrap());
        assert!(engine.shared.interfaces.live_snapshot().is_empty());

        engine.resume();
        assert!(!*engine.shared.suspended.lock().unwrap());

        engine.stop().await.unwrap();
        engine.join().await.unwrap();
    }

    #[tokio::test]
    async fn worker_skips_maintenance_while_suspended() {
        let engine = Engine::init(Guid::generate(), true);
        engine.set_critical_parameters(Timers {
            retries: 0,
            retry_interval_secs: 0,
            ..Timers::default()
        });
        engine.start().await.unwrap();

        engine.suspend();
        engine
            .find_advertised_name(0x0001, "org.example.*", FindPolicy::AlwaysRetry)
            .await
            .unwrap();

        // Give the worker a few ticks to run while suspended; the retry
        // queue must still hold the entry since maintenance is skipped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.shared.retries.lock().unwrap().len(), 1);

        engine.resume();
        engine.stop().await.unwrap();
        engine.join().await.unwrap();
    }
}
