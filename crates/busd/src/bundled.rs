//! Bundled router launcher (C6).
//!
//! When a client library can't reach an external router, it falls back to
//! one embedded in its own process, reached via the null transport (C7).
//! Exactly one [`Bus`] is ever alive at a time, shared by every concurrent
//! connect attempt; the launcher tracks which null transports are plugged
//! into it and tears the bus down once the last one disconnects.
//!
//! The original links this launcher in via a file-scope static whose
//! constructor reaches for a process-global transport registry. This
//! rewrite replaces that with an explicit, once-guarded [`bootstrap`],
//! called by whatever wires up the null transport with the registry passed
//! in rather than reached for globally (§9, §4.6).

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::guid::Guid;
use crate::transport::{Bus, BusController, NullTransport, RouterLauncherRegistry};

/// Busy-wait granularity while a `start` call waits out a draining `stop`.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

static INSTANCE: OnceLock<Arc<BundledRouterLauncher>> = OnceLock::new();

struct State {
    bus: Option<Arc<Bus>>,
    controller: Option<Arc<BusController>>,
    draining: bool,
}

/// The process-wide bundled-router singleton.
pub struct BundledRouterLauncher {
    guid: Guid,
    config: DaemonConfig,
    transports: Mutex<Vec<Arc<dyn NullTransport>>>,
    state: Mutex<State>,
}

impl BundledRouterLauncher {
    fn new(guid: Guid, config: DaemonConfig) -> Self {
        Self {
            guid,
            config,
            transports: Mutex::new(Vec::new()),
            state: Mutex::new(State {
                bus: None,
                controller: None,
                draining: false,
            }),
        }
    }

    /// Obtain the process-wide launcher, registering it with `registry` the
    /// first time this is called. Subsequent calls return the same
    /// instance without touching `registry` again.
    pub fn bootstrap(
        guid: Guid,
        config: DaemonConfig,
        registry: &dyn RouterLauncherRegistry,
    ) -> Arc<BundledRouterLauncher> {
        INSTANCE
            .get_or_init(|| {
                let launcher = Arc::new(BundledRouterLauncher::new(guid, config));
                registry.register_router_launcher(launcher.clone());
                launcher
            })
            .clone()
    }

    /// Called by a null transport when the client it serves can't reach an
    /// external router. Waits out any in-progress drain, then either joins
    /// the existing bus or constructs a fresh one, and splices `transport`
    /// to it.
    pub async fn start(&self, transport: Arc<dyn NullTransport>) -> Result<Arc<Bus>> {
        loop {
            if !self.state.lock().unwrap().draining {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let (bus, just_created) = {
            let mut state = self.state.lock().unwrap();
            if let Some(bus) = &state.bus {
                (bus.clone(), false)
            } else {
                let bus = Bus::new(&self.config, self.guid);
                let controller = Arc::new(BusController::new(bus.clone(), self.config.clone()));
                state.bus = Some(bus.clone());
                state.controller = Some(controller);
                (bus, true)
            }
        };

        if just_created {
            info!(guid = %self.guid, "bringing up bundled router");
            let controller = self.state.lock().unwrap().controller.clone().unwrap();
            controller.start().await?;
        }

        self.transports.lock().unwrap().push(transport.clone());
        transport.link_bus(bus.clone());
        Ok(bus)
    }

    /// Called when `transport` no longer needs the bundled router. Once the
    /// last tracked transport has stopped, the router controller is asked
    /// to stop and the launcher enters its draining state.
    pub async fn stop(&self, transport: &Arc<dyn NullTransport>) -> Result<()> {
        let now_empty = {
            let mut transports = self.transports.lock().unwrap();
            transports.retain(|t| !Arc::ptr_eq(t, transport));
            transports.is_empty()
        };

        if now_empty {
            let controller = {
                let mut state = self.state.lock().unwrap();
                state.draining = true;
                state.controller.clone()
            };
            if let Some(controller) = controller {
                debug!("draining bundled router: last null transport disconnected");
                controller.stop().await?;
            }
        }
        Ok(())
    }

    /// Block until a drain initiated by [`stop`](Self::stop) completes, then
    /// delete the bus. A no-op if nothing is draining.
    pub async fn join(&self) {
        loop {
            if self.state.lock().unwrap().draining {
                break;
            }
            if self.state.lock().unwrap().bus.is_none() {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let mut state = self.state.lock().unwrap();
        state.bus = None;
        state.controller = None;
        state.draining = false;
    }
}

impl Drop for BundledRouterLauncher {
    /// Best-effort cleanup net for process exit: disconnects every tracked
    /// null transport. Callers should still `stop`/`join` explicitly — Drop
    /// cannot await the controller's async shutdown.
    fn drop(&mut self) {
        for transport in self.transports.lock().unwrap().drain(..) {
            transport.disconnect("null:");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestRegistry {
        registered: Mutex<Vec<Arc<BundledRouterLauncher>>>,
    }

    impl TestRegistry {
        fn new() -> Self {
            Self {
                registered: Mutex::new(Vec::new()),
            }
        }
    }

    impl RouterLauncherRegistry for TestRegistry {
        fn register_router_launcher(&self, launcher: Arc<BundledRouterLauncher>) {
            self.registered.lock().unwrap().push(launcher);
        }
    }

    struct TestTransport {
        linked: AtomicUsize,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                linked: AtomicUsize::new(0),
            })
        }
    }

    impl NullTransport for TestTransport {
        fn link_bus(&self, _bus: Arc<Bus>) {
            self.linked.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self, _endpoint_spec: &str) {}
    }

    #[tokio::test]
    async fn concurrent_start_calls_share_one_bus() {
        let launcher = Arc::new(BundledRouterLauncher::new(Guid::generate(), DaemonConfig::default()));

        let t1: Arc<dyn NullTransport> = TestTransport::new();
        let t2: Arc<dyn NullTransport> = TestTransport::new();

        let l1 = launcher.clone();
        let t1c = t1.clone();
        let h1 = tokio::spawn(async move { l1.start(t1c).await });

        let l2 = launcher.clone();
        let t2c = t2.clone();
        let h2 = tokio::spawn(async move { l2.start(t2c).await });

        let bus1 = h1.await.unwrap().unwrap();
        let bus2 = h2.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&bus1, &bus2));

        launcher.stop(&t1).await.unwrap();
        assert!(launcher.state.lock().unwrap().bus.is_some());
        launcher.stop(&t2).await.unwrap();
        launcher.join().await;
        assert!(launcher.state.lock().unwrap().bus.is_none());
    }

    #[test]
    fn bootstrap_registers_exactly_once() {
        let registry = TestRegistry::new();
        let a = BundledRouterLauncher::bootstrap(Guid::generate(), DaemonConfig::default(), &registry);
        let b = BundledRouterLauncher::bootstrap(Guid::generate(), DaemonConfig::default(), &registry);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.registered.lock().unwrap().len(), 1);
    }
}
