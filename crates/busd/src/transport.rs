//! Null transport contract (C7).
//!
//! The bundled router launcher (C6) doesn't know how a client library talks
//! to the process it's embedded in; it only needs three operations on
//! whatever in-process link the client side hands it, plus somewhere to
//! register itself so future connect attempts can find it. Both are traits
//! here so C6 has a concrete surface to compile and test against. A real
//! client-library splice (marshalling typed messages across the null
//! transport's in-process queues) is an external collaborator; what's
//! provided here is the minimal `Bus`/`BusController` pair needed to drive
//! the start/stop/join lifecycle end to end.

use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::guid::Guid;
use crate::ns::{Engine, EnableFlags};
use crate::router::Router;

/// The in-process client/router link a bundled router launcher plugs into.
///
/// Implementations deliver messages between the client-library side and the
/// router-core side via in-process queues, never sockets.
pub trait NullTransport: Send + Sync {
    /// Splice this transport to `bus`, making the router reachable from the
    /// client side.
    fn link_bus(&self, bus: Arc<Bus>);

    /// Tear down the in-process link named by `endpoint_spec` (e.g. `"null:"`).
    fn disconnect(&self, endpoint_spec: &str);
}

/// Where a bundled router launcher registers itself, once, so that future
/// null-transport connect attempts route to it instead of each constructing
/// their own router.
pub trait RouterLauncherRegistry: Send + Sync {
    fn register_router_launcher(&self, launcher: Arc<crate::bundled::BundledRouterLauncher>);
}

/// The in-process router instantiated by a bundled launcher: a message
/// router (C5) bound to a name-service engine (C3) advertising/discovering
/// over the interfaces the daemon config selects.
pub struct Bus {
    pub router: Arc<Router>,
    pub engine: Arc<Engine>,
}

impl Bus {
    /// Construct (but do not start) a bus for `config`, identified by `guid`.
    pub fn new(config: &DaemonConfig, guid: Guid) -> Arc<Self> {
        let router = Arc::new(Router::new());
        let engine = Engine::init(guid, false);

        let name = if config.ip_name_service.interfaces == "*" {
            None
        } else {
            Some(config.ip_name_service.interfaces.clone())
        };
        engine.open_interface(0x0001, name, None);

        Arc::new(Self { router, engine })
    }
}

/// Owns a [`Bus`]'s lifecycle: starting its engine, wiring the configured
/// transport ports, and stopping/joining it on request.
pub struct BusController {
    bus: Arc<Bus>,
    config: DaemonConfig,
}

impl BusController {
    pub fn new(bus: Arc<Bus>, config: DaemonConfig) -> Self {
        Self { bus, config }
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    /// Bring the bus's engine up, enabling the configured transport with the
    /// listen ports carried in `config.listen`.
    pub async fn start(&self) -> Result<()> {
        self.bus.engine.start().await?;
        self.bus
            .engine
            .enable(
                0x0001,
                self.config.listen.r4port,
                0,
                0,
                0,
                EnableFlags {
                    ipv4: self.config.ip_name_service.enable_ipv4,
                    ipv6: self.config.ip_name_service.enable_ipv6,
                },
            )
            .await?;
        Ok(())
    }

    /// Stop and join the bus's engine (§4.3.3's `STOPPING` → `SHUTDOWN`).
    pub async fn stop(&self) -> Result<()> {
        self.bus.engine.stop().await?;
        self.bus.engine.join().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct RecordingTransport {
        pub linked: AtomicUsize,
        pub disconnected: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                linked: AtomicUsize::new(0),
                disconnected: Mutex::new(Vec::new()),
            }
        }
    }

    impl NullTransport for RecordingTransport {
        fn link_bus(&self, _bus: Arc<Bus>) {
            self.linked.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self, endpoint_spec: &str) {
            self.disconnected.lock().unwrap().push(endpoint_spec.to_string());
        }
    }

    #[test]
    fn bus_construction_opens_the_configured_interface_selector() {
        let config = DaemonConfig::default();
        let bus = Bus::new(&config, Guid::generate());
        assert_eq!(bus.router.endpoint_count(), 0);
    }
}
