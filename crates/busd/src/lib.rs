//! Daemon core for a link-local service bus: discovery, rule-based routing,
//! and the bundled-router lifecycle.
//!
//! This crate implements the pieces of a proximal peer-to-peer message bus
//! that do the real work: a UDP-multicast name service for discovering and
//! advertising well-known names on the local network, a DBus-style match-rule
//! table that drives message fan-out, and the bootstrap sequence that brings
//! up an in-process router when no external one can be reached.
//!
//! # Example
//!
//! ```no_run
//! use busd::guid::Guid;
//! use busd::ns::{Engine, FindPolicy};
//!
//! # async fn run() -> busd::Result<()> {
//! let guid = Guid::persistent("/var/lib/busd")?;
//! let engine = Engine::init(guid, false);
//! engine.enable(0x0001, 9955, 0, 0, 0, Default::default()).await?;
//! engine.advertise(0x0001, vec!["org.example.svc".into()], false).await?;
//! engine.find_advertised_name(0x0001, "org.example.*", FindPolicy::AlwaysRetry).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Rule matching
//!
//! ```
//! use busd::rules::Rule;
//!
//! let rule = Rule::parse("type='signal',interface='org.example',member='Foo'").unwrap();
//! assert_eq!(rule.interface.as_deref(), Some("org.example"));
//! ```

pub mod bundled;
pub mod config;
pub mod error;
pub mod guid;
pub mod iface;
mod netlink;
pub mod ns;
pub mod router;
pub mod rules;
pub mod transport;
pub mod util;
mod wire;

pub use error::{Error, Result};
pub use guid::Guid;
pub use rules::{Rule, RuleTable};
pub use wire::{IsAt, NsHeader, NsMessage, WhoHas, NS_MESSAGE_MAX};
