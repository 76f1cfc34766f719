//! Minimal RTNetlink plumbing used by the interface monitor.
//!
//! Just enough to receive `NEWLINK`/`DELLINK`/`NEWADDR`/`DELADDR`
//! notifications on the routing multicast groups and decode their
//! `{ifindex, flags}` / `{ifindex, family, address, prefix_len}` payloads.
//! General-purpose netlink configuration (routes, qdiscs, rules, ...) is
//! out of scope here; [`crate::iface`] is the only consumer.

pub mod attr;
mod error;
pub mod message;
mod socket;

pub use attr::{AttrIter, NlAttr};
pub use error::{Error, Result};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgHdr, NlMsgType};
pub use socket::{NetlinkSocket, Protocol, rtnetlink_groups};
