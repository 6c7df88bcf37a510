//! Cluster membership and the consistent-hash ring built from it.

pub mod events;
pub mod hashring;
pub mod memberlist_membership;
pub mod notify;
pub mod provider;
pub mod ring;

pub use events::{Member, MemberStatus, MembershipEvent};
pub use hashring::HashRing;
pub use memberlist_membership::MemberlistMembership;
pub use notify::CoalescingNotifier;
pub use provider::{MembershipProvider, StaticMembership};
pub use ring::{MemberInfo, MembershipRing, PeerFactory, RingSnapshot};
