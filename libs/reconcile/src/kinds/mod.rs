//! Sub-resource kinds supported by the engine.

mod disk;
mod firewall_rule;
mod network_adapter;
mod tag;

pub use disk::{DesiredDisk, Disk, DiskSpeed, DiskUpdate, ObservedDisk};
pub use firewall_rule::{DesiredRule, FirewallRule, ObservedRule, Protocol, RuleAction};
pub use network_adapter::{
    AdapterType, AdapterUpdate, DesiredAdapter, NetworkAdapter, ObservedAdapter,
};
pub use tag::{DesiredTag, ObservedTag, Tag};

use crate::api::{CollectionApi, PowerApi};

/// A control plane that serves every supported kind.
pub trait ControlPlane:
    PowerApi
    + CollectionApi<Disk>
    + CollectionApi<NetworkAdapter>
    + CollectionApi<Tag>
    + CollectionApi<FirewallRule>
{
}

impl<T> ControlPlane for T where
    T: PowerApi
        + CollectionApi<Disk>
        + CollectionApi<NetworkAdapter>
        + CollectionApi<Tag>
        + CollectionApi<FirewallRule>
        + ?Sized
{
}
