//! Virtual disks attached to a server, keyed by SCSI unit id.
//!
//! Disks can only grow. A disk change may need two control-plane calls:
//! expand first, then change speed.

use std::fmt;

use serde::{Deserialize, Serialize};
use stratus_id::EntityId;

use crate::api::EntityType;
use crate::diff::ActionKind;
use crate::kind::{Completion, SubResource};

/// Storage tier of a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskSpeed {
    #[default]
    #[serde(rename = "STANDARD")]
    Standard,
    #[serde(rename = "HIGHPERFORMANCE")]
    HighPerformance,
    #[serde(rename = "ECONOMY")]
    Economy,
}

impl fmt::Display for DiskSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskSpeed::Standard => f.write_str("STANDARD"),
            DiskSpeed::HighPerformance => f.write_str("HIGHPERFORMANCE"),
            DiskSpeed::Economy => f.write_str("ECONOMY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredDisk {
    pub scsi_unit_id: u32,
    pub size_gb: u64,
    #[serde(default)]
    pub speed: DiskSpeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedDisk {
    pub id: EntityId,
    pub scsi_unit_id: u32,
    pub size_gb: u64,
    pub speed: DiskSpeed,
}

/// One disk update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskUpdate {
    Expand { size_gb: u64 },
    ChangeSpeed { speed: DiskSpeed },
}

impl DesiredDisk {
    /// The next single update that moves `observed` towards `self`.
    ///
    /// Expansion comes before a speed change.
    pub fn next_update(&self, observed: &ObservedDisk) -> Option<DiskUpdate> {
        if self.size_gb > observed.size_gb {
            Some(DiskUpdate::Expand {
                size_gb: self.size_gb,
            })
        } else if self.speed != observed.speed {
            Some(DiskUpdate::ChangeSpeed { speed: self.speed })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disk;

impl SubResource for Disk {
    type Key = u32;
    type Desired = DesiredDisk;
    type Observed = ObservedDisk;

    const NAME: &'static str = "disk";
    const ENTITY_TYPE: EntityType = EntityType::Disk;
    const CHANGE_STEPS: usize = 2;

    fn desired_key(desired: &DesiredDisk) -> u32 {
        desired.scsi_unit_id
    }

    fn observed_key(observed: &ObservedDisk) -> u32 {
        observed.scsi_unit_id
    }

    fn observed_id(observed: &ObservedDisk) -> &EntityId {
        &observed.id
    }

    fn needs_change(desired: &DesiredDisk, observed: &ObservedDisk) -> bool {
        desired.size_gb != observed.size_gb || desired.speed != observed.speed
    }

    fn validate(desired: &DesiredDisk) -> Result<(), String> {
        if desired.size_gb == 0 {
            return Err("size must be greater than 0 GB".to_string());
        }
        Ok(())
    }

    fn check_change(desired: &DesiredDisk, observed: &ObservedDisk) -> Result<(), String> {
        if desired.size_gb < observed.size_gb {
            return Err(format!(
                "cannot resize disk {} from {} GB to {} GB (disks can only be expanded)",
                observed.scsi_unit_id, observed.size_gb, desired.size_gb
            ));
        }
        Ok(())
    }

    fn requires_power_off(_kind: ActionKind) -> bool {
        true
    }

    fn completion(_kind: ActionKind) -> Completion {
        Completion::OwnerChange
    }
}
