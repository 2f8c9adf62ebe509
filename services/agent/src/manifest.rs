//! Desired-state manifest.
//!
//! ```toml
//! [[server]]
//! id = "srv-web-1"
//! tags = { env = "prod" }
//!
//! [[server.disk]]
//! scsi_unit_id = 0
//! size_gb = 50
//!
//! [[server.network_adapter]]
//! index = 0
//! vlan_id = "vlan-frontend"
//!
//! [[network_domain]]
//! id = "nd-prod"
//!
//! [[network_domain.firewall_rule]]
//! name = "allow-https"
//! action = "ACCEPT"
//! protocol = "TCP"
//! destination_port = 443
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use stratus_id::OwnerId;
use stratus_reconcile::kinds::{DesiredAdapter, DesiredDisk, DesiredRule, DesiredTag};
use stratus_reconcile::Owner;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerManifest>,

    #[serde(default, rename = "network_domain")]
    pub network_domains: Vec<NetworkDomainManifest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerManifest {
    pub id: OwnerId,

    #[serde(default, rename = "disk")]
    pub disks: Vec<DesiredDisk>,

    #[serde(default, rename = "network_adapter")]
    pub network_adapters: Vec<DesiredAdapter>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDomainManifest {
    pub id: OwnerId,

    #[serde(default, rename = "firewall_rule")]
    pub firewall_rules: Vec<DesiredRule>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ServerManifest {
    pub fn owner(&self) -> Owner {
        Owner::server(self.id.clone())
    }

    pub fn tags(&self) -> Vec<DesiredTag> {
        desired_tags(&self.tags)
    }
}

impl NetworkDomainManifest {
    pub fn owner(&self) -> Owner {
        Owner::network_domain(self.id.clone())
    }

    pub fn tags(&self) -> Vec<DesiredTag> {
        desired_tags(&self.tags)
    }
}

fn desired_tags(tags: &BTreeMap<String, String>) -> Vec<DesiredTag> {
    tags.iter()
        .map(|(name, value)| DesiredTag {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

impl Manifest {
    /// Parse a manifest from TOML.
    pub fn parse(contents: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(contents).context("invalid manifest TOML")?;
        manifest.check_unique_owners()?;
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to load manifest: {}", path.display()))
    }

    /// Number of owners declared.
    pub fn owner_count(&self) -> usize {
        self.servers.len() + self.network_domains.len()
    }

    fn check_unique_owners(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        let ids = self
            .servers
            .iter()
            .map(|s| &s.id)
            .chain(self.network_domains.iter().map(|d| &d.id));
        for id in ids {
            if !seen.insert(id.as_str()) {
                anyhow::bail!("owner '{id}' is declared more than once");
            }
        }
        Ok(())
    }
}
