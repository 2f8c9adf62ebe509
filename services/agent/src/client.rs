//! HTTP client for the control plane API.
//!
//! Implements the engine's collaborator traits over a JSON REST API:
//! - `GET  /status/{entity_type}/{id}` for change polling
//! - `GET|POST|PUT|DELETE` on the owner's sub-resource collections
//! - `GET /servers/{id}/power`, `POST /servers/{id}/{shutdown,start}`
//!
//! Failed calls return an envelope `{"responseCode": ..., "message": ...}`.
//! `409` / `RESOURCE_BUSY` maps to [`ApiError::Busy`], `404` /
//! `RESOURCE_NOT_FOUND` to [`ApiError::NotFound`], and anything else to
//! [`ApiError::Rejected`].

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stratus_id::EntityId;
use stratus_reconcile::kinds::{
    AdapterType, AdapterUpdate, DesiredAdapter, DesiredDisk, DesiredRule, DesiredTag, Disk,
    DiskSpeed, DiskUpdate, FirewallRule, NetworkAdapter, ObservedAdapter, ObservedDisk,
    ObservedRule, ObservedTag, Protocol, RuleAction, Tag,
};
use stratus_reconcile::{
    ApiError, CollectionApi, EntityStatus, EntityType, Owner, PowerApi, PowerState,
    ProvisioningState, StatusApi,
};
use tracing::{debug, warn};

use crate::config::Config;

/// Control plane API client.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

/// Error envelope returned by the control plane.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEnvelope {
    response_code: String,
    #[serde(default)]
    message: String,
}

/// Body of an accepted create request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedEntity {
    id: EntityId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    id: EntityId,
    state: String,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default)]
    nested: Vec<EntityId>,
}

impl StatusBody {
    fn into_status(self) -> EntityStatus {
        let state = match self.state.as_str() {
            "NORMAL" => ProvisioningState::Normal,
            "FAILED" => ProvisioningState::Failed(
                self.failure_reason
                    .unwrap_or_else(|| "no reason reported".to_string()),
            ),
            _ => ProvisioningState::Pending(self.state),
        };
        EntityStatus {
            id: self.id,
            state,
            nested: self.nested,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PowerBody {
    started: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskBody {
    #[serde(default, skip_serializing)]
    id: Option<EntityId>,
    scsi_unit_id: u32,
    size_gb: u64,
    speed: DiskSpeed,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdapterBody {
    #[serde(default, skip_serializing)]
    id: Option<EntityId>,
    index: u32,
    vlan_id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    adapter_type: Option<AdapterType>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagBody {
    #[serde(default, skip_serializing)]
    id: Option<EntityId>,
    name: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleBody {
    #[serde(default, skip_serializing)]
    id: Option<EntityId>,
    name: String,
    action: RuleAction,
    protocol: Protocol,
    source: String,
    destination: String,
    #[serde(default)]
    destination_port: Option<u16>,
    enabled: bool,
}

impl From<&DesiredRule> for RuleBody {
    fn from(rule: &DesiredRule) -> Self {
        Self {
            id: None,
            name: rule.name.clone(),
            action: rule.action,
            protocol: rule.protocol,
            source: rule.source.clone(),
            destination: rule.destination.clone(),
            destination_port: rule.destination_port,
            enabled: rule.enabled,
        }
    }
}

fn missing_id(kind: &str) -> ApiError {
    ApiError::Malformed(format!("{kind} returned without an id"))
}

impl HttpControlPlane {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        let credentials = config
            .api_user
            .clone()
            .zip(config.api_password.clone());

        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            credentials,
        })
    }

    fn owner_path(owner: &Owner) -> String {
        match owner.entity_type {
            EntityType::NetworkDomain => format!("networkDomains/{}", owner.id),
            _ => format!("servers/{}", owner.id),
        }
    }

    /// Send a request and return the successful response.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(method = %method, url = %url, "Calling control plane");

        let mut request = self.client.request(method, &url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, &body))
    }

    fn classify(status: StatusCode, body: &str) -> ApiError {
        let envelope: Option<ResponseEnvelope> = serde_json::from_str(body).ok();
        let (code, message) = match envelope {
            Some(envelope) => (envelope.response_code, envelope.message),
            None => (status.as_str().to_string(), body.to_string()),
        };

        if status == StatusCode::CONFLICT || code == "RESOURCE_BUSY" {
            return ApiError::Busy(message);
        }
        if status == StatusCode::NOT_FOUND || code == "RESOURCE_NOT_FOUND" {
            return ApiError::NotFound(message);
        }

        warn!(status = %status, code = %code, message = %message, "Control plane rejected request");
        ApiError::Rejected { code, message }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        match self.send::<()>(Method::GET, path, None).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| ApiError::Malformed(e.to_string())),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<EntityId, ApiError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        let created: CreatedEntity = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        Ok(created.id)
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ApiError> {
        self.send(method, path, body).await.map(|_| ())
    }
}

#[async_trait]
impl StatusApi for HttpControlPlane {
    async fn fetch_status(
        &self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<EntityStatus>, ApiError> {
        let kind = serde_json::to_value(entity_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ApiError::Malformed(format!("unknown entity type {entity_type}")))?;
        let body: Option<StatusBody> = self.get_json(&format!("status/{kind}/{id}")).await?;
        Ok(body.map(StatusBody::into_status))
    }
}

#[async_trait]
impl PowerApi for HttpControlPlane {
    async fn power_state(&self, owner: &Owner) -> Result<Option<PowerState>, ApiError> {
        if owner.entity_type != EntityType::Server {
            return Ok(Some(PowerState::Running));
        }
        let body: Option<PowerBody> = self.get_json(&format!("servers/{}/power", owner.id)).await?;
        Ok(body.map(|b| {
            if b.started {
                PowerState::Running
            } else {
                PowerState::Stopped
            }
        }))
    }

    async fn power_off(&self, owner: &Owner) -> Result<(), ApiError> {
        self.call::<()>(Method::POST, &format!("servers/{}/shutdown", owner.id), None)
            .await
    }

    async fn power_on(&self, owner: &Owner) -> Result<(), ApiError> {
        self.call::<()>(Method::POST, &format!("servers/{}/start", owner.id), None)
            .await
    }
}

#[async_trait]
impl CollectionApi<Disk> for HttpControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedDisk>>, ApiError> {
        let path = format!("{}/disks", Self::owner_path(owner));
        let Some(disks) = self.get_json::<Vec<DiskBody>>(&path).await? else {
            return Ok(None);
        };
        disks
            .into_iter()
            .map(|d| {
                Ok(ObservedDisk {
                    id: d.id.ok_or_else(|| missing_id("disk"))?,
                    scsi_unit_id: d.scsi_unit_id,
                    size_gb: d.size_gb,
                    speed: d.speed,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()
            .map(Some)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredDisk) -> Result<EntityId, ApiError> {
        let body = DiskBody {
            id: None,
            scsi_unit_id: desired.scsi_unit_id,
            size_gb: desired.size_gb,
            speed: desired.speed,
        };
        self.create(&format!("{}/disks", Self::owner_path(owner)), &body)
            .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredDisk,
        observed: &ObservedDisk,
    ) -> Result<(), ApiError> {
        let path = format!("{}/disks/{id}", Self::owner_path(owner));
        match desired.next_update(observed) {
            Some(DiskUpdate::Expand { size_gb }) => {
                self.call(
                    Method::POST,
                    &format!("{path}/expand"),
                    Some(&serde_json::json!({ "newSizeGb": size_gb })),
                )
                .await
            }
            Some(DiskUpdate::ChangeSpeed { speed }) => {
                self.call(
                    Method::POST,
                    &format!("{path}/speed"),
                    Some(&serde_json::json!({ "speed": speed })),
                )
                .await
            }
            None => Ok(()),
        }
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        _observed: &ObservedDisk,
    ) -> Result<(), ApiError> {
        let path = format!("{}/disks/{id}", Self::owner_path(owner));
        self.call::<()>(Method::DELETE, &path, None).await
    }
}

#[async_trait]
impl CollectionApi<NetworkAdapter> for HttpControlPlane {
    async fn fetch_observed(
        &self,
        owner: &Owner,
    ) -> Result<Option<Vec<ObservedAdapter>>, ApiError> {
        let path = format!("{}/networkAdapters", Self::owner_path(owner));
        let Some(adapters) = self.get_json::<Vec<AdapterBody>>(&path).await? else {
            return Ok(None);
        };
        adapters
            .into_iter()
            .map(|a| {
                Ok(ObservedAdapter {
                    id: a.id.ok_or_else(|| missing_id("network adapter"))?,
                    index: a.index,
                    vlan_id: a.vlan_id,
                    private_ipv4: a
                        .private_ipv4
                        .ok_or_else(|| ApiError::Malformed("adapter without IPv4 address".into()))?,
                    adapter_type: a
                        .adapter_type
                        .ok_or_else(|| ApiError::Malformed("adapter without type".into()))?,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()
            .map(Some)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredAdapter) -> Result<EntityId, ApiError> {
        let body = AdapterBody {
            id: None,
            index: desired.index,
            vlan_id: desired.vlan_id.clone(),
            private_ipv4: desired.private_ipv4,
            adapter_type: desired.adapter_type,
        };
        self.create(&format!("{}/networkAdapters", Self::owner_path(owner)), &body)
            .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredAdapter,
        observed: &ObservedAdapter,
    ) -> Result<(), ApiError> {
        let path = format!("{}/networkAdapters/{id}", Self::owner_path(owner));
        match desired.next_update(observed) {
            Some(AdapterUpdate::ChangeIpv4 { address }) => {
                self.call(
                    Method::POST,
                    &format!("{path}/ipv4"),
                    Some(&serde_json::json!({ "privateIpv4": address })),
                )
                .await
            }
            Some(AdapterUpdate::ChangeType { adapter_type }) => {
                self.call(
                    Method::POST,
                    &format!("{path}/type"),
                    Some(&serde_json::json!({ "adapterType": adapter_type })),
                )
                .await
            }
            None => Ok(()),
        }
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        _observed: &ObservedAdapter,
    ) -> Result<(), ApiError> {
        let path = format!("{}/networkAdapters/{id}", Self::owner_path(owner));
        self.call::<()>(Method::DELETE, &path, None).await
    }
}

#[async_trait]
impl CollectionApi<Tag> for HttpControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedTag>>, ApiError> {
        let path = format!("{}/tags", Self::owner_path(owner));
        let Some(tags) = self.get_json::<Vec<TagBody>>(&path).await? else {
            return Ok(None);
        };
        tags.into_iter()
            .map(|t| {
                Ok(ObservedTag {
                    id: t.id.ok_or_else(|| missing_id("tag"))?,
                    name: t.name,
                    value: t.value,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()
            .map(Some)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredTag) -> Result<EntityId, ApiError> {
        let body = TagBody {
            id: None,
            name: desired.name.clone(),
            value: desired.value.clone(),
        };
        self.create(&format!("{}/tags", Self::owner_path(owner)), &body)
            .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredTag,
        _observed: &ObservedTag,
    ) -> Result<(), ApiError> {
        let path = format!("{}/tags/{id}", Self::owner_path(owner));
        self.call(
            Method::PUT,
            &path,
            Some(&serde_json::json!({ "value": desired.value })),
        )
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        _observed: &ObservedTag,
    ) -> Result<(), ApiError> {
        let path = format!("{}/tags/{id}", Self::owner_path(owner));
        self.call::<()>(Method::DELETE, &path, None).await
    }
}

#[async_trait]
impl CollectionApi<FirewallRule> for HttpControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedRule>>, ApiError> {
        let path = format!("{}/firewallRules", Self::owner_path(owner));
        let Some(rules) = self.get_json::<Vec<RuleBody>>(&path).await? else {
            return Ok(None);
        };
        rules
            .into_iter()
            .map(|r| {
                Ok(ObservedRule {
                    id: r.id.ok_or_else(|| missing_id("firewall rule"))?,
                    name: r.name,
                    action: r.action,
                    protocol: r.protocol,
                    source: r.source,
                    destination: r.destination,
                    destination_port: r.destination_port,
                    enabled: r.enabled,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()
            .map(Some)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredRule) -> Result<EntityId, ApiError> {
        let body = RuleBody::from(desired);
        self.create(&format!("{}/firewallRules", Self::owner_path(owner)), &body)
            .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredRule,
        _observed: &ObservedRule,
    ) -> Result<(), ApiError> {
        let path = format!("{}/firewallRules/{id}", Self::owner_path(owner));
        self.call(
            Method::PATCH,
            &path,
            Some(&serde_json::json!({ "enabled": desired.enabled })),
        )
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        _observed: &ObservedRule,
    ) -> Result<(), ApiError> {
        let path = format!("{}/firewallRules/{id}", Self::owner_path(owner));
        self.call::<()>(Method::DELETE, &path, None).await
    }
}
