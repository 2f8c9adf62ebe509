//! HTTP control plane tests against a mock API server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stratus_agent::{Config, HttpControlPlane};
use stratus_id::{EntityId, OwnerId};
use stratus_reconcile::kinds::{DesiredDisk, DesiredTag, Disk, DiskSpeed, Tag};
use stratus_reconcile::{
    ApiError, CollectionApi, EngineSettings, EntityType, LockRegistry, Orchestrator, Owner,
    PowerApi, PowerState, ProvisioningState, ShutdownSignal, StatusApi,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer, credentials: bool) -> Config {
    let uri = server.uri();
    Config::from_lookup(|key| match key {
        "STRATUS_API_URL" => Some(uri.clone()),
        "STRATUS_API_USER" if credentials => Some("admin".to_string()),
        "STRATUS_API_PASSWORD" if credentials => Some("secret".to_string()),
        _ => None,
    })
    .unwrap()
}

fn client(server: &MockServer) -> HttpControlPlane {
    HttpControlPlane::new(&config(server, false)).unwrap()
}

fn server_owner() -> Owner {
    Owner::server(OwnerId::parse("srv-1").unwrap())
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry_delay: Duration::from_millis(10),
        retry_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        create_timeout: Duration::from_secs(5),
        update_timeout: Duration::from_secs(5),
        delete_timeout: Duration::from_secs(5),
        allow_owner_reboot: false,
    }
}

#[tokio::test]
async fn test_fetch_disks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/servers/srv-1/disks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "disk-1", "scsiUnitId": 0, "sizeGb": 10, "speed": "STANDARD" },
            { "id": "disk-2", "scsiUnitId": 1, "sizeGb": 50, "speed": "HIGHPERFORMANCE" },
        ])))
        .mount(&server)
        .await;

    let disks = CollectionApi::<Disk>::fetch_observed(&client(&server), &server_owner())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(disks.len(), 2);
    assert_eq!(disks[1].id.as_str(), "disk-2");
    assert_eq!(disks[1].size_gb, 50);
    assert_eq!(disks[1].speed, DiskSpeed::HighPerformance);
}

#[tokio::test]
async fn test_missing_owner_fetches_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/servers/srv-1/tags"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "responseCode": "RESOURCE_NOT_FOUND",
            "message": "Server srv-1 not found",
        })))
        .mount(&server)
        .await;

    let tags = CollectionApi::<Tag>::fetch_observed(&client(&server), &server_owner())
        .await
        .unwrap();
    assert!(tags.is_none());
}

#[tokio::test]
async fn test_add_returns_assigned_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/servers/srv-1/disks"))
        .and(body_json(json!({ "scsiUnitId": 2, "sizeGb": 20, "speed": "ECONOMY" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "disk-9" })))
        .expect(1)
        .mount(&server)
        .await;

    let desired = DesiredDisk {
        scsi_unit_id: 2,
        size_gb: 20,
        speed: DiskSpeed::Economy,
    };
    let id = CollectionApi::<Disk>::add(&client(&server), &server_owner(), &desired)
        .await
        .unwrap();
    assert_eq!(id, EntityId::parse("disk-9").unwrap());
}

#[tokio::test]
async fn test_conflict_maps_to_busy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/servers/srv-1/tags"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "responseCode": "RESOURCE_BUSY",
            "message": "Server srv-1 has an operation in progress",
        })))
        .mount(&server)
        .await;

    let desired = DesiredTag {
        name: "env".to_string(),
        value: "prod".to_string(),
    };
    let err = CollectionApi::<Tag>::add(&client(&server), &server_owner(), &desired)
        .await
        .unwrap_err();
    assert!(err.is_busy());
}

#[tokio::test]
async fn test_basic_auth_is_sent() {
    let server = MockServer::start().await;
    // admin:secret
    Mock::given(method("GET"))
        .and(path("/servers/srv-1/power"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "started": true })))
        .expect(1)
        .mount(&server)
        .await;

    let plane = HttpControlPlane::new(&config(&server, true)).unwrap();
    let state = plane.power_state(&server_owner()).await.unwrap();
    assert_eq!(state, Some(PowerState::Running));
}

#[tokio::test]
async fn test_fetch_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status/network_adapter/nic-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "nic-1",
            "state": "PENDING_DELETE",
        })))
        .mount(&server)
        .await;

    let status = client(&server)
        .fetch_status(EntityType::NetworkAdapter, &EntityId::parse("nic-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        status.state,
        ProvisioningState::Pending("PENDING_DELETE".to_string())
    );
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/servers/srv-1/tags/tag-1"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "responseCode": "INVALID_INPUT_DATA",
            "message": "tag is locked",
        })))
        .mount(&server)
        .await;

    let observed = stratus_reconcile::kinds::ObservedTag {
        id: EntityId::parse("tag-1").unwrap(),
        name: "env".to_string(),
        value: "prod".to_string(),
    };
    let err = CollectionApi::<Tag>::remove(
        &client(&server),
        &server_owner(),
        &observed.id,
        &observed,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::Rejected { ref code, .. } if code == "INVALID_INPUT_DATA"));
}

#[tokio::test]
async fn test_pass_over_http_retries_busy_and_waits() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/servers/srv-1/disks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/servers/srv-1/disks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "disk-1", "scsiUnitId": 0, "sizeGb": 10, "speed": "STANDARD" },
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/servers/srv-1/power"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "started": false })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/servers/srv-1/disks"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "responseCode": "RESOURCE_BUSY",
            "message": "busy",
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/servers/srv-1/disks"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "id": "disk-1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/server/srv-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "srv-1", "state": "PENDING_CHANGE" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/server/srv-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "srv-1", "state": "NORMAL" })),
        )
        .mount(&server)
        .await;

    let engine = Orchestrator::new(
        Arc::new(client(&server)),
        LockRegistry::new(),
        fast_settings(),
        ShutdownSignal::never(),
    );
    let desired = vec![DesiredDisk {
        scsi_unit_id: 0,
        size_gb: 10,
        speed: DiskSpeed::Standard,
    }];

    let outcome = engine
        .reconcile::<Disk>(&server_owner(), &desired)
        .await
        .unwrap();

    assert_eq!(outcome.applied().len(), 1);
    assert_eq!(outcome.applied()[0].entity.as_str(), "disk-1");

    let requests = server.received_requests().await.unwrap();
    let posts = requests
        .iter()
        .filter(|r| r.method == wiremock::http::Method::POST)
        .count();
    let polls = requests
        .iter()
        .filter(|r| r.url.path() == "/status/server/srv-1")
        .count();
    assert_eq!(posts, 3);
    assert_eq!(polls, 2);
}
