//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tag subscription bookkeeping and single-server endpoints."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use r_daq_common::{DaqError, ErrorKind};
use r_daq_core::{
    AddressRole, AddressType, DataTag, Endpoint, EndpointContext, EndpointSettings, GroupBatch,
    HardwareAddress, HealthUpdate, TagSubscriptionMapper,
};
use r_daq_msg::{EquipmentState, Quality, QualityCode, RecordingSender, SenderEvent, TagId};
use r_daq_net::{
    ClientHandle, DataValue, DeadbandType, NodeAddress, Operation, ServerState, SimulatedConnector,
    SimulatedServer, StatusCode,
};
use r_daq_resilience::{RetryDelegate, RetryPolicy};
use serde_json::json;
use tokio::time::{sleep, Instant};

const PRIMARY: &str = "opc.tcp://primary:4840";
const WAIT: Duration = Duration::from_secs(2);

struct Fixture {
    server: SimulatedServer,
    mapper: Arc<TagSubscriptionMapper>,
    sender: RecordingSender,
    endpoint: Endpoint,
}

fn fixture_with(settings: EndpointSettings) -> Fixture {
    let server = SimulatedServer::new(PRIMARY)
        .with_node(NodeAddress::string(2, "Boiler.Temperature"), 20.5)
        .with_node(NodeAddress::string(2, "Boiler.Pressure"), 1.2)
        .with_node(NodeAddress::string(2, "Pump.Speed"), 1450);
    let connector = SimulatedConnector::new().with_server(server.clone());
    let mapper = Arc::new(TagSubscriptionMapper::default());
    let sender = RecordingSender::new();
    let retry = RetryDelegate::new(
        RetryPolicy::new(Duration::from_millis(10), 2.0, Duration::from_millis(50), 3),
        None,
    );
    let ctx = EndpointContext {
        connector: Arc::new(connector),
        mapper: mapper.clone(),
        sender: Arc::new(sender.clone()),
        retry,
        settings,
    };
    Fixture {
        server,
        mapper,
        sender,
        endpoint: Endpoint::new(PRIMARY, AddressRole::Primary, ctx),
    }
}

fn fixture() -> Fixture {
    fixture_with(EndpointSettings {
        request_timeout: Duration::from_millis(500),
        long_lost_threshold: Duration::from_secs(60),
    })
}

fn tag(id: u64, item: &str, time_ms: u64) -> DataTag {
    DataTag::new(
        TagId(id),
        item.to_lowercase(),
        HardwareAddress::new(2, item, AddressType::String),
    )
    .with_deadband(Duration::from_millis(time_ms), 0.0, DeadbandType::None)
}

fn batch(mapper: &TagSubscriptionMapper, tags: &[DataTag]) -> GroupBatch {
    let mut batch = GroupBatch::new();
    for t in tags {
        let definition = mapper.get_or_create_definition(t).unwrap();
        batch
            .entry(mapper.group_for_tag(t))
            .or_default()
            .push(definition);
    }
    batch
}

fn quality_of(
    qualities: &HashMap<ClientHandle, Quality>,
    mapper: &TagSubscriptionMapper,
    tag: TagId,
) -> QualityCode {
    let handle = mapper.definition(tag).unwrap().handle;
    qualities[&handle].code
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn initialize_classifies_connect_failures() {
    let f = fixture();
    let mapper = f.mapper.clone();
    let ctx = EndpointContext {
        connector: Arc::new(SimulatedConnector::new()),
        mapper,
        sender: Arc::new(f.sender.clone()),
        retry: RetryDelegate::default(),
        settings: EndpointSettings::default(),
    };
    let unknown = Endpoint::new("opc.tcp://nowhere:4840", AddressRole::Primary, ctx);
    let err = unknown.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    f.server.set_reachable(false);
    let err = f.endpoint.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert!(!f.endpoint.is_connected());

    f.server.set_reachable(true);
    f.endpoint.initialize().await.unwrap();
    assert!(f.endpoint.is_connected());
    assert!(
        f.sender
            .wait_for(WAIT, |events| events.contains(&SenderEvent::State(EquipmentState::Ok)))
            .await
    );
}

#[tokio::test]
async fn one_unknown_node_does_not_block_its_siblings() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let good = tag(1, "Boiler.Temperature", 1000);
    let missing = tag(2, "Boiler.Missing", 1000);

    let qualities = f
        .endpoint
        .subscribe(&batch(&f.mapper, &[good.clone(), missing.clone()]))
        .await
        .unwrap();

    assert_eq!(qualities.len(), 2);
    assert_eq!(quality_of(&qualities, &f.mapper, good.id), QualityCode::Ok);
    assert_eq!(
        quality_of(&qualities, &f.mapper, missing.id),
        QualityCode::NodeNotFound
    );
    let group = f.mapper.group_for_tag(&good);
    assert!(group.contains(good.id));
    assert!(!group.contains(missing.id));
    assert_eq!(f.server.subscription_count(), 1);
    assert_eq!(f.server.monitored_item_count(), 1);
}

#[tokio::test]
async fn one_request_per_group() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let tags = [
        tag(1, "Boiler.Temperature", 1000),
        tag(2, "Boiler.Pressure", 1000),
        tag(3, "Pump.Speed", 5000),
    ];
    f.endpoint.subscribe(&batch(&f.mapper, &tags)).await.unwrap();

    assert_eq!(f.server.calls(Operation::CreateSubscription), 2);
    assert_eq!(f.server.calls(Operation::CreateMonitoredItems), 2);
    assert_eq!(f.server.monitored_item_count(), 3);

    // applying the same batch again creates nothing new
    f.endpoint.subscribe(&batch(&f.mapper, &tags)).await.unwrap();
    assert_eq!(f.server.calls(Operation::CreateMonitoredItems), 2);
}

#[tokio::test]
async fn unsubscribing_the_last_tag_deletes_the_subscription() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let t = tag(1, "Boiler.Temperature", 1000);
    f.endpoint.subscribe(&batch(&f.mapper, &[t.clone()])).await.unwrap();
    let handle = f.mapper.definition(t.id).unwrap().handle;
    let group = f.mapper.group_for_tag(&t);

    assert!(f.endpoint.unsubscribe(handle).await.unwrap());
    assert!(group.is_empty());
    assert_eq!(group.subscription(), None);
    assert!(f.mapper.definition(t.id).is_none());
    assert_eq!(f.server.subscription_count(), 0);
    assert!(!f.endpoint.unsubscribe(handle).await.unwrap());
}

#[tokio::test]
async fn values_are_routed_to_their_tags() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let t = tag(7, "Boiler.Pressure", 1000);
    f.endpoint.subscribe(&batch(&f.mapper, &[t.clone()])).await.unwrap();

    let node = NodeAddress::string(2, "Boiler.Pressure");
    f.server.set_value(&node, 3.4);
    assert!(
        f.sender
            .wait_for(WAIT, |events| events.iter().any(|e| matches!(
                e,
                SenderEvent::Value(id, update) if *id == t.id && update.value == json!(3.4)
            )))
            .await
    );

    f.server.set_data_value(
        &node,
        DataValue::with_status(json!(null), StatusCode::BAD_COMMUNICATION_ERROR),
    );
    assert!(
        f.sender
            .wait_for(WAIT, |events| events.iter().any(|e| matches!(
                e,
                SenderEvent::Invalid(id, quality) if *id == t.id && quality.code == QualityCode::Unreachable
            )))
            .await
    );
}

#[tokio::test]
async fn session_loss_and_recovery_are_reported() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let mut activity = f.endpoint.activity();

    f.server.drop_session();
    assert!(
        f.sender
            .wait_for(WAIT, |events| events
                .contains(&SenderEvent::State(EquipmentState::ConnectionLost)))
            .await
    );
    activity.wait_for(|active| !*active).await.unwrap();
    assert!(f.endpoint.disconnected_for().is_some());

    f.server.restore_session();
    activity.wait_for(|active| *active).await.unwrap();
    assert_eq!(
        f.sender.states(),
        vec![
            EquipmentState::Ok,
            EquipmentState::ConnectionLost,
            EquipmentState::Ok
        ]
    );
    assert!(f.endpoint.disconnected_for().is_none());
}

#[tokio::test]
async fn failed_transfers_recreate_the_subscription() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let tags = [
        tag(1, "Boiler.Temperature", 1000),
        tag(2, "Boiler.Pressure", 1000),
    ];
    f.endpoint.subscribe(&batch(&f.mapper, &tags)).await.unwrap();
    let group = f.mapper.group_for_tag(&tags[0]);
    let original = group.subscription().unwrap();

    f.server.drop_session();
    f.server.fail_next(
        Operation::CreateSubscription,
        r_daq_net::ClientError::Timeout,
    );
    f.server.restore_session_without_subscriptions();

    assert!(eventually(|| f.server.monitored_item_count() == 2).await);
    let recreated = group.subscription().unwrap();
    assert_ne!(recreated, original);
    assert_eq!(f.server.calls(Operation::CreateSubscription), 3);

    f.sender.clear();
    f.server.set_value(&NodeAddress::string(2, "Boiler.Temperature"), 99.0);
    assert!(
        f.sender
            .wait_for(WAIT, |events| events
                .iter()
                .any(|e| matches!(e, SenderEvent::Value(id, _) if *id == TagId(1))))
            .await
    );
}

#[tokio::test]
async fn recreation_stops_at_configuration_failures() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let t = tag(1, "Boiler.Temperature", 1000);
    f.endpoint.subscribe(&batch(&f.mapper, &[t.clone()])).await.unwrap();

    f.server.fail_times(
        Operation::CreateSubscription,
        5,
        r_daq_net::ClientError::Status(StatusCode::BAD_USER_ACCESS_DENIED),
    );
    f.server.restore_session_without_subscriptions();

    assert!(
        f.sender
            .wait_for(WAIT, |events| events
                .iter()
                .any(|e| matches!(e, SenderEvent::Invalid(id, _) if *id == t.id)))
            .await
    );
    // the original creation plus exactly one recreation attempt
    assert_eq!(f.server.calls(Operation::CreateSubscription), 2);
}

#[tokio::test]
async fn slow_requests_time_out_as_communication_failures() {
    let f = fixture_with(EndpointSettings {
        request_timeout: Duration::from_millis(50),
        long_lost_threshold: Duration::from_secs(60),
    });
    f.endpoint.initialize().await.unwrap();
    f.server.set_latency(Duration::from_millis(300));

    let err = f
        .endpoint
        .read(&NodeAddress::string(2, "Pump.Speed"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
}

#[tokio::test]
async fn long_disconnections_become_long_lost() {
    let f = fixture_with(EndpointSettings {
        request_timeout: Duration::from_millis(500),
        long_lost_threshold: Duration::from_millis(20),
    });
    f.endpoint.initialize().await.unwrap();
    let node = NodeAddress::string(2, "Pump.Speed");

    f.server.drop_session();
    let mut activity = f.endpoint.activity();
    activity.wait_for(|active| !*active).await.unwrap();
    let err = f.endpoint.read(&node).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EndpointDisconnected);

    sleep(Duration::from_millis(50)).await;
    let err = f.endpoint.read(&node).await.unwrap_err();
    assert!(matches!(err, DaqError::LongLostConnection { .. }));
}

#[tokio::test]
async fn read_and_write_report_quality_and_acceptance() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let node = NodeAddress::string(2, "Pump.Speed");

    let (value, quality) = f.endpoint.read(&node).await.unwrap();
    assert_eq!(value, json!(1450));
    assert!(quality.is_valid());

    assert!(f.endpoint.write(&node, json!(1500)).await.unwrap());
    assert_eq!(f.server.value(&node).unwrap().value, json!(1500));

    let missing = NodeAddress::string(2, "Nope");
    assert!(!f.endpoint.write(&missing, json!(1)).await.unwrap());
    let (_, quality) = f.endpoint.read(&missing).await.unwrap();
    assert_eq!(quality.code, QualityCode::NodeNotFound);
}

#[tokio::test]
async fn health_monitoring_forwards_samples_until_stopped() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let mut health = f
        .endpoint
        .monitor_health(Duration::from_millis(100))
        .await
        .unwrap();

    let mut initial = vec![health.recv().await.unwrap(), health.recv().await.unwrap()];
    initial.sort_by_key(|update| matches!(update, HealthUpdate::ServerState(_)));
    assert_eq!(
        initial,
        vec![
            HealthUpdate::ServiceLevel(255),
            HealthUpdate::ServerState(ServerState::Running)
        ]
    );

    f.server.set_server_state(ServerState::Shutdown);
    assert_eq!(
        health.recv().await,
        Some(HealthUpdate::ServerState(ServerState::Shutdown))
    );

    f.endpoint.stop_health_monitoring().await;
    assert_eq!(health.recv().await, None);
    assert_eq!(f.server.subscription_count(), 0);
}

#[tokio::test]
async fn disconnect_closes_the_session() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    f.endpoint.disconnect().await;
    assert!(!f.endpoint.is_connected());
    assert!(!f.server.has_session());
    let err = f
        .endpoint
        .read(&NodeAddress::string(2, "Pump.Speed"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EndpointDisconnected);
    // idempotent
    f.endpoint.disconnect().await;
}

#[tokio::test]
async fn tags_removed_before_apply_create_nothing() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    let t = tag(1, "Boiler.Temperature", 1000);
    let pending = batch(&f.mapper, &[t.clone()]);
    let handle = f.mapper.definition(t.id).unwrap().handle;
    assert!(f.mapper.remove_tag(t.id));

    let qualities = f.endpoint.subscribe(&pending).await.unwrap();
    assert_eq!(qualities[&handle].code, QualityCode::Unknown);
    assert_eq!(f.server.calls(Operation::CreateSubscription), 0);
    assert_eq!(f.server.monitored_item_count(), 0);
}

#[tokio::test]
async fn item_of_a_tag_removed_mid_apply_is_deleted() {
    let f = fixture();
    f.endpoint.initialize().await.unwrap();
    f.server.set_latency(Duration::from_millis(100));
    let t = tag(1, "Boiler.Temperature", 1000);
    let pending = batch(&f.mapper, &[t.clone()]);
    let handle = f.mapper.definition(t.id).unwrap().handle;

    let endpoint = f.endpoint.clone();
    let apply = tokio::spawn(async move { endpoint.subscribe(&pending).await });
    sleep(Duration::from_millis(30)).await;
    assert!(f.mapper.remove_tag(t.id));

    let qualities = apply.await.unwrap().unwrap();
    assert_eq!(qualities[&handle].code, QualityCode::Unknown);
    assert_eq!(f.server.calls(Operation::CreateMonitoredItems), 1);
    assert_eq!(f.server.calls(Operation::DeleteMonitoredItems), 1);
    assert_eq!(f.server.monitored_item_count(), 0);
    assert_eq!(f.server.subscription_count(), 0);
    assert!(f.mapper.group_for_tag(&t).is_empty());
}
