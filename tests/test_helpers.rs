//! Test helpers and fixtures for integration tests

use oef_core::config::{BrokerConfig, ClientConfig};
use oef_core::proxy::{NetworkProxy, OefCore};
use oef_core::scheduler::{BrokerStats, SchedulerHandle};
use oef_core::schema::{
    Attribute, AttributeType, Constraint, DataModel, Instance, Location, QueryModel, RelationOp,
    Value,
};
use oef_core::server::Broker;
use oef_core::testing::RecordingHandler;
use oef_core::OefResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(5);

/// Car-sale data model: manufacturer, colour, year, luxury flag
#[allow(dead_code)]
pub fn car_model() -> DataModel {
    DataModel::new(
        "car",
        vec![
            Attribute::new("manufacturer", AttributeType::String, true),
            Attribute::new("colour", AttributeType::String, false),
            Attribute::new("year", AttributeType::Int, false),
            Attribute::new("luxury", AttributeType::Bool, true),
        ],
        "A car offered for sale",
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn car(manufacturer: &str, luxury: bool) -> Instance {
    Instance::new(
        car_model(),
        [
            ("manufacturer", Value::from(manufacturer)),
            ("luxury", Value::from(luxury)),
        ],
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn car_with_year(manufacturer: &str, year: i64, luxury: bool) -> Instance {
    Instance::new(
        car_model(),
        [
            ("manufacturer", Value::from(manufacturer)),
            ("year", Value::from(year)),
            ("luxury", Value::from(luxury)),
        ],
    )
    .unwrap()
}

/// Weather-station data model: manufacturer, wireless flag, optional position
#[allow(dead_code)]
pub fn weather_station_model() -> DataModel {
    DataModel::new(
        "weather_station",
        vec![
            Attribute::new("manufacturer", AttributeType::String, true),
            Attribute::new("wireless", AttributeType::Bool, true),
            Attribute::new("wind_speed", AttributeType::Bool, false),
            Attribute::new("location", AttributeType::Location, false),
        ],
        "A weather station selling its readings",
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn weather_station(manufacturer: &str, wireless: bool) -> Instance {
    Instance::new(
        weather_station_model(),
        [
            ("manufacturer", Value::from(manufacturer)),
            ("wireless", Value::from(wireless)),
        ],
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn weather_station_at(manufacturer: &str, location: Location) -> Instance {
    Instance::new(
        weather_station_model(),
        [
            ("manufacturer", Value::from(manufacturer)),
            ("wireless", Value::from(true)),
            ("location", Value::from(location)),
        ],
    )
    .unwrap()
}

/// `luxury == true` scoped to the car model
#[allow(dead_code)]
pub fn luxury_query() -> QueryModel {
    QueryModel::new(
        vec![Constraint::relation(
            Attribute::new("luxury", AttributeType::Bool, true),
            RelationOp::Eq,
            true,
        )],
        Some(car_model()),
    )
    .unwrap()
}

/// `manufacturer == name` with no model filter
#[allow(dead_code)]
pub fn manufacturer_query(name: &str) -> QueryModel {
    QueryModel::new(
        vec![Constraint::relation(
            Attribute::new("manufacturer", AttributeType::String, true),
            RelationOp::Eq,
            name,
        )],
        None,
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn sorted(mut agents: Vec<String>) -> Vec<String> {
    agents.sort();
    agents
}

/// Local broker on an ephemeral port with every error notification enabled
#[allow(dead_code)]
pub fn broker_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.broker.port = 0;
    config.broker.handshake_timeout_ms = 2000;
    config.notifications.routing_errors = true;
    config.notifications.protocol_errors = true;
    config
}

/// A running broker. Dropping `stop` (or sending on it) shuts it down.
#[allow(dead_code)]
pub struct TestBroker {
    pub addr: SocketAddr,
    pub handle: SchedulerHandle,
    pub stop: oneshot::Sender<()>,
}

#[allow(dead_code)]
pub async fn start_broker(config: BrokerConfig) -> TestBroker {
    let broker = Broker::bind(&config).await.unwrap();
    let addr = broker.local_addr().unwrap();
    let handle = broker.handle();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(broker.run_until(async {
        let _ = stopped.await;
    }));
    TestBroker { addr, handle, stop }
}

/// A connected network agent with its run loop on a background task
#[allow(dead_code)]
pub struct TestAgent {
    pub proxy: Arc<NetworkProxy>,
    pub recorder: RecordingHandler,
    pub task: JoinHandle<OefResult<()>>,
}

#[allow(dead_code)]
pub async fn connect_agent(addr: SocketAddr, agent_id: &str) -> TestAgent {
    connect_agent_with(addr, agent_id, |recorder| recorder).await
}

/// Connect an agent whose callbacks go to the handler built by `make_handler`
#[allow(dead_code)]
pub async fn connect_agent_with<H, F>(addr: SocketAddr, agent_id: &str, make_handler: F) -> TestAgent
where
    H: oef_core::proxy::AgentHandler + 'static,
    F: FnOnce(RecordingHandler) -> H,
{
    let proxy = NetworkProxy::new(ClientConfig::new(format!("tcp://{addr}"), agent_id));
    proxy.handshake().await.unwrap();
    let proxy = Arc::new(proxy);

    let recorder = RecordingHandler::new();
    let mut handler = make_handler(recorder.clone());
    let runner = proxy.clone();
    let task = tokio::spawn(async move { runner.run(&mut handler).await });

    TestAgent {
        proxy,
        recorder,
        task,
    }
}

/// Poll the scheduler until `done` holds for its stats or `WAIT` passes
#[allow(dead_code)]
pub async fn wait_for_stats<F>(handle: &SchedulerHandle, done: F) -> BrokerStats
where
    F: Fn(&BrokerStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = handle.stats().await.unwrap();
        if done(&stats) || tokio::time::Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
