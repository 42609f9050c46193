use otgw_bus::{BusPublisher, MqttBus, MqttBusConfig};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn unreachable_broker_reports_disconnected() {
    // 占用一个端口后立即释放，保证连接被拒绝
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let (bus, _commands) = MqttBus::connect(MqttBusConfig {
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        prefix: String::new(),
        reconnect_delay: Duration::from_millis(100),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!bus.is_connected());

    bus.disconnect().await;
    bus.disconnect().await;
    assert!(!bus.is_connected());
}
