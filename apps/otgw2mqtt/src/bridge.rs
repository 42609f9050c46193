//! 网关桥装配模块
//!
//! 把网关链路（DeviceLink）、行解码（FrameCodec）、值缓存（ValueStore）、
//! MQTT 总线和透传端口组装在一起：
//! - 网关的每一行原样广播给透传客户端，同时解码；
//! - 状态帧经值缓存去重后，按声明顺序逐个发布到总线；
//! - 总线命令与透传客户端的行写回网关。
//!
//! 所有事件由单个路由任务顺序处理，一帧的全部变更发布完成后才处理下一行。

use domain::Command;
use otgw_bus::{BusPublisher, MqttBus, MqttBusConfig, command_result_topic, status_topic};
use otgw_config::{BridgeConfig, ConfigError};
use otgw_pipeline::ValueStore;
use otgw_protocol::{
    Decoded, DeviceLink, DeviceLinkConfig, DeviceWriter, FrameCodec, LinkEvent, PassthroughConfig,
    PassthroughServer,
};
use otgw_telemetry::{
    metrics, record_command_dropped, record_command_sent, record_decode_failure,
    record_frame_decoded, record_line_ignored, record_line_received, record_link_connected,
    record_publish_failure, record_publish_skipped, record_publish_success,
    record_reconnect_scheduled, record_value_changed,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件路由器
///
/// 只在路由任务内使用，值缓存因此无需加锁。
struct FrameRouter {
    /// topic 前缀
    prefix: String,
    codec: FrameCodec,
    store: ValueStore,
    /// 网关写入端
    device: Arc<dyn DeviceWriter>,
    /// 总线；配置缺失时为空，发布全部跳过
    bus: Option<Arc<dyn BusPublisher>>,
    /// 透传端口；关闭时为空
    passthrough: Option<PassthroughServer>,
}

impl FrameRouter {
    fn new(
        prefix: String,
        device: Arc<dyn DeviceWriter>,
        bus: Option<Arc<dyn BusPublisher>>,
        passthrough: Option<PassthroughServer>,
    ) -> Self {
        Self {
            prefix,
            codec: FrameCodec::new(),
            store: ValueStore::new(),
            device,
            bus,
            passthrough,
        }
    }

    /// 顺序处理各路输入，直到取消或链路事件通道关闭
    async fn run(
        mut self,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut bus_commands: Option<mpsc::Receiver<Command>>,
        mut peer_commands: Option<mpsc::Receiver<String>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = link_events.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => break,
                },
                Some(command) = recv_optional(&mut bus_commands) => {
                    self.handle_bus_command(command).await;
                }
                Some(line) = recv_optional(&mut peer_commands) => {
                    self.handle_passthrough_line(&line).await;
                }
            }
        }
        debug!(target: "otgw.bridge", "frame router stopped");
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { addr } => {
                record_link_connected();
                debug!(target: "otgw.bridge", addr = %addr, "gateway link up");
            }
            LinkEvent::ConnectFailed { .. } | LinkEvent::Disconnected { .. } => {
                record_reconnect_scheduled();
            }
            LinkEvent::LineReceived(line) => self.handle_line(&line).await,
        }
    }

    /// 处理网关的一行输出
    async fn handle_line(&mut self, line: &str) {
        record_line_received();
        debug!(target: "otgw.bridge", line = %line, "received");

        // 1. 原样转发给透传客户端
        if let Some(passthrough) = &self.passthrough {
            passthrough.broadcast(line);
        }

        // 2. 解码
        let decoded = match self.codec.try_decode(line) {
            Ok(decoded) => decoded,
            Err(err) => {
                record_decode_failure();
                warn!(target: "otgw.bridge", line = %line, error = %err, "frame_decode_failed");
                return;
            }
        };

        // 3. 按解码结果分发
        match decoded {
            Decoded::Status(frame) => {
                record_frame_decoded();
                for change in self.store.apply_frame(&frame.updates) {
                    record_value_changed();
                    let topic = status_topic(&self.prefix, change.name);
                    self.publish(&topic, &change.value.to_string()).await;
                }
            }
            Decoded::CommandResult { code, result } => {
                info!(target: "otgw.bridge", code = %code, result = %result, "command_result");
                let topic = command_result_topic(&self.prefix, &code);
                self.publish(&topic, &result).await;
            }
            Decoded::FollowUp(command) => self.send_command(&command).await,
            Decoded::Ignored => record_line_ignored(),
        }
    }

    /// 总线命令写入网关
    async fn handle_bus_command(&self, command: Command) {
        self.send_command(&command).await;
    }

    /// 透传客户端的行原样写入网关
    async fn handle_passthrough_line(&self, line: &str) {
        if self.device.send_line(line).await {
            record_command_sent();
        } else {
            record_command_dropped();
            debug!(target: "otgw.bridge", line = %line, "gateway not connected, raw command dropped");
        }
    }

    async fn send_command(&self, command: &Command) {
        if self.device.send_command(command).await {
            record_command_sent();
        } else {
            record_command_dropped();
            debug!(target: "otgw.bridge", command = %command, "gateway not connected, command dropped");
        }
    }

    /// 发布到总线；未连接时跳过
    async fn publish(&self, topic: &str, payload: &str) {
        let Some(bus) = self.bus.as_ref().filter(|bus| bus.is_connected()) else {
            record_publish_skipped();
            debug!(target: "otgw.bridge", topic = %topic, "bus not connected, publish skipped");
            return;
        };
        match bus.publish(topic, payload).await {
            Ok(()) => record_publish_success(),
            Err(err) => {
                record_publish_failure();
                warn!(target: "otgw.bridge", topic = %topic, error = %err, "publish_failed");
            }
        }
    }
}

async fn recv_optional<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// 网关桥
pub struct GatewayBridge {
    config: BridgeConfig,
    cancel: CancellationToken,
    link: Option<DeviceLink>,
    bus: Option<Arc<MqttBus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            link: None,
            bus: None,
            tasks: Vec::new(),
        }
    }

    /// 连接总线、启动透传端口和网关链路
    ///
    /// 配置缺失只记录错误，不中止进程。
    pub async fn start(&mut self) {
        if self.link.is_some() || self.bus.is_some() {
            debug!(target: "otgw.bridge", "bridge already started");
            return;
        }
        self.cancel = CancellationToken::new();

        // 1. 总线：网关与 broker 都配置时才连接
        let missing = self.config.missing_required();
        let bus_commands = match (&self.config.mqtt_broker, missing.is_empty()) {
            (Some(broker), true) => {
                let (bus, commands) = MqttBus::connect(MqttBusConfig {
                    host: broker.clone(),
                    port: self.config.mqtt_port,
                    username: self.config.mqtt_username.clone(),
                    password: self.config.mqtt_password.clone(),
                    prefix: self.config.mqtt_prefix.clone(),
                    reconnect_delay: self.config.reconnect_delay(),
                });
                self.bus = Some(Arc::new(bus));
                Some(commands)
            }
            _ => {
                let err = ConfigError::Missing(missing.join(", "));
                error!(target: "otgw.bridge", error = %err, "configuration missing");
                None
            }
        };

        let Some(host) = self.config.tcp_host.clone() else {
            return;
        };

        // 2. 透传端口
        let (passthrough, peer_commands) = if self.config.listen_enabled {
            let (server, commands) =
                PassthroughServer::new(PassthroughConfig::new(self.config.listen_port()));
            let runner = server.clone();
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                if let Err(err) = runner.run(cancel).await {
                    error!(target: "otgw.bridge", error = %err, "passthrough server failed");
                }
            }));
            (Some(server), Some(commands))
        } else {
            (None, None)
        };

        // 3. 网关链路与路由任务
        let (link, link_events) = DeviceLink::new(
            DeviceLinkConfig::new(host, self.config.tcp_port)
                .with_reconnect_delay(self.config.reconnect_delay()),
        );
        let router = FrameRouter::new(
            self.config.mqtt_prefix.clone(),
            Arc::new(link.clone()),
            self.bus.clone().map(|bus| bus as Arc<dyn BusPublisher>),
            passthrough,
        );
        self.tasks.push(tokio::spawn(router.run(
            link_events,
            bus_commands,
            peer_commands,
            self.cancel.clone(),
        )));
        link.start();
        self.link = Some(link);
    }

    /// 断开总线并停止网关链路；可重复调用
    pub async fn stop(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.disconnect().await;
        }
        if let Some(link) = self.link.take() {
            link.stop().await;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(target: "otgw.bridge", error = %err, "bridge task ended abnormally");
            }
        }

        let snapshot = metrics().snapshot();
        info!(
            target: "otgw.bridge",
            lines_received = snapshot.lines_received,
            frames_decoded = snapshot.frames_decoded,
            lines_ignored = snapshot.lines_ignored,
            decode_failures = snapshot.decode_failures,
            values_changed = snapshot.values_changed,
            publish_success = snapshot.publish_success,
            publish_failure = snapshot.publish_failure,
            publish_skipped = snapshot.publish_skipped,
            commands_sent = snapshot.commands_sent,
            commands_dropped = snapshot.commands_dropped,
            link_connects = snapshot.link_connects,
            reconnects_scheduled = snapshot.reconnects_scheduled,
            "bridge stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otgw_bus::BusError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingDevice {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingDevice {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl DeviceWriter for RecordingDevice {
        async fn send_line(&self, line: &str) -> bool {
            self.lines.lock().expect("lock").push(line.to_string());
            true
        }

        async fn send_raw(&self, data: &[u8]) -> bool {
            self.lines
                .lock()
                .expect("lock")
                .push(String::from_utf8_lossy(data).into_owned());
            true
        }
    }

    struct RecordingBus {
        connected: AtomicBool,
        published: Mutex<Vec<(String, String)>>,
    }

    impl RecordingBus {
        fn new(connected: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                published: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<(String, String)> {
            std::mem::take(&mut *self.published.lock().expect("lock"))
        }
    }

    #[async_trait]
    impl BusPublisher for RecordingBus {
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
            self.published
                .lock()
                .expect("lock")
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn router(
        device: &Arc<RecordingDevice>,
        bus: &Arc<RecordingBus>,
        passthrough: Option<PassthroughServer>,
    ) -> FrameRouter {
        FrameRouter::new(
            "home/".to_string(),
            device.clone(),
            Some(bus.clone() as Arc<dyn BusPublisher>),
            passthrough,
        )
    }

    fn expected(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(topic, payload)| (topic.to_string(), payload.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn status_changes_are_published_in_declaration_order() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let mut router = router(&device, &bus, None);

        router.handle_line("B40000480").await;
        assert_eq!(
            bus.take(),
            expected(&[
                ("home/otgw/status/flame_status", "00000100/10000000"),
                ("home/otgw/status/cooling_mode", "0"),
                ("home/otgw/status/burner_on", "0"),
                ("home/otgw/status/central_heating_mode", "0"),
                ("home/otgw/status/domestic_hot_water_mode", "0"),
                ("home/otgw/status/domestic_hot_water_enabled", "0"),
                ("home/otgw/status/fault_indication", "0"),
            ])
        );

        router.handle_line("B40000480").await;
        assert!(bus.take().is_empty());

        router.handle_line("B40000008").await;
        assert_eq!(
            bus.take(),
            expected(&[
                ("home/otgw/status/flame_status", "00000000/00001000"),
                ("home/otgw/status/burner_on", "1"),
            ])
        );
    }

    #[tokio::test]
    async fn repeated_temperature_is_published_once() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let mut router = router(&device, &bus, None);

        router.handle_line("B40191580").await;
        router.handle_line("B40191580").await;
        assert_eq!(
            bus.take(),
            expected(&[("home/otgw/status/boiler_water_temperature", "21.5")])
        );
    }

    #[tokio::test]
    async fn summary_result_triggers_follow_up_without_publish() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let mut router = router(&device, &bus, None);

        router.handle_line("PS: 1").await;
        assert_eq!(device.lines(), vec!["PS=0".to_string()]);
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn command_result_is_published_lower_cased() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let mut router = router(&device, &bus, None);

        router.handle_line("TT: 20.50").await;
        assert_eq!(
            bus.take(),
            expected(&[("home/otgw/status/command_tt", "20.50")])
        );
        assert!(device.lines().is_empty());
    }

    #[tokio::test]
    async fn disconnected_bus_skips_publish() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(false));
        let mut router = router(&device, &bus, None);

        router.handle_line("B40191580").await;
        assert!(bus.take().is_empty());
        assert_eq!(
            router
                .store
                .get(domain::DataPointId(25))
                .map(|value| value.to_string()),
            Some("21.5".to_string())
        );
    }

    #[tokio::test]
    async fn malformed_lines_publish_nothing() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let mut router = router(&device, &bus, None);

        for line in ["", "garbage", "B4019158", "X40191580", "B40631234", "BZ0191580"] {
            router.handle_line(line).await;
        }
        assert!(bus.take().is_empty());
        assert!(device.lines().is_empty());
    }

    #[tokio::test]
    async fn bus_and_passthrough_commands_reach_gateway() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let router = router(&device, &bus, None);

        router.handle_bus_command(Command::new("TT", "20.5")).await;
        router.handle_passthrough_line("GW=R").await;
        assert_eq!(
            device.lines(),
            vec!["TT=20.5".to_string(), "GW=R".to_string()]
        );
    }

    #[tokio::test]
    async fn raw_lines_are_broadcast_to_passthrough() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let (server, _commands) = PassthroughServer::new(PassthroughConfig::new(0));
        let mut lines = server.subscribe();
        let mut router = router(&device, &bus, Some(server));

        router.handle_line("B40191580").await;
        router.handle_line("garbage").await;
        assert_eq!(lines.recv().await.expect("line"), "B40191580\r\n");
        assert_eq!(lines.recv().await.expect("line"), "garbage\r\n");
    }

    #[tokio::test]
    async fn run_processes_events_in_order() {
        let device = Arc::new(RecordingDevice::default());
        let bus = Arc::new(RecordingBus::new(true));
        let router = router(&device, &bus, None);

        let (events_tx, events_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let task = tokio::spawn(router.run(
            events_rx,
            Some(commands_rx),
            None,
            CancellationToken::new(),
        ));

        commands_tx
            .send(Command::new("SH", "60"))
            .await
            .expect("send");
        for line in ["T10630000", "B40191580", "B40191600"] {
            events_tx
                .send(LinkEvent::LineReceived(line.to_string()))
                .await
                .expect("send");
        }
        drop(events_tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("router timeout")
            .expect("router task");

        assert_eq!(
            bus.take(),
            expected(&[
                ("home/otgw/status/boiler_water_temperature", "21.5"),
                ("home/otgw/status/boiler_water_temperature", "22"),
            ])
        );
        assert_eq!(device.lines(), vec!["SH=60".to_string()]);
    }

    #[tokio::test]
    async fn bridge_without_broker_still_runs_gateway_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let config = BridgeConfig {
            tcp_host: Some("127.0.0.1".to_string()),
            tcp_port: port,
            listen_enabled: false,
            reconnect_delay_seconds: 1,
            ..BridgeConfig::default()
        };

        let mut bridge = GatewayBridge::new(config);
        bridge.start().await;
        let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("connect timeout")
            .expect("accept");
        let (read_half, mut write_half) = socket.into_split();
        write_half.write_all(b"PS: 1\r\n").await.expect("write");

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("follow-up timeout")
            .expect("read");
        assert_eq!(line, "PS=0\r\n");

        bridge.stop().await;
        bridge.stop().await;
    }
}
