//! MQTT 总线适配
//!
//! 负责把数据点变化发布到 broker，并把 `otgw/command/+` 上的命令转交给网关桥。
//!
//! ## 行为
//!
//! - 发布统一使用 QoS 2 + retain；
//! - 每次（重新）连上 broker 都会重新订阅命令 topic；
//! - 连接断开后由事件循环按固定间隔重连，发布方通过 [`BusPublisher::is_connected`] 判断是否跳过。

mod topic;

pub use topic::{command_filter, command_result_topic, parse_command, status_topic};

use async_trait::async_trait;
use domain::Command;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 入站命令通道容量
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// 客户端请求队列容量
const REQUEST_CAPACITY: usize = 10;

/// 断开时等待事件循环退出的上限
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// 总线错误。
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("client error: {0}")]
    Client(String),
    #[error("unexpected topic: {0}")]
    Topic(String),
    #[error("payload error: {0}")]
    Payload(String),
}

/// 总线发布抽象。
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// 以 QoS 2 + retain 发布文本
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    /// 当前是否已连上 broker
    fn is_connected(&self) -> bool;
}

/// MQTT 总线配置。
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// topic 前缀（原样拼接）
    pub prefix: String,
    /// 连接失败后的重试间隔
    pub reconnect_delay: Duration,
}

struct BusState {
    connected: AtomicBool,
    stopping: AtomicBool,
}

/// MQTT 总线实现。
pub struct MqttBus {
    client: AsyncClient,
    state: Arc<BusState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// 建立客户端并启动事件循环；入站命令从返回的接收端读出
    pub fn connect(config: MqttBusConfig) -> (Self, mpsc::Receiver<Command>) {
        let client_id = format!("otgw2mqtt-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = config.username.clone() {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let state = Arc::new(BusState {
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        });

        info!(
            target: "otgw.bus",
            host = %config.host,
            port = config.port,
            "connecting to broker"
        );
        let task = tokio::spawn(run_eventloop(
            eventloop,
            client.clone(),
            config,
            Arc::clone(&state),
            commands,
        ));

        (
            Self {
                client,
                state,
                task: Mutex::new(Some(task)),
            },
            receiver,
        )
    }

    /// 断开 broker 并结束事件循环；可重复调用
    pub async fn disconnect(&self) {
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        self.state.stopping.store(true, Ordering::SeqCst);
        let graceful = self.state.connected.load(Ordering::SeqCst)
            && match self.client.try_disconnect() {
                Ok(()) => true,
                Err(err) => {
                    debug!(target: "otgw.bus", error = %err, "disconnect request not queued");
                    false
                }
            };
        if !graceful || tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
        info!(target: "otgw.bus", "mqtt client stopped");
    }
}

#[async_trait]
impl BusPublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        debug!(target: "otgw.bus", topic = %topic, payload = %payload, "publish");
        self.client
            .publish(topic, QoS::ExactlyOnce, true, payload.as_bytes().to_vec())
            .await
            .map_err(|err| BusError::Client(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

async fn run_eventloop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    config: MqttBusConfig,
    state: Arc<BusState>,
    commands: mpsc::Sender<Command>,
) {
    let filter = command_filter(&config.prefix);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                state.connected.store(true, Ordering::SeqCst);
                info!(target: "otgw.bus", "mqtt client connected");
                // clean session 下订阅不会保留，每次连上都要重新订阅
                if let Err(err) = client.try_subscribe(filter.as_str(), QoS::ExactlyOnce) {
                    warn!(target: "otgw.bus", error = %err, "synchronizing subscriptions failed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match parse_command(&config.prefix, &publish.topic, &publish.payload) {
                    Ok(command) => {
                        debug!(target: "otgw.bus", command = %command, "command received");
                        if let Err(err) = commands.try_send(command) {
                            warn!(target: "otgw.bus", error = %err, "command dropped");
                        }
                    }
                    Err(err) => {
                        warn!(target: "otgw.bus", error = %err, "mqtt message skipped");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
                if state.connected.swap(false, Ordering::SeqCst) {
                    info!(target: "otgw.bus", error = %err, "mqtt client disconnected");
                } else {
                    warn!(target: "otgw.bus", error = %err, "mqtt client unable to connect");
                }
                tokio::time::sleep(config.reconnect_delay).await;
            }
        }
    }
    state.connected.store(false, Ordering::SeqCst);
    debug!(target: "otgw.bus", "mqtt eventloop stopped");
}
