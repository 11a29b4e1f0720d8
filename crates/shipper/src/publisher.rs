//! 브로커 발행기 -- 레코드를 토픽 익스체인지로 발행합니다.
//!
//! 빌더에서 레코드를 받아 영속 메시지로 발행하며, at-least-once 의미론과
//! 브로커 장애 시 유한 메모리를 보장합니다.
//!
//! # 재연결 상태 기계
//! ```text
//! Disconnected -> Connecting -> Connected -> Channeling -> Ready
//!        ^                                                   |
//!        +------------------- Errored <----------------------+
//! ```
//! 재시도 지연은 5초에서 시작하여 실패마다 1.5배, 최대 30초까지 증가하고
//! `Ready` 도달 시 기본값으로 리셋됩니다. 연속 10회 실패 시 치명적 에러를
//! 보고합니다.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{Instant, interval, sleep, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use opsentra_core::LOGS_EXCHANGE;
use opsentra_core::error::OpsentraError;
use opsentra_core::types::LogRecord;

use crate::error::ShipperError;
use crate::queue::RecordQueue;

/// 재연결 기본 지연
const RECONNECT_BASE: Duration = Duration::from_secs(5);
/// 재연결 지연 상한
const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// 재연결 지연 증가 배율
const RECONNECT_FACTOR: f64 = 1.5;
/// 프로세스 종료 전 최대 연속 연결 시도 횟수
const MAX_CONNECT_ATTEMPTS: u32 = 10;
/// 연결 시도 타임아웃
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 레코드당 발행 재시도 횟수
const SEND_RETRIES: u32 = 3;
/// 발행 재시도 간격
const SEND_RETRY_SPACING: Duration = Duration::from_millis(250);
/// 한 번에 발행하는 최대 배치 크기
const PUBLISH_BATCH: usize = 128;

/// 발행기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// 연결 없음
    Disconnected,
    /// 연결 시도 중
    Connecting,
    /// 연결됨, 채널 미개설
    Connected,
    /// 채널 개설 중
    Channeling,
    /// 발행 가능
    Ready,
    /// 에러로 연결 폐기
    Errored,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Channeling => "channeling",
            Self::Ready => "ready",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// 발행기 설정
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// 브로커 URL
    pub broker_url: String,
    /// 발행 배치 타임아웃
    pub batch_timeout: Duration,
    /// 종료 시 플러시 데드라인
    pub flush_deadline: Duration,
}

/// 브로커 발행기
///
/// 단일 연결과 단일 채널을 유지하며, 채널/연결 에러 시 재연결 상태 기계로
/// 전환하고 레코드를 로컬 큐에 보관합니다.
pub struct BrokerPublisher {
    settings: PublisherSettings,
    queue: Arc<Mutex<RecordQueue>>,
    state: Arc<Mutex<PublisherState>>,
    published_count: Arc<AtomicU64>,
}

impl BrokerPublisher {
    /// 새 발행기를 생성합니다.
    pub fn new(settings: PublisherSettings, queue_capacity: usize) -> Self {
        Self {
            settings,
            queue: Arc::new(Mutex::new(RecordQueue::new(queue_capacity))),
            state: Arc::new(Mutex::new(PublisherState::Disconnected)),
            published_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 로컬 큐 핸들을 반환합니다 (헬스 리포팅용).
    pub fn queue_handle(&self) -> Arc<Mutex<RecordQueue>> {
        Arc::clone(&self.queue)
    }

    /// 상태 핸들을 반환합니다 (헬스 리포팅용).
    pub fn state_handle(&self) -> Arc<Mutex<PublisherState>> {
        Arc::clone(&self.state)
    }

    /// 발행 성공 카운터 핸들을 반환합니다.
    pub fn published_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.published_count)
    }

    /// 발행기 메인 루프를 실행합니다.
    ///
    /// `tokio::spawn`으로 별도 태스크에서 호출하세요.
    /// 연속 연결 실패가 한도를 넘으면 `fatal_tx`로 치명적 에러를 보고하고
    /// 종료합니다.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<LogRecord>,
        mut shutdown: broadcast::Receiver<()>,
        fatal_tx: mpsc::Sender<OpsentraError>,
    ) {
        let mut backoff = RECONNECT_BASE;
        let mut attempts: u32 = 0;

        'reconnect: loop {
            // --- 연결 단계: 백오프 동안에도 유입 레코드를 버퍼링 ---
            let (connection, channel) = loop {
                match self.connect_ready().await {
                    Ok(pair) => {
                        attempts = 0;
                        backoff = RECONNECT_BASE;
                        break pair;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= MAX_CONNECT_ATTEMPTS {
                            error!(
                                attempts = attempts,
                                error = %e,
                                "broker connect attempts exhausted"
                            );
                            let _ = fatal_tx
                                .send(ShipperError::ReconnectExhausted { attempts }.into())
                                .await;
                            return;
                        }
                        warn!(
                            attempt = attempts,
                            backoff_secs = backoff.as_secs_f64(),
                            error = %e,
                            "broker connect failed, backing off"
                        );

                        let deadline = sleep(backoff);
                        tokio::pin!(deadline);
                        loop {
                            tokio::select! {
                                _ = &mut deadline => break,
                                maybe = rx.recv() => match maybe {
                                    Some(record) => self.enqueue(record).await,
                                    None => {
                                        debug!("record channel closed while disconnected");
                                        return;
                                    }
                                },
                                _ = shutdown.recv() => {
                                    let pending = self.queue.lock().await.len();
                                    if pending > 0 {
                                        warn!(pending = pending, "shutdown while disconnected, records unflushed");
                                    }
                                    return;
                                }
                            }
                        }
                        backoff = next_backoff(backoff);
                    }
                }
            };

            info!(state = %PublisherState::Ready, "publisher ready");

            // --- 발행 단계 ---
            let mut flush_timer = interval(self.settings.batch_timeout);
            flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let batch = self.queue.lock().await.drain_batch(PUBLISH_BATCH);
                if !batch.is_empty() {
                    if let Err(e) = self.publish_batch(&channel, batch).await {
                        warn!(error = %e, "publish failed, entering reconnect");
                        self.set_state(PublisherState::Errored).await;
                        drop(channel);
                        let _ = connection.close(0, "publisher reconnect").await;
                        self.set_state(PublisherState::Disconnected).await;
                        continue 'reconnect;
                    }
                    // 큐가 빌 때까지 계속 플러시
                    continue;
                }

                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(record) => self.enqueue(record).await,
                        None => {
                            debug!("record channel closed, draining and stopping");
                            let deadline = Instant::now() + self.settings.flush_deadline;
                            self.drain_until(&channel, deadline).await;
                            return;
                        }
                    },
                    _ = flush_timer.tick() => {}
                    _ = shutdown.recv() => {
                        // 종료: 빌더가 채널을 닫을 때까지 잔여 유입분을 수거한 뒤,
                        // 같은 데드라인 내에서 로컬 큐를 플러시
                        let deadline = Instant::now() + self.settings.flush_deadline;
                        let _ = timeout_at(deadline, async {
                            while let Some(record) = rx.recv().await {
                                self.enqueue(record).await;
                            }
                        })
                        .await;
                        self.drain_until(&channel, deadline).await;
                        let _ = connection.close(0, "publisher shutdown").await;
                        return;
                    }
                }
            }
        }
    }

    /// 연결 -> 채널 -> 확인 모드 -> 익스체인지 선언까지 한 번의 시도를 수행합니다.
    async fn connect_ready(&self) -> Result<(Connection, Channel), ShipperError> {
        self.set_state(PublisherState::Connecting).await;

        let connection = match timeout(
            CONNECT_TIMEOUT,
            Connection::connect(&self.settings.broker_url, ConnectionProperties::default()),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.set_state(PublisherState::Disconnected).await;
                return Err(ShipperError::Connect(e.to_string()));
            }
            Err(_) => {
                self.set_state(PublisherState::Disconnected).await;
                return Err(ShipperError::Connect("connect attempt timed out".to_owned()));
            }
        };
        self.set_state(PublisherState::Connected).await;

        self.set_state(PublisherState::Channeling).await;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ShipperError::Connect(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ShipperError::Connect(e.to_string()))?;
        channel
            .exchange_declare(
                LOGS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ShipperError::Connect(e.to_string()))?;

        self.set_state(PublisherState::Ready).await;
        Ok((connection, channel))
    }

    /// 배치를 순서대로 발행합니다.
    ///
    /// 실패한 레코드와 미발행 잔여분은 큐 머리에 순서대로 되돌립니다.
    async fn publish_batch(
        &self,
        channel: &Channel,
        batch: Vec<LogRecord>,
    ) -> Result<(), ShipperError> {
        let mut pending = batch.into_iter();

        while let Some(record) = pending.next() {
            if let Err(e) = self.publish_with_retry(channel, &record).await {
                let mut queue = self.queue.lock().await;
                let mut rest: Vec<LogRecord> = pending.collect();
                rest.reverse();
                for leftover in rest {
                    queue.push_front(leftover);
                }
                queue.push_front(record);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 레코드 하나를 재시도와 함께 발행합니다.
    async fn publish_with_retry(
        &self,
        channel: &Channel,
        record: &LogRecord,
    ) -> Result<(), ShipperError> {
        let mut last_error = None;

        for attempt in 0..SEND_RETRIES {
            if attempt > 0 {
                sleep(SEND_RETRY_SPACING).await;
            }
            match publish_once(channel, record).await {
                Ok(()) => {
                    self.published_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        attempt = attempt + 1,
                        routing_key = %record.routing_key(),
                        error = %e,
                        "publish attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ShipperError::Publish {
            routing_key: record.routing_key(),
            reason: "unknown publish failure".to_owned(),
        }))
    }

    /// 레코드를 로컬 큐에 추가합니다 (가득 차면 drop-oldest).
    async fn enqueue(&self, record: LogRecord) {
        self.queue.lock().await.push(record);
    }

    /// 주어진 데드라인까지 큐를 플러시합니다.
    async fn drain_until(&self, channel: &Channel, deadline: Instant) {
        let result = timeout_at(deadline, async {
            loop {
                let batch = self.queue.lock().await.drain_batch(PUBLISH_BATCH);
                if batch.is_empty() {
                    break;
                }
                if let Err(e) = self.publish_batch(channel, batch).await {
                    warn!(error = %e, "flush publish failed during shutdown");
                    break;
                }
            }
        })
        .await;

        let leftover = self.queue.lock().await.len();
        match result {
            Ok(()) if leftover == 0 => info!("publisher queue flushed"),
            _ => warn!(leftover = leftover, "publisher flush incomplete at shutdown"),
        }
    }

    async fn set_state(&self, state: PublisherState) {
        let mut guard = self.state.lock().await;
        if *guard != state {
            debug!(from = %*guard, to = %state, "publisher state transition");
            *guard = state;
        }
    }
}

/// 레코드 하나를 발행하고 브로커 확인을 기다립니다.
async fn publish_once(channel: &Channel, record: &LogRecord) -> Result<(), ShipperError> {
    let routing_key = record.routing_key();
    let payload = serde_json::to_vec(record).map_err(|e| ShipperError::Publish {
        routing_key: routing_key.clone(),
        reason: format!("serialization failed: {e}"),
    })?;

    let confirm = channel
        .basic_publish(
            LOGS_EXCHANGE,
            &routing_key,
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default()
                .with_delivery_mode(2) // persistent
                .with_content_type("application/json".into()),
        )
        .await
        .map_err(|e| ShipperError::Publish {
            routing_key: routing_key.clone(),
            reason: e.to_string(),
        })?
        .await
        .map_err(|e| ShipperError::Publish {
            routing_key: routing_key.clone(),
            reason: e.to_string(),
        })?;

    match confirm {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(_) => Err(ShipperError::Publish {
            routing_key,
            reason: "broker negatively acknowledged".to_owned(),
        }),
    }
}

/// 다음 재연결 지연을 계산합니다 (1.5배 증가, 30초 상한).
fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(RECONNECT_FACTOR).min(RECONNECT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut delay = RECONNECT_BASE;
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(7_500));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(11_250));

        for _ in 0..10 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, RECONNECT_CAP);
    }

    #[test]
    fn state_display_names() {
        assert_eq!(PublisherState::Disconnected.to_string(), "disconnected");
        assert_eq!(PublisherState::Ready.to_string(), "ready");
        assert_eq!(PublisherState::Errored.to_string(), "errored");
    }

    #[tokio::test]
    async fn publisher_starts_disconnected() {
        let publisher = BrokerPublisher::new(
            PublisherSettings {
                broker_url: "amqp://localhost:5672".to_owned(),
                batch_timeout: Duration::from_millis(500),
                flush_deadline: Duration::from_secs(10),
            },
            100,
        );
        assert_eq!(*publisher.state_handle().lock().await, PublisherState::Disconnected);
        assert_eq!(publisher.published_handle().load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn enqueue_respects_capacity() {
        let publisher = BrokerPublisher::new(
            PublisherSettings {
                broker_url: "amqp://localhost:5672".to_owned(),
                batch_timeout: Duration::from_millis(500),
                flush_deadline: Duration::from_secs(10),
            },
            2,
        );
        for i in 0..4 {
            publisher.enqueue(sample_record(&format!("r{i}"))).await;
        }
        let queue = publisher.queue_handle();
        let guard = queue.lock().await;
        assert_eq!(guard.len(), 2);
        assert_eq!(guard.dropped_count(), 2);
    }

    fn sample_record(msg: &str) -> LogRecord {
        use opsentra_core::types::{Level, SourceType};
        LogRecord {
            timestamp: chrono::Utc::now(),
            level: Level::Info,
            service: "test".to_owned(),
            host: "host".to_owned(),
            ip: "10.0.0.1".to_owned(),
            source: "/var/log/test.log".to_owned(),
            message: msg.to_owned(),
            source_type: SourceType::System,
            metadata: Default::default(),
        }
    }
}
