//! Shipper 파이프라인 오케스트레이션 -- 탐색/테일/빌드/발행의 전체 흐름을 관리합니다.
//!
//! [`ShipperPipeline`]은 core의 [`Pipeline`] trait을 구현하여
//! `opsentra-daemon`에서 다른 모듈과 동일한 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! Discoverer -> Tailers (소스당 1개) -> mpsc -> RecordBuilder -> mpsc -> Publisher -> broker
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use opsentra_core::error::OpsentraError;
use opsentra_core::pipeline::{HealthStatus, Pipeline};
use opsentra_core::types::LogRecord;

use crate::config::ShipperPipelineConfig;
use crate::discover::discover_sources;
use crate::error::ShipperError;
use crate::identity;
use crate::publisher::{BrokerPublisher, PublisherSettings, PublisherState};
use crate::queue::RecordQueue;
use crate::record::RecordBuilder;
use crate::tailer::{FileTailer, TailedLine, TailerConfig};

/// 레코드 채널 용량 (빌더 -> 발행기)
const RECORD_CHANNEL_CAPACITY: usize = 1024;

/// 파이프라인 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShipperState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// Shipper 파이프라인
///
/// 기동 시 소스를 1회 탐색하고, 소스당 테일러 태스크 하나와
/// 빌더/발행기 태스크를 스폰합니다. 테일러 하나의 실패는
/// 다른 테일러에 영향을 주지 않습니다.
pub struct ShipperPipeline {
    /// 파이프라인 설정
    config: ShipperPipelineConfig,
    /// 현재 상태
    state: ShipperState,
    /// 종료 브로드캐스트 송신측
    shutdown_tx: broadcast::Sender<()>,
    /// 백그라운드 태스크 핸들
    tasks: Vec<tokio::task::JoinHandle<()>>,
    /// 치명적 에러 보고 채널
    fatal_tx: mpsc::Sender<OpsentraError>,
    /// 발행기 로컬 큐 (헬스 리포팅용 공유 핸들)
    queue: Option<Arc<Mutex<RecordQueue>>>,
    /// 발행기 상태 (헬스 리포팅용 공유 핸들)
    publisher_state: Option<Arc<Mutex<PublisherState>>>,
    /// 발행 성공 카운터
    published_count: Arc<AtomicU64>,
    /// 빌드된 레코드 카운터
    built_count: Arc<AtomicU64>,
    /// 활성 소스 수
    source_count: usize,
}

impl ShipperPipeline {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            ShipperState::Initialized => "initialized",
            ShipperState::Running => "running",
            ShipperState::Stopped => "stopped",
        }
    }

    /// 빌드된 레코드 수를 반환합니다.
    pub fn built_count(&self) -> u64 {
        self.built_count.load(Ordering::Relaxed)
    }

    /// 발행된 레코드 수를 반환합니다.
    pub fn published_count(&self) -> u64 {
        self.published_count.load(Ordering::Relaxed)
    }

    /// 탐색된 소스 수를 반환합니다.
    pub fn source_count(&self) -> usize {
        self.source_count
    }

    /// 발행기 큐 사용률을 반환합니다 (실행 중이 아니면 0.0).
    pub async fn queue_utilization(&self) -> f64 {
        match &self.queue {
            Some(queue) => queue.lock().await.utilization(),
            None => 0.0,
        }
    }
}

impl Pipeline for ShipperPipeline {
    async fn start(&mut self) -> Result<(), OpsentraError> {
        if self.state == ShipperState::Running {
            return Err(opsentra_core::error::PipelineError::AlreadyRunning.into());
        }

        info!("starting shipper pipeline");

        // 1. 호스트 식별자 해석 (메타데이터 질의는 2초 데드라인, 1회 캐시)
        let identity = identity::resolve().await;
        let builder = RecordBuilder::new(identity.host, identity.ip);

        // 2. 소스 탐색 (기동 시 1회)
        let sources = discover_sources(&self.config);
        if sources.is_empty() {
            warn!("no log sources discovered, shipper will be idle");
        }
        self.source_count = sources.len();

        // 3. 채널 구성
        let (line_tx, mut line_rx) =
            mpsc::channel::<TailedLine>(self.config.line_channel_capacity);
        let (record_tx, record_rx) = mpsc::channel::<LogRecord>(RECORD_CHANNEL_CAPACITY);

        // 4. 발행기 태스크
        let publisher = BrokerPublisher::new(
            PublisherSettings {
                broker_url: self.config.broker_url.clone(),
                batch_timeout: self.config.batch_timeout(),
                flush_deadline: std::time::Duration::from_secs(self.config.flush_deadline_secs),
            },
            self.config.queue_capacity,
        );
        self.queue = Some(publisher.queue_handle());
        self.publisher_state = Some(publisher.state_handle());
        self.published_count = publisher.published_handle();
        self.tasks.push(tokio::spawn(publisher.run(
            record_rx,
            self.shutdown_tx.subscribe(),
            self.fatal_tx.clone(),
        )));

        // 5. 빌더 태스크
        let built_count = Arc::clone(&self.built_count);
        let mut builder_shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = line_rx.recv() => match maybe {
                        Some(tailed) => {
                            if let Some(record) = builder.build(&tailed.line, &tailed.source) {
                                built_count.fetch_add(1, Ordering::Relaxed);
                                if record_tx.send(record).await.is_err() {
                                    debug!("record receiver dropped, builder stopping");
                                    return;
                                }
                            }
                        }
                        None => {
                            debug!("line channel closed, builder stopping");
                            return;
                        }
                    },
                    _ = builder_shutdown.recv() => {
                        // 종료: 테일러들이 부분 라인을 확정하고 채널을 닫을 때까지
                        // 잔여 라인을 모두 소화
                        while let Some(tailed) = line_rx.recv().await {
                            if let Some(record) = builder.build(&tailed.line, &tailed.source) {
                                built_count.fetch_add(1, Ordering::Relaxed);
                                let _ = record_tx.send(record).await;
                            }
                        }
                        return;
                    }
                }
            }
        }));

        // 6. 소스당 테일러 태스크
        let tailer_config = TailerConfig {
            poll_interval: self.config.poll_interval(),
            retry_window: self.config.retry_window(),
        };
        for source in sources {
            let tailer = FileTailer::new(Arc::new(source), tailer_config.clone(), line_tx.clone());
            self.tasks
                .push(tokio::spawn(tailer.run(self.shutdown_tx.subscribe())));
        }
        drop(line_tx);

        self.state = ShipperState::Running;
        info!(sources = self.source_count, "shipper pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), OpsentraError> {
        if self.state != ShipperState::Running {
            return Err(opsentra_core::error::PipelineError::NotRunning.into());
        }

        info!("stopping shipper pipeline");

        // 종료 신호 브로드캐스트: 테일러 -> 빌더 -> 발행기 순으로 드레인됩니다.
        // 발행기는 플러시 데드라인 내에서 로컬 큐를 비웁니다.
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "shipper task join failed");
            }
        }

        self.queue = None;
        self.publisher_state = None;
        self.state = ShipperState::Stopped;
        info!("shipper pipeline stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ShipperState::Running => {
                if let Some(state) = &self.publisher_state {
                    let state = *state.lock().await;
                    if state != PublisherState::Ready {
                        return HealthStatus::Degraded(format!("publisher {state}"));
                    }
                }
                let utilization = self.queue_utilization().await;
                if utilization > 0.9 {
                    HealthStatus::Degraded(format!(
                        "publish queue utilization high: {:.1}%",
                        utilization * 100.0
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            ShipperState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ShipperState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// Shipper 파이프라인 빌더
///
/// 파이프라인을 구성하고 치명적 에러 보고 채널을 생성합니다.
pub struct ShipperPipelineBuilder {
    config: ShipperPipelineConfig,
    fatal_channel_capacity: usize,
}

impl ShipperPipelineBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: ShipperPipelineConfig::default(),
            fatal_channel_capacity: 4,
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: ShipperPipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// 파이프라인을 빌드합니다.
    ///
    /// # Returns
    /// - `ShipperPipeline`: 파이프라인 인스턴스
    /// - `mpsc::Receiver<OpsentraError>`: 치명적 에러 수신 채널
    ///   (브로커 재연결 한도 초과 등, 데몬이 비정상 종료를 결정할 때 사용)
    pub fn build(
        self,
    ) -> Result<(ShipperPipeline, mpsc::Receiver<OpsentraError>), ShipperError> {
        self.config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(16);
        let (fatal_tx, fatal_rx) = mpsc::channel(self.fatal_channel_capacity);

        let pipeline = ShipperPipeline {
            config: self.config,
            state: ShipperState::Initialized,
            shutdown_tx,
            tasks: Vec::new(),
            fatal_tx,
            queue: None,
            publisher_state: None,
            published_count: Arc::new(AtomicU64::new(0)),
            built_count: Arc::new(AtomicU64::new(0)),
            source_count: 0,
        };

        Ok((pipeline, fatal_rx))
    }
}

impl Default for ShipperPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
