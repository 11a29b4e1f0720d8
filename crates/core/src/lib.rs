#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{
    ArchiveError, BrokerError, ConfigError, OpsentraError, PipelineError, StorageError,
};

// 설정
pub use config::{AggregatorConfig, GeneralConfig, OpsentraConfig, ShipperConfig};

// 파이프라인 trait
pub use pipeline::{DynPipeline, HealthStatus, Pipeline};

// 도메인 타입
pub use types::{EnrichmentUpdate, Level, LogRecord, SourceDescriptor, SourceType};

/// 브로커 토픽 익스체인지명
pub const LOGS_EXCHANGE: &str = "logs_exchange";
/// 원시 로그 큐명
pub const RAW_LOGS_QUEUE: &str = "raw-logs";
/// 보강 데이터 큐명
pub const ENRICHED_QUEUE: &str = "ai-enriched";
/// 원시 로그 바인딩 키 (모든 레코드)
pub const RAW_LOGS_BINDING: &str = "logs.#";
/// 보강 데이터 바인딩 키
pub const ENRICHED_BINDING: &str = "ai.#";
