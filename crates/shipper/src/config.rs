//! Shipper 파이프라인 설정
//!
//! [`ShipperPipelineConfig`]는 core의 [`ShipperConfig`](opsentra_core::config::ShipperConfig)를
//! 기반으로 Shipper 전용 설정을 제공합니다.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ShipperError;

/// Shipper 파이프라인 설정
///
/// core의 `ShipperConfig`에서 파생되며, 파이프라인 내부에서
/// 사용하는 추가 설정을 포함합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperPipelineConfig {
    /// 브로커 URL (필수)
    pub broker_url: String,
    /// 일반 로그 파일 글롭 패턴 목록
    pub log_paths: Vec<String>,
    /// 컨테이너 런타임 로그 수집 여부
    pub container_enabled: bool,
    /// 컨테이너 런타임 로그 루트
    pub container_root: String,
    /// 파드 로그 트리 수집 여부
    pub pod_enabled: bool,
    /// 파드 로그 트리 루트
    pub pod_root: String,
    /// CI 잡 로그 수집 여부
    pub ci_enabled: bool,
    /// CI 로그 루트 목록
    pub ci_roots: Vec<String>,
    /// 사용자 지정 경로 목록
    pub custom_paths: Vec<String>,
    /// 발행기 로컬 큐 최대 용량 (high-water)
    pub queue_capacity: usize,
    /// 발행 배치 타임아웃 (밀리초)
    pub batch_timeout_ms: u64,
    /// 테일러 재시도 윈도우 (초, 최소 5)
    pub retry_window_secs: u64,

    // --- 확장 설정 (core에 없는 추가 필드) ---
    /// 테일러 폴링 주기 (밀리초)
    pub poll_interval_ms: u64,
    /// 테일러 -> 빌더 채널 용량
    pub line_channel_capacity: usize,
    /// 종료 시 발행기 플러시 데드라인 (초)
    pub flush_deadline_secs: u64,
}

impl Default for ShipperPipelineConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            log_paths: vec!["/var/log/*.log".to_owned()],
            container_enabled: true,
            container_root: "/var/lib/docker/containers".to_owned(),
            pod_enabled: false,
            pod_root: "/var/log/pods".to_owned(),
            ci_enabled: false,
            ci_roots: Vec::new(),
            custom_paths: Vec::new(),
            queue_capacity: 10_000,
            batch_timeout_ms: 500,
            retry_window_secs: 5,
            poll_interval_ms: 500,
            line_channel_capacity: 1024,
            flush_deadline_secs: 10,
        }
    }
}

impl ShipperPipelineConfig {
    /// core의 `ShipperConfig`에서 파이프라인 설정을 생성합니다.
    ///
    /// core 설정에 없는 확장 필드는 기본값이 적용됩니다.
    pub fn from_core(core: &opsentra_core::config::ShipperConfig) -> Self {
        Self {
            broker_url: core.broker_url.clone(),
            log_paths: core.log_paths.clone(),
            container_enabled: core.container_enabled,
            container_root: core.container_root.clone(),
            pod_enabled: core.pod_enabled,
            pod_root: core.pod_root.clone(),
            ci_enabled: core.ci_enabled,
            ci_roots: core.ci_roots.clone(),
            custom_paths: core.custom_paths.clone(),
            queue_capacity: core.batch_size,
            batch_timeout_ms: core.batch_timeout_ms,
            retry_window_secs: core.retry_window_secs,
            ..Self::default()
        }
    }

    /// 테일러 폴링 주기를 반환합니다.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 테일러 재시도 윈도우를 반환합니다.
    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.retry_window_secs)
    }

    /// 발행 배치 타임아웃을 반환합니다.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ShipperError> {
        const MAX_QUEUE_CAPACITY: usize = 10_000_000;

        if self.broker_url.is_empty() {
            return Err(ShipperError::Config {
                field: "broker_url".to_owned(),
                reason: "required, no default".to_owned(),
            });
        }
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ShipperError::Config {
                field: "queue_capacity".to_owned(),
                reason: format!("must be 1-{}", MAX_QUEUE_CAPACITY),
            });
        }
        if self.batch_timeout_ms == 0 {
            return Err(ShipperError::Config {
                field: "batch_timeout_ms".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.retry_window_secs < 5 {
            return Err(ShipperError::Config {
                field: "retry_window_secs".to_owned(),
                reason: "must be at least 5".to_owned(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ShipperError::Config {
                field: "poll_interval_ms".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.line_channel_capacity == 0 {
            return Err(ShipperError::Config {
                field: "line_channel_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        Ok(())
    }
}

/// Shipper 파이프라인 설정 빌더
#[derive(Default)]
pub struct ShipperPipelineConfigBuilder {
    config: ShipperPipelineConfig,
}

impl ShipperPipelineConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 브로커 URL을 설정합니다.
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    /// 로그 파일 글롭 패턴을 설정합니다.
    pub fn log_paths(mut self, paths: Vec<String>) -> Self {
        self.config.log_paths = paths;
        self
    }

    /// 컨테이너 수집 여부를 설정합니다.
    pub fn container_enabled(mut self, enabled: bool) -> Self {
        self.config.container_enabled = enabled;
        self
    }

    /// 컨테이너 로그 루트를 설정합니다.
    pub fn container_root(mut self, root: impl Into<String>) -> Self {
        self.config.container_root = root.into();
        self
    }

    /// 파드 수집 여부를 설정합니다.
    pub fn pod_enabled(mut self, enabled: bool) -> Self {
        self.config.pod_enabled = enabled;
        self
    }

    /// 파드 로그 루트를 설정합니다.
    pub fn pod_root(mut self, root: impl Into<String>) -> Self {
        self.config.pod_root = root.into();
        self
    }

    /// CI 수집 여부를 설정합니다.
    pub fn ci_enabled(mut self, enabled: bool) -> Self {
        self.config.ci_enabled = enabled;
        self
    }

    /// CI 로그 루트를 설정합니다.
    pub fn ci_roots(mut self, roots: Vec<String>) -> Self {
        self.config.ci_roots = roots;
        self
    }

    /// 사용자 지정 경로를 설정합니다.
    pub fn custom_paths(mut self, paths: Vec<String>) -> Self {
        self.config.custom_paths = paths;
        self
    }

    /// 발행기 큐 용량을 설정합니다.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// 배치 타임아웃(밀리초)을 설정합니다.
    pub fn batch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.batch_timeout_ms = ms;
        self
    }

    /// 폴링 주기(밀리초)를 설정합니다.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// 설정을 검증하고 `ShipperPipelineConfig`를 생성합니다.
    pub fn build(self) -> Result<ShipperPipelineConfig, ShipperError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_broker_url() {
        let config = ShipperPipelineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_core_preserves_values() {
        let core = opsentra_core::config::ShipperConfig {
            broker_url: "amqp://broker:5672".to_owned(),
            log_paths: vec!["/var/log/nginx/*.log".to_owned()],
            batch_size: 5_000,
            batch_timeout_ms: 250,
            ..Default::default()
        };
        let config = ShipperPipelineConfig::from_core(&core);
        assert_eq!(config.broker_url, "amqp://broker:5672");
        assert_eq!(config.queue_capacity, 5_000);
        assert_eq!(config.batch_timeout_ms, 250);
        // 확장 필드는 기본값
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.flush_deadline_secs, 10);
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = ShipperPipelineConfigBuilder::new()
            .broker_url("amqp://localhost:5672")
            .log_paths(vec!["/tmp/test/*.log".to_owned()])
            .queue_capacity(100)
            .build()
            .unwrap();
        assert_eq!(config.queue_capacity, 100);
    }

    #[test]
    fn builder_rejects_zero_queue_capacity() {
        let result = ShipperPipelineConfigBuilder::new()
            .broker_url("amqp://localhost:5672")
            .queue_capacity(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_short_retry_window() {
        let config = ShipperPipelineConfig {
            broker_url: "amqp://localhost:5672".to_owned(),
            retry_window_secs: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
