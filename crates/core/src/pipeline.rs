//! 파이프라인 trait -- 모듈 생명주기 정의
//!
//! [`Pipeline`] trait은 Shipper/Aggregator 모듈이 구현하는 생명주기 인터페이스입니다.
//! `opsentra-daemon`이 이 인터페이스로 모듈을 기동/정지하고 상태를 확인합니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::OpsentraError;

/// dyn-compatible Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 모든 파이프라인 모듈이 구현하는 생명주기 trait
///
/// # 구현 예시
/// ```ignore
/// struct ShipperPipeline { /* ... */ }
///
/// impl Pipeline for ShipperPipeline {
///     async fn start(&mut self) -> Result<(), OpsentraError> {
///         // 소스 탐색, 테일러 스폰, 발행기 기동
///         Ok(())
///     }
///
///     async fn stop(&mut self) -> Result<(), OpsentraError> {
///         // 드레인 후 리소스 정리
///         Ok(())
///     }
///
///     async fn health_check(&self) -> HealthStatus {
///         HealthStatus::Healthy
///     }
/// }
/// ```
pub trait Pipeline: Send + Sync {
    /// 모듈을 시작합니다.
    ///
    /// 의존 시스템 연결, 워커 스폰, 채널 연결을 수행합니다.
    /// 이미 실행 중인 경우 `PipelineError::AlreadyRunning`을 반환합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), OpsentraError>> + Send;

    /// 모듈을 정지합니다.
    ///
    /// Graceful shutdown을 수행합니다. 진행 중인 작업을 드레인하고
    /// 외부 연결을 닫습니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), OpsentraError>> + Send;

    /// 모듈의 현재 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn-compatible 파이프라인 trait
///
/// `Pipeline` trait은 RPITIT를 사용하므로 `dyn Pipeline`이 불가합니다.
/// `DynPipeline`은 `BoxFuture`를 반환하여 데몬이 모듈을
/// `Box<dyn DynPipeline>`으로 동적 관리할 수 있게 합니다.
pub trait DynPipeline: Send + Sync {
    /// 모듈을 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), OpsentraError>>;

    /// 모듈을 정지합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), OpsentraError>>;

    /// 모듈의 현재 상태를 확인합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), OpsentraError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), OpsentraError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

/// 모듈 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상 동작 중
    Healthy,
    /// 성능 저하 또는 부분적 장애 (서비스는 계속 동작)
    Degraded(String),
    /// 비정상 -- 서비스 불가 상태
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 비정상 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_healthy() {
        let status = HealthStatus::Healthy;
        assert!(status.is_healthy());
        assert!(!status.is_unhealthy());
        assert_eq!(status.to_string(), "healthy");
    }

    #[test]
    fn health_status_degraded() {
        let status = HealthStatus::Degraded("publisher queue 92% full".to_owned());
        assert!(!status.is_healthy());
        assert!(!status.is_unhealthy());
        assert!(status.to_string().contains("92%"));
    }

    #[test]
    fn health_status_unhealthy() {
        let status = HealthStatus::Unhealthy("broker unreachable".to_owned());
        assert!(status.is_unhealthy());
        assert!(status.to_string().contains("broker unreachable"));
    }

    #[test]
    fn health_status_serialize_roundtrip() {
        let status = HealthStatus::Degraded("slow".to_owned());
        let json = serde_json::to_string(&status).unwrap();
        let back: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }

    struct MockPipeline {
        running: bool,
    }

    impl Pipeline for MockPipeline {
        async fn start(&mut self) -> Result<(), OpsentraError> {
            if self.running {
                return Err(crate::error::PipelineError::AlreadyRunning.into());
            }
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), OpsentraError> {
            if !self.running {
                return Err(crate::error::PipelineError::NotRunning.into());
            }
            self.running = false;
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            if self.running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy("not running".to_owned())
            }
        }
    }

    #[tokio::test]
    async fn mock_pipeline_lifecycle() {
        let mut pipeline = MockPipeline { running: false };

        assert!(Pipeline::health_check(&pipeline).await.is_unhealthy());

        Pipeline::start(&mut pipeline).await.unwrap();
        assert!(Pipeline::health_check(&pipeline).await.is_healthy());

        // 중복 시작 시 에러
        assert!(Pipeline::start(&mut pipeline).await.is_err());

        Pipeline::stop(&mut pipeline).await.unwrap();
        assert!(Pipeline::health_check(&pipeline).await.is_unhealthy());

        // 중복 정지 시 에러
        assert!(Pipeline::stop(&mut pipeline).await.is_err());
    }

    #[tokio::test]
    async fn dyn_pipeline_can_be_boxed() {
        let mut pipeline: Box<dyn DynPipeline> = Box::new(MockPipeline { running: false });

        assert!(pipeline.health_check().await.is_unhealthy());
        pipeline.start().await.unwrap();
        assert!(pipeline.health_check().await.is_healthy());
        pipeline.stop().await.unwrap();
    }
}
