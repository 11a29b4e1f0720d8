//! Shipper 에러 타입
//!
//! [`ShipperError`]는 Shipper 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<ShipperError> for OpsentraError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use opsentra_core::error::{OpsentraError, PipelineError};

/// Shipper 도메인 에러
///
/// 소스 탐색, 테일링, 레코드 빌드, 발행, 큐잉 등 Shipper 내부의
/// 모든 에러 상황을 포괄합니다.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    /// 소스 탐색 실패
    #[error("discover error: {source_type}: {reason}")]
    Discover {
        /// 소스 유형 (files, container, pod, ci)
        source_type: String,
        /// 실패 사유
        reason: String,
    },

    /// 테일링 실패
    #[error("tail error: {path}: {reason}")]
    Tail {
        /// 대상 파일 경로
        path: String,
        /// 실패 사유
        reason: String,
    },

    /// 브로커 연결 실패
    #[error("broker connect error: {0}")]
    Connect(String),

    /// 발행 실패
    #[error("publish error: routing key '{routing_key}': {reason}")]
    Publish {
        /// 대상 라우팅 키
        routing_key: String,
        /// 실패 사유
        reason: String,
    },

    /// 재연결 시도 한도 초과
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// 소진된 시도 횟수
        attempts: u32,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ShipperError> for OpsentraError {
    fn from(err: ShipperError) -> Self {
        match err {
            ShipperError::Connect(reason) => {
                OpsentraError::Broker(opsentra_core::error::BrokerError::Connection(reason))
            }
            ShipperError::ReconnectExhausted { attempts } => OpsentraError::Broker(
                opsentra_core::error::BrokerError::ReconnectExhausted { attempts },
            ),
            ShipperError::Publish {
                routing_key,
                reason,
            } => OpsentraError::Broker(opsentra_core::error::BrokerError::Publish {
                routing_key,
                reason,
            }),
            other => OpsentraError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
