//! 도메인 타입 -- 시스템 전역에서 사용되는 공통 타입
//!
//! Shipper와 Aggregator가 공유하는 데이터 구조를 정의합니다.
//! [`LogRecord`]는 파이프라인 전체를 관통하는 표준 로그 단위이며,
//! 브로커 메시지 페이로드는 이 타입의 JSON 직렬화 결과입니다.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 로그 레벨
///
/// 레코드 빌더가 원시 라인에서 추출하며, 추출 실패 시 `Info`가 기본값입니다.
/// `Ord` 구현으로 레벨 비교가 가능합니다 (`Trace < Debug < Info < Warn < Error < Fatal`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// 상세 추적
    Trace,
    /// 디버그
    Debug,
    /// 정보성 (기본값)
    #[default]
    Info,
    /// 경고
    Warn,
    /// 에러
    Error,
    /// 치명적 -- 프로세스/서비스 수준 장애
    Fatal,
}

impl Level {
    /// 문자열에서 레벨을 파싱합니다.
    ///
    /// 대소문자를 구분하지 않으며, 일반적인 별칭(`warning`, `critical` 등)을 허용합니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "err" => Some(Self::Error),
            "fatal" | "critical" | "crit" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// 레벨의 소문자 표기를 반환합니다.
    ///
    /// 브로커 페이로드와 스토어 문서가 사용하는 표준 표기입니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 로그 소스 유형
///
/// 디스커버러가 소스 경로를 분류할 때 결정되며, 레코드에 그대로 전파됩니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// 일반 시스템 로그 파일
    #[default]
    System,
    /// 컨테이너 런타임 로그 (JSON 라인 래핑)
    Container,
    /// 파드 로그 트리
    Pod,
    /// CI 잡 로그
    Ci,
    /// 사용자 지정 경로
    Custom,
}

impl SourceType {
    /// 소스 유형의 소문자 표기를 반환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Container => "container",
            Self::Pod => "pod",
            Self::Ci => "ci",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 로그 레코드
///
/// 파이프라인의 보편 단위입니다. Shipper의 레코드 빌더가 생성하고,
/// 브로커를 거쳐 Aggregator가 스토어에 영속화합니다.
///
/// # 불변식
/// - `message`, `service`, `host`는 비어있지 않습니다.
/// - `level`은 항상 [`Level`] 열거형의 값입니다.
/// - 동일 소스 내에서 `timestamp`는 단조 증가합니다 (파일 순서 캡처).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// 캡처 시각 (UTC, 밀리초 정밀도)
    pub timestamp: DateTime<Utc>,
    /// 로그 레벨
    #[serde(default)]
    pub level: Level,
    /// 서비스 식별자 (소스 경로에서 파생)
    pub service: String,
    /// 캡처 호스트명
    pub host: String,
    /// 네트워크 식별자 (클라우드 메타데이터 IP 또는 호스트명)
    #[serde(default)]
    pub ip: String,
    /// 원본 파일/스트림의 절대 경로
    pub source: String,
    /// 원시 라인 (후행 개행 제거, 그 외 변형 없음)
    pub message: String,
    /// 소스 유형
    #[serde(default, rename = "sourceType")]
    pub source_type: SourceType,
    /// 개방형 메타데이터 (컨테이너 ID, 파드명, 네임스페이스, 잡명 등)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl LogRecord {
    /// 브로커 라우팅 키를 생성합니다 (`logs.<service>.<ip-or-host>`).
    ///
    /// 컨슈머는 임의의 프리픽스로 바인딩할 수 있습니다.
    pub fn routing_key(&self) -> String {
        let identity = if self.ip.is_empty() {
            &self.host
        } else {
            &self.ip
        };
        format!("logs.{}.{}", self.service, identity)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.level, self.host, self.service, self.message,
        )
    }
}

/// 소스 기술자
///
/// Shipper 측의 임시 객체입니다. 디스커버러가 생성하고 테일러 하나가 소비하며,
/// 테일러 종료와 함께 소멸합니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// 로그 파일의 절대 경로
    pub path: PathBuf,
    /// 소스 유형
    pub source_type: SourceType,
    /// 파생된 서비스명
    pub service: String,
    /// 부가 메타데이터 (레코드의 `metadata`로 전파)
    pub metadata: BTreeMap<String, String>,
}

impl SourceDescriptor {
    /// 새 소스 기술자를 생성합니다.
    pub fn new(
        path: impl Into<PathBuf>,
        source_type: SourceType,
        service: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            source_type,
            service: service.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 메타데이터 항목을 추가합니다.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) service={}",
            self.path.display(),
            self.source_type,
            self.service,
        )
    }
}

/// 보강 업데이트
///
/// 외부 분석 서비스가 `ai-enriched` 큐로 발행하는 2차 페이로드입니다.
/// 영속화된 레코드에 식별자로 병합됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentUpdate {
    /// 대상 레코드 식별자
    pub log_id: String,
    /// 분석 텍스트
    #[serde(alias = "suggestion")]
    pub analysis: String,
    /// 제안 명령 목록
    #[serde(default, alias = "commands")]
    pub suggestions: Vec<String>,
    /// 신뢰도 (0.0 ~ 1.0)
    #[serde(default)]
    pub confidence: f64,
}

impl fmt::Display for EnrichmentUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enrichment for {} (confidence {:.2}, {} suggestions)",
            self.log_id,
            self.confidence,
            self.suggestions.len(),
        )
    }
}
