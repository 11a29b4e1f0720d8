//! 에러 타입 -- 도메인별 에러 정의

/// OpSentra 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum OpsentraError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 브로커 통신 에러
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// 스토리지 에러
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// 아카이브 에러
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// 필수 설정 누락
    #[error("missing required config value: {field}")]
    MissingRequired { field: String },
}

/// 파이프라인 생명주기 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중
    #[error("pipeline already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline not running")]
    NotRunning,

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}

/// 브로커 통신 에러
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// 연결 실패
    #[error("connection failed: {0}")]
    Connection(String),

    /// 채널 열기 실패
    #[error("channel open failed: {0}")]
    Channel(String),

    /// 토폴로지 선언 실패 (익스체인지/큐/바인딩)
    #[error("topology declaration failed: {0}")]
    Topology(String),

    /// 발행 실패
    #[error("publish failed for routing key '{routing_key}': {reason}")]
    Publish { routing_key: String, reason: String },

    /// 소비 실패
    #[error("consume failed on queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    /// 디코딩 불가 메시지
    #[error("undecodable message on queue '{queue}': {reason}")]
    Decode { queue: String, reason: String },

    /// 재연결 시도 한도 초과
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

/// 스토리지 에러
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 연결 실패
    #[error("connection failed: {0}")]
    Connection(String),

    /// 컬렉션/인덱스 준비 실패
    #[error("collection setup failed: {0}")]
    Setup(String),

    /// 쓰기 실패
    #[error("write failed: {0}")]
    Write(String),

    /// 조회 실패
    #[error("query failed: {0}")]
    Query(String),
}

/// 아카이브 에러
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// 버킷 준비 실패
    #[error("bucket setup failed for '{bucket}': {reason}")]
    Bucket { bucket: String, reason: String },

    /// 압축 실패
    #[error("compression failed: {0}")]
    Compress(String),

    /// 업로드 실패
    #[error("upload failed for key '{key}': {reason}")]
    Upload { key: String, reason: String },

    /// 동기화 마킹 실패
    #[error("sync mark failed: {0}")]
    Mark(String),
}
