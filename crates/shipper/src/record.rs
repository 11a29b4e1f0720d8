//! 레코드 빌더 -- 원시 라인을 구조화된 로그 레코드로 변환합니다.
//!
//! `(rawLine, source)`를 받아 완전히 채워진 [`LogRecord`]를 생성합니다.
//! 비어있지 않은 트림된 라인당 정확히 하나의 레코드를 생성하며,
//! 빈 라인은 드롭합니다.
//!
//! # 레벨 추출
//! 다음 패턴을 순서대로 적용하여 첫 매치를 사용합니다:
//! 1. `[LEVEL]`
//! 2. `LEVEL:`
//! 3. 선행 ISO 유사 날짜 뒤의 `LEVEL`
//!
//! 모두 실패하면 단어 스캔 휴리스틱을 적용하고, 그마저 실패하면 `info`입니다.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use opsentra_core::types::{Level, LogRecord, SourceDescriptor, SourceType};

/// `[LEVEL]` 패턴
static BRACKET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(trace|debug|info|warn|warning|error|fatal|critical)\]")
        .expect("bracket pattern compiles")
});

/// `LEVEL:` 패턴
static COLON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(trace|debug|info|warn|warning|error|fatal|critical):")
        .expect("colon pattern compiles")
});

/// 선행 ISO 유사 날짜 + LEVEL 패턴
static DATED_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?\s+(trace|debug|info|warn|warning|error|fatal|critical)\b",
    )
    .expect("dated pattern compiles")
});

/// 단어 스캔 휴리스틱 (2차)
static WORD_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|err|fatal|critical)\b").expect("word pattern compiles")
});
static WORD_WARN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(warn|warning)\b").expect("word pattern compiles"));
static WORD_INFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binfo\b").expect("word pattern compiles"));
static WORD_DEBUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(debug|trace)\b").expect("word pattern compiles"));

/// 레코드 빌더
///
/// 호스트 식별자는 생성 시 1회 결정되어 모든 레코드에 복사됩니다.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    /// 캡처 호스트명
    host: String,
    /// 네트워크 식별자 (메타데이터 IP 또는 호스트명)
    ip: String,
}

impl RecordBuilder {
    /// 새 레코드 빌더를 생성합니다.
    pub fn new(host: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ip: ip.into(),
        }
    }

    /// 원시 라인 하나를 레코드로 변환합니다.
    ///
    /// 트림 결과가 빈 라인이면 `None`을 반환합니다 (레코드 미생성).
    pub fn build(&self, raw_line: &str, source: &SourceDescriptor) -> Option<LogRecord> {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return None;
        }

        // 컨테이너 런타임 라인 언랩: {"log": "...", "stream": ..., "time": ...}
        let message = if source.source_type == SourceType::Container {
            unwrap_container_line(line)
        } else {
            line.to_owned()
        };
        if message.trim().is_empty() {
            return None;
        }

        let level = extract_level(&message);

        Some(LogRecord {
            timestamp: millisecond_now(),
            level,
            service: source.service.clone(),
            host: self.host.clone(),
            ip: self.ip.clone(),
            source: source.path.display().to_string(),
            message,
            source_type: source.source_type,
            metadata: source.metadata.clone(),
        })
    }
}

/// 컨테이너 런타임 JSON 라인에서 `log` 필드를 추출합니다.
///
/// 파싱에 실패하거나 `log` 필드가 없으면 원본 라인을 그대로 사용합니다.
fn unwrap_container_line(line: &str) -> String {
    if !line.trim_start().starts_with('{') {
        return line.to_owned();
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(doc) => match doc.get("log").and_then(|v| v.as_str()) {
            Some(log) => log.trim_end_matches(['\n', '\r']).to_owned(),
            None => line.to_owned(),
        },
        Err(_) => line.to_owned(),
    }
}

/// 메시지에서 로그 레벨을 추출합니다.
///
/// 순수 함수입니다: 같은 입력에 대해 항상 같은 결과를 반환합니다.
pub fn extract_level(message: &str) -> Level {
    for pattern in [&*BRACKET_PATTERN, &*COLON_PATTERN, &*DATED_PATTERN] {
        if let Some(caps) = pattern.captures(message)
            && let Some(matched) = caps.get(1)
            && let Some(level) = Level::from_str_loose(matched.as_str())
        {
            return level;
        }
    }

    // 2차 휴리스틱: 단어 스캔
    if WORD_ERROR.is_match(message) {
        return Level::Error;
    }
    if WORD_WARN.is_match(message) {
        return Level::Warn;
    }
    if WORD_INFO.is_match(message) {
        return Level::Info;
    }
    if WORD_DEBUG.is_match(message) {
        return Level::Debug;
    }

    Level::Info
}

/// 밀리초 정밀도의 현재 UTC 시각을 반환합니다.
fn millisecond_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
