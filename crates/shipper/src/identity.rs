//! 호스트 식별자 해석 -- 호스트명과 네트워크 IP
//!
//! 호스트명은 OS에서 읽고, IP는 클라우드 메타데이터 엔드포인트에 1회 질의합니다.
//! 메타데이터 질의는 2초 하드 데드라인을 가지며, 실패 시 호스트명으로 대체합니다.
//! 결과는 프로세스 수명 동안 캐시됩니다.

use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info};

/// 클라우드 메타데이터 IP 엔드포인트
const METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/local-ipv4";

/// 메타데이터 질의 하드 데드라인
const METADATA_DEADLINE: Duration = Duration::from_secs(2);

/// 해석된 호스트 식별자
#[derive(Debug, Clone)]
pub struct Identity {
    /// 캡처 호스트의 안정적 이름
    pub host: String,
    /// 최선 노력 네트워크 식별자 (메타데이터 IP 또는 호스트명)
    pub ip: String,
}

static IDENTITY: OnceCell<Identity> = OnceCell::const_new();

/// 호스트 식별자를 해석합니다 (프로세스당 1회, 이후 캐시 반환).
pub async fn resolve() -> Identity {
    IDENTITY
        .get_or_init(|| async {
            let host = resolve_host();
            let ip = resolve_ip(METADATA_URL, &host).await;
            info!(host = %host, ip = %ip, "capture identity resolved");
            Identity { host, ip }
        })
        .await
        .clone()
}

/// OS 호스트명을 읽습니다.
fn resolve_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_owned())
}

/// 메타데이터 엔드포인트에서 IP를 질의합니다.
///
/// 2초 내에 2xx 응답과 비어있지 않은 본문을 받지 못하면 호스트명으로 대체합니다.
async fn resolve_ip(url: &str, fallback: &str) -> String {
    let attempt = async {
        let client = reqwest::Client::builder()
            .timeout(METADATA_DEADLINE)
            .build()
            .ok()?;
        let response = client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        let ip = body.trim().to_owned();
        if ip.is_empty() { None } else { Some(ip) }
    };

    match tokio::time::timeout(METADATA_DEADLINE, attempt).await {
        Ok(Some(ip)) => ip,
        Ok(None) => {
            debug!("cloud metadata lookup failed, using host name");
            fallback.to_owned()
        }
        Err(_) => {
            debug!("cloud metadata lookup timed out, using host name");
            fallback.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_never_empty() {
        assert!(!resolve_host().is_empty());
    }

    #[tokio::test]
    async fn unreachable_metadata_falls_back_to_host() {
        // 닫힌 포트로의 연결은 즉시 거부되어 2초 내에 대체 경로를 탑니다
        let ip = resolve_ip("http://127.0.0.1:1/latest/meta-data/local-ipv4", "web-01").await;
        assert_eq!(ip, "web-01");
    }

    #[tokio::test]
    async fn cached_identity_is_stable() {
        let first = resolve().await;
        let second = resolve().await;
        assert_eq!(first.host, second.host);
        assert_eq!(first.ip, second.ip);
    }
}
