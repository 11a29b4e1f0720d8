//! 소스 탐색 -- 파일시스템 루트에서 로그 소스를 열거하고 분류합니다.
//!
//! 기동 시 1회 수행됩니다. 소스 유형별 탐색은 서로 독립적이며,
//! 한 유형의 실패가 다른 유형의 탐색을 중단시키지 않습니다.
//!
//! # 소스 유형
//! - 일반 파일: 글롭 패턴 확장 (`log_paths`)
//! - 컨테이너 런타임: 컨테이너별 로그 루트 + 인접 설정 문서에서 이름 파생
//! - 파드 로그 트리: `<root>/<namespace>/<pod>/<container>.log`
//! - CI 잡 로그: 루트 하위 `**/*.log`, `jobs/` 다음 세그먼트가 잡 식별자
//! - 사용자 지정 경로: 분류 없이 `custom` 유형으로 수집

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use opsentra_core::types::{SourceDescriptor, SourceType};

use crate::config::ShipperPipelineConfig;

/// 파일명에서 제거하는 로그 확장자 목록
const LOG_EXTENSIONS: &[&str] = &["log", "out", "err", "txt"];

/// 잘 알려진 서비스명 목록
///
/// 베이스명에 이 문자열이 포함되면 해당 서비스명으로 매핑합니다.
const WELL_KNOWN_SERVICES: &[&str] = &["nginx", "apache", "mysql", "postgres", "redis", "mongo"];

/// 설정된 모든 소스 유형을 탐색하여 소스 기술자 목록을 반환합니다.
///
/// 개별 유형의 탐색 에러는 로깅 후 건너뜁니다.
pub fn discover_sources(config: &ShipperPipelineConfig) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();

    sources.extend(discover_glob_paths(&config.log_paths, SourceType::System));

    if config.container_enabled {
        sources.extend(discover_containers(Path::new(&config.container_root)));
    }
    if config.pod_enabled {
        sources.extend(discover_pods(Path::new(&config.pod_root)));
    }
    if config.ci_enabled {
        sources.extend(discover_ci_logs(&config.ci_roots));
    }

    sources.extend(discover_glob_paths(&config.custom_paths, SourceType::Custom));

    // 경로 기준 중복 제거 (예: log_paths와 custom_paths가 겹치는 경우)
    sources.sort_by(|a, b| a.path.cmp(&b.path));
    sources.dedup_by(|a, b| a.path == b.path);

    info!(count = sources.len(), "source discovery complete");
    sources
}

/// 글롭 패턴 목록을 소스 기술자로 확장합니다.
///
/// 읽을 수 없는 경로는 건너뜁니다.
fn discover_glob_paths(patterns: &[String], source_type: SourceType) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();

    for pattern in patterns {
        let paths = match glob::glob(pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid glob pattern, skipping");
                continue;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    debug!(error = %e, "unreadable glob entry, skipping");
                    continue;
                }
            };
            if !path.is_file() || !is_readable(&path) {
                continue;
            }
            let service = derive_service_name(&path);
            sources.push(SourceDescriptor::new(path, source_type, service));
        }
    }

    sources
}

/// 컨테이너 런타임 로그 루트를 탐색합니다.
///
/// 컨테이너별 디렉토리에서 `<id>-json.log`를 찾고, 인접한 설정 문서에서
/// 친화적 이름을 파생합니다. 실패 시 `container-<id 앞 12자>`로 대체합니다.
fn discover_containers(root: &Path) -> Vec<SourceDescriptor> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "container log root unreadable");
            return Vec::new();
        }
    };

    let mut sources = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let container_id = entry.file_name().to_string_lossy().into_owned();
        let log_path = dir.join(format!("{container_id}-json.log"));
        if !log_path.is_file() || !is_readable(&log_path) {
            continue;
        }

        let service = container_service_name(&dir, &container_id);
        let descriptor = SourceDescriptor::new(log_path, SourceType::Container, service)
            .with_metadata("containerId", container_id);
        sources.push(descriptor);
    }

    debug!(count = sources.len(), root = %root.display(), "container sources discovered");
    sources
}

/// 컨테이너 설정 문서에서 서비스명을 파생합니다.
///
/// `config.v2.json`의 `Name` 또는 `Config.Image` 필드를 사용하며,
/// 둘 다 없으면 ID 앞 12자로 대체합니다.
fn container_service_name(container_dir: &Path, container_id: &str) -> String {
    let fallback = || {
        let short = &container_id[..12.min(container_id.len())];
        format!("container-{short}")
    };

    let config_path = container_dir.join("config.v2.json");
    let content = match fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(_) => return fallback(),
    };
    let doc: serde_json::Value = match serde_json::from_str(&content) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(path = %config_path.display(), error = %e, "container config unparsable");
            return fallback();
        }
    };

    if let Some(name) = doc.get("Name").and_then(|v| v.as_str()) {
        let name = name.trim_start_matches('/');
        if !name.is_empty() {
            return name.to_owned();
        }
    }
    if let Some(image) = doc
        .get("Config")
        .and_then(|c| c.get("Image"))
        .and_then(|v| v.as_str())
    {
        // 이미지 태그와 레지스트리 경로는 제거 (예: docker.io/library/nginx:1.25 -> nginx)
        let image = image.rsplit('/').next().unwrap_or(image);
        let image = image.split(':').next().unwrap_or(image);
        if !image.is_empty() {
            return image.to_owned();
        }
    }
    fallback()
}

/// 파드 로그 트리를 탐색합니다 (`<root>/<namespace>/<pod>/<container>.log`).
fn discover_pods(root: &Path) -> Vec<SourceDescriptor> {
    let namespaces = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "pod log root unreadable");
            return Vec::new();
        }
    };

    let mut sources = Vec::new();
    for ns_entry in namespaces.flatten() {
        let ns_dir = ns_entry.path();
        if !ns_dir.is_dir() {
            continue;
        }
        let namespace = ns_entry.file_name().to_string_lossy().into_owned();

        let pods = match fs::read_dir(&ns_dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for pod_entry in pods.flatten() {
            let pod_dir = pod_entry.path();
            if !pod_dir.is_dir() {
                continue;
            }
            let pod = pod_entry.file_name().to_string_lossy().into_owned();

            let containers = match fs::read_dir(&pod_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for log_entry in containers.flatten() {
                let log_path = log_entry.path();
                if log_path.extension().and_then(|e| e.to_str()) != Some("log")
                    || !log_path.is_file()
                    || !is_readable(&log_path)
                {
                    continue;
                }
                let container = log_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let descriptor =
                    SourceDescriptor::new(log_path, SourceType::Pod, format!("k8s-{pod}"))
                        .with_metadata("namespace", namespace.clone())
                        .with_metadata("pod", pod.clone())
                        .with_metadata("container", container);
                sources.push(descriptor);
            }
        }
    }

    debug!(count = sources.len(), root = %root.display(), "pod sources discovered");
    sources
}

/// CI 로그 루트들을 탐색합니다.
///
/// 각 루트 하위의 `**/*.log`를 수집하며, 경로에서 `jobs/` 다음 세그먼트를
/// 잡 식별자로 사용합니다.
fn discover_ci_logs(roots: &[String]) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();

    for root in roots {
        let pattern = format!("{}/**/*.log", root.trim_end_matches('/'));
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(root = %root, error = %e, "invalid ci root, skipping");
                continue;
            }
        };

        for entry in paths.flatten() {
            if !entry.is_file() || !is_readable(&entry) {
                continue;
            }
            let job = job_identifier(&entry);
            let service = match &job {
                Some(job) => format!("ci-{job}"),
                None => derive_service_name(&entry),
            };
            let mut descriptor = SourceDescriptor::new(entry, SourceType::Ci, service);
            if let Some(job) = job {
                descriptor = descriptor.with_metadata("job", job);
            }
            sources.push(descriptor);
        }
    }

    sources
}

/// 경로에서 `jobs/` 바로 다음 세그먼트를 추출합니다.
fn job_identifier(path: &Path) -> Option<String> {
    let mut components = path.components();
    while let Some(component) = components.next() {
        if component.as_os_str() == "jobs" {
            return components
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned());
        }
    }
    None
}

/// 일반 파일 경로에서 서비스명을 파생합니다.
///
/// 마지막 경로 세그먼트에서 로그 확장자를 제거하고,
/// 잘 알려진 베이스명은 표준 서비스명으로 매핑합니다.
pub fn derive_service_name(path: &Path) -> String {
    let basename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let mut name = basename.as_str();
    // `access.log.1` 같은 다중 확장자를 위해 반복 제거
    loop {
        let mut stripped = name;
        if let Some((stem, ext)) = stripped.rsplit_once('.')
            && (LOG_EXTENSIONS.contains(&ext) || ext.chars().all(|c| c.is_ascii_digit()))
            && !stem.is_empty()
        {
            stripped = stem;
        }
        if stripped == name {
            break;
        }
        name = stripped;
    }

    let lowered = name.to_ascii_lowercase();
    for known in WELL_KNOWN_SERVICES {
        if lowered.contains(known) {
            return (*known).to_owned();
        }
    }

    // 디렉토리명이 잘 알려진 서비스인 경우 (예: /var/log/nginx/error.log)
    if let Some(parent) = path.parent().and_then(|p| p.file_name()) {
        let parent = parent.to_string_lossy().to_ascii_lowercase();
        for known in WELL_KNOWN_SERVICES {
            if parent.contains(known) {
                return (*known).to_owned();
            }
        }
    }

    if name.is_empty() {
        "unknown".to_owned()
    } else {
        name.to_owned()
    }
}

/// 현재 프로세스 권한으로 경로를 읽을 수 있는지 확인합니다.
fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn derive_service_strips_log_extension() {
        assert_eq!(derive_service_name(Path::new("/var/log/app.log")), "app");
        assert_eq!(derive_service_name(Path::new("/var/log/worker.out")), "worker");
    }

    #[test]
    fn derive_service_strips_rotation_suffix() {
        assert_eq!(derive_service_name(Path::new("/var/log/app.log.1")), "app");
    }

    #[test]
    fn derive_service_maps_well_known_names() {
        assert_eq!(
            derive_service_name(Path::new("/var/log/nginx-access.log")),
            "nginx"
        );
        assert_eq!(
            derive_service_name(Path::new("/var/log/mysql-slow.log")),
            "mysql"
        );
        assert_eq!(
            derive_service_name(Path::new("/var/log/postgresql.log")),
            "postgres"
        );
    }

    #[test]
    fn derive_service_uses_parent_directory() {
        assert_eq!(
            derive_service_name(Path::new("/var/log/nginx/error.log")),
            "nginx"
        );
    }

    #[test]
    fn glob_discovery_finds_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.log"), "line\n");
        touch(&dir.path().join("other.log"), "line\n");
        touch(&dir.path().join("ignored.conf"), "");

        let pattern = format!("{}/*.log", dir.path().display());
        let sources = discover_glob_paths(&[pattern], SourceType::System);

        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.source_type == SourceType::System));
    }

    #[test]
    fn glob_discovery_skips_bad_patterns() {
        let sources = discover_glob_paths(&["[invalid".to_owned()], SourceType::System);
        assert!(sources.is_empty());
    }

    #[test]
    fn container_discovery_reads_config_name() {
        let dir = TempDir::new().unwrap();
        let id = "abc123def456abc123def456";
        let container_dir = dir.path().join(id);
        touch(&container_dir.join(format!("{id}-json.log")), "{}\n");
        touch(
            &container_dir.join("config.v2.json"),
            r#"{"Name":"/web-frontend","Config":{"Image":"nginx:1.25"}}"#,
        );

        let sources = discover_containers(dir.path());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].service, "web-frontend");
        assert_eq!(sources[0].source_type, SourceType::Container);
        assert_eq!(sources[0].metadata.get("containerId").unwrap(), id);
    }

    #[test]
    fn container_discovery_falls_back_to_image() {
        let dir = TempDir::new().unwrap();
        let id = "abc123def456abc123def456";
        let container_dir = dir.path().join(id);
        touch(&container_dir.join(format!("{id}-json.log")), "{}\n");
        touch(
            &container_dir.join("config.v2.json"),
            r#"{"Config":{"Image":"docker.io/library/redis:7"}}"#,
        );

        let sources = discover_containers(dir.path());
        assert_eq!(sources[0].service, "redis");
    }

    #[test]
    fn container_discovery_falls_back_to_short_id() {
        let dir = TempDir::new().unwrap();
        let id = "abc123def456abc123def456";
        let container_dir = dir.path().join(id);
        touch(&container_dir.join(format!("{id}-json.log")), "{}\n");

        let sources = discover_containers(dir.path());
        assert_eq!(sources[0].service, "container-abc123def456");
    }

    #[test]
    fn container_discovery_handles_missing_root() {
        let sources = discover_containers(Path::new("/nonexistent/containers"));
        assert!(sources.is_empty());
    }

    #[test]
    fn pod_discovery_walks_tree() {
        let dir = TempDir::new().unwrap();
        touch(
            &dir.path().join("production/api-server/app.log"),
            "line\n",
        );
        touch(
            &dir.path().join("production/api-server/sidecar.log"),
            "line\n",
        );

        let mut sources = discover_pods(dir.path());
        sources.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].service, "k8s-api-server");
        assert_eq!(sources[0].metadata.get("namespace").unwrap(), "production");
        assert_eq!(sources[0].metadata.get("pod").unwrap(), "api-server");
        assert_eq!(sources[0].metadata.get("container").unwrap(), "app");
    }

    #[test]
    fn ci_discovery_derives_job_identifier() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("jobs/build-42/output.log"), "line\n");

        let sources = discover_ci_logs(&[dir.path().display().to_string()]);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].service, "ci-build-42");
        assert_eq!(sources[0].metadata.get("job").unwrap(), "build-42");
        assert_eq!(sources[0].source_type, SourceType::Ci);
    }

    #[test]
    fn job_identifier_absent_without_jobs_segment() {
        assert_eq!(job_identifier(Path::new("/ci/logs/output.log")), None);
        assert_eq!(
            job_identifier(Path::new("/ci/jobs/deploy-7/step.log")),
            Some("deploy-7".to_owned())
        );
    }

    #[test]
    fn discover_sources_deduplicates_paths() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.log"), "line\n");
        let pattern = format!("{}/*.log", dir.path().display());

        let config = ShipperPipelineConfig {
            broker_url: "amqp://localhost:5672".to_owned(),
            log_paths: vec![pattern.clone()],
            custom_paths: vec![pattern],
            container_enabled: false,
            pod_enabled: false,
            ci_enabled: false,
            ..Default::default()
        };

        let sources = discover_sources(&config);
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn failed_source_type_does_not_abort_others() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.log"), "line\n");

        let config = ShipperPipelineConfig {
            broker_url: "amqp://localhost:5672".to_owned(),
            log_paths: vec![format!("{}/*.log", dir.path().display())],
            container_enabled: true,
            container_root: "/nonexistent/containers".to_owned(),
            pod_enabled: true,
            pod_root: "/nonexistent/pods".to_owned(),
            ci_enabled: false,
            ..Default::default()
        };

        let sources = discover_sources(&config);
        assert_eq!(sources.len(), 1);
    }
}
