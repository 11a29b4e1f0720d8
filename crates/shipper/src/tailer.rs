//! 파일 테일러 -- 로테이션을 가로질러 파일을 추적합니다.
//!
//! `tail -f`와 유사한 동작을 비동기 방식으로 구현합니다.
//! 테일 시작 이후 기록된 모든 개행 종결 라인을 파일 순서대로
//! 레코드 빌더에 전달합니다.
//!
//! # 로테이션 감지
//! - inode 변경 감지 (logrotate 등) -> 오프셋 0에서 재오픈
//! - 파일 크기 축소 감지 (truncation) -> 오프셋 0으로 리셋
//!
//! # 부분 라인
//! 읽기 경계를 가로지르는 부분 라인은 버퍼에 유지되며, 개행이 도착하거나
//! 종료/로테이션 시점에 확정(finalize)될 때만 방출됩니다.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use opsentra_core::types::SourceDescriptor;

/// 한 번의 폴링에서 읽는 최대 바이트 수
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// 테일러가 방출하는 원시 라인
///
/// 테일러가 생성하고 레코드 빌더가 소비하는 중간 데이터 형식입니다.
#[derive(Debug, Clone)]
pub struct TailedLine {
    /// 라인이 유래한 소스
    pub source: Arc<SourceDescriptor>,
    /// 개행이 제거된 라인
    pub line: String,
}

/// 테일러 설정
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// 파일 상태 체크 주기
    pub poll_interval: Duration,
    /// 파일 소실/읽기 실패 시 재시도 윈도우 (이후 소스 포기)
    pub retry_window: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            retry_window: Duration::from_secs(5),
        }
    }
}

/// 파일 테일러
///
/// 소스 하나당 하나씩 생성되어 독립된 태스크에서 실행됩니다.
/// 한 테일러의 실패는 다른 테일러에 영향을 주지 않습니다.
pub struct FileTailer {
    /// 추적 대상 소스
    source: Arc<SourceDescriptor>,
    /// 테일러 설정
    config: TailerConfig,
    /// 라인 전송 채널
    tx: mpsc::Sender<TailedLine>,
    /// 마지막 읽기 위치 (바이트 오프셋)
    offset: u64,
    /// 현재 파일의 inode (Unix 전용)
    #[cfg(unix)]
    inode: Option<u64>,
    /// 개행 미도착 부분 라인 버퍼
    partial: Vec<u8>,
}

impl FileTailer {
    /// 새 테일러를 생성합니다.
    pub fn new(
        source: Arc<SourceDescriptor>,
        config: TailerConfig,
        tx: mpsc::Sender<TailedLine>,
    ) -> Self {
        Self {
            source,
            config,
            tx,
            offset: 0,
            #[cfg(unix)]
            inode: None,
            partial: Vec::new(),
        }
    }

    /// 테일러를 실행합니다.
    ///
    /// 파일 끝에서 시작하여 새 내용을 추적합니다. 종료 신호를 받으면
    /// 마지막 읽기를 수행하고 부분 라인을 확정한 뒤 반환합니다.
    /// `tokio::spawn`으로 별도 태스크에서 호출하세요.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let path = self.source.path.clone();

        // 파일 끝에서 테일 시작
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                self.offset = meta.len();
                #[cfg(unix)]
                {
                    self.inode = get_inode(&path).await.ok();
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "source not readable at tail start");
            }
        }

        info!(path = %path.display(), offset = self.offset, "tailing source");

        let mut unreadable_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    // 종료: 마지막 읽기 후 부분 라인 확정
                    let _ = self.poll_once().await;
                    self.finalize_partial().await;
                    debug!(path = %path.display(), "tailer shutting down");
                    return;
                }
            }

            match self.poll_once().await {
                Ok(()) => {
                    unreadable_since = None;
                }
                Err(e) => {
                    let since = unreadable_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.config.retry_window {
                        // 재시도 윈도우 소진: 소스 포기
                        warn!(
                            path = %path.display(),
                            retry_window_secs = self.config.retry_window.as_secs(),
                            error = %e,
                            "source unreadable past retry window, abandoning"
                        );
                        self.finalize_partial().await;
                        return;
                    }
                    debug!(path = %path.display(), error = %e, "source unreadable, retrying");
                }
            }

            if self.tx.is_closed() {
                debug!(path = %path.display(), "line channel closed, stopping tailer");
                return;
            }
        }
    }

    /// 한 번의 폴링: 로테이션/축소 확인 후 새 바이트를 읽어 라인을 방출합니다.
    async fn poll_once(&mut self) -> std::io::Result<()> {
        let path = self.source.path.clone();

        // 로테이션 확인 (inode 변경)
        #[cfg(unix)]
        {
            let current = get_inode(&path).await?;
            if let Some(last) = self.inode
                && current != last
            {
                info!(path = %path.display(), "rotation detected, reopening at offset zero");
                // 이전 파일의 부분 라인은 해당 스트림의 끝이므로 확정
                self.finalize_partial().await;
                self.offset = 0;
                self.inode = Some(current);
            } else {
                self.inode = Some(current);
            }
        }

        // Truncation 확인
        let meta = tokio::fs::metadata(&path).await?;
        if meta.len() < self.offset {
            warn!(
                path = %path.display(),
                size = meta.len(),
                offset = self.offset,
                "truncation detected, resetting offset"
            );
            self.finalize_partial().await;
            self.offset = 0;
        }

        if meta.len() == self.offset {
            return Ok(());
        }

        let (bytes, new_offset) = read_new_bytes(&path, self.offset).await?;
        self.offset = new_offset;
        self.consume_bytes(&bytes).await;
        Ok(())
    }

    /// 읽은 바이트를 부분 라인 버퍼에 이어붙이고, 완성된 라인을 방출합니다.
    async fn consume_bytes(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop(); // 개행 제거
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.emit(line).await;
        }
    }

    /// 종료/로테이션 시점에 남은 부분 라인을 확정 방출합니다.
    async fn finalize_partial(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.partial);
        self.emit(line).await;
    }

    /// 라인 하나를 빌더 채널로 전송합니다. 빈 라인은 건너뜁니다.
    async fn emit(&self, line: Vec<u8>) {
        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            return;
        }
        let tailed = TailedLine {
            source: Arc::clone(&self.source),
            line: text.into_owned(),
        };
        if self.tx.send(tailed).await.is_err() {
            debug!(path = %self.source.path.display(), "line receiver dropped");
        }
    }
}

/// 주어진 오프셋부터 새 바이트를 읽습니다.
///
/// 반환값: (읽은 바이트, 새로운 오프셋). 한 번에 [`MAX_READ_BYTES`]까지 읽습니다.
async fn read_new_bytes(path: &Path, offset: u64) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut buf = Vec::new();
    let read = file.take(MAX_READ_BYTES).read_to_end(&mut buf).await?;

    Ok((buf, offset + read as u64))
}

/// 파일의 inode를 가져옵니다 (Unix 전용).
#[cfg(unix)]
async fn get_inode(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;

    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.ino())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsentra_core::types::SourceType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn descriptor(path: &Path) -> Arc<SourceDescriptor> {
        Arc::new(SourceDescriptor::new(path, SourceType::System, "test"))
    }

    #[tokio::test]
    async fn read_new_bytes_from_offset() {
        let mut temp = NamedTempFile::new().unwrap();
        write!(temp, "hello\nworld\n").unwrap();
        temp.flush().unwrap();

        let (bytes, offset) = read_new_bytes(temp.path(), 6).await.unwrap();
        assert_eq!(bytes, b"world\n");
        assert_eq!(offset, 12);
    }

    #[tokio::test]
    async fn read_new_bytes_empty_file() {
        let temp = NamedTempFile::new().unwrap();
        let (bytes, offset) = read_new_bytes(temp.path(), 0).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn consume_bytes_splits_lines() {
        let temp = NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut tailer = FileTailer::new(descriptor(temp.path()), TailerConfig::default(), tx);

        tailer.consume_bytes(b"first\nsecond\npart").await;

        assert_eq!(rx.recv().await.unwrap().line, "first");
        assert_eq!(rx.recv().await.unwrap().line, "second");
        // 부분 라인은 아직 방출되지 않음
        assert!(rx.try_recv().is_err());
        assert_eq!(tailer.partial, b"part");
    }

    #[tokio::test]
    async fn consume_bytes_joins_partial_across_reads() {
        let temp = NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut tailer = FileTailer::new(descriptor(temp.path()), TailerConfig::default(), tx);

        tailer.consume_bytes(b"hel").await;
        tailer.consume_bytes(b"lo\n").await;

        assert_eq!(rx.recv().await.unwrap().line, "hello");
    }

    #[tokio::test]
    async fn consume_bytes_strips_carriage_return() {
        let temp = NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut tailer = FileTailer::new(descriptor(temp.path()), TailerConfig::default(), tx);

        tailer.consume_bytes(b"windows line\r\n").await;
        assert_eq!(rx.recv().await.unwrap().line, "windows line");
    }

    #[tokio::test]
    async fn consume_bytes_skips_blank_lines() {
        let temp = NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut tailer = FileTailer::new(descriptor(temp.path()), TailerConfig::default(), tx);

        tailer.consume_bytes(b"one\n\n  \ntwo\n").await;
        assert_eq!(rx.recv().await.unwrap().line, "one");
        assert_eq!(rx.recv().await.unwrap().line, "two");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finalize_emits_partial() {
        let temp = NamedTempFile::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut tailer = FileTailer::new(descriptor(temp.path()), TailerConfig::default(), tx);

        tailer.consume_bytes(b"unterminated").await;
        assert!(rx.try_recv().is_err());

        tailer.finalize_partial().await;
        assert_eq!(rx.recv().await.unwrap().line, "unterminated");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn get_inode_returns_valid_inode() {
        let temp = NamedTempFile::new().unwrap();
        let inode = get_inode(temp.path()).await.unwrap();
        assert!(inode > 0);
    }
}
