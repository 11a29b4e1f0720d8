//! 파일 테일러 통합 테스트
//!
//! 실제 파일시스템에서 추가 기록, 로테이션, 축소, 종료 확정 동작을 검증합니다.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

use opsentra_core::types::{SourceDescriptor, SourceType};
use opsentra_shipper::tailer::{FileTailer, TailedLine, TailerConfig};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn fast_config() -> TailerConfig {
    TailerConfig {
        poll_interval: Duration::from_millis(20),
        retry_window: Duration::from_secs(5),
    }
}

fn descriptor(path: &Path) -> Arc<SourceDescriptor> {
    Arc::new(SourceDescriptor::new(path, SourceType::System, "test"))
}

async fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap();
    file.write_all(content.as_bytes()).await.unwrap();
    file.flush().await.unwrap();
}

async fn recv_line(rx: &mut mpsc::Receiver<TailedLine>) -> String {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("line should arrive before timeout")
        .expect("channel should stay open")
        .line
}

#[tokio::test]
async fn delivers_lines_appended_after_tail_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    append(&path, "existing line before tail\n").await;

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let tailer = FileTailer::new(descriptor(&path), fast_config(), tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    // 테일러가 파일 끝에 자리잡을 시간을 줌
    sleep(Duration::from_millis(150)).await;

    append(&path, "first new line\nsecond new line\n").await;

    assert_eq!(recv_line(&mut rx).await, "first new line");
    assert_eq!(recv_line(&mut rx).await, "second new line");

    // 테일 시작 전 내용은 전달되지 않음
    assert!(rx.try_recv().is_err());

    let _ = shutdown_tx.send(());
    let _ = timeout(RECV_TIMEOUT, task).await;
}

#[tokio::test]
async fn preserves_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.log");
    append(&path, "").await;

    let (tx, mut rx) = mpsc::channel(256);
    let (shutdown_tx, _) = broadcast::channel(1);
    let tailer = FileTailer::new(descriptor(&path), fast_config(), tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    sleep(Duration::from_millis(150)).await;

    for i in 0..20 {
        append(&path, &format!("line {i}\n")).await;
    }

    for i in 0..20 {
        assert_eq!(recv_line(&mut rx).await, format!("line {i}"));
    }

    let _ = shutdown_tx.send(());
    let _ = timeout(RECV_TIMEOUT, task).await;
}

#[tokio::test]
async fn reopens_after_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.log");
    append(&path, "").await;

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let tailer = FileTailer::new(descriptor(&path), fast_config(), tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    sleep(Duration::from_millis(150)).await;

    append(&path, "a much longer first line for offset\n").await;
    assert_eq!(
        recv_line(&mut rx).await,
        "a much longer first line for offset"
    );

    // 축소 후 새 내용은 오프셋 0부터 다시 읽힘 (새 내용이 이전 오프셋보다 짧음)
    tokio::fs::write(&path, "two\n").await.unwrap();
    assert_eq!(recv_line(&mut rx).await, "two");

    let _ = shutdown_tx.send(());
    let _ = timeout(RECV_TIMEOUT, task).await;
}

#[cfg(unix)]
#[tokio::test]
async fn reopens_after_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rotated.log");
    append(&path, "").await;

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let tailer = FileTailer::new(descriptor(&path), fast_config(), tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    sleep(Duration::from_millis(150)).await;

    append(&path, "before rotation\n").await;
    assert_eq!(recv_line(&mut rx).await, "before rotation");

    // logrotate 방식: 기존 파일을 옮기고 같은 경로에 새 파일 생성 (inode 변경)
    tokio::fs::rename(&path, dir.path().join("rotated.log.1"))
        .await
        .unwrap();
    tokio::fs::write(&path, "after rotation\n").await.unwrap();

    assert_eq!(recv_line(&mut rx).await, "after rotation");

    let _ = shutdown_tx.send(());
    let _ = timeout(RECV_TIMEOUT, task).await;
}

#[tokio::test]
async fn finalizes_partial_line_at_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.log");
    append(&path, "").await;

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let tailer = FileTailer::new(descriptor(&path), fast_config(), tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    sleep(Duration::from_millis(150)).await;

    append(&path, "complete line\nunterminated tail").await;
    assert_eq!(recv_line(&mut rx).await, "complete line");
    // 개행 미도착분은 아직 방출되지 않음
    assert!(rx.try_recv().is_err());

    let _ = shutdown_tx.send(());
    assert_eq!(recv_line(&mut rx).await, "unterminated tail");

    let _ = timeout(RECV_TIMEOUT, task).await;
    // 테일러 종료 후 채널은 닫힘
    assert!(timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn abandons_source_after_retry_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vanishing.log");
    append(&path, "").await;

    let (tx, _rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let config = TailerConfig {
        poll_interval: Duration::from_millis(20),
        retry_window: Duration::from_millis(200),
    };
    let tailer = FileTailer::new(descriptor(&path), config, tx);
    let task = tokio::spawn(tailer.run(shutdown_tx.subscribe()));

    sleep(Duration::from_millis(100)).await;
    tokio::fs::remove_file(&path).await.unwrap();

    // 재시도 윈도우 소진 후 테일러는 스스로 종료해야 함
    timeout(Duration::from_secs(3), task)
        .await
        .expect("tailer should abandon the source")
        .unwrap();
}

#[tokio::test]
async fn independent_tailers_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = dir.path().join("healthy.log");
    let broken = dir.path().join("broken.log");
    append(&healthy, "").await;
    append(&broken, "").await;

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);

    let config = TailerConfig {
        poll_interval: Duration::from_millis(20),
        retry_window: Duration::from_millis(200),
    };
    let healthy_task = tokio::spawn(
        FileTailer::new(descriptor(&healthy), config.clone(), tx.clone())
            .run(shutdown_tx.subscribe()),
    );
    let broken_task = tokio::spawn(
        FileTailer::new(descriptor(&broken), config, tx).run(shutdown_tx.subscribe()),
    );

    sleep(Duration::from_millis(100)).await;

    // 한 소스가 사라져도
    tokio::fs::remove_file(&broken).await.unwrap();
    timeout(Duration::from_secs(3), broken_task)
        .await
        .expect("broken tailer should abandon")
        .unwrap();

    // 다른 테일러는 계속 동작
    append(&healthy, "still alive\n").await;
    assert_eq!(recv_line(&mut rx).await, "still alive");

    let _ = shutdown_tx.send(());
    let _ = timeout(RECV_TIMEOUT, healthy_task).await;
}
