//! 발행 대기 큐 -- 브로커 장애 시 유한 메모리 버퍼링
//!
//! [`RecordQueue`]는 빌더와 발행기 사이의 유일한 백프레셔 지점입니다.
//! 용량 초과 시 가장 오래된 레코드를 드롭하여 (drop-oldest)
//! 최근 활동이 백로그에서 살아남도록 합니다.

use std::collections::VecDeque;

use opsentra_core::types::LogRecord;

/// 유한 발행 대기 큐
///
/// 브로커 장애 동안 레코드를 버퍼링합니다. 발행에 실패한 레코드는
/// [`push_front`](RecordQueue::push_front)로 큐 머리에 되돌려 순서를 보존합니다.
pub struct RecordQueue {
    /// 큐 내부 저장소
    queue: VecDeque<LogRecord>,
    /// 최대 용량 (high-water)
    capacity: usize,
    /// 드롭된 레코드 카운터 (통계용)
    dropped_count: u64,
    /// 총 유입 레코드 카운터
    total_received: u64,
}

impl RecordQueue {
    /// 새 레코드 큐를 생성합니다.
    pub fn new(capacity: usize) -> Self {
        // capacity가 0이면 최소 1로 설정
        let actual_capacity = if capacity == 0 {
            tracing::warn!("queue capacity is 0, setting to minimum 1");
            1
        } else {
            capacity
        };

        Self {
            queue: VecDeque::with_capacity(actual_capacity.min(10_000)),
            capacity: actual_capacity,
            dropped_count: 0,
            total_received: 0,
        }
    }

    /// 레코드를 큐 꼬리에 추가합니다.
    ///
    /// 큐가 가득 찬 경우 가장 오래된 레코드를 드롭합니다.
    /// 드롭이 발생하면 `true`를 반환합니다.
    pub fn push(&mut self, record: LogRecord) -> bool {
        self.total_received += 1;

        let mut dropped = false;
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped_count += 1;
            dropped = true;
            tracing::warn!(
                dropped = self.dropped_count,
                capacity = self.capacity,
                "publish queue full, dropped oldest record"
            );
        }

        self.queue.push_back(record);
        dropped
    }

    /// 발행에 실패한 레코드를 큐 머리에 되돌립니다.
    ///
    /// 재연결 후 재시도 시 소스별 FIFO 순서를 보존합니다.
    /// 가득 찬 경우에도 머리 삽입을 우선하고 꼬리를 드롭합니다.
    pub fn push_front(&mut self, record: LogRecord) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_back();
            self.dropped_count += 1;
        }
        self.queue.push_front(record);
    }

    /// 배치 크기만큼 또는 큐에 남은 만큼 레코드를 드레인합니다.
    pub fn drain_batch(&mut self, batch_size: usize) -> Vec<LogRecord> {
        let count = batch_size.min(self.queue.len());
        self.queue.drain(..count).collect()
    }

    /// 큐의 모든 레코드를 드레인합니다.
    pub fn drain_all(&mut self) -> Vec<LogRecord> {
        self.queue.drain(..).collect()
    }

    /// 현재 큐에 저장된 레코드 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// 큐가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 큐 최대 용량을 반환합니다.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 지금까지 드롭된 레코드 수를 반환합니다.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// 총 유입 레코드 수를 반환합니다.
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// 큐 사용률을 0.0~1.0 범위로 반환합니다.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(u32::try_from(self.queue.len()).unwrap_or(u32::MAX))
            / f64::from(u32::try_from(self.capacity).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsentra_core::types::{Level, SourceType};
    use std::collections::BTreeMap;

    fn make_record(msg: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: Level::Info,
            service: "test".to_owned(),
            host: "host".to_owned(),
            ip: "10.0.0.1".to_owned(),
            source: "/var/log/test.log".to_owned(),
            message: msg.to_owned(),
            source_type: SourceType::System,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn push_and_drain() {
        let mut queue = RecordQueue::new(100);
        queue.push(make_record("one"));
        queue.push(make_record("two"));
        queue.push(make_record("three"));
        assert_eq!(queue.len(), 3);

        let batch = queue.drain_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message, "one");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = RecordQueue::new(3);
        queue.push(make_record("one"));
        queue.push(make_record("two"));
        queue.push(make_record("three"));
        assert_eq!(queue.dropped_count(), 0);

        let dropped = queue.push(make_record("four"));
        assert!(dropped);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 1);

        // 가장 최근 활동이 살아남음
        let batch = queue.drain_all();
        assert_eq!(batch[0].message, "two");
        assert_eq!(batch[2].message, "four");
    }

    #[test]
    fn push_front_preserves_retry_order() {
        let mut queue = RecordQueue::new(100);
        queue.push(make_record("second"));
        queue.push(make_record("third"));
        queue.push_front(make_record("first"));

        let batch = queue.drain_all();
        assert_eq!(batch[0].message, "first");
        assert_eq!(batch[1].message, "second");
        assert_eq!(batch[2].message, "third");
    }

    #[test]
    fn push_front_on_full_queue_drops_tail() {
        let mut queue = RecordQueue::new(2);
        queue.push(make_record("a"));
        queue.push(make_record("b"));
        queue.push_front(make_record("retry"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
        let batch = queue.drain_all();
        assert_eq!(batch[0].message, "retry");
        assert_eq!(batch[1].message, "a");
    }

    #[test]
    fn drain_batch_larger_than_queue() {
        let mut queue = RecordQueue::new(100);
        queue.push(make_record("one"));
        let batch = queue.drain_batch(50);
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_from_empty_queue() {
        let mut queue = RecordQueue::new(100);
        assert!(queue.drain_batch(10).is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn zero_capacity_becomes_one() {
        let mut queue = RecordQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(make_record("only"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn utilization_calculation() {
        let mut queue = RecordQueue::new(100);
        assert_eq!(queue.utilization(), 0.0);
        for i in 0..50 {
            queue.push(make_record(&format!("r{i}")));
        }
        let util = queue.utilization();
        assert!(util > 0.49 && util < 0.51);
    }

    #[test]
    fn total_received_tracks_all() {
        let mut queue = RecordQueue::new(2);
        queue.push(make_record("1"));
        queue.push(make_record("2"));
        queue.push(make_record("3"));
        assert_eq!(queue.total_received(), 3);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn fifo_order_maintained_under_overflow() {
        let mut queue = RecordQueue::new(3);
        for i in 0..6 {
            queue.push(make_record(&format!("r{i}")));
        }
        let batch = queue.drain_all();
        assert_eq!(batch[0].message, "r3");
        assert_eq!(batch[1].message, "r4");
        assert_eq!(batch[2].message, "r5");
    }
}
