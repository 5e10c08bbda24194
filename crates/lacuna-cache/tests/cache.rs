use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

use lacuna_cache::{CacheStore, CachedRangeSource, MemoryCacheStore};
use lacuna_core::{ByteRange, LacunaError, LacunaErrorKind, LacunaResult, RangeSource};

struct FakeSource {
    data: Vec<u8>,
    reads: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    gate: Option<Arc<Notify>>,
}

impl FakeSource {
    fn new(len: usize, gate: Option<Arc<Notify>>) -> Self {
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        Self {
            data,
            reads: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            gate,
        }
    }

    fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    fn fail_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail)
    }
}

#[async_trait::async_trait]
impl RangeSource for FakeSource {
    async fn total_len(&self) -> LacunaResult<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LacunaError::with_message(
                LacunaErrorKind::Io,
                "synthetic source failure",
            ));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(LacunaError::with_message(
                LacunaErrorKind::OutOfRange,
                "read exceeds backing store",
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(buf.len())
    }
}

#[tokio::test]
async fn cache_hit_after_miss() {
    let source = FakeSource::new(8192, None);
    let reads = source.read_counter();
    let expected = source.data.clone();
    let cached = CachedRangeSource::new("hit-after-miss", source, MemoryCacheStore::new())
        .await
        .expect("cached source");

    let mut buf = vec![0u8; 1024];
    let read = cached.read_at(1024, &mut buf).await.expect("read range");
    assert_eq!(read, buf.len());
    assert_eq!(&buf[..], &expected[1024..2048]);
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    let mut buf2 = vec![0u8; 1024];
    let read2 = cached.read_at(1024, &mut buf2).await.expect("read range");
    assert_eq!(read2, buf2.len());
    assert_eq!(buf, buf2);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_reads_share_one_fetch() {
    let gate = Arc::new(Notify::new());
    let source = FakeSource::new(4096, Some(Arc::clone(&gate)));
    let reads = source.read_counter();
    let cached = Arc::new(
        CachedRangeSource::new("inflight", source, MemoryCacheStore::new())
            .await
            .expect("cached source"),
    );

    let cached_a = Arc::clone(&cached);
    let cached_b = Arc::clone(&cached);
    let task_a = tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        cached_a.read_at(512, &mut buf).await.expect("read a");
    });
    let task_b = tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        cached_b.read_at(512, &mut buf).await.expect("read b");
    });

    tokio::task::yield_now().await;
    // a stored permit survives even if the filler has not parked yet
    gate.notify_one();

    task_a.await.expect("task a");
    task_b.await.expect("task b");

    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_failure_leaves_bytes_absent_and_retries() {
    let source = FakeSource::new(2048, None);
    let reads = source.read_counter();
    let fail = source.fail_flag();
    let expected = source.data.clone();
    let cached = CachedRangeSource::new("retry", source, MemoryCacheStore::new())
        .await
        .expect("cached source");

    fail.store(true, Ordering::SeqCst);
    let mut buf = vec![0u8; 256];
    let err = cached.read_at(0, &mut buf).await.expect_err("read fails");
    assert_eq!(err.kind(), LacunaErrorKind::Io);
    assert!(cached.completed_ranges().is_empty());

    fail.store(false, Ordering::SeqCst);
    cached.read_at(0, &mut buf).await.expect("read succeeds");
    assert_eq!(&buf[..], &expected[0..256]);
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn seeded_cache_serves_without_remote_reads() {
    let source = FakeSource::new(1024, None);
    let reads = source.read_counter();
    let expected = source.data.clone();

    let store = MemoryCacheStore::new();
    store.write_at(0, &expected).await.expect("prefill store");

    let cached = CachedRangeSource::with_seed(
        "seeded",
        source,
        store,
        vec![ByteRange::new(0, 1024)],
    )
    .await
    .expect("cached source");
    assert_eq!(cached.completed_ranges(), vec![ByteRange::new(0, 1024)]);

    let mut buf = vec![0u8; 1024];
    cached.read_at(0, &mut buf).await.expect("read range");
    assert_eq!(buf, expected);
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn warm_prefetches_without_reading_out() {
    let source = FakeSource::new(4096, None);
    let reads = source.read_counter();
    let expected = source.data.clone();
    let cached = CachedRangeSource::new("warm", source, MemoryCacheStore::new())
        .await
        .expect("cached source");

    let warmed = cached.warm(ByteRange::new(0, 4096)).await.expect("warm");
    assert_eq!(warmed, 4096);
    assert_eq!(cached.completed_ranges(), vec![ByteRange::new(0, 4096)]);
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    // a second warm finds nothing missing
    let warmed = cached.warm(ByteRange::new(0, 4096)).await.expect("rewarm");
    assert_eq!(warmed, 0);

    let mut buf = vec![0u8; 4096];
    cached.read_at(0, &mut buf).await.expect("read range");
    assert_eq!(buf, expected);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_alignment_bounds_the_fill() {
    let source = FakeSource::new(8192, None);
    let reads = source.read_counter();
    let cached = CachedRangeSource::with_fetch_align(
        "aligned",
        source,
        MemoryCacheStore::new(),
        1024,
    )
    .await
    .expect("cached source");

    let mut buf = vec![0u8; 100];
    cached.read_at(3000, &mut buf).await.expect("read range");
    assert_eq!(cached.completed_ranges(), vec![ByteRange::new(2048, 4096)]);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_past_end_is_rejected() {
    let source = FakeSource::new(1024, None);
    let cached = CachedRangeSource::new("bounds", source, MemoryCacheStore::new())
        .await
        .expect("cached source");

    let mut buf = vec![0u8; 128];
    let err = cached.read_at(1000, &mut buf).await.expect_err("oob read");
    assert_eq!(err.kind(), LacunaErrorKind::OutOfRange);
}
