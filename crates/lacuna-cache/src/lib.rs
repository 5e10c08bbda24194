//! Byte-range caching wrapper over a remote artifact source.
//!
//! [`CachedRangeSource`] serves reads from a local [`CacheStore`], fetching
//! missing ranges from the wrapped [`RangeSource`] as they are first touched.
//! All coordination between concurrent readers goes through a
//! [`SparseFileTracker`]: the tracker decides which reader fetches which
//! bytes, and wakes every reader whose range became available, so no byte is
//! ever fetched twice concurrently.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_channel::oneshot;
use tracing::trace;

use lacuna_core::{ByteRange, LacunaError, LacunaErrorKind, LacunaResult, RangeSource};
use lacuna_tracker::{Gap, RangeListener, SparseFileTracker};

const DEFAULT_FETCH_ALIGN: u64 = 32 * 1024;
const FETCH_CHUNK: u64 = 64 * 1024;

/// Backend byte store for a single cached artifact.
///
/// Implementations are expected to be internally synchronized; the cache
/// wrapper may call these methods concurrently from multiple tasks.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read bytes at a fixed offset. Returns the number of bytes read.
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> LacunaResult<usize>;

    /// Write all bytes at a fixed offset.
    async fn write_at(&self, offset: u64, data: &[u8]) -> LacunaResult<()>;

    /// Resize the underlying store.
    async fn set_len(&self, len: u64) -> LacunaResult<()>;

    /// Persist pending writes.
    async fn flush(&self) -> LacunaResult<()>;
}

#[async_trait]
impl<T> CacheStore for Arc<T>
where
    T: CacheStore + ?Sized,
{
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> LacunaResult<usize> {
        (**self).read_at(offset, out).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> LacunaResult<()> {
        (**self).write_at(offset, data).await
    }

    async fn set_len(&self, len: u64) -> LacunaResult<()> {
        (**self).set_len(len).await
    }

    async fn flush(&self) -> LacunaResult<()> {
        (**self).flush().await
    }
}

/// Read-through cache for one fixed-length remote artifact.
pub struct CachedRangeSource<S, C> {
    inner: S,
    store: C,
    tracker: SparseFileTracker,
    length: u64,
    fetch_align: u64,
}

impl<S, C> CachedRangeSource<S, C>
where
    S: RangeSource,
    C: CacheStore,
{
    /// Construct an empty cache with the default fetch alignment.
    pub async fn new(name: impl Into<String>, inner: S, store: C) -> LacunaResult<Self> {
        Self::build(name, inner, store, DEFAULT_FETCH_ALIGN, Vec::new()).await
    }

    /// Construct with a custom fetch-alignment quantum. Requested ranges are
    /// widened to this alignment before fills start, so neighboring small
    /// reads coalesce into shared fetches.
    pub async fn with_fetch_align(
        name: impl Into<String>,
        inner: S,
        store: C,
        fetch_align: u64,
    ) -> LacunaResult<Self> {
        Self::build(name, inner, store, fetch_align, Vec::new()).await
    }

    /// Construct over a store that already holds `seed` ranges from an
    /// earlier run. The caller owns persistence of the completed set; see
    /// [`completed_ranges`](CachedRangeSource::completed_ranges).
    pub async fn with_seed(
        name: impl Into<String>,
        inner: S,
        store: C,
        seed: Vec<ByteRange>,
    ) -> LacunaResult<Self> {
        Self::build(name, inner, store, DEFAULT_FETCH_ALIGN, seed).await
    }

    async fn build(
        name: impl Into<String>,
        inner: S,
        store: C,
        fetch_align: u64,
        seed: Vec<ByteRange>,
    ) -> LacunaResult<Self> {
        if fetch_align == 0 || !fetch_align.is_power_of_two() {
            return Err(LacunaError::with_message(
                LacunaErrorKind::InvalidInput,
                "fetch alignment must be non-zero power of two",
            ));
        }
        let name = name.into();
        let length = inner.total_len().await?;
        store.set_len(length).await?;
        let tracker = SparseFileTracker::with_completed_ranges(&name, length, seed)?;
        trace!(name = %name, length, fetch_align, "cached range source initialized");
        Ok(Self {
            inner,
            store,
            tracker,
            length,
            fetch_align,
        })
    }

    /// Total artifact length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Ranges currently materialized in the store, merged and ascending.
    pub fn completed_ranges(&self) -> Vec<ByteRange> {
        self.tracker.completed_ranges()
    }

    /// Ensure every byte of `range` is materialized without reading it out.
    /// Returns the number of bytes that were still missing when warming began.
    pub async fn warm(&self, range: ByteRange) -> LacunaResult<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        if range.end > self.length {
            return Err(LacunaError::with_message(
                LacunaErrorKind::OutOfRange,
                "warm range exceeds artifact length",
            ));
        }
        let mut warmed = 0u64;
        let mut cursor = range.start;
        while let Some(absent) = self.tracker.absent_range_within(cursor, range.end) {
            trace!(name = %self.tracker.name(), %absent, bytes = absent.len(), "warming absent range");
            let (tx, rx) = oneshot::channel();
            let gaps = self.tracker.wait_for_range(absent, absent, send_result(tx))?;
            self.fill_gaps(gaps).await?;
            await_listener(rx).await?;
            warmed += absent.len();
            cursor = absent.end;
        }
        Ok(warmed)
    }

    fn fetch_range(&self, inner: ByteRange) -> ByteRange {
        let start = inner.start - (inner.start % self.fetch_align);
        let end = inner
            .end
            .div_ceil(self.fetch_align)
            .saturating_mul(self.fetch_align)
            .min(self.length);
        ByteRange::new(start, end)
    }

    /// Drive every gap to a terminal state. A fetch or store error fails the
    /// affected gap and is reported after the remaining gaps were driven, so
    /// no listener is left hanging.
    async fn fill_gaps(&self, gaps: Vec<Gap>) -> LacunaResult<()> {
        let mut first_err = None;
        for mut gap in gaps {
            match self.fill_gap(&mut gap).await {
                Ok(()) => gap.on_completion()?,
                Err(err) => {
                    trace!(name = %self.tracker.name(), gap = ?gap, %err, "gap fill failed");
                    gap.on_failure(err.clone())?;
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn fill_gap(&self, gap: &mut Gap) -> LacunaResult<()> {
        trace!(
            name = %self.tracker.name(),
            start = gap.start(),
            end = gap.end(),
            "fetching missing range from inner source"
        );
        let mut offset = gap.start();
        while offset < gap.end() {
            let chunk_len = FETCH_CHUNK.min(gap.end() - offset) as usize;
            let mut chunk = vec![0u8; chunk_len];
            read_source_exact(&self.inner, offset, &mut chunk).await?;
            self.store.write_at(offset, &chunk).await?;
            offset += chunk_len as u64;
            gap.on_progress(offset)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S, C> RangeSource for CachedRangeSource<S, C>
where
    S: RangeSource,
    C: CacheStore,
{
    async fn total_len(&self) -> LacunaResult<u64> {
        Ok(self.length)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(buf.len() as u64).ok_or_else(|| {
            LacunaError::with_message(LacunaErrorKind::OutOfRange, "read offset overflow")
        })?;
        if end > self.length {
            return Err(LacunaError::with_message(
                LacunaErrorKind::OutOfRange,
                "read exceeds artifact length",
            ));
        }
        let wanted = ByteRange::new(offset, end);

        let (tx, rx) = oneshot::channel();
        if self.tracker.wait_for_range_if_pending(wanted, send_result(tx))? {
            trace!(name = %self.tracker.name(), %wanted, "awaiting fills already in flight");
            await_listener(rx).await?;
        } else {
            let (tx, rx) = oneshot::channel();
            let outer = self.fetch_range(wanted);
            let gaps = self.tracker.wait_for_range(outer, wanted, send_result(tx))?;
            self.fill_gaps(gaps).await?;
            await_listener(rx).await?;
        }

        if !read_store_exact(&self.store, offset, buf).await? {
            return Err(LacunaError::with_message(
                LacunaErrorKind::Io,
                "cache store returned short read",
            ));
        }
        Ok(buf.len())
    }
}

fn send_result(tx: oneshot::Sender<LacunaResult<()>>) -> RangeListener {
    Box::new(move |result| {
        let _ = tx.send(result);
    })
}

async fn await_listener(rx: oneshot::Receiver<LacunaResult<()>>) -> LacunaResult<()> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(LacunaError::with_message(
            LacunaErrorKind::Other,
            "range listener dropped without firing",
        )),
    }
}

async fn read_source_exact<S: RangeSource>(
    source: &S,
    mut offset: u64,
    out: &mut [u8],
) -> LacunaResult<()> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = source.read_at(offset, &mut out[filled..]).await?;
        if read == 0 {
            return Err(LacunaError::with_message(
                LacunaErrorKind::Io,
                "inner source returned short read",
            ));
        }
        filled += read;
        offset += read as u64;
    }
    Ok(())
}

async fn read_store_exact<C: CacheStore>(
    store: &C,
    mut offset: u64,
    out: &mut [u8],
) -> LacunaResult<bool> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = store.read_at(offset, &mut out[filled..]).await?;
        if read == 0 {
            return Ok(false);
        }
        filled += read;
        offset += read as u64;
    }
    Ok(true)
}

/// In-memory store implementation useful for tests and embedded callers.
pub struct MemoryCacheStore {
    state: Mutex<Vec<u8>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> LacunaResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let guard = self.state.lock().unwrap();
        let start = match usize::try_from(offset) {
            Ok(v) => v,
            Err(_) => return Ok(0),
        };
        if start >= guard.len() {
            return Ok(0);
        }
        let copy_len = (guard.len() - start).min(out.len());
        out[..copy_len].copy_from_slice(&guard[start..start + copy_len]);
        Ok(copy_len)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> LacunaResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.lock().unwrap();
        let start = usize::try_from(offset).map_err(|_| {
            LacunaError::with_message(LacunaErrorKind::OutOfRange, "offset exceeds memory store")
        })?;
        let end = start.checked_add(data.len()).ok_or_else(|| {
            LacunaError::with_message(LacunaErrorKind::OutOfRange, "write overflow")
        })?;
        if end > guard.len() {
            guard.resize(end, 0);
        }
        guard[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn set_len(&self, len: u64) -> LacunaResult<()> {
        let len = usize::try_from(len).map_err(|_| {
            LacunaError::with_message(LacunaErrorKind::OutOfRange, "length exceeds memory store")
        })?;
        self.state.lock().unwrap().resize(len, 0);
        Ok(())
    }

    async fn flush(&self) -> LacunaResult<()> {
        Ok(())
    }
}
