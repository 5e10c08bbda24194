use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub type LacunaResult<T> = Result<T, LacunaError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LacunaErrorKind {
    InvalidInput,
    InvalidRange,
    InvalidListenerRange,
    IllegalState,
    OutOfRange,
    Io,
    Other,
}

#[derive(Clone, Debug)]
pub struct LacunaError {
    kind: LacunaErrorKind,
    message: Option<String>,
}

impl LacunaError {
    pub const fn new(kind: LacunaErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: LacunaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> LacunaErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for LacunaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for LacunaError {}

/// Half-open byte interval `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes in the interval.
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// True when the intersection of the two intervals is non-empty.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }
}

impl fmt::Debug for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<std::ops::Range<u64>> for ByteRange {
    fn from(range: std::ops::Range<u64>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Read-only byte-range access to a fixed-length remote artifact.
///
/// Implementations are expected to be internally synchronized; callers may
/// issue reads concurrently from multiple tasks.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total length of the artifact in bytes.
    async fn total_len(&self) -> LacunaResult<u64>;

    /// Read bytes starting at `offset` into `buf`. Returns the number of
    /// bytes read, which may be short; zero means nothing is available at
    /// `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize>;
}

#[async_trait]
impl<T> RangeSource for Arc<T>
where
    T: RangeSource + ?Sized,
{
    async fn total_len(&self) -> LacunaResult<u64> {
        (**self).total_len().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize> {
        (**self).read_at(offset, buf).await
    }
}
