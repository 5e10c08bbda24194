//! In-memory tracker for which byte ranges of a fixed-length file have been
//! materialized locally.
//!
//! A [`SparseFileTracker`] records the present part of a logical file as an
//! ordered list of segments, hands out [`Gap`]s to fillers for the absent
//! parts, and notifies registered listeners the moment a byte range of
//! interest becomes fully available. It is the coordination primitive under a
//! block-range cache: the tracker performs no I/O itself and only arbitrates
//! who produces which bytes and who gets told when.
//!
//! All state lives behind a single mutex per tracker. Listener callbacks are
//! collected inside the critical section and invoked after the lock is
//! released, so a callback may re-enter the tracker freely.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use lacuna_core::{LacunaError, LacunaErrorKind, LacunaResult};

pub use lacuna_core::ByteRange;

/// One-shot notification for a registered range wait.
///
/// Receives `Ok(())` once every byte of the inner range is available, or the
/// filler's error if any covering fill fails. Invoked exactly once, never
/// while the tracker lock is held.
pub type RangeListener = Box<dyn FnOnce(LacunaResult<()>) + Send>;

type Firing = (RangeListener, LacunaResult<()>);

/// Tracks the materialized byte ranges of a single fixed-length file.
///
/// The tracker is typically owned by the cache entry for the file and shared
/// by reference; outstanding [`Gap`]s keep the internal state alive
/// independently of the tracker itself.
pub struct SparseFileTracker {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    length: u64,
    state: Mutex<State>,
}

struct State {
    /// Ordered by `(start, end)`, non-overlapping. COMPLETE segments never
    /// touch each other; PENDING segments may touch anything, since each one
    /// is owned by exactly one filler and must not be fused with another.
    segments: Vec<Segment>,
    next_owner: u64,
}

struct Segment {
    start: u64,
    end: u64,
    body: SegmentBody,
}

enum SegmentBody {
    Complete,
    Pending(PendingSegment),
}

struct PendingSegment {
    owner: u64,
    waiters: Vec<Arc<Waiter>>,
}

/// Listener handle shared across every PENDING segment overlapping its range.
struct Waiter {
    range: ByteRange,
    remaining: AtomicUsize,
    callback: Mutex<Option<RangeListener>>,
}

impl Waiter {
    fn new(range: ByteRange, remaining: usize, callback: RangeListener) -> Self {
        Self {
            range,
            remaining: AtomicUsize::new(remaining),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn take(&self) -> Option<RangeListener> {
        self.callback.lock().unwrap().take()
    }
}

impl Segment {
    fn complete(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            body: SegmentBody::Complete,
        }
    }

    fn pending(start: u64, end: u64, owner: u64) -> Self {
        Self {
            start,
            end,
            body: SegmentBody::Pending(PendingSegment {
                owner,
                waiters: Vec::new(),
            }),
        }
    }

    fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    fn is_complete(&self) -> bool {
        matches!(self.body, SegmentBody::Complete)
    }

    fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl State {
    /// Index of the first segment whose interval may intersect `range`.
    fn first_overlapping(&self, range: ByteRange) -> usize {
        self.segments.partition_point(|seg| seg.end <= range.start)
    }
}

impl SparseFileTracker {
    /// New tracker with no bytes present.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        let name = name.into();
        trace!(name = %name, length, "created sparse file tracker");
        Self {
            shared: Arc::new(Shared {
                name,
                length,
                state: Mutex::new(State {
                    segments: Vec::new(),
                    next_owner: 0,
                }),
            }),
        }
    }

    /// New tracker seeded with already-materialized ranges, e.g. recovered by
    /// the caller after a restart.
    ///
    /// `ranges` must iterate in ascending order and be non-overlapping and
    /// non-touching; each range must satisfy `0 <= start < end <= length`.
    pub fn with_completed_ranges(
        name: impl Into<String>,
        length: u64,
        ranges: impl IntoIterator<Item = ByteRange>,
    ) -> LacunaResult<Self> {
        let name = name.into();
        let mut segments = Vec::new();
        let mut prev_end = None;
        for range in ranges {
            if range.start >= range.end || range.end > length {
                return Err(LacunaError::with_message(
                    LacunaErrorKind::InvalidRange,
                    format!("invalid seed range {range} for {name} with length {length}"),
                ));
            }
            if let Some(prev) = prev_end {
                if range.start <= prev {
                    return Err(LacunaError::with_message(
                        LacunaErrorKind::InvalidRange,
                        format!("seed range {range} overlaps or touches its predecessor for {name}"),
                    ));
                }
            }
            prev_end = Some(range.end);
            segments.push(Segment::complete(range.start, range.end));
        }
        trace!(name = %name, length, seeded = segments.len(), "created seeded sparse file tracker");
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                length,
                state: Mutex::new(State {
                    segments,
                    next_owner: 0,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn length(&self) -> u64 {
        self.shared.length
    }

    /// Wait for `inner` to become fully available, starting fills as needed.
    ///
    /// Creates a PENDING segment and returns a [`Gap`] for every maximal
    /// sub-range of `outer` that is neither materialized nor already owned by
    /// another filler; bytes already PENDING are left to the filler that owns
    /// them. `listener` fires with success once no still-pending segment
    /// overlaps `inner` (immediately, before this call returns, if `inner` is
    /// already fully available), or with the filler's error if a covering
    /// fill fails.
    ///
    /// Requires `0 <= outer.start <= inner.start < inner.end <= outer.end <=
    /// length`. Validation failures are returned to the caller and never
    /// reach the listener.
    pub fn wait_for_range(
        &self,
        outer: ByteRange,
        inner: ByteRange,
        listener: RangeListener,
    ) -> LacunaResult<Vec<Gap>> {
        self.shared.check_range(outer, "for")?;
        self.shared.check_range(inner, "to listen to for")?;
        if inner.start < outer.start || outer.end < inner.end {
            return Err(LacunaError::with_message(
                LacunaErrorKind::InvalidListenerRange,
                format!("unable to listen to range {inner} within {outer}"),
            ));
        }

        let mut firings = Vec::new();
        let gaps = {
            let mut state = self.shared.state.lock().unwrap();

            let mut gaps = Vec::new();
            let mut idx = state.first_overlapping(outer);
            let mut cursor = outer.start;
            while cursor < outer.end {
                if idx < state.segments.len() && state.segments[idx].start <= cursor {
                    cursor = cursor.max(state.segments[idx].end);
                    idx += 1;
                    continue;
                }
                let gap_end = match state.segments.get(idx) {
                    Some(seg) => seg.start.min(outer.end),
                    None => outer.end,
                };
                let owner = state.next_owner;
                state.next_owner += 1;
                state.segments.insert(idx, Segment::pending(cursor, gap_end, owner));
                gaps.push(Gap {
                    shared: Arc::clone(&self.shared),
                    range: ByteRange::new(cursor, gap_end),
                    owner,
                    finished: false,
                });
                idx += 1;
                cursor = gap_end;
            }

            let mut targets = Vec::new();
            let lo = state.first_overlapping(inner);
            for i in lo..state.segments.len() {
                let seg = &state.segments[i];
                if seg.start >= inner.end {
                    break;
                }
                if !seg.is_complete() && seg.range().overlaps(&inner) {
                    targets.push(i);
                }
            }

            if targets.is_empty() {
                firings.push((listener, Ok(())));
            } else {
                let waiter = Arc::new(Waiter::new(inner, targets.len(), listener));
                for i in targets {
                    if let SegmentBody::Pending(pending) = &mut state.segments[i].body {
                        pending.waiters.push(Arc::clone(&waiter));
                    }
                }
            }

            trace!(
                name = %self.shared.name,
                %outer,
                %inner,
                gaps = gaps.len(),
                "registered range wait"
            );
            gaps
        };
        fire(firings);
        Ok(gaps)
    }

    /// Register `listener` only if `inner` is currently being filled.
    ///
    /// Returns `false` without invoking the listener when `inner` is already
    /// fully available, or when any of its bytes is absent and unowned (the
    /// caller is expected to follow up with [`wait_for_range`] to start
    /// fills). Returns `true` when the listener was attached to the fills in
    /// flight.
    ///
    /// [`wait_for_range`]: SparseFileTracker::wait_for_range
    pub fn wait_for_range_if_pending(
        &self,
        inner: ByteRange,
        listener: RangeListener,
    ) -> LacunaResult<bool> {
        self.shared.check_range(inner, "to listen to for")?;

        let mut state = self.shared.state.lock().unwrap();
        let mut cursor = inner.start;
        let mut targets = Vec::new();
        let lo = state.first_overlapping(inner);
        for idx in lo..state.segments.len() {
            let seg = &state.segments[idx];
            if seg.start >= inner.end {
                break;
            }
            if seg.is_empty() {
                continue;
            }
            if seg.start > cursor {
                return Ok(false);
            }
            if !seg.is_complete() {
                targets.push(idx);
            }
            cursor = cursor.max(seg.end);
        }
        if cursor < inner.end || targets.is_empty() {
            return Ok(false);
        }

        let waiter = Arc::new(Waiter::new(inner, targets.len(), listener));
        for idx in targets {
            if let SegmentBody::Pending(pending) = &mut state.segments[idx].body {
                pending.waiters.push(Arc::clone(&waiter));
            }
        }
        trace!(name = %self.shared.name, %inner, "attached listener to pending fills");
        Ok(true)
    }

    /// First maximal sub-range of `[start, end)` that is not materialized.
    ///
    /// Bytes owned by in-flight fills count as absent: the result tells the
    /// caller what is not yet readable, not what still needs a filler.
    /// Returns `None` iff every byte of the query is materialized; an empty
    /// query is always `None`.
    pub fn absent_range_within(&self, start: u64, end: u64) -> Option<ByteRange> {
        let end = end.min(self.shared.length);
        if start >= end {
            return None;
        }
        let query = ByteRange::new(start, end);
        let state = self.shared.state.lock().unwrap();
        let mut cursor = start;
        let lo = state.first_overlapping(query);
        for seg in &state.segments[lo..] {
            if seg.start >= end {
                break;
            }
            if !seg.is_complete() {
                continue;
            }
            if seg.start > cursor {
                return Some(ByteRange::new(cursor, seg.start.min(end)));
            }
            cursor = cursor.max(seg.end);
            if cursor >= end {
                return None;
            }
        }
        Some(ByteRange::new(cursor, end))
    }

    /// All materialized ranges in ascending order, with touching runs merged.
    pub fn completed_ranges(&self) -> Vec<ByteRange> {
        let state = self.shared.state.lock().unwrap();
        let mut out: Vec<ByteRange> = Vec::new();
        for seg in &state.segments {
            if !seg.is_complete() {
                continue;
            }
            if let Some(last) = out.last_mut() {
                if last.end == seg.start {
                    last.end = seg.end;
                    continue;
                }
            }
            out.push(seg.range());
        }
        out
    }
}

impl fmt::Debug for SparseFileTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseFileTracker")
            .field("name", &self.shared.name)
            .field("length", &self.shared.length)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn check_range(&self, range: ByteRange, what: &str) -> LacunaResult<()> {
        if range.start >= range.end || range.end > self.length {
            return Err(LacunaError::with_message(
                LacunaErrorKind::InvalidRange,
                format!(
                    "invalid range {range} {what} {} with length {}",
                    self.name, self.length
                ),
            ));
        }
        Ok(())
    }

    /// Locate the live PENDING segment driven by a gap. Segment ends never
    /// change while a PENDING segment lives, so `(end, owner)` identifies it.
    fn find_owned(state: &State, gap_end: u64, owner: u64) -> Option<usize> {
        let mut idx = state.segments.partition_point(|seg| seg.end < gap_end);
        while idx < state.segments.len() && state.segments[idx].end == gap_end {
            if let SegmentBody::Pending(pending) = &state.segments[idx].body {
                if pending.owner == owner {
                    return Some(idx);
                }
            }
            idx += 1;
        }
        None
    }

    /// Complete the prefix of the PENDING segment at `idx` up to `offset`,
    /// detaching and firing waiters whose range no longer overlaps the
    /// remaining suffix. Returns the segment's index after the split; offsets
    /// at or below current progress are a no-op.
    fn progress_locked(
        state: &mut State,
        idx: usize,
        offset: u64,
        firings: &mut Vec<Firing>,
    ) -> usize {
        let old_start = state.segments[idx].start;
        if offset <= old_start {
            return idx;
        }
        let end = state.segments[idx].end;
        state.segments[idx].start = offset;
        if let SegmentBody::Pending(pending) = &mut state.segments[idx].body {
            let suffix = ByteRange::new(offset, end);
            pending.waiters.retain(|waiter| {
                if waiter.range.overlaps(&suffix) {
                    return true;
                }
                if waiter.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Some(listener) = waiter.take() {
                        firings.push((listener, Ok(())));
                    }
                }
                false
            });
        }
        if idx > 0 && state.segments[idx - 1].is_complete() && state.segments[idx - 1].end == old_start
        {
            state.segments[idx - 1].end = offset;
            idx
        } else {
            state.segments.insert(idx, Segment::complete(old_start, offset));
            idx + 1
        }
    }

    /// Merge the COMPLETE neighbors left touching after removing the segment
    /// that used to sit at `idx`.
    fn merge_at_removal(state: &mut State, idx: usize) {
        if idx == 0 || idx >= state.segments.len() {
            return;
        }
        let touching = state.segments[idx - 1].end == state.segments[idx].start;
        if touching && state.segments[idx - 1].is_complete() && state.segments[idx].is_complete() {
            let right = state.segments.remove(idx);
            state.segments[idx - 1].end = right.end;
        }
    }

    fn progress_gap(&self, gap: &Gap, offset: u64) -> LacunaResult<Vec<Firing>> {
        if offset < gap.range.start || offset > gap.range.end {
            return Err(LacunaError::with_message(
                LacunaErrorKind::InvalidRange,
                format!("progress offset {offset} outside gap {} of {}", gap.range, self.name),
            ));
        }
        let mut firings = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let idx = Self::find_owned(&state, gap.range.end, gap.owner)
                .ok_or_else(|| untracked_gap(gap, &self.name))?;
            Self::progress_locked(&mut state, idx, offset, &mut firings);
        }
        trace!(name = %self.name, gap = %gap.range, offset, "gap progressed");
        Ok(firings)
    }

    fn complete_gap(&self, gap: &Gap) -> LacunaResult<Vec<Firing>> {
        let mut firings = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let idx = Self::find_owned(&state, gap.range.end, gap.owner)
                .ok_or_else(|| untracked_gap(gap, &self.name))?;
            let idx = Self::progress_locked(&mut state, idx, gap.range.end, &mut firings);
            debug_assert!(state.segments[idx].is_empty());
            state.segments.remove(idx);
            Self::merge_at_removal(&mut state, idx);
        }
        trace!(name = %self.name, gap = %gap.range, "gap completed");
        Ok(firings)
    }

    fn fail_gap(&self, gap: &Gap, error: LacunaError) -> LacunaResult<Vec<Firing>> {
        let mut firings = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let idx = Self::find_owned(&state, gap.range.end, gap.owner)
                .ok_or_else(|| untracked_gap(gap, &self.name))?;
            let seg = state.segments.remove(idx);
            if let SegmentBody::Pending(pending) = seg.body {
                for waiter in pending.waiters {
                    if let Some(listener) = waiter.take() {
                        firings.push((listener, Err(error.clone())));
                    }
                }
            }
            Self::merge_at_removal(&mut state, idx);
        }
        trace!(name = %self.name, gap = %gap.range, %error, "gap failed");
        Ok(firings)
    }
}

fn untracked_gap(gap: &Gap, name: &str) -> LacunaError {
    LacunaError::with_message(
        LacunaErrorKind::IllegalState,
        format!("gap {} of {name} is no longer tracked", gap.range),
    )
}

fn fire(firings: Vec<Firing>) {
    for (listener, result) in firings {
        listener(result);
    }
}

/// Filler capability for one contiguous absent sub-range.
///
/// Exactly one filler owns each Gap; driving it reports the bytes it has
/// produced back into the tracker. A Gap must end with exactly one terminal
/// call, either [`on_completion`] or [`on_failure`]; an abandoned Gap leaves
/// its bytes unreadable until the owner signals failure.
///
/// [`on_completion`]: Gap::on_completion
/// [`on_failure`]: Gap::on_failure
pub struct Gap {
    shared: Arc<Shared>,
    range: ByteRange,
    owner: u64,
    finished: bool,
}

impl Gap {
    pub fn start(&self) -> u64 {
        self.range.start
    }

    pub fn end(&self) -> u64 {
        self.range.end
    }

    /// Report that every byte below `offset` has been materialized.
    ///
    /// Listeners whose range is cleared by this progress fire before this
    /// call returns. Offsets at or below the current progress are silently
    /// ignored; offsets outside `[start, end]` fail with `InvalidRange`.
    /// Progressing to `end` makes every byte readable but keeps the fill
    /// registered until [`on_completion`](Gap::on_completion).
    pub fn on_progress(&mut self, offset: u64) -> LacunaResult<()> {
        if self.finished {
            return Err(finished_gap(self));
        }
        let firings = self.shared.progress_gap(self, offset)?;
        fire(firings);
        Ok(())
    }

    /// Mark the whole gap materialized and retire it.
    pub fn on_completion(&mut self) -> LacunaResult<()> {
        if self.finished {
            return Err(finished_gap(self));
        }
        let firings = self.shared.complete_gap(self)?;
        self.finished = true;
        fire(firings);
        Ok(())
    }

    /// Abort the fill. Bytes not yet progressed return to the absent state
    /// and may be re-attempted by a later [`wait_for_range`]; every listener
    /// attached to this fill fires with `error`.
    ///
    /// [`wait_for_range`]: SparseFileTracker::wait_for_range
    pub fn on_failure(&mut self, error: LacunaError) -> LacunaResult<()> {
        if self.finished {
            return Err(finished_gap(self));
        }
        let firings = self.shared.fail_gap(self, error)?;
        self.finished = true;
        fire(firings);
        Ok(())
    }
}

impl fmt::Debug for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gap[{} of {}]", self.range, self.shared.name)
    }
}

fn finished_gap(gap: &Gap) -> LacunaError {
    LacunaError::with_message(
        LacunaErrorKind::IllegalState,
        format!("gap {} of {} already finished", gap.range, gap.shared.name),
    )
}
