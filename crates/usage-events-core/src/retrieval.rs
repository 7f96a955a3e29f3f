//! Ceiling-bounded retrieval with time-chunked fallback.

use serde::Serialize;
use time::OffsetDateTime;

use crate::query::{PredicateBuilder, PredicateSet};
use crate::{EventFilter, EventRecord, EventsError};

/// Maximum number of rows a single retrieval returns.
pub const RESULT_CEILING: usize = 1000;
/// Upper bound on sub-queries issued by one chunked scan.
pub const MAX_CHUNKS: usize = 10;

/// Storage capability the retriever runs against.
pub trait EventStore {
    /// Counts rows matching `predicates`.
    ///
    /// # Errors
    /// Returns [`EventsError::Query`] when the backend fails.
    fn count_events(&self, predicates: &PredicateSet) -> Result<u64, EventsError>;

    /// Returns at most `limit` matching rows, newest first, ties broken by
    /// descending id.
    ///
    /// # Errors
    /// Returns [`EventsError::Query`] when the backend fails.
    fn fetch_events(
        &self,
        predicates: &PredicateSet,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventsError>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RetrievalLimits {
    pub ceiling: usize,
    pub max_chunks: usize,
}

impl Default for RetrievalLimits {
    fn default() -> Self {
        Self {
            ceiling: RESULT_CEILING,
            max_chunks: MAX_CHUNKS,
        }
    }
}

impl RetrievalLimits {
    /// # Errors
    /// Returns [`EventsError::Configuration`] when either limit is zero.
    pub fn validate(&self) -> Result<(), EventsError> {
        if self.ceiling == 0 {
            return Err(EventsError::Configuration(
                "ceiling MUST be >= 1".to_string(),
            ));
        }
        if self.max_chunks == 0 {
            return Err(EventsError::Configuration(
                "max_chunks MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one retrieval call.
///
/// `truncated` is set whenever more rows matched than were returned.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Retrieval {
    pub total_count: u64,
    pub truncated: bool,
    pub chunks: usize,
    pub events: Vec<EventRecord>,
}

/// One sub-interval of a scanned range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChunk {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub end_inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<TimeChunk>,
}

impl ChunkPlan {
    /// `ceil(total_count / ceiling)`, clamped to `1..=max_chunks`.
    #[must_use]
    pub fn chunk_count(total_count: u64, ceiling: usize, max_chunks: usize) -> usize {
        let ceiling = u64::try_from(ceiling.max(1)).unwrap_or(u64::MAX);
        let needed = total_count.div_ceil(ceiling).max(1);
        usize::try_from(needed)
            .unwrap_or(usize::MAX)
            .min(max_chunks.max(1))
    }

    /// Splits `[from, to]` into `chunks` equal slices. Inner slices are
    /// half-open and touch their successor; the final slice ends exactly at
    /// `to` and includes it. An empty or inverted range yields one slice.
    ///
    /// # Errors
    /// Returns [`EventsError::Validation`] when a boundary is not a
    /// representable instant.
    pub fn partition(
        from: OffsetDateTime,
        to: OffsetDateTime,
        chunks: usize,
    ) -> Result<Self, EventsError> {
        if chunks <= 1 || to <= from {
            return Ok(Self {
                chunks: vec![TimeChunk {
                    start: from,
                    end: to,
                    end_inclusive: true,
                }],
            });
        }

        let from_nanos = from.unix_timestamp_nanos();
        let span = to.unix_timestamp_nanos() - from_nanos;
        let count = i128::try_from(chunks).unwrap_or(i128::MAX);

        let mut plan = Vec::with_capacity(chunks);
        let mut start = from;
        for index in 1..=count {
            let last = index == count;
            let end = if last {
                to
            } else {
                let boundary = from_nanos + span * index / count;
                OffsetDateTime::from_unix_timestamp_nanos(boundary).map_err(|err| {
                    EventsError::Validation(format!("invalid chunk boundary {boundary}: {err}"))
                })?
            };
            plan.push(TimeChunk {
                start,
                end,
                end_inclusive: last,
            });
            start = end;
        }

        Ok(Self { chunks: plan })
    }

    #[must_use]
    pub fn chunks(&self) -> &[TimeChunk] {
        &self.chunks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedScan {
    pub chunks: usize,
    pub events: Vec<EventRecord>,
}

/// Runs one bounded query per time chunk and merges the results.
#[derive(Debug)]
pub struct ChunkedTimeScanner<'a, S: ?Sized> {
    store: &'a S,
    limits: RetrievalLimits,
}

impl<'a, S: EventStore + ?Sized> ChunkedTimeScanner<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, limits: RetrievalLimits) -> Self {
        Self { store, limits }
    }

    /// Scans `filter`'s time range in sequential chunks sized from
    /// `total_count`.
    ///
    /// # Errors
    /// Returns [`EventsError::Validation`] when the filter lacks a parseable
    /// range, and the first chunk's [`EventsError::Query`] otherwise.
    pub fn scan(&self, filter: &EventFilter, total_count: u64) -> Result<ChunkedScan, EventsError> {
        let (from, to) = filter.time_range().ok_or_else(|| {
            EventsError::Validation("chunked scan requires parseable from and to".to_string())
        })?;

        let ceiling = self.limits.ceiling;
        let needed = ChunkPlan::chunk_count(total_count, ceiling, usize::MAX);
        let chunks = needed.min(self.limits.max_chunks.max(1));
        if chunks < needed {
            tracing::warn!(
                total_count,
                chunks,
                ceiling,
                "large result set; limiting chunked scan"
            );
        }

        let plan = ChunkPlan::partition(from, to, chunks)?;
        let attributes = filter.without_time_bounds();

        let mut events = Vec::new();
        for (index, chunk) in plan.chunks().iter().enumerate() {
            let predicates = PredicateBuilder::new()
                .add_attribute_filters(&attributes)
                .add_time_window(chunk)
                .finish();
            let batch = self.store.fetch_events(&predicates, ceiling)?;
            tracing::debug!(
                chunk = index + 1,
                of = plan.len(),
                rows = batch.len(),
                start = %chunk.start,
                end = %chunk.end,
                "fetched chunk"
            );
            events.extend(batch);
        }

        sort_newest_first(&mut events);
        if events.len() > ceiling {
            tracing::debug!(from = events.len(), to = ceiling, "truncating merged chunks");
            events.truncate(ceiling);
        }

        Ok(ChunkedScan {
            chunks: plan.len(),
            events,
        })
    }
}

/// Count-first retrieval that never returns more than the ceiling.
#[derive(Debug)]
pub struct BoundedRetriever<'a, S: ?Sized> {
    store: &'a S,
    limits: RetrievalLimits,
}

impl<'a, S: EventStore + ?Sized> BoundedRetriever<'a, S> {
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            limits: RetrievalLimits::default(),
        }
    }

    /// # Errors
    /// Returns [`EventsError::Configuration`] for zero limits.
    pub fn with_limits(store: &'a S, limits: RetrievalLimits) -> Result<Self, EventsError> {
        limits.validate()?;
        Ok(Self { store, limits })
    }

    #[must_use]
    pub fn limits(&self) -> RetrievalLimits {
        self.limits
    }

    /// Retrieves matching events, newest first.
    ///
    /// When more rows match than the ceiling allows and the filter carries a
    /// parseable time range, the range is scanned in chunks; otherwise one
    /// capped query runs and the result is flagged as truncated.
    ///
    /// # Errors
    /// Returns [`EventsError::Query`] from the count query (before any row
    /// fetch) or from any row query.
    pub fn get_events(&self, filter: &EventFilter) -> Result<Retrieval, EventsError> {
        let predicates = PredicateBuilder::new().add_filters(filter).finish();
        let total_count = self.store.count_events(&predicates)?;

        let ceiling = self.limits.ceiling;
        let over_ceiling = total_count > u64::try_from(ceiling).unwrap_or(u64::MAX);

        if over_ceiling && filter.time_range().is_some() {
            let scan = ChunkedTimeScanner::new(self.store, self.limits).scan(filter, total_count)?;
            return Ok(Retrieval {
                total_count,
                truncated: true,
                chunks: scan.chunks,
                events: scan.events,
            });
        }

        if over_ceiling {
            tracing::warn!(
                total_count,
                ceiling,
                "query matches more events than the ceiling; consider a narrower time range"
            );
        }

        let events = self.store.fetch_events(&predicates, ceiling)?;
        Ok(Retrieval {
            total_count,
            truncated: over_ceiling,
            chunks: 1,
            events,
        })
    }
}

fn sort_newest_first(events: &mut [EventRecord]) {
    events.sort_by(|lhs, rhs| {
        rhs.timestamp
            .cmp(&lhs.timestamp)
            .then_with(|| rhs.id.cmp(&lhs.id))
    });
}
