//! Block until an observation satisfying a predicate shows up.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

/// One page of observations and the cursor to continue from.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>, next_cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(next_cursor.into()),
        }
    }
}

/// A cursor-addressed, append-only stream of observations.
#[async_trait]
pub trait ObservationSource: Send {
    type Item: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Observations after `since`; `None` means from the start.
    async fn next_batch(&mut self, since: Option<&str>) -> Result<Batch<Self::Item>, Self::Error>;
}

#[derive(Debug, Error)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("timed out after {elapsed:?}: checked {checked} observations over {fetches} fetches")]
    TimedOut {
        checked: usize,
        fetches: usize,
        elapsed: Duration,
    },
    #[error("fetch {fetches} failed: {source}")]
    Fetch {
        fetches: usize,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut { .. })
    }
}

/// Fetch batches from `source` until `predicate` accepts an observation.
///
/// The deadline is checked before every fetch. A fetch that hangs is not
/// interrupted, so a slow source can overrun `timeout`. Fetch errors abort
/// immediately. Empty batches just lead to the next fetch.
pub async fn poll_until<S, F>(
    source: &mut S,
    timeout: Duration,
    mut predicate: F,
) -> Result<S::Item, PollError<S::Error>>
where
    S: ObservationSource + ?Sized,
    F: FnMut(&S::Item) -> bool,
{
    let start = Instant::now();
    let mut cursor: Option<String> = None;
    let mut checked = 0;
    let mut fetches = 0;

    loop {
        let elapsed = start.elapsed();
        if elapsed > timeout {
            tracing::debug!(checked, fetches, ?elapsed, "poll deadline exceeded");
            return Err(PollError::TimedOut {
                checked,
                fetches,
                elapsed,
            });
        }

        fetches += 1;
        let batch = source
            .next_batch(cursor.as_deref())
            .await
            .map_err(|err| PollError::Fetch { fetches, source: err })?;

        for item in batch.items {
            checked += 1;
            if predicate(&item) {
                tracing::debug!(checked, fetches, "poll predicate satisfied");
                return Ok(item);
            }
        }
        if batch.next_cursor.is_some() {
            cursor = batch.next_cursor;
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Error)]
    #[error("transport down")]
    struct Down;

    /// Replays scripted batches and records the cursors it was asked for.
    struct Scripted {
        batches: VecDeque<Result<Batch<u32>, Down>>,
        seen_cursors: Vec<Option<String>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(batches: Vec<Result<Batch<u32>, Down>>) -> Self {
            Self {
                batches: batches.into(),
                seen_cursors: Vec::new(),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ObservationSource for Scripted {
        type Item = u32;
        type Error = Down;

        async fn next_batch(&mut self, since: Option<&str>) -> Result<Batch<u32>, Down> {
            self.seen_cursors.push(since.map(str::to_string));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.batches
                .pop_front()
                .unwrap_or_else(|| Ok(Batch { items: vec![], next_cursor: None }))
        }
    }

    #[tokio::test]
    async fn returns_first_match_across_two_batches() {
        // K = 3 misses, then the hit as the first item of the second batch.
        let mut source = Scripted::new(vec![
            Ok(Batch::new(vec![1, 2], "s1")),
            Ok(Batch::new(vec![3, 42, 43], "s2")),
        ]);
        let mut calls = 0;
        let hit = poll_until(&mut source, Duration::from_secs(5), |n| {
            calls += 1;
            *n == 42
        })
        .await
        .unwrap();

        assert_eq!(hit, 42);
        assert_eq!(calls, 4);
        assert_eq!(source.seen_cursors, vec![None, Some("s1".to_string())]);
    }

    #[tokio::test]
    async fn empty_batches_keep_polling() {
        let mut source = Scripted::new(vec![
            Ok(Batch::new(vec![], "s1")),
            Ok(Batch::new(vec![], "s2")),
            Ok(Batch::new(vec![7], "s3")),
        ]);
        let hit = poll_until(&mut source, Duration::from_secs(5), |n| *n == 7)
            .await
            .unwrap();
        assert_eq!(hit, 7);
        assert_eq!(source.seen_cursors.len(), 3);
        assert_eq!(source.seen_cursors[2], Some("s2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn never_matching_predicate_times_out_with_counts() {
        let mut source = Scripted::new(
            (0..100)
                .map(|i| Ok(Batch::new(vec![i], format!("s{i}"))))
                .collect(),
        );
        source.delay = Duration::from_millis(400);

        let err = poll_until(&mut source, Duration::from_secs(1), |_| false)
            .await
            .unwrap_err();
        match err {
            PollError::TimedOut {
                checked,
                fetches,
                elapsed,
            } => {
                // fetches finish at 400ms, 800ms, 1200ms; the 4th check fails.
                assert_eq!(fetches, 3);
                assert_eq!(checked, 3);
                assert!(elapsed > Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_error_aborts_without_retry() {
        let mut source = Scripted::new(vec![
            Ok(Batch::new(vec![1], "s1")),
            Err(Down),
            Ok(Batch::new(vec![2], "s2")),
        ]);
        let err = poll_until(&mut source, Duration::from_secs(5), |n| *n == 2)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Fetch { fetches: 2, .. }));
        assert!(!err.is_timeout());
        assert_eq!(source.batches.len(), 1);
    }
}
