//! Presentation-time pacing for replayed packets

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

use crate::types::MediaPacket;

/// Gaps longer than this re-anchor pacing instead of stalling the stream.
pub const MAX_PACING_GAP: Duration = Duration::from_secs(5);

/// Items that carry a presentation timestamp.
pub trait Presented {
    fn presentation_time(&self) -> Duration;
}

impl Presented for MediaPacket {
    fn presentation_time(&self) -> Duration {
        self.pts
    }
}

/// Extension trait to replay any stream of timestamped items in real time
pub trait PacedExt: Stream {
    /// Delay each item until its presentation time, relative to the first item.
    ///
    /// Items that are already late pass through immediately; timestamps never
    /// cause items to be reordered or dropped.
    fn paced(self) -> Paced<Self>
    where
        Self: Sized,
        Self::Item: Presented,
    {
        Paced::new(self)
    }
}

impl<T: Stream> PacedExt for T {}

pin_project! {
    /// A stream combinator that releases items at their presentation time
    pub struct Paced<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        delay: Sleep,
        pending: Option<S::Item>,
        // Wall time and pts of the pacing anchor
        origin: Option<(Instant, Duration)>,
    }
}

impl<S: Stream> Paced<S>
where
    S::Item: Presented,
{
    pub fn new(stream: S) -> Self {
        Self { stream, delay: sleep(Duration::ZERO), pending: None, origin: None }
    }
}

impl<S: Stream> Stream for Paced<S>
where
    S::Item: Presented,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if this.pending.is_some() {
            ready!(this.delay.as_mut().poll(cx));
            return Poll::Ready(this.pending.take());
        }

        let Some(item) = ready!(this.stream.as_mut().poll_next(cx)) else {
            return Poll::Ready(None);
        };

        let now = Instant::now();
        let pts = item.presentation_time();
        let (start, first) = *this.origin.get_or_insert((now, pts));
        let due = start + pts.saturating_sub(first);

        if due <= now {
            return Poll::Ready(Some(item));
        }
        if due - now > MAX_PACING_GAP {
            *this.origin = Some((now, pts));
            return Poll::Ready(Some(item));
        }

        this.delay.as_mut().reset(due);
        *this.pending = Some(item);
        ready!(this.delay.as_mut().poll(cx));
        Poll::Ready(this.pending.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Debug, PartialEq)]
    struct Stamped(u64);

    impl Presented for Stamped {
        fn presentation_time(&self) -> Duration {
            Duration::from_millis(self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn releases_items_at_their_offsets() {
        let start = Instant::now();
        let mut paced = std::pin::pin!(futures::stream::iter([1000, 1040, 1200].map(Stamped)).paced());

        let mut seen = Vec::new();
        while let Some(item) = paced.next().await {
            seen.push((item.0, start.elapsed()));
        }

        assert_eq!(seen[0], (1000, Duration::ZERO));
        assert_eq!(seen[1], (1040, Duration::from_millis(40)));
        assert_eq!(seen[2], (1200, Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn backward_and_huge_jumps_do_not_stall() {
        let start = Instant::now();
        let items = [500, 400, 60_000, 60_100].map(Stamped);
        let out: Vec<_> = futures::stream::iter(items).paced().collect().await;

        assert_eq!(out.len(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
