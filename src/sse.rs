//! Push-stream transport for export progress.
//!
//! Frames are `data: <snapshot json>` on every update and `: heartbeat`
//! comments on the connection's heartbeat timer. The response ends when the
//! broadcaster drops the connection (grace teardown or eviction); a client
//! hanging up drops the stream, which detaches it from the broadcaster.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};

use axum::response::sse::{Event, Sse};
use tokio_stream::{Stream, StreamExt};

use crate::broadcaster::{Frame, Subscription};

/// Frame stream of one subscription; keeps the connection registered for
/// as long as the response body is alive.
pub struct SubscriberStream {
    subscription: Subscription,
}

impl SubscriberStream {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }
}

impl Stream for SubscriberStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_frame(cx)
    }
}

pub fn progress_stream(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream =
        SubscriberStream::new(subscription).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Sse::new(stream)
}
