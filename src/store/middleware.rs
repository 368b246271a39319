use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::StoreError;
use crate::event::Event;
use crate::store::persistence::EventStream;

/// The four hook points of the append/load pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    /// Runs sequentially before persistence; may substitute the event; a
    /// failure aborts the append.
    PreAppend,
    /// Observes each persisted event; failures are logged, never surfaced.
    Appended,
    /// Observes the batch after a failed append; failures are logged, never
    /// surfaced.
    AppendErrored,
    /// Transforms each event pulled out of the store, per pull.
    Loaded,
}

/// A user hook fired at one of the [`EventAction`] points. Transforming
/// actions may substitute the event by returning a different one.
#[async_trait]
pub trait EventMiddleware: Send + Sync {
    async fn apply(&self, event: Event) -> Result<Event, StoreError>;

    /// Used in tracing spans to identify the middleware being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Lazy sequence adapter piping every pulled event through the LOADED
/// middleware chain, in registration order.
///
/// The chain runs per pull; at most one event is in flight, so consumer
/// back-pressure reaches the back-end untouched. A failing middleware is
/// logged and the event passes on unchanged.
pub struct MiddlewareIterator {
    inner: EventStream,
}

impl MiddlewareIterator {
    pub(crate) fn new(events: EventStream, middlewares: Vec<Arc<dyn EventMiddleware>>) -> Self {
        if middlewares.is_empty() {
            return Self { inner: events };
        }

        let inner = events
            .then(move |result| {
                let middlewares = middlewares.clone();
                async move {
                    let mut event = result?;
                    for middleware in &middlewares {
                        match middleware.apply(event.clone()).await {
                            Ok(next) => event = next,
                            Err(error) => {
                                tracing::error!(
                                    middleware = middleware.name(),
                                    error = ?error,
                                    "loaded middleware failed, passing event through unchanged"
                                );
                            }
                        }
                    }
                    Ok(event)
                }
            })
            .boxed();

        Self { inner }
    }
}

impl Stream for MiddlewareIterator {
    type Item = Result<Event, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;

    struct Tagger(&'static str);

    #[async_trait]
    impl EventMiddleware for Tagger {
        async fn apply(&self, event: Event) -> Result<Event, StoreError> {
            Ok(event.with_metadata("tag", json!(self.0)))
        }
    }

    struct Failing;

    #[async_trait]
    impl EventMiddleware for Failing {
        async fn apply(&self, _event: Event) -> Result<Event, StoreError> {
            Err(StoreError::custom(std::io::Error::other("boom")))
        }
    }

    fn events(count: usize) -> EventStream {
        let items: Vec<_> = (0..count)
            .map(|i| Ok(Event::new("e", json!(i)).with_no(i as i64 + 1)))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let iterator = MiddlewareIterator::new(events(2), vec![Arc::new(Tagger("first")), Arc::new(Tagger("second"))]);

        let collected: Vec<Event> = iterator.try_collect().await.unwrap();
        assert_eq!(collected.len(), 2);
        for event in &collected {
            assert_eq!(event.metadata.get("tag"), Some(&json!("second")));
        }
    }

    #[tokio::test]
    async fn failing_middleware_passes_event_through() {
        let iterator = MiddlewareIterator::new(events(1), vec![Arc::new(Failing), Arc::new(Tagger("after"))]);

        let collected: Vec<Event> = iterator.try_collect().await.unwrap();
        assert_eq!(collected[0].metadata.get("tag"), Some(&json!("after")));
        assert_eq!(collected[0].no, 1);
    }

    #[tokio::test]
    async fn empty_chain_is_transparent() {
        let iterator = MiddlewareIterator::new(events(3), vec![]);
        let collected: Vec<Event> = iterator.try_collect().await.unwrap();
        assert_eq!(collected.len(), 3);
    }
}
