use chrono::{DateTime, Utc};
use futures::stream;
use futures::StreamExt;
use serde_json::Value;

use crate::event::{Event, Metadata};
use crate::store::persistence::EventStream;
use crate::types::SequenceNumber;

struct MergeSource {
    stream: String,
    events: EventStream,
    head: Option<Event>,
    done: bool,
}

/// Merges per-stream sequences into one, ordered by `(created_at, no)`
/// ascending and stable by source-declaration order under equal keys.
///
/// Each yielded event is tagged with its source stream name in
/// `metadata.stream`. At most one event per source is buffered, so
/// back-pressure propagates to the underlying sequences.
pub(crate) fn merge_streams(sources: Vec<(String, EventStream)>) -> EventStream {
    let sources: Vec<MergeSource> = sources
        .into_iter()
        .map(|(stream, events)| MergeSource {
            stream,
            events,
            head: None,
            done: false,
        })
        .collect();

    Box::pin(stream::unfold(sources, |mut sources| async move {
        // Refill empty heads before picking the next event.
        for index in 0..sources.len() {
            if sources[index].head.is_none() && !sources[index].done {
                match sources[index].events.next().await {
                    Some(Ok(event)) => {
                        let stream = sources[index].stream.clone();
                        sources[index].head =
                            Some(event.with_metadata(Metadata::STREAM, Value::from(stream)));
                    }
                    Some(Err(err)) => return Some((Err(err), sources)),
                    None => sources[index].done = true,
                }
            }
        }

        let mut best: Option<(usize, (DateTime<Utc>, SequenceNumber))> = None;
        for (index, source) in sources.iter().enumerate() {
            if let Some(head) = &source.head {
                let key = (head.created_at, head.no);
                match &best {
                    // Strict comparison keeps the earliest source on ties.
                    Some((_, best_key)) if *best_key <= key => {}
                    _ => best = Some((index, key)),
                }
            }
        }

        let (index, _) = best?;
        let event = sources[index]
            .head
            .take()
            .expect("selected merge source has a buffered head");
        Some((Ok(event), sources))
    }))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn source(name: &str, events: Vec<Event>) -> (String, EventStream) {
        (name.to_string(), Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    #[tokio::test]
    async fn merges_by_created_at_then_no() {
        let s1 = vec![
            Event::new("a", json!(1)).with_no(1).with_created_at(at(10)),
            Event::new("b", json!(2)).with_no(2).with_created_at(at(30)),
        ];
        let s2 = vec![Event::new("c", json!(3)).with_no(1).with_created_at(at(20))];

        let merged: Vec<Event> = merge_streams(vec![source("s1", s1), source("s2", s2)])
            .try_collect()
            .await
            .unwrap();

        let names: Vec<&str> = merged.iter().map(Event::name).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
        assert_eq!(merged[0].metadata.stream(), Some("s1"));
        assert_eq!(merged[1].metadata.stream(), Some("s2"));
    }

    #[tokio::test]
    async fn equal_keys_resolve_by_declaration_order() {
        let left = vec![Event::new("left", json!(null)).with_no(1).with_created_at(at(5))];
        let right = vec![Event::new("right", json!(null)).with_no(1).with_created_at(at(5))];

        let merged: Vec<Event> = merge_streams(vec![source("l", left), source("r", right)])
            .try_collect()
            .await
            .unwrap();

        assert_eq!(merged[0].name(), "left");
        assert_eq!(merged[1].name(), "right");
    }

    #[tokio::test]
    async fn empty_sources_yield_nothing() {
        let merged: Vec<Event> = merge_streams(vec![source("s", vec![])]).try_collect().await.unwrap();
        assert!(merged.is_empty());
    }
}
