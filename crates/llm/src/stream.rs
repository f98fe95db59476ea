use futures::StreamExt;
use tokio::sync::oneshot;

use super::client::ByteStream;
use super::protocol::{LineBuffer, StreamLine, StreamUpdate, parse_line};

/// How a generation stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

enum LineControl {
    Continue,
    Done,
}

/// Drives a generation body to its end, feeding every update to `on_update`.
///
/// A cancel signal, or the sender being dropped, stops reading immediately; nothing
/// is delivered after that. Malformed event lines are skipped. A body that ends
/// without the end marker still counts as completed.
pub async fn consume_event_stream<F>(
    mut body: ByteStream,
    mut cancel_rx: oneshot::Receiver<()>,
    mut on_update: F,
) -> StreamOutcome
where
    F: FnMut(StreamUpdate),
{
    let mut lines = LineBuffer::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                tracing::debug!("generation stream cancelled");
                return StreamOutcome::Cancelled;
            }
            next_chunk = body.next() => {
                match next_chunk {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk) {
                            if let LineControl::Done = handle_line(&line, &mut on_update) {
                                return StreamOutcome::Completed;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "generation stream failed");
                        return StreamOutcome::Failed(error.to_string());
                    }
                    None => {
                        if let Some(tail) = lines.finish() {
                            handle_line(&tail, &mut on_update);
                        }
                        tracing::debug!("generation stream ended without end marker");
                        return StreamOutcome::Completed;
                    }
                }
            }
        }
    }
}

fn handle_line<F>(line: &str, on_update: &mut F) -> LineControl
where
    F: FnMut(StreamUpdate),
{
    match parse_line(line) {
        StreamLine::Ignored => LineControl::Continue,
        StreamLine::Done => LineControl::Done,
        StreamLine::Event(envelope) => {
            envelope.into_updates().into_iter().for_each(&mut *on_update);
            LineControl::Continue
        }
        StreamLine::Malformed { payload, error } => {
            tracing::warn!(payload = %payload, error = %error, "dropping malformed stream event");
            LineControl::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;
    use structura_storage::MessageId;

    use super::*;
    use crate::error::{ApiError, ApiResult};

    fn body_from_chunks(chunks: Vec<Vec<u8>>) -> ByteStream {
        futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    async fn collect(body: ByteStream) -> (StreamOutcome, Vec<StreamUpdate>) {
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let mut updates = Vec::new();
        let outcome = consume_event_stream(body, cancel_rx, |update| updates.push(update)).await;
        (outcome, updates)
    }

    fn content(updates: &[StreamUpdate]) -> String {
        updates
            .iter()
            .filter_map(|update| match update {
                StreamUpdate::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    const BODY: &str = concat!(
        "data: {\"user_message_id\": 1}\n",
        "data: {\"assistant_message_id\": 2}\n",
        "data: {\"content\": \"a\"}\n",
        "data: {\"content\": \"b\"}\n",
        "data: [DONE]\n",
    );

    #[tokio::test]
    async fn delivers_ids_and_content_in_order() {
        let (outcome, updates) = collect(body_from_chunks(vec![BODY.as_bytes().to_vec()])).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(
            updates,
            vec![
                StreamUpdate::UserMessageId(MessageId::new(1)),
                StreamUpdate::AssistantMessageId(MessageId::new(2)),
                StreamUpdate::Content("a".to_string()),
                StreamUpdate::Content("b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn any_chunk_split_yields_the_same_content() {
        let bytes = BODY.as_bytes();
        for split in 0..=bytes.len() {
            let body = body_from_chunks(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]);
            let (outcome, updates) = collect(body).await;
            assert_eq!(outcome, StreamOutcome::Completed, "split at {split}");
            assert_eq!(content(&updates), "ab", "split at {split}");
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let body = body_from_chunks(vec![
            b"data: {\"content\": \"a\"}\ndata: {oops\n: ping\ndata: {\"content\": \"b\"}\n"
                .to_vec(),
        ]);
        let (outcome, updates) = collect(body).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(content(&updates), "ab");
    }

    #[tokio::test]
    async fn nothing_after_end_marker_is_applied() {
        let body = body_from_chunks(vec![
            b"data: {\"content\": \"a\"}\ndata: [DONE]\ndata: {\"content\": \"late\"}\n".to_vec(),
        ]);
        let (_, updates) = collect(body).await;
        assert_eq!(content(&updates), "a");
    }

    #[tokio::test]
    async fn transport_error_fails_the_stream() {
        let chunks: Vec<Result<Vec<u8>, ApiError>> = vec![
            Ok(b"data: {\"content\": \"a\"}\n".to_vec()),
            Err(ApiError::StreamInterrupted {
                stage: "test",
                message: "reset".to_string(),
            }),
        ];
        let (outcome, updates) = collect(futures::stream::iter(chunks).boxed()).await;

        assert!(matches!(outcome, StreamOutcome::Failed(message) if message.contains("reset")));
        assert_eq!(content(&updates), "a");
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded::<ApiResult<Vec<u8>>>();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        chunk_tx
            .unbounded_send(Ok(b"data: {\"content\": \"a\"}\n".to_vec()))
            .unwrap();

        let worker = tokio::spawn(async move {
            let mut updates = Vec::new();
            let outcome =
                consume_event_stream(chunk_rx.boxed(), cancel_rx, |update| updates.push(update))
                    .await;
            (outcome, updates)
        });

        tokio::task::yield_now().await;
        cancel_tx.send(()).unwrap();
        chunk_tx
            .unbounded_send(Ok(b"data: {\"content\": \"late\"}\n".to_vec()))
            .unwrap();

        let (outcome, updates) = worker.await.unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(!content(&updates).contains("late"));
    }

    #[tokio::test]
    async fn dropped_cancel_handle_counts_as_cancel() {
        let (_chunk_tx, chunk_rx) = mpsc::unbounded::<ApiResult<Vec<u8>>>();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        drop(cancel_tx);

        let outcome = consume_event_stream(chunk_rx.boxed(), cancel_rx, |_| {}).await;
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }
}
