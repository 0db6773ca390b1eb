//! Streaming accumulator.
//!
//! `read_stream` consumes a provider's chunk stream in order, forwards every
//! chunk to an optional sink, and folds completed output items into history
//! messages. Deltas are forwarded for live display but never folded; the
//! `response.output_item.done` chunk carries the complete item.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use runloop_types::chunk::{Chunk, OutputContent, OutputItem};
use runloop_types::llm::{LlmError, Usage};
use runloop_types::message::{
    FunctionCallMessage, ImageGenerationCallMessage, Message, ReasoningMessage,
};

/// Folded result of one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResult {
    pub output: Vec<Message>,
    /// `None` when the stream ended without `response.completed`.
    pub usage: Option<Usage>,
}

impl StreamResult {
    pub fn function_calls(&self) -> Vec<FunctionCallMessage> {
        self.output
            .iter()
            .filter_map(|m| m.as_function_call().cloned())
            .collect()
    }
}

/// Consume `stream` to its end.
///
/// A provider error ends the read with that error; messages folded so far are
/// discarded. A closed sink is not an error: the chunk is dropped and reading
/// continues so that history stays complete.
pub async fn read_stream<S>(
    stream: S,
    sink: Option<&mpsc::Sender<Chunk>>,
) -> Result<StreamResult, LlmError>
where
    S: Stream<Item = Result<Chunk, LlmError>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut result = StreamResult::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        trace!(event = chunk.event_type(), "chunk");

        if let Some(sink) = sink {
            if sink.send(chunk.clone()).await.is_err() {
                debug!("chunk sink closed, continuing without forwarding");
            }
        }

        fold(&mut result, chunk);
    }

    Ok(result)
}

fn fold(result: &mut StreamResult, chunk: Chunk) {
    match chunk {
        Chunk::OutputItemDone { item, .. } => fold_item(&mut result.output, item),
        Chunk::ResponseCompleted { usage, .. } => match result.usage.as_mut() {
            Some(total) => total.add(&usage),
            None => result.usage = Some(usage),
        },
        _ => {}
    }
}

fn fold_item(output: &mut Vec<Message>, item: OutputItem) {
    match item {
        OutputItem::Message { id, content } => {
            for part in content {
                let text = match part {
                    OutputContent::OutputText { text } => text,
                    OutputContent::Refusal { refusal } => refusal,
                };
                output.push(Message::assistant(id.clone(), text));
            }
        }
        OutputItem::Reasoning {
            id,
            summary,
            encrypted_content,
        } => {
            let summary: Vec<String> = summary
                .into_iter()
                .map(|part| part.text)
                .filter(|text| !text.is_empty())
                .collect();
            if encrypted_content.is_none() && summary.is_empty() {
                return;
            }
            output.push(Message::Reasoning(ReasoningMessage {
                id,
                summary,
                encrypted_content,
            }));
        }
        OutputItem::FunctionCall {
            id,
            call_id,
            name,
            arguments,
            thought_signature,
        } => output.push(Message::FunctionCall(FunctionCallMessage {
            id,
            call_id,
            name,
            arguments,
            thought_signature,
        })),
        OutputItem::ImageGenerationCall { id, status, result } => {
            output.push(Message::ImageGenerationCall(ImageGenerationCallMessage {
                id,
                status,
                result: result.unwrap_or_default(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_types::chunk::ReasoningSummaryPart;

    fn ok(chunks: Vec<Chunk>) -> impl Stream<Item = Result<Chunk, LlmError>> {
        futures_util::stream::iter(chunks.into_iter().map(Ok))
    }

    fn text_done(id: &str, texts: &[&str]) -> Chunk {
        Chunk::OutputItemDone {
            output_index: 0,
            item: OutputItem::Message {
                id: id.to_string(),
                content: texts
                    .iter()
                    .map(|t| OutputContent::OutputText {
                        text: t.to_string(),
                    })
                    .collect(),
            },
        }
    }

    fn completed(input: u64, output: u64) -> Chunk {
        Chunk::ResponseCompleted {
            response_id: "resp_1".to_string(),
            usage: Usage::new(input, output),
        }
    }

    #[tokio::test]
    async fn test_forwards_every_chunk_in_order() {
        let chunks = vec![
            Chunk::ResponseCreated {
                response_id: "resp_1".to_string(),
            },
            Chunk::OutputTextDelta {
                item_id: "msg_a".to_string(),
                output_index: 0,
                content_index: 0,
                delta: "Hi".to_string(),
            },
            text_done("msg_a", &["Hi!"]),
            completed(5, 2),
        ];
        let (tx, mut rx) = mpsc::channel(16);
        let result = read_stream(ok(chunks.clone()), Some(&tx)).await.unwrap();
        drop(tx);

        let mut forwarded = Vec::new();
        while let Some(chunk) = rx.recv().await {
            forwarded.push(chunk);
        }
        assert_eq!(forwarded, chunks);
        assert_eq!(result.output, vec![Message::assistant("msg_a", "Hi!")]);
        assert_eq!(result.usage, Some(Usage::new(5, 2)));
    }

    #[tokio::test]
    async fn test_one_message_per_text_part() {
        let result = read_stream(ok(vec![text_done("msg_a", &["one", "two"])]), None)
            .await
            .unwrap();
        assert_eq!(
            result.output,
            vec![
                Message::assistant("msg_a", "one"),
                Message::assistant("msg_a", "two")
            ]
        );
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn test_noop_chunks_do_not_change_output() {
        let plain = vec![text_done("msg_a", &["Hi!"]), completed(1, 1)];
        let noisy = vec![
            Chunk::ResponseInProgress {
                response_id: "resp_1".to_string(),
            },
            Chunk::FunctionCallArgumentsDelta {
                item_id: "fc".to_string(),
                output_index: 1,
                delta: "{\"pa".to_string(),
            },
            text_done("msg_a", &["Hi!"]),
            Chunk::ReasoningSummaryTextDelta {
                item_id: "rs".to_string(),
                output_index: 2,
                delta: "thinking".to_string(),
            },
            completed(1, 1),
        ];
        let a = read_stream(ok(plain), None).await.unwrap();
        let b = read_stream(ok(noisy), None).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_reasoning_dropped_only_when_empty() {
        let reasoning = |summary: Vec<&str>, encrypted: Option<&str>| Chunk::OutputItemDone {
            output_index: 0,
            item: OutputItem::Reasoning {
                id: "rs_1".to_string(),
                summary: summary
                    .into_iter()
                    .map(|t| ReasoningSummaryPart {
                        text: t.to_string(),
                    })
                    .collect(),
                encrypted_content: encrypted.map(str::to_string),
            },
        };

        let result = read_stream(
            ok(vec![
                reasoning(vec![], None),
                reasoning(vec![""], None),
                reasoning(vec![], Some("opaque")),
                reasoning(vec!["planned steps"], None),
            ]),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.output.len(), 2);
        assert!(matches!(
            &result.output[0],
            Message::Reasoning(r) if r.encrypted_content.as_deref() == Some("opaque")
        ));
        assert!(matches!(
            &result.output[1],
            Message::Reasoning(r) if r.summary == vec!["planned steps".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_function_call_and_image_items() {
        let result = read_stream(
            ok(vec![
                Chunk::OutputItemDone {
                    output_index: 0,
                    item: OutputItem::FunctionCall {
                        id: "fc_1".to_string(),
                        call_id: "call_1".to_string(),
                        name: "search".to_string(),
                        arguments: r#"{"q":"x"}"#.to_string(),
                        thought_signature: Some("sig".to_string()),
                    },
                },
                Chunk::OutputItemDone {
                    output_index: 1,
                    item: OutputItem::ImageGenerationCall {
                        id: "ig_1".to_string(),
                        status: "completed".to_string(),
                        result: Some("aGVsbG8=".to_string()),
                    },
                },
            ]),
            None,
        )
        .await
        .unwrap();

        let calls = result.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].thought_signature.as_deref(), Some("sig"));
        assert!(matches!(
            &result.output[1],
            Message::ImageGenerationCall(img) if img.result == "aGVsbG8="
        ));
    }

    #[tokio::test]
    async fn test_provider_error_ends_read() {
        let stream = futures_util::stream::iter(vec![
            Ok(text_done("msg_a", &["partial"])),
            Err(LlmError::Stream("connection reset".to_string())),
        ]);
        let err = read_stream(stream, None).await.unwrap_err();
        assert!(matches!(err, LlmError::Stream(_)));
    }

    #[tokio::test]
    async fn test_closed_sink_is_not_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = read_stream(ok(vec![text_done("msg_a", &["Hi!"])]), Some(&tx))
            .await
            .unwrap();
        assert_eq!(result.output.len(), 1);
    }
}
