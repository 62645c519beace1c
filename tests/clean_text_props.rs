use assistant_mux::providers::codec::{clean_text, WireCodec};
use assistant_mux::providers::error::ProviderError;
use assistant_mux::providers::openai::OpenAiCodec;
use assistant_mux::providers::streaming::{decode_text_stream, LineStream};
use bytes::Bytes;
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Markdown-heavy text, so the patterns actually fire
fn markdownish() -> impl Strategy<Value = String> {
    "[a-c *#\\-\t\n]{0,40}"
}

fn decode_deltas(deltas: &[String]) -> Vec<String> {
    let mut lines: Vec<Result<String, ProviderError>> = deltas
        .iter()
        .map(|d| Ok(format!("data: {}", json!({"choices": [{"delta": {"content": d}}]}))))
        .collect();
    lines.push(Ok("data: [DONE]".to_string()));

    let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
    let stream = decode_text_stream(
        futures::stream::iter(lines),
        codec,
        CancellationToken::new(),
        None,
    );

    tokio_test::block_on(async {
        stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|item| item.unwrap())
            .collect()
    })
}

proptest! {
    #[test]
    fn clean_text_is_idempotent(text in markdownish()) {
        let once = clean_text(&text);
        prop_assert_eq!(clean_text(&once), once);
    }

    #[test]
    fn clean_text_leaves_plain_text_alone(text in "[a-z .,!?]{0,60}") {
        prop_assert_eq!(clean_text(&text), text);
    }

    #[test]
    fn streamed_text_is_cleaned_per_delta(deltas in prop::collection::vec(markdownish(), 0..8)) {
        let streamed = decode_deltas(&deltas).concat();
        let expected: String = deltas.iter().map(|d| clean_text(d)).collect();
        prop_assert_eq!(streamed, expected);
    }

    #[test]
    fn line_splitting_ignores_chunk_boundaries(
        lines in prop::collection::vec("[a-zé€ ]{0,12}", 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let body = lines.iter().map(|l| format!("{}\n", l)).collect::<String>().into_bytes();

        let mut offsets: Vec<usize> = cuts.iter().map(|c| c.index(body.len() + 1)).collect();
        offsets.push(0);
        offsets.push(body.len());
        offsets.sort_unstable();
        offsets.dedup();

        let chunks: Vec<Result<Bytes, ProviderError>> = offsets
            .windows(2)
            .map(|w| Ok(Bytes::copy_from_slice(&body[w[0]..w[1]])))
            .collect();

        let received: Vec<String> = tokio_test::block_on(async {
            LineStream::new(futures::stream::iter(chunks))
                .map(|line| line.unwrap())
                .collect()
                .await
        });
        prop_assert_eq!(received, lines);
    }
}
