//! Wire codec contract and the text post-processing shared by all providers.

use super::error::ProviderError;
use crate::models::{ChatRequest, StreamEvent};
use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix of every relevant line in an SSE style response body
pub const DATA_PREFIX: &str = "data: ";

/// Stop sequences sent by the OpenAI-compatible family
pub const STOP_SEQUENCES: [&str; 2] = ["\n\n\n", "<|im_end|>"];

/// Media type of every image attachment the app produces
pub const IMAGE_MEDIA_TYPE: &str = "image/jpeg";

/// Pure, stateless translation between a canonical chat request and one
/// vendor's JSON schema.
pub trait WireCodec: Send + Sync {
    /// Serialize the request body. `request.history` holds prior turns only.
    fn encode_request(
        &self,
        system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Decode one raw body line. `None` means the line carries nothing for
    /// the caller (wrong prefix, heartbeat, malformed JSON, missing path) and
    /// must not abort the stream.
    fn decode_chunk(&self, line: &str) -> Option<StreamEvent>;
}

/// Strip the `data: ` marker, returning the payload
pub fn sse_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX).map(str::trim)
}

/// `data:` URL for a base64 JPEG, as the OpenAI family expects
pub fn jpeg_data_url(image_b64: &str) -> String {
    format!("data:{};base64,{}", IMAGE_MEDIA_TYPE, image_b64)
}

static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.*?)\*").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(?:#{1,6}[ \t]+)+").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^-[ \t]").unwrap());

/// Remove markdown decoration the chat bubbles cannot render.
///
/// Order matters: emphasis first (it can uncover a heading or bullet at
/// line start), then heading markers, then bullets. After one pass no line
/// holds two asterisks or starts with a `#` run followed by a blank or with
/// `- `, so a second pass is a no-op. A `#` glued to the next character
/// (`#include`, `#!/bin/sh`, `#[derive]`) is not a heading and is kept.
///
/// Applied per streamed delta, so a marker split across two deltas is not
/// reassembled: half of a `**` pair is an empty emphasis and gets dropped,
/// and a lone `*` is kept.
pub fn clean_text(text: &str) -> String {
    let text = BOLD.replace_all(text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = HEADING.replace_all(&text, "");
    BULLET.replace_all(&text, "• ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_emphasis() {
        assert_eq!(clean_text("**Hi**"), "Hi");
        assert_eq!(clean_text("an *italic* word"), "an italic word");
        assert_eq!(clean_text("***both***"), "both");
    }

    #[test]
    fn test_clean_strips_headings_at_line_start() {
        assert_eq!(clean_text("### Title\nbody"), "Title\nbody");
        assert_eq!(clean_text("# # nested"), "nested");
        assert_eq!(clean_text("issue #42"), "issue #42");
        assert_eq!(clean_text("####### seven"), "####### seven");
    }

    #[test]
    fn test_clean_keeps_hash_without_blank() {
        assert_eq!(clean_text("#include <stdio.h>"), "#include <stdio.h>");
        assert_eq!(clean_text("#!/bin/bash\necho hi"), "#!/bin/bash\necho hi");
        assert_eq!(clean_text("#[derive(Debug)]\nstruct A;"), "#[derive(Debug)]\nstruct A;");
        assert_eq!(clean_text("#"), "#");
        assert_eq!(clean_text("## Build\n#define N 4"), "Build\n#define N 4");
    }

    #[test]
    fn test_clean_normalizes_bullets() {
        assert_eq!(clean_text("- one\n- two"), "• one\n• two");
        assert_eq!(clean_text("* star item"), "* star item");
        assert_eq!(clean_text("a - b"), "a - b");
    }

    #[test]
    fn test_clean_split_marker_is_not_reassembled() {
        // "**bold**" arriving as two deltas: each half is an empty `**` pair
        assert_eq!(clean_text("**bo"), "bo");
        assert_eq!(clean_text("ld**"), "ld");
        // "*it*" split keeps the lone stars
        assert_eq!(clean_text("*i"), "*i");
        assert_eq!(clean_text("t*"), "t*");
    }

    #[test]
    fn test_clean_is_idempotent_on_tricky_inputs() {
        for input in ["# - x", "- # x", "*-* x", "**# x**", "***", "#\n- a\n* b *c*", "a**b*c*", "# #x", "#\t# x", "*#* x"] {
            let once = clean_text(input);
            assert_eq!(clean_text(&once), once, "input: {:?}", input);
        }
    }

    #[test]
    fn test_sse_payload() {
        assert_eq!(sse_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_payload("data: [DONE] "), Some("[DONE]"));
        assert_eq!(sse_payload("event: ping"), None);
    }
}
