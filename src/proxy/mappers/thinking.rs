// Thinking-fragment rewriter
//
// Upstream "thinking" deltas arrive wrapped in frontend HTML scaffolding
// (`<summary>`, `<details>`, quote prefixes). This pure function strips the
// scaffolding and rewrites the wrapper tags according to the configured mode.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::config::ThinkTagsMode;

static SUMMARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<summary>.*?</summary>").expect("summary regex"));
static DETAILS_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<details[^>]*>").expect("details regex"));

/// Rewrite one thinking fragment. Empty output means "nothing to emit".
pub fn transform_thinking(input: &str, mode: ThinkTagsMode) -> String {
    let s = SUMMARY_RE.replace_all(input, "");
    let s = s
        .replace("</thinking>", "")
        .replace("<Full>", "")
        .replace("</Full>", "");
    let s = s.trim();

    let s = match mode {
        ThinkTagsMode::Think => {
            let s = DETAILS_OPEN_RE.replace_all(s, "<think>");
            s.replace("</details>", "</think>")
        }
        ThinkTagsMode::Strip => {
            let s = DETAILS_OPEN_RE.replace_all(s, "");
            s.replace("</details>", "")
        }
        ThinkTagsMode::Raw => s.to_string(),
    };

    // Quote markers: one leading "> " plus any per-line continuation.
    let s = s.strip_prefix("> ").unwrap_or(&s).replace("\n> ", "\n");
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_summary_block_removed() {
        let out = transform_thinking("<summary>hidden</summary>visible", ThinkTagsMode::Raw);
        assert_eq!(out, "visible");
    }

    #[test]
    fn test_summary_spans_newlines() {
        let out = transform_thinking(
            "<summary>line1\nline2</summary>rest",
            ThinkTagsMode::Raw,
        );
        assert_eq!(out, "rest");
    }

    #[test]
    fn test_residual_tags_deleted() {
        let out = transform_thinking(
            "<Full>text</Full> tail</thinking>",
            ThinkTagsMode::Raw,
        );
        assert_eq!(out, "text tail");
    }

    #[test]
    fn test_think_mode_rewrites_details() {
        let out = transform_thinking(
            "<details open>reasoning</details>",
            ThinkTagsMode::Think,
        );
        assert_eq!(out, "<think>reasoning</think>");
    }

    #[test]
    fn test_think_mode_handles_attributes() {
        let out = transform_thinking(
            r#"<details type="reasoning" open>x</details>"#,
            ThinkTagsMode::Think,
        );
        assert_eq!(out, "<think>x</think>");
    }

    #[test]
    fn test_strip_mode_deletes_details() {
        let out = transform_thinking(
            "<details open>reasoning</details>",
            ThinkTagsMode::Strip,
        );
        assert_eq!(out, "reasoning");
    }

    #[test]
    fn test_raw_mode_preserves_details() {
        let input = "<details open>reasoning</details>";
        assert_eq!(transform_thinking(input, ThinkTagsMode::Raw), input);
    }

    #[test]
    fn test_quote_prefixes_stripped() {
        let out = transform_thinking("> first\n> second\n> third", ThinkTagsMode::Raw);
        assert_eq!(out, "first\nsecond\nthird");
    }

    #[test]
    fn test_quote_prefix_only_at_line_start() {
        // "> " inside a line is content, not a quote marker.
        let out = transform_thinking("a > b", ThinkTagsMode::Raw);
        assert_eq!(out, "a > b");
    }

    #[test]
    fn test_empty_output_is_valid() {
        assert_eq!(
            transform_thinking("<summary>only</summary>", ThinkTagsMode::Think),
            ""
        );
        assert_eq!(transform_thinking("   ", ThinkTagsMode::Think), "");
    }

    #[test]
    fn test_combined_scaffolding() {
        let input = "<summary>Thinking…</summary>> step one\n> step two";
        let out = transform_thinking(input, ThinkTagsMode::Think);
        assert_eq!(out, "step one\nstep two");
    }

    #[test]
    fn test_quote_marker_inside_details_survives() {
        // Only a string-leading "> " is stripped; one hidden behind the
        // rewritten tag stays.
        let input = "<details open>> a\n> b</details>";
        let out = transform_thinking(input, ThinkTagsMode::Think);
        assert_eq!(out, "<think>> a\nb</think>");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// On inputs free of scaffolding, the transformer is idempotent:
        /// applying it twice equals applying it once.
        #[test]
        fn prop_idempotent_on_clean_input(s in "[a-zA-Z0-9 .,!?\n]{0,200}") {
            for mode in [ThinkTagsMode::Think, ThinkTagsMode::Strip, ThinkTagsMode::Raw] {
                let once = transform_thinking(&s, mode);
                let twice = transform_thinking(&once, mode);
                prop_assert_eq!(&once, &twice);
            }
        }

        /// Output never retains a `<summary>` block regardless of mode.
        #[test]
        fn prop_no_summary_survives(
            pre in "[a-z ]{0,20}",
            body in "[a-z ]{0,20}",
            post in "[a-z ]{0,20}",
        ) {
            let input = format!("{pre}<summary>{body}</summary>{post}");
            for mode in [ThinkTagsMode::Think, ThinkTagsMode::Strip, ThinkTagsMode::Raw] {
                let out = transform_thinking(&input, mode);
                prop_assert!(!out.contains("<summary>"));
                prop_assert!(!out.contains("</summary>"));
            }
        }
    }
}
