//! Token usage extraction from agent output.
//!
//! Agent CLIs print usage in one of two JSON shapes:
//!
//! - **Anthropic**: `{"usage": {"input_tokens": N, "output_tokens": N}}`
//! - **OpenAI**: `{"usage": {"prompt_tokens": N, "completion_tokens": N}}`
//!
//! The usage object may sit on its own JSON line or be embedded in a larger
//! document. When nothing is found, usage is estimated from text length.

use serde::Deserialize;
use serde_json::Value;

/// Characters per token used for estimation.
const CHARS_PER_TOKEN: usize = 4;

/// Token usage reported by (or estimated for) one agent session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `true` when read from agent output rather than estimated.
    pub is_actual: bool,
    /// `anthropic`, `openai`, `parsed` or `estimated`.
    pub source: String,
}

impl ParsedTokenUsage {
    pub fn actual(input: u64, output: u64, source: impl Into<String>) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            is_actual: true,
            source: source.into(),
        }
    }

    pub fn estimated(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            is_actual: false,
            source: "estimated".to_string(),
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct UsageEnvelope {
    usage: Value,
}

/// Finds usage blocks in agent output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsageParser;

impl TokenUsageParser {
    pub fn new() -> Self {
        Self
    }

    /// Returns the last usage block found, since streaming agents report
    /// cumulative usage at the end.
    pub fn parse(&self, output: &str) -> Option<ParsedTokenUsage> {
        let from_lines = output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str::<UsageEnvelope>(line).ok())
            .filter_map(|envelope| parse_usage_value(&envelope.usage))
            .last();

        from_lines.or_else(|| extract_embedded_usage(output))
    }
}

fn parse_usage_value(value: &Value) -> Option<ParsedTokenUsage> {
    if let Ok(usage) = serde_json::from_value::<AnthropicUsage>(value.clone()) {
        return Some(ParsedTokenUsage::actual(
            usage.input_tokens,
            usage.output_tokens,
            "anthropic",
        ));
    }
    if let Ok(usage) = serde_json::from_value::<OpenAiUsage>(value.clone()) {
        return Some(ParsedTokenUsage::actual(
            usage.prompt_tokens,
            usage.completion_tokens,
            "openai",
        ));
    }

    let map = value.as_object()?;
    let input = map
        .get("input_tokens")
        .or_else(|| map.get("prompt_tokens"))
        .and_then(Value::as_u64)?;
    let output = map
        .get("output_tokens")
        .or_else(|| map.get("completion_tokens"))
        .and_then(Value::as_u64)?;
    Some(ParsedTokenUsage::actual(input, output, "parsed"))
}

/// Locate `"usage": { ... }` anywhere in the text, including pretty-printed
/// multi-line JSON.
fn extract_embedded_usage(output: &str) -> Option<ParsedTokenUsage> {
    const KEY: &str = "\"usage\"";
    let start = output.rfind(KEY)? + KEY.len();
    let rest = output[start..].trim_start().strip_prefix(':')?.trim_start();
    if !rest.starts_with('{') {
        return None;
    }
    let end = matching_brace(rest)?;
    let value: Value = serde_json::from_str(&rest[..=end]).ok()?;
    parse_usage_value(&value)
}

fn matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rough token estimate for text.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

/// Parse usage from `output`, falling back to an estimate over the prompt
/// and output text.
pub fn extract_or_estimate(output: &str, prompt: &str) -> ParsedTokenUsage {
    TokenUsageParser::new()
        .parse(output)
        .unwrap_or_else(|| {
            ParsedTokenUsage::estimated(estimate_tokens(prompt), estimate_tokens(output))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_anthropic_usage() {
        let output = r#"{"usage": {"input_tokens": 1500, "output_tokens": 500}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert!(usage.is_actual);
        assert_eq!(usage.input_tokens, 1500);
        assert_eq!(usage.output_tokens, 500);
        assert_eq!(usage.total(), 2000);
        assert_eq!(usage.source, "anthropic");
    }

    #[test]
    fn test_parse_openai_usage() {
        let output =
            r#"{"usage": {"prompt_tokens": 1000, "completion_tokens": 800, "total_tokens": 1800}}"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.output_tokens, 800);
        assert_eq!(usage.source, "openai");
    }

    #[test]
    fn test_last_usage_line_wins() {
        let output = r#"
{"type":"progress","usage":{"input_tokens":10,"output_tokens":1}}
working...
{"type":"result","usage":{"input_tokens":120,"output_tokens":45}}
"#;
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 45);
    }

    #[test]
    fn test_parse_pretty_printed_usage() {
        let output = "Result:\n{\n  \"result\": \"ok\",\n  \"usage\": {\n    \"input_tokens\": 42,\n    \"output_tokens\": 15\n  }\n}\n";
        let usage = TokenUsageParser::new().parse(output).unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert_eq!(usage.output_tokens, 15);
    }

    #[test]
    fn test_parse_no_usage() {
        assert!(TokenUsageParser::new()
            .parse("Just some plain text output")
            .is_none());
    }

    #[test]
    fn test_extract_or_estimate_falls_back() {
        let usage = extract_or_estimate("12345678", "abcd");
        assert!(!usage.is_actual);
        assert_eq!(usage.source, "estimated");
        assert_eq!(usage.input_tokens, 1);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
