//! Script-generation output: pulls the script body out of the generator's
//! markdown reply.

use page_analysis_types::GeneratedScript;

pub const SUPPORTED_FORMATS: [&str; 2] = ["yaml", "playwright"];

/// Confidence for a non-empty script body
pub const SCRIPT_CONFIDENCE: f64 = 0.8;

pub fn is_supported(format: &str) -> bool {
    SUPPORTED_FORMATS.contains(&format)
}

fn file_name(format: &str) -> String {
    let extension = match format {
        "playwright" => "spec.ts",
        "yaml" => "yaml",
        _ => "txt",
    };
    format!("generated_{}.{}", format, extension)
}

/// Body of the first fenced block, or the whole reply when it has none
fn script_body(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text.trim();
    };
    let after_fence = &text[start + 3..];
    // Language tag line
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => "",
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

pub fn extract(format: &str, scenario_count: usize, text: &str) -> GeneratedScript {
    let content = script_body(text).to_string();
    let degraded = content.is_empty();
    if degraded {
        log::warn!("[SCRIPTS] Generator returned no {} script body", format);
    }

    GeneratedScript {
        format: format.to_string(),
        file_name: file_name(format),
        content,
        scenario_count,
        confidence: if degraded { 0.0 } else { SCRIPT_CONFIDENCE },
        degraded,
    }
}

/// Placeholder for a format whose generation failed
pub fn failed_script(format: &str, scenario_count: usize) -> GeneratedScript {
    GeneratedScript {
        format: format.to_string(),
        file_name: file_name(format),
        content: String::new(),
        scenario_count,
        confidence: 0.0,
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_fenced_block() {
        let reply = "Here is the test:\n```typescript\ntest('login', async () => {});\n```\nAnd notes ```x```";
        let script = extract("playwright", 2, reply);
        assert_eq!(script.content, "test('login', async () => {});");
        assert_eq!(script.file_name, "generated_playwright.spec.ts");
        assert_eq!(script.scenario_count, 2);
        assert!(!script.degraded);
        assert!((script.confidence - SCRIPT_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn unfenced_reply_is_used_whole() {
        let script = extract("yaml", 1, "\n  steps:\n    - open: /login\n");
        assert_eq!(script.content, "steps:\n    - open: /login");
        assert_eq!(script.file_name, "generated_yaml.yaml");
    }

    #[test]
    fn unterminated_fence_keeps_the_rest() {
        let script = extract("yaml", 1, "```yaml\nname: login\n");
        assert_eq!(script.content, "name: login");
    }

    #[test]
    fn empty_block_is_degraded() {
        let script = extract("yaml", 3, "```yaml\n```");
        assert!(script.degraded);
        assert_eq!(script.confidence, 0.0);
        assert!(script.content.is_empty());
    }

    #[test]
    fn supported_formats() {
        assert!(is_supported("yaml"));
        assert!(is_supported("playwright"));
        assert!(!is_supported("cypress"));
    }
}
