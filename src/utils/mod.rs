use cyder_tools::snow_flake::Snowflake;
use once_cell::sync::Lazy;

pub mod billing;
pub mod crypto;
pub mod limit;
pub mod sse;

pub static ID_GENERATOR: Lazy<Snowflake> = Lazy::new(|| Snowflake::new(1));

/// Public-facing vendor name for a model id. Keeps the actual upstream
/// aggregator out of client-visible payloads.
pub fn brand_for_model(model: &str) -> &'static str {
    let name = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
    let prefixes: [(&str, &'static str); 10] = [
        ("gpt-", "openai"),
        ("chatgpt", "openai"),
        ("o1", "openai"),
        ("o3", "openai"),
        ("o4", "openai"),
        ("claude", "anthropic"),
        ("gemini", "google"),
        ("deepseek", "deepseek"),
        ("qwen", "alibaba"),
        ("llama", "meta"),
    ];
    prefixes
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, brand)| *brand)
        .unwrap_or("gateway")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_for_model() {
        assert_eq!(brand_for_model("gpt-4o-mini"), "openai");
        assert_eq!(brand_for_model("o1-preview"), "openai");
        assert_eq!(brand_for_model("claude-3-5-sonnet"), "anthropic");
        assert_eq!(brand_for_model("google/gemini-1.5-pro"), "google");
        assert_eq!(brand_for_model("my-finetune"), "gateway");
    }
}
