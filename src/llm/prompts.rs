//! System prompts for the chat model

/// Prompt used when the operator configured none
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Appended to every system prompt so the model knows the directive syntax
pub const GENERATION_INSTRUCTIONS: &str = r#"

=== GENERATION CAPABILITIES ===

You have access to Image Generation and Text-to-Speech.

**1. FOR IMAGES:** Use `[T2I_REQUEST: detailed prompt]`
**2. FOR AUDIO:** Use `[TTS_REQUEST: text to speak]`

**CRITICAL RULES:**
- You MUST use these exact tags to trigger generation.
- The system will process these tags and show the result to the user.
- HISTORY: You will see these tags in your history. This is normal. CONTINUING using them for new requests.
- Do NOT invent other formats like `[Audio:...]`."#;

/// Build the system prompt sent ahead of the conversation
pub fn build_system_prompt(custom: Option<&str>) -> String {
    let base = custom
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let mut prompt = String::with_capacity(base.len() + GENERATION_INSTRUCTIONS.len());
    prompt.push_str(base);
    prompt.push_str(GENERATION_INSTRUCTIONS);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompt_includes_instructions() {
        let prompt = build_system_prompt(None);
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(prompt.contains("[T2I_REQUEST: detailed prompt]"));
        assert!(prompt.contains("[TTS_REQUEST: text to speak]"));
    }

    #[test]
    fn test_custom_prompt() {
        let prompt = build_system_prompt(Some("You are a pirate."));
        assert!(prompt.starts_with("You are a pirate."));
        assert!(prompt.ends_with("`[Audio:...]`."));

        assert_eq!(build_system_prompt(Some("   ")), build_system_prompt(None));
    }
}
