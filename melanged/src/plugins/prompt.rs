//! Prompt composition for image transforms.
//!
//! A transform request carries an optional main prompt plus per-reference
//! prompts. All-ASCII prompts are concatenated locally; anything outside
//! the Latin ASCII range goes through the image model for translation and
//! combination. When only reference prompts are present, a synthetic main
//! prompt announces the style transformation.

use melange_common::errors::HubResult;
use tracing::{debug, warn};

use crate::providers::genai::ImageModel;

const MAX_PROMPT_LEN: usize = 800;
const DEFAULT_PROMPT: &str = "Transform the image with artistic style";

/// Combine the main and reference prompts into one style prompt.
pub async fn compose_style_prompt(
    main_prompt: &str,
    reference_prompts: &[String],
    model: Option<&dyn ImageModel>,
) -> HubResult<String> {
    let main = main_prompt.trim();
    let references: Vec<&str> = reference_prompts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    if main.is_empty() && references.is_empty() {
        return Ok(DEFAULT_PROMPT.to_string());
    }

    // References alone get a synthetic main prompt so the provider knows
    // this is a style transfer, not a content edit.
    if main.is_empty() {
        let combined = format!("Apply style transformation: {}", references.join("; "));
        return Ok(finalize(combined, model).await);
    }

    if references.is_empty() {
        return Ok(finalize(main.to_string(), model).await);
    }

    let needs_model = !is_ascii(main) || references.iter().any(|r| !is_ascii(r));
    if needs_model {
        if let Some(model) = model {
            match combine_with_model(main, &references, model).await {
                Ok(combined) => return Ok(truncate_at_separator(combined)),
                Err(err) => {
                    warn!("model prompt combination failed, concatenating: {err}");
                }
            }
        }
    }

    let mut parts = vec![main.to_string()];
    parts.extend(references.iter().map(|r| r.to_string()));
    Ok(truncate_at_separator(parts.join("; ")))
}

fn is_ascii(text: &str) -> bool {
    text.chars().all(|c| (c as u32) <= 127)
}

async fn finalize(prompt: String, model: Option<&dyn ImageModel>) -> String {
    if is_ascii(&prompt) {
        return truncate_at_separator(prompt);
    }
    let Some(model) = model else {
        debug!("no model available to translate a non-ASCII prompt");
        return truncate_at_separator(prompt);
    };
    let request = format!(
        "Translate this image style description to English. \
         Only return the English translation, nothing else:\n\n{prompt}"
    );
    match model.generate_text(&request).await {
        Ok(translated) if !translated.is_empty() => truncate_at_separator(translated),
        Ok(_) | Err(_) => {
            warn!("prompt translation failed, keeping the original");
            truncate_at_separator(prompt)
        }
    }
}

async fn combine_with_model(
    main: &str,
    references: &[&str],
    model: &dyn ImageModel,
) -> HubResult<String> {
    let mut listing = format!("- Main transformation: {main}\n");
    for (index, reference) in references.iter().enumerate() {
        listing.push_str(&format!("- Reference {}: {reference}\n", index + 1));
    }
    let request = format!(
        "Combine these image transformation instructions into a single, \
         coherent prompt:\n\n{listing}\n\
         Requirements:\n\
         1. Create ONE clear, concise transformation prompt\n\
         2. Maintain the intent of all instructions\n\
         3. Resolve conflicts by prioritizing the main transformation\n\
         4. Keep the result under {MAX_PROMPT_LEN} characters\n\
         5. Return ONLY the combined prompt, no explanations"
    );
    model.generate_text(&request).await
}

/// Truncate to the length limit, cutting at the last separator so the
/// prompt never ends mid-clause.
fn truncate_at_separator(prompt: String) -> String {
    if prompt.len() <= MAX_PROMPT_LEN {
        return prompt;
    }
    let mut end = MAX_PROMPT_LEN;
    while !prompt.is_char_boundary(end) {
        end -= 1;
    }
    let mut cut = &prompt[..end];
    if let Some(position) = cut.rfind(';') {
        cut = &cut[..position];
    } else if let Some(position) = cut.rfind(' ') {
        cut = &cut[..position];
    }
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn references_only_get_a_synthetic_main() {
        let prompt = compose_style_prompt(
            "",
            &["make it look like oil painting".to_string()],
            None,
        )
        .await
        .unwrap();
        assert!(prompt.starts_with("Apply style transformation: make it look like oil painting"));
    }

    #[tokio::test]
    async fn ascii_prompts_concatenate_with_semicolons() {
        let prompt = compose_style_prompt(
            "add dramatic lighting",
            &["cool color palette".to_string(), "film grain".to_string()],
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            prompt,
            "add dramatic lighting; cool color palette; film grain"
        );
    }

    #[tokio::test]
    async fn empty_inputs_fall_back_to_the_default() {
        let prompt = compose_style_prompt("", &[], None).await.unwrap();
        assert_eq!(prompt, DEFAULT_PROMPT);
    }

    #[tokio::test]
    async fn long_prompts_are_cut_at_a_separator() {
        let references: Vec<String> = (0..100)
            .map(|i| format!("reference instruction number {i}"))
            .collect();
        let prompt = compose_style_prompt("main", &references, None).await.unwrap();
        assert!(prompt.len() <= MAX_PROMPT_LEN + 3);
        assert!(prompt.ends_with("..."));
        // The cut landed at a separator, not mid-word.
        assert!(!prompt.trim_end_matches("...").ends_with(';'));
    }

    #[tokio::test]
    async fn non_ascii_without_model_keeps_the_original() {
        let prompt = compose_style_prompt("수채화 스타일로", &[], None).await.unwrap();
        assert_eq!(prompt, "수채화 스타일로");
    }
}
