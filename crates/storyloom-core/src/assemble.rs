//! Result assembler
//!
//! Converts raw model output into validated internal records. Two explicit
//! responsibilities, kept separate: a tolerant decoder whose repair set is
//! closed (fence strip, balanced-object scan, trailing-comma fix, array
//! wrap), and a strict schema validator per stage. The assembler is the
//! boundary where external snake_case naming is translated inward; the
//! canonical records serialize camelCase.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Pages per story; the script stage rejects anything else
pub const PAGES_PER_STORY: usize = 10;

/// Vocabulary entries per story; the vocabulary stage rejects anything else
pub const VOCAB_PER_STORY: usize = 10;

/// Canonical script-stage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDraft {
    pub title_en: String,
    pub synopsis_en: String,
    pub pages: Vec<StoryPageDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryPageDraft {
    pub page_number: i32,
    pub text_en: String,
    pub summary_en: String,
}

/// Canonical translation-stage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationDraft {
    pub title_zh: String,
    pub synopsis_zh: String,
    pub pages: Vec<TranslationPageDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPageDraft {
    pub page_number: i32,
    pub text_zh: String,
    pub notes_zh: String,
}

impl TranslationDraft {
    /// Translated text for a page, matched by page number
    pub fn text_for_page(&self, page_number: i32) -> Option<&str> {
        self.pages
            .iter()
            .find(|p| p.page_number == page_number)
            .map(|p| p.text_zh.as_str())
    }
}

/// Canonical vocabulary-stage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VocabularyDraft {
    pub entries: Vec<VocabEntryDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VocabEntryDraft {
    pub word: String,
    pub part_of_speech: String,
    pub definition_en: String,
    pub definition_zh: String,
    pub example_sentence: String,
    pub example_translation: String,
    pub cefr_level: Option<String>,
}

// External wire shapes: snake_case keys exactly as the prompts mandate.

#[derive(Debug, Deserialize)]
struct StoryWire {
    title_en: String,
    synopsis_en: String,
    pages: Vec<StoryPageWire>,
}

#[derive(Debug, Deserialize)]
struct StoryPageWire {
    page_number: i32,
    text_en: String,
    summary_en: String,
}

#[derive(Debug, Deserialize)]
struct TranslationWire {
    title_zh: String,
    synopsis_zh: String,
    pages: Vec<TranslationPageWire>,
}

#[derive(Debug, Deserialize)]
struct TranslationPageWire {
    page_number: i32,
    text_zh: String,
    #[serde(default)]
    notes_zh: String,
}

#[derive(Debug, Deserialize)]
struct VocabularyWire {
    entries: Vec<VocabEntryWire>,
}

#[derive(Debug, Deserialize)]
struct VocabEntryWire {
    word: String,
    part_of_speech: String,
    definition_en: String,
    definition_zh: String,
    example_sentence: String,
    example_translation: String,
    #[serde(default)]
    cefr_level: Option<String>,
}

/// Tolerant decode of a model payload into a JSON value
///
/// Structured values pass through untouched. Strings go through the repair
/// pipeline in order: fence strip, strict parse, balanced-object scan with
/// trailing-comma fix, then top-level array wrapped as `{entries}`.
pub fn decode(data: &serde_json::Value) -> Result<serde_json::Value> {
    match data {
        serde_json::Value::String(raw) => decode_str(raw),
        other => Ok(wrap_bare_array(other.clone())),
    }
}

/// Models sometimes emit only the entries array; absorb it
fn wrap_bare_array(value: serde_json::Value) -> serde_json::Value {
    if value.is_array() {
        serde_json::json!({ "entries": value })
    } else {
        value
    }
}

fn decode_str(raw: &str) -> Result<serde_json::Value> {
    let stripped = strip_fences(raw).trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stripped) {
        return Ok(wrap_bare_array(value));
    }

    // Longest balanced object first: the model often appends prose after
    // the JSON it was asked for.
    for candidate in balanced_object_candidates(stripped).into_iter().rev() {
        let repaired = strip_trailing_commas(candidate);
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&repaired) {
            return Ok(value);
        }
    }

    if let Some(candidate) = array_candidate(stripped) {
        let repaired = strip_trailing_commas(candidate);
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&repaired) {
            if value.is_array() {
                return Ok(serde_json::json!({ "entries": value }));
            }
        }
    }

    Err(Error::validation("model output is not decodable JSON"))
}

/// Strip a Markdown code fence, with or without a `json` tag
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();

    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };

    body.strip_suffix("```").unwrap_or(body)
}

/// Balanced `{…}` substrings starting at the first `{`, shortest first
fn balanced_object_candidates(s: &str) -> Vec<&str> {
    let Some(start) = s.find('{') else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in s[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    candidates.push(&s[start..start + idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    candidates
}

/// First balanced top-level `[…]` substring
fn array_candidate(s: &str) -> Option<&str> {
    let start = s.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in s[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[start..start + idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Remove commas that directly precede a closing `}` or `]`
fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();

    for (idx, &ch) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }

        match ch {
            '\\' if in_string => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            ',' if !in_string => {
                let next_meaningful =
                    chars[idx + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    // Trailing comma: drop it.
                } else {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Reject the model's documented escape hatch before schema validation
fn check_declined(value: &serde_json::Value) -> Result<()> {
    if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
        return Err(Error::validation(format!("model declined: {}", message)));
    }
    Ok(())
}

/// Decode + strictly validate a script-stage payload
pub fn assemble_story(data: &serde_json::Value) -> Result<StoryDraft> {
    let value = decode(data)?;
    check_declined(&value)?;

    let wire: StoryWire = serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("story payload shape: {}", e)))?;

    if wire.pages.len() != PAGES_PER_STORY {
        return Err(Error::validation(format!(
            "story must have exactly {} pages, got {}",
            PAGES_PER_STORY,
            wire.pages.len()
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for page in &wire.pages {
        if page.page_number < 1 || page.page_number > PAGES_PER_STORY as i32 {
            return Err(Error::validation(format!(
                "page_number {} out of range",
                page.page_number
            )));
        }
        if !seen.insert(page.page_number) {
            return Err(Error::validation(format!(
                "duplicate page_number {}",
                page.page_number
            )));
        }
        if page.text_en.trim().is_empty() {
            return Err(Error::validation(format!("page {} has empty text", page.page_number)));
        }
    }

    let mut pages: Vec<StoryPageDraft> = wire
        .pages
        .into_iter()
        .map(|p| StoryPageDraft {
            page_number: p.page_number,
            text_en: p.text_en,
            summary_en: p.summary_en,
        })
        .collect();
    pages.sort_by_key(|p| p.page_number);

    Ok(StoryDraft { title_en: wire.title_en, synopsis_en: wire.synopsis_en, pages })
}

/// Decode + strictly validate a translation-stage payload
pub fn assemble_translation(data: &serde_json::Value) -> Result<TranslationDraft> {
    let value = decode(data)?;
    check_declined(&value)?;

    let wire: TranslationWire = serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("translation payload shape: {}", e)))?;

    for page in &wire.pages {
        if page.text_zh.trim().is_empty() {
            return Err(Error::validation(format!(
                "translation for page {} is empty",
                page.page_number
            )));
        }
    }

    let mut pages: Vec<TranslationPageDraft> = wire
        .pages
        .into_iter()
        .map(|p| TranslationPageDraft {
            page_number: p.page_number,
            text_zh: p.text_zh,
            notes_zh: p.notes_zh,
        })
        .collect();
    pages.sort_by_key(|p| p.page_number);

    Ok(TranslationDraft {
        title_zh: wire.title_zh,
        synopsis_zh: wire.synopsis_zh,
        pages,
    })
}

/// Decode + strictly validate a vocabulary-stage payload
pub fn assemble_vocabulary(data: &serde_json::Value) -> Result<VocabularyDraft> {
    let value = decode(data)?;
    check_declined(&value)?;

    let wire: VocabularyWire = serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("vocabulary payload shape: {}", e)))?;

    if wire.entries.len() != VOCAB_PER_STORY {
        return Err(Error::validation(format!(
            "vocabulary must have exactly {} entries, got {}",
            VOCAB_PER_STORY,
            wire.entries.len()
        )));
    }

    let entries = wire
        .entries
        .into_iter()
        .map(|e| VocabEntryDraft {
            word: e.word,
            part_of_speech: e.part_of_speech,
            definition_en: e.definition_en,
            definition_zh: e.definition_zh,
            example_sentence: e.example_sentence,
            example_translation: e.example_translation,
            cefr_level: e.cefr_level,
        })
        .collect();

    Ok(VocabularyDraft { entries })
}

#[cfg(test)]
pub(crate) fn sample_story_payload(pages: usize) -> serde_json::Value {
    serde_json::json!({
        "title_en": "The Friendly Cloud",
        "synopsis_en": "A little cloud learns to share rain.",
        "pages": (1..=pages).map(|n| serde_json::json!({
            "page_number": n,
            "text_en": format!("Page {} of the cloud's day.", n),
            "summary_en": format!("The cloud, scene {}.", n),
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
pub(crate) fn sample_translation_payload(pages: usize) -> serde_json::Value {
    serde_json::json!({
        "title_zh": "友好的云",
        "synopsis_zh": "一朵小云学会分享雨水。",
        "pages": (1..=pages).map(|n| serde_json::json!({
            "page_number": n,
            "text_zh": format!("云的一天,第{}页。", n),
            "notes_zh": "",
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
pub(crate) fn sample_vocabulary_payload(entries: usize) -> serde_json::Value {
    serde_json::json!({
        "entries": (0..entries).map(|n| serde_json::json!({
            "word": format!("word{}", n),
            "part_of_speech": "noun",
            "definition_en": "a thing",
            "definition_zh": "东西",
            "example_sentence": "Here is a thing.",
            "example_translation": "这里有个东西。",
            "cefr_level": "A1",
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_payload_passes_through_idempotently() {
        let payload = sample_story_payload(10);

        let first = assemble_story(&payload).unwrap();
        let second = assemble_story(&payload).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_canonical_records_serialize_camel_case() {
        let story = assemble_story(&sample_story_payload(10)).unwrap();
        let value = serde_json::to_value(&story).unwrap();

        assert!(value.get("titleEn").is_some());
        assert!(value["pages"][0].get("pageNumber").is_some());
    }

    #[test]
    fn test_fenced_payload_decodes() {
        let raw = format!("```json\n{}\n```", sample_story_payload(10));
        let story = assemble_story(&serde_json::Value::String(raw)).unwrap();
        assert_eq!(story.pages.len(), 10);
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let raw = "{\"title_zh\": \"云\", \"synopsis_zh\": \"云。\", \"pages\": \
                   [{\"page_number\": 1, \"text_zh\": \"第一页。\", \"notes_zh\": \"\"},],}";
        let translation = assemble_translation(&serde_json::Value::String(raw.to_string()))
            .unwrap();
        assert_eq!(translation.pages.len(), 1);
    }

    #[test]
    fn test_prose_around_object_repaired() {
        let raw = format!(
            "Here is your story!\n{}\nI hope the children enjoy it.",
            sample_story_payload(10)
        );
        let story = assemble_story(&serde_json::Value::String(raw)).unwrap();
        assert_eq!(story.title_en, "The Friendly Cloud");
    }

    #[test]
    fn test_bare_array_wrapped_as_entries() {
        let entries = sample_vocabulary_payload(10);

        // As a raw string...
        let raw = entries["entries"].to_string();
        let vocab = assemble_vocabulary(&serde_json::Value::String(raw)).unwrap();
        assert_eq!(vocab.entries.len(), 10);

        // ...and as an already-structured array.
        let vocab = assemble_vocabulary(&entries["entries"]).unwrap();
        assert_eq!(vocab.entries.len(), 10);
    }

    #[test]
    fn test_comma_inside_string_survives_repair() {
        let repaired = strip_trailing_commas("{\"a\": \"one, two,\", \"b\": [1, 2,],}");
        assert_eq!(repaired, "{\"a\": \"one, two,\", \"b\": [1, 2]}");
    }

    #[test]
    fn test_story_rejects_wrong_page_count() {
        assert!(assemble_story(&sample_story_payload(9)).is_err());
        assert!(assemble_story(&sample_story_payload(11)).is_err());
    }

    #[test]
    fn test_story_rejects_duplicate_page_numbers() {
        let mut payload = sample_story_payload(10);
        payload["pages"][1]["page_number"] = serde_json::json!(1);
        assert!(assemble_story(&payload).is_err());
    }

    #[test]
    fn test_vocabulary_rejects_wrong_entry_count() {
        assert!(assemble_vocabulary(&sample_vocabulary_payload(9)).is_err());
        assert!(assemble_vocabulary(&sample_vocabulary_payload(11)).is_err());
    }

    #[test]
    fn test_translation_rejects_empty_text() {
        let mut payload = sample_translation_payload(2);
        payload["pages"][1]["text_zh"] = serde_json::json!("   ");
        assert!(assemble_translation(&payload).is_err());
    }

    #[test]
    fn test_translation_does_not_enforce_length() {
        let translation = assemble_translation(&sample_translation_payload(3)).unwrap();
        assert_eq!(translation.pages.len(), 3);
        assert_eq!(translation.text_for_page(2), Some("云的一天,第2页。"));
    }

    #[test]
    fn test_model_decline_is_a_validation_error() {
        let declined = serde_json::json!({"error": "unable_to_produce_json"});
        let err = assemble_story(&declined).unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_undecodable_output_rejected() {
        let raw = serde_json::Value::String("no json here at all".to_string());
        assert!(assemble_story(&raw).is_err());
    }
}
