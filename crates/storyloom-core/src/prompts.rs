//! Stage-specific prompt templates
//!
//! Every system prompt pins the model to a single JSON object on one line
//! with the stage's exact key set, and names the escape hatch it must use
//! when it cannot comply. Content rules target ages 0-6.

use crate::ai::ChatMessage;
use crate::assemble::{StoryDraft, TranslationDraft};

const JSON_RULES: &str = "Output exactly one JSON object and nothing else. \
The object must be JSON-parseable, on a single line, with newlines inside \
strings escaped as \\n. Do not wrap the object in Markdown code fences. If \
you cannot comply, output {\"error\":\"unable_to_produce_json\"} and \
nothing else.";

const CONTENT_RULES: &str = "The content is for children aged 0 to 6: warm, \
gentle, age-appropriate, non-violent and non-adult. Use short sentences and \
simple vocabulary.";

/// Script stage: a 10-page English story for the given theme
pub fn story_prompt(theme: &str, tone: Option<&str>, age_range: Option<&str>) -> Vec<ChatMessage> {
    let system = format!(
        "You are a children's picture-book author. {} {} \
         The JSON object must have exactly these keys: \
         \"title_en\" (string), \"synopsis_en\" (string), and \"pages\" \
         (array of exactly 10 objects, each with \"page_number\" (integer \
         1 to 10), \"text_en\" (2-3 sentences of story text) and \
         \"summary_en\" (one sentence describing the scene for an \
         illustrator)).",
        CONTENT_RULES, JSON_RULES
    );

    let mut request = format!("Write a 10-page story about: {}.", theme);
    if let Some(tone) = tone {
        request.push_str(&format!(" The tone should be {}.", tone));
    }
    if let Some(age_range) = age_range {
        request.push_str(&format!(" The target age range is {}.", age_range));
    }

    vec![ChatMessage::system(system), ChatMessage::user(request)]
}

/// Translation stage: Simplified Chinese rendition of an assembled story
pub fn translation_prompt(story: &StoryDraft) -> Vec<ChatMessage> {
    let system = format!(
        "You are a literary translator for children's books, translating \
         English to Simplified Chinese. {} {} \
         The JSON object must have exactly these keys: \"title_zh\" \
         (string), \"synopsis_zh\" (string), and \"pages\" (array with one \
         entry per source page, each with \"page_number\" (matching the \
         source page), \"text_zh\" (the translation) and \"notes_zh\" \
         (a short translation note, may be an empty string)).",
        CONTENT_RULES, JSON_RULES
    );

    let mut source = format!(
        "Title: {}\nSynopsis: {}\n\nPages:\n",
        story.title_en, story.synopsis_en
    );
    for page in &story.pages {
        source.push_str(&format!("{}. {}\n", page.page_number, page.text_en));
    }

    vec![ChatMessage::system(system), ChatMessage::user(source)]
}

/// Vocabulary stage: 10 learner entries drawn from the translated story
pub fn vocabulary_prompt(story: &StoryDraft, translation: &TranslationDraft) -> Vec<ChatMessage> {
    let system = format!(
        "You are an English-learning curriculum writer for young children. \
         {} \
         The JSON object must have exactly one key \"entries\": an array of \
         exactly 10 objects, each with \"word\", \"part_of_speech\", \
         \"definition_en\", \"definition_zh\", \"example_sentence\", \
         \"example_translation\" and \"cefr_level\" (one of A1, A2, B1, or \
         null).",
        JSON_RULES
    );

    let mut source = format!("Story title: {} / {}\n\n", story.title_en, translation.title_zh);
    for page in &story.pages {
        source.push_str(&format!("{}\n", page.text_en));
    }
    source.push_str(
        "\nPick the 10 most useful words for a young learner from this \
         story and produce the entries.",
    );

    vec![ChatMessage::system(system), ChatMessage::user(source)]
}

/// Illustration prompt for a page's image job
pub fn image_prompt(text_en: &str) -> String {
    format!(
        "Children's picture-book illustration, soft colors, friendly \
         characters, no text in the image. Scene: {}",
        text_en
    )
}
