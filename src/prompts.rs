//! Instructions sent to the completion backend at each refinement stage.
//!
//! Every prompt lives here so that changing how a stage is phrased means
//! editing one place, and so tests can match requests to stages by their
//! leading instruction line without a live model.
//!
//! Each constant or builder produces the *instruction* message; the content
//! message (OCR text, a draft, candidate versions) is assembled by the
//! `*_content` helpers.

/// Stage 2: first conversion of OCR text (plus the page image) into markdown.
pub const INITIAL_CONVERSION_PROMPT: &str =
    "Convert the following text to markdown format, preserving structure and formatting:";

/// Stage 3a: critique of the current draft against the OCR text.
pub const FEEDBACK_PROMPT: &str = "Compare the original text with the markdown conversion.
Identify any discrepancies in structure, formatting, or content.
Provide specific feedback on how to improve the markdown.";

/// Leading line of the stage 3b instruction; see [`improve_prompt`].
pub const IMPROVE_PROMPT_HEADER: &str =
    "Using the following feedback, improve the markdown conversion:";

/// Alternate candidate: image-only transcription with no OCR input.
pub const AI_READ_PROMPT: &str = "Convert the following page to markdown.
Return only the markdown with no explanation text.
Do not exclude any content from the page.";

/// Content message paired with [`AI_READ_PROMPT`].
pub const AI_READ_CONTENT: &str = "Please read and transcribe the text in this image.";

/// Stage 4: reconcile several candidate transcripts.
pub const META_REASONING_PROMPT: &str =
    "Compare the following markdown versions with the original text.
Analyze each version for accuracy, completeness, and proper markdown formatting.
Select the best version or combine the best elements from multiple versions.
Return only the final, optimized markdown.";

/// Stage 5: strip explanatory wrapper text, keep only the page content.
pub const FINAL_VERSION_PROMPT: &str = "Based on the following optimized markdown, create a final version that matches the original page text as closely as possible.
Remove any additional text or explanations that were added during the optimization process.
Ensure that the final output is clean, properly formatted markdown that represents only the content from the original page.
REMEMBER: The final output should only be the markdown that matches the original page text, with no additional text or explanations.";

/// Fixed system instruction for the translation engine.
///
/// Downstream consumers rely on every rule here; edit with care.
pub const TRANSLATOR_SYSTEM_PROMPT: &str = "You are a professional translator.
**Translator Instructions**
- Translate the given content into the target language
- Return **only the translated text**; avoid additional explanations
- Ensure translations are accurate and _precisely match_ the source content's intent
- **Do not** engage in dialogue or answer user queries; your sole role is to translate
- Maintain strict adherence to formatting (e.g., preserve **bold**, *italics*, headings, lists and tables exactly)
> *Note:* All responses should focus exclusively on translation quality without deviations.";

/// Stage 3b instruction carrying the feedback produced in stage 3a.
pub fn improve_prompt(feedback: &str) -> String {
    format!("{IMPROVE_PROMPT_HEADER}\n{feedback}")
}

/// Content of the stage 3a request: the OCR text and the current draft.
pub fn feedback_content(original_text: &str, markdown: &str) -> String {
    format!("Original text:\n{original_text}\n\nCurrent markdown:\n{markdown}")
}

/// Content of the stage 4 request: the OCR text and numbered candidates.
pub fn meta_reasoning_content(original_text: &str, versions: &[String]) -> String {
    let versions_text = versions
        .iter()
        .enumerate()
        .map(|(i, v)| format!("Version {}:\n{}", i + 1, v))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Original text:\n{original_text}\n\nMarkdown versions:\n{versions_text}")
}

/// System instruction for translating into `target_language`.
///
/// The fixed rules come first, verbatim; the target language is appended.
pub fn translator_instruction(target_language: &str) -> String {
    format!(
        "{TRANSLATOR_SYSTEM_PROMPT}\n\nTranslate the following text to {target_language}, preserving all formatting and structure."
    )
}
