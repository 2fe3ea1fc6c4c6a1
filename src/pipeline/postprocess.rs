//! Post-processing: deterministic normalisation of model-written Markdown.
//!
//! Even after the distillation stage, models leave traces of the
//! conversation in their output: a "Here is the final markdown:" preamble,
//! the whole page wrapped in a ```` ```markdown ```` fence, `#Heading` with no
//! space, a code fence that is opened and never closed. These are cheap to
//! fix with string rules and expensive to fix with another model call.
//!
//! [`format_markdown`] runs once on the final text of both engines, right
//! before it is written to the sink.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so every later rule sees `\n`. The
//! preamble goes before the fence rule because models put it *outside* the
//! fence. Heading rules skip fenced code so `# comment` lines inside a bash
//! block survive.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every normalisation rule, in order.
///
/// 1. Normalise line endings (CRLF/CR → LF)
/// 2. Drop a conversational lead-in line ("Here is the markdown:") right
///    before a fenced block; the same line over page text is kept
/// 3. Strip an outer ```` ```markdown ```` fence wrapping the whole output
/// 4. Trim trailing whitespace per line
/// 5. Normalise heading markers (`#Title` → `# Title`, depth ≤ 6)
/// 6. Close an unbalanced code fence
/// 7. Ensure a blank line before each heading
/// 8. Collapse runs of blank lines
/// 9. Strip invisible Unicode (zero-width space, BOM, soft hyphen, …)
/// 10. End with exactly one newline
pub fn format_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_preamble(&s);
    let s = strip_outer_fence(&s);
    let s = trim_trailing_whitespace(&s);
    let s = normalise_heading_markers(&s);
    let s = close_unbalanced_fence(&s);
    let s = blank_line_before_headings(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

// ── Rule 1 ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2 ───────────────────────────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:here(?: is|'s| are)\b[^\n]*|(?:the )?(?:final|optimized|improved|translated|refined) (?:version|markdown|text|translation)[^\n]*):\s*\n",
    )
    .unwrap()
});

fn strip_preamble(input: &str) -> String {
    match RE_PREAMBLE.find(input) {
        Some(m) if input[m.end()..].trim_start().starts_with("```") => {
            input[m.end()..].trim_start().to_string()
        }
        _ => input.to_string(),
    }
}

// ── Rule 3 ───────────────────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\n(.*?)\n?```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        // An inner fence means the outer ``` pair is really two code blocks.
        Some(caps) if !caps[1].lines().any(is_fence) => caps[1].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 4 ───────────────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5 ───────────────────────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,})[ \t]*(.*)$").unwrap());

fn normalise_heading_markers(input: &str) -> String {
    let mut in_code = false;
    input
        .lines()
        .map(|line| {
            if is_fence(line) {
                in_code = !in_code;
                return line.to_string();
            }
            if in_code {
                return line.to_string();
            }
            fix_heading(line).unwrap_or_else(|| line.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn fix_heading(line: &str) -> Option<String> {
    let caps = RE_HEADING.captures(line)?;
    let hashes = caps[1].len();
    let text = caps[2].trim();
    if text.is_empty() {
        return None;
    }
    let spaced = line.as_bytes().get(hashes).is_some_and(|b| *b == b' ' || *b == b'\t');
    // `#include`, `#hashtag`: only repair a missing space before a capital or digit.
    if !spaced && !text.starts_with(|c: char| c.is_uppercase() || c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{} {}", "#".repeat(hashes.min(6)), text))
}

// ── Rule 6 ───────────────────────────────────────────────────────────────

fn close_unbalanced_fence(input: &str) -> String {
    let fences = input.lines().filter(|l| is_fence(l)).count();
    if fences % 2 == 1 {
        format!("{}\n```", input.trim_end())
    } else {
        input.to_string()
    }
}

// ── Rule 7 ───────────────────────────────────────────────────────────────

fn blank_line_before_headings(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_code = false;
    for line in input.lines() {
        if is_fence(line) {
            in_code = !in_code;
        } else if !in_code && line.starts_with('#') && RE_HEADING.is_match(line) {
            if let Some(prev) = out.last() {
                if !prev.is_empty() {
                    out.push("");
                }
            }
        }
        out.push(line);
    }
    out.join("\n")
}

// ── Rule 8 ───────────────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 9 ───────────────────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 10 ──────────────────────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}
