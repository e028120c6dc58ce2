//! Mail body parsing and output rendering
//!
//! Inbound: pull a `Session-ID:` out of replies, split a template reply into
//! working directory, model and prompt, and flatten HTML bodies to text.
//! Outbound: strip terminal escapes and wrap pane output in an escaped
//! `<pre>` block with a `Session-ID:` footer that replies carry back.

use regex::Regex;
use std::sync::OnceLock;

const FORWARDED_MARKER: &str = "---------- Forwarded message ----------";

static SESSION_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DIRECTORY_RE: OnceLock<Option<Regex>> = OnceLock::new();
static MODEL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();
static BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ANSI_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ENTITY_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

// ============================================================================
// Inbound
// ============================================================================

/// First `Session-ID: <uuid>` in the body.
pub fn parse_session_id(body: &str) -> Option<String> {
    let re = cached(
        &SESSION_ID_RE,
        r"Session-ID:\s*([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})",
    )?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Fields a user filled into a template reply. Empty fields mean "use the
/// default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateFields {
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
}

/// Cut the forwarded section, drop one level of `>` quoting, then lift out
/// the `Directory:` and `Model:` lines. What remains is the prompt.
pub fn parse_template(body: &str) -> TemplateFields {
    let body = match body.find(FORWARDED_MARKER) {
        Some(idx) => &body[..idx],
        None => body,
    };

    let unquoted: Vec<&str> = body
        .lines()
        .map(|line| {
            line.strip_prefix("> ")
                .or_else(|| line.strip_prefix('>'))
                .unwrap_or(line)
        })
        .collect();
    let mut text = unquoted.join("\n").trim().to_string();

    let working_dir = take_field(&mut text, &DIRECTORY_RE, r"(?m)^Directory:[ \t]*(.+)$");
    let model = take_field(&mut text, &MODEL_RE, r"(?m)^Model:[ \t]*(.+)$");

    TemplateFields {
        working_dir,
        model,
        prompt: text.trim().to_string(),
    }
}

fn take_field(text: &mut String, cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<String> {
    let re = cached(cell, pattern)?;
    let value = re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty());
    if value.is_some() {
        *text = re.replace_all(text, "").into_owned();
    }
    value
}

pub fn looks_like_html(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["<html", "<body", "<div", "<p>"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Flatten an HTML body: block ends become newlines, tags go, entities are
/// decoded, and runs of blank lines collapse to one.
pub fn extract_text_from_html(html: &str) -> String {
    let mut text = html.to_string();
    if let Some(re) = cached(&BLOCK_RE, r"(?i)<\s*(?:br|/p|/div|/tr|/li)\s*/?\s*>") {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = cached(&TAG_RE, r"<[^>]*>") {
        text = re.replace_all(&text, "").into_owned();
    }
    let text = decode_entities(&text);

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn decode_entities(text: &str) -> String {
    let Some(re) = cached(&ENTITY_RE, r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);") else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures| {
        let name = &caps[1];
        let decoded = match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ if name.starts_with("#x") || name.starts_with("#X") => {
                u32::from_str_radix(&name[2..], 16).ok().and_then(char::from_u32)
            }
            _ if name.starts_with('#') => name[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };
        decoded.map(String::from).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

// ============================================================================
// Outbound
// ============================================================================

pub fn strip_ansi(raw: &str) -> String {
    match cached(&ANSI_RE, r"\x1b\[[0-9;?]*[a-zA-Z]") {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.to_string(),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Pane capture as an HTML mail body.
pub fn render_output(raw: &str, session_id: &str) -> String {
    let cleaned = strip_ansi(raw);
    format!(
        "<pre style=\"font-family:monospace;white-space:pre-wrap\">{}</pre>\n<p>Session-ID: {}</p>",
        escape_html(cleaned.trim_end()),
        session_id
    )
}

/// Plain text as an HTML mail body, no footer.
pub fn render_plain(text: &str) -> String {
    format!(
        "<pre style=\"font-family:monospace;white-space:pre-wrap\">{}</pre>",
        escape_html(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    #[test]
    fn test_session_id_found_in_quoted_reply() {
        let body = format!("please continue\n\n> output...\n> Session-ID: {}\n", SID);
        assert_eq!(parse_session_id(&body).as_deref(), Some(SID));
        assert_eq!(parse_session_id("no id here"), None);
        assert_eq!(parse_session_id("Session-ID: not-a-uuid"), None);
    }

    #[test]
    fn test_template_reply_extracts_fields() {
        let body = "\
> Directory: ~/projects/app
> Model: opus
>
> Fix the flaky test in parser.rs

---------- Forwarded message ----------
Directory: ~
Model: sonnet
(Write your task here)";
        let fields = parse_template(body);
        assert_eq!(fields.working_dir.as_deref(), Some("~/projects/app"));
        assert_eq!(fields.model.as_deref(), Some("opus"));
        assert_eq!(fields.prompt, "Fix the flaky test in parser.rs");
    }

    #[test]
    fn test_template_without_fields_is_all_prompt() {
        let fields = parse_template("just do it\n");
        assert!(fields.working_dir.is_none());
        assert!(fields.model.is_none());
        assert_eq!(fields.prompt, "just do it");
    }

    #[test]
    fn test_only_one_quote_level_removed() {
        let fields = parse_template(">> nested\n> single");
        assert_eq!(fields.prompt, "> nested\nsingle");
    }

    #[test]
    fn test_html_flattened_to_text() {
        let html = "<html><body><div>Directory: ~/a</div><div>Model: haiku</div>\
                    <p>Use &lt;T&gt; &amp; go</p><br><br><br><p>end</p></body></html>";
        assert!(looks_like_html(html));
        let text = extract_text_from_html(html);
        assert_eq!(text, "Directory: ~/a\nModel: haiku\nUse <T> & go\n\nend");
        assert!(!looks_like_html("plain text"));
    }

    #[test]
    fn test_render_strips_ansi_and_escapes() {
        let raw = "\x1b[32mok\x1b[0m <done> & \"quoted\"\n\n";
        let html = render_output(raw, SID);
        assert!(html.starts_with("<pre"));
        assert!(html.contains("ok &lt;done&gt; &amp; &quot;quoted&quot;"));
        assert!(!html.contains('\x1b'));
        assert!(html.ends_with(&format!("<p>Session-ID: {}</p>", SID)));
        // Replies quoting the footer route back to the same session.
        assert_eq!(parse_session_id(&html).as_deref(), Some(SID));
    }
}
