//! Text-to-markup transform for displaying message content.
//!
//! Content is escaped first, so nothing the user or the model typed can
//! produce live markup; only the heading rewrite emits tags.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static H2: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mR)^## (.*)$").expect("static regex"));
static H3: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mR)^### (.*)$").expect("static regex"));

/// Presentation choices passed explicitly into rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupStyle {
    pub h2_class: String,
    pub h3_class: String,
}

impl Default for MarkupStyle {
    fn default() -> Self {
        Self {
            h2_class: "text-xl font-bold mb-2 mt-1".to_string(),
            h3_class: "text-lg font-bold mb-2 mt-1".to_string(),
        }
    }
}

/// Escape the three reserved markup characters. `&` goes first so the
/// entities produced for `<` and `>` are not escaped again.
pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Escape `text`, then turn line-leading `## ` / `### ` markers into headings.
pub fn render(text: &str, style: &MarkupStyle) -> String {
    let escaped = escape(text);
    // class values are escaped too; they come from configuration, not content
    let h2 = format!(r#"<h2 class="{}">$1</h2>"#, escape_attr(&style.h2_class));
    let h3 = format!(r#"<h3 class="{}">$1</h3>"#, escape_attr(&style.h3_class));
    let out = H2.replace_all(&escaped, h2.as_str());
    H3.replace_all(&out, h3.as_str()).into_owned()
}

fn escape_attr(value: &str) -> String {
    escape(value).replace('"', "&quot;").replace('$', "$$")
}
