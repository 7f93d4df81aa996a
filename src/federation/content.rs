//! Note content encoding
//!
//! Local notes are written as plain text with Markdown links. Outgoing
//! `Note.content` is HTML: escaped text, `[text](url)` anchors, hashtag
//! anchors and `<br>`/`<p>` for line structure.

use serde_json::{Value, json};

use super::urls::LocalUrls;

const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Rendered note plus what was extracted from it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedContent {
    pub html: String,
    /// Hashtag names without `#`, first spelling wins
    pub tags: Vec<String>,
    /// `(username, domain)` pairs from `@user@domain`
    pub mentions: Vec<(String, String)>,
}

impl EncodedContent {
    /// `Hashtag` objects for the note's `tag` array
    pub fn tag_objects(&self, urls: &LocalUrls) -> Vec<Value> {
        self.tags
            .iter()
            .map(|name| {
                json!({
                    "type": "Hashtag",
                    "href": urls.tag(&name.to_lowercase()),
                    "name": format!("#{}", name),
                })
            })
            .collect()
    }
}

/// JSON-LD context, extended with `Hashtag` when tags are present
pub fn note_context(has_tags: bool) -> Value {
    if has_tags {
        json!([AS_CONTEXT, {"Hashtag": "as:Hashtag"}])
    } else {
        json!(AS_CONTEXT)
    }
}

/// Render plain text with Markdown links into note HTML
pub fn encode_note(source: &str, urls: &LocalUrls) -> EncodedContent {
    let mut encoded = EncodedContent::default();
    let normalized = source.replace("\r\n", "\n");

    let paragraphs: Vec<String> = normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| format!("<p>{}</p>", encode_inline(paragraph, urls, &mut encoded)))
        .collect();

    encoded.html = paragraphs.concat();
    encoded
}

/// Strip anything but formatting markup from remote HTML
pub fn sanitize_remote_html(html: &str) -> String {
    ammonia::clean(html)
}

fn encode_inline(text: &str, urls: &LocalUrls, encoded: &mut EncodedContent) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let at_boundary = i == 0 || !is_word_char(chars[i - 1]);

        match c {
            '[' => {
                if let Some((label, href, next)) = parse_markdown_link(&chars, i) {
                    out.push_str(&format!(
                        "<a href=\"{}\" rel=\"nofollow noopener noreferrer\" target=\"_blank\">{}</a>",
                        html_escape::encode_double_quoted_attribute(&href),
                        html_escape::encode_text(&label)
                    ));
                    i = next;
                    continue;
                }
            }
            '#' if at_boundary => {
                if let Some((name, next)) = parse_hashtag(&chars, i + 1) {
                    out.push_str(&format!(
                        "<a href=\"{}\" class=\"hashtag\" rel=\"tag\">#<span>{}</span></a>",
                        html_escape::encode_double_quoted_attribute(&urls.tag(&name.to_lowercase())),
                        html_escape::encode_text(&name)
                    ));
                    if !encoded
                        .tags
                        .iter()
                        .any(|existing| existing.eq_ignore_ascii_case(&name))
                    {
                        encoded.tags.push(name);
                    }
                    i = next;
                    continue;
                }
            }
            '@' if i == 0 || chars[i - 1].is_whitespace() || chars[i - 1] == '(' => {
                if let Some((username, domain, next)) = parse_mention(&chars, i + 1) {
                    let literal: String = chars[i..next].iter().collect();
                    out.push_str(&html_escape::encode_text(&literal));
                    if !encoded
                        .mentions
                        .iter()
                        .any(|(u, d)| u == &username && d == &domain)
                    {
                        encoded.mentions.push((username, domain));
                    }
                    i = next;
                    continue;
                }
            }
            '\n' => {
                out.push_str("<br>");
                i += 1;
                continue;
            }
            _ => {}
        }

        let mut buf = [0u8; 4];
        let literal: &str = c.encode_utf8(&mut buf);
        out.push_str(&html_escape::encode_double_quoted_attribute(literal));
        i += 1;
    }

    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '&' || c == '/'
}

fn parse_markdown_link(chars: &[char], start: usize) -> Option<(String, String, usize)> {
    let close_label = (start + 1..chars.len()).find(|&j| chars[j] == ']' || chars[j] == '\n')?;
    if chars[close_label] != ']' || close_label == start + 1 {
        return None;
    }
    if chars.get(close_label + 1) != Some(&'(') {
        return None;
    }

    let href_start = close_label + 2;
    let close_href = (href_start..chars.len()).find(|&j| chars[j] == ')')?;
    let href: String = chars[href_start..close_href].iter().collect();
    if href.chars().any(char::is_whitespace)
        || !(href.starts_with("https://") || href.starts_with("http://"))
    {
        return None;
    }
    url::Url::parse(&href).ok()?;

    let label: String = chars[start + 1..close_label].iter().collect();
    Some((label, href, close_href + 1))
}

fn parse_hashtag(chars: &[char], start: usize) -> Option<(String, usize)> {
    let end = (start..chars.len())
        .find(|&j| !(chars[j].is_alphanumeric() || chars[j] == '_'))
        .unwrap_or(chars.len());
    let name: String = chars[start..end].iter().collect();
    // `#123` is an issue number, not a tag
    if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((name, end))
}

fn parse_mention(chars: &[char], start: usize) -> Option<(String, String, usize)> {
    let user_end = (start..chars.len())
        .find(|&j| !(chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.'))
        .unwrap_or(chars.len());
    if user_end == start || chars.get(user_end) != Some(&'@') {
        return None;
    }

    let domain_start = user_end + 1;
    let mut domain_end = (domain_start..chars.len())
        .find(|&j| !(chars[j].is_ascii_alphanumeric() || matches!(chars[j], '.' | '-' | ':')))
        .unwrap_or(chars.len());
    while domain_end > domain_start && matches!(chars[domain_end - 1], '.' | ':') {
        domain_end -= 1;
    }

    let domain: String = chars[domain_start..domain_end].iter().collect();
    if !domain.contains('.') && !domain.contains(':') && domain != "localhost" {
        return None;
    }

    let username: String = chars[start..user_end].iter().collect();
    Some((username, domain.to_ascii_lowercase(), domain_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> LocalUrls {
        LocalUrls::new("https://fedi.example", "fedi.example")
    }

    #[test]
    fn plain_text_is_escaped_and_wrapped() {
        let encoded = encode_note("a < b & \"c\"", &urls());
        assert_eq!(encoded.html, "<p>a &lt; b &amp; &quot;c&quot;</p>");
        assert!(encoded.tags.is_empty());
    }

    #[test]
    fn markdown_links_become_anchors() {
        let encoded = encode_note("see [the docs](https://docs.example/a?b=1&c=2) now", &urls());
        assert_eq!(
            encoded.html,
            "<p>see <a href=\"https://docs.example/a?b=1&amp;c=2\" rel=\"nofollow noopener noreferrer\" target=\"_blank\">the docs</a> now</p>"
        );
    }

    #[test]
    fn non_http_markdown_links_stay_text() {
        let encoded = encode_note("[x](javascript:alert(1))", &urls());
        assert!(!encoded.html.contains("<a "));
    }

    #[test]
    fn hashtags_become_tag_anchors() {
        let encoded = encode_note("hello #Rust and #rust, not issue #42", &urls());
        assert!(encoded.html.contains(
            "<a href=\"https://fedi.example/tags/rust\" class=\"hashtag\" rel=\"tag\">#<span>Rust</span></a>"
        ));
        assert!(encoded.html.contains("issue #42"));
        assert_eq!(encoded.tags, vec!["Rust".to_string()]);

        let tags = encoded.tag_objects(&urls());
        assert_eq!(tags[0]["type"], "Hashtag");
        assert_eq!(tags[0]["name"], "#Rust");
    }

    #[test]
    fn hashtag_inside_word_is_ignored() {
        let encoded = encode_note("C#sharp", &urls());
        assert!(encoded.tags.is_empty());
    }

    #[test]
    fn line_breaks_and_paragraphs() {
        let encoded = encode_note("one\ntwo\n\nthree", &urls());
        assert_eq!(encoded.html, "<p>one<br>two</p><p>three</p>");
    }

    #[test]
    fn mentions_are_collected() {
        let encoded = encode_note("hi @bob@remote.example and @carol@127.0.0.1:4000.", &urls());
        assert_eq!(
            encoded.mentions,
            vec![
                ("bob".to_string(), "remote.example".to_string()),
                ("carol".to_string(), "127.0.0.1:4000".to_string()),
            ]
        );
        assert!(encoded.html.contains("@bob@remote.example"));
    }

    #[test]
    fn context_gains_hashtag_term_only_with_tags() {
        assert_eq!(note_context(false), json!(AS_CONTEXT));
        assert_eq!(note_context(true)[1]["Hashtag"], "as:Hashtag");
    }

    #[test]
    fn remote_html_is_sanitized() {
        let cleaned = sanitize_remote_html("<p>hi<script>alert(1)</script></p>");
        assert_eq!(cleaned, "<p>hi</p>");
    }
}
