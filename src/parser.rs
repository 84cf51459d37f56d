//! HTML scraping for the appliance's profile form
//!
//! This is a narrow pattern scan over one known page layout, not a document
//! parser. Everything callers need goes through [`scrape_form`].

use crate::models::Profile;
use regex::Regex;
use std::sync::OnceLock;

/// Input names treated as anti-forgery tokens even when not typed hidden
const TOKEN_FIELD_NAMES: &[&str] = &[
    "csrf_token",
    "csrfmiddlewaretoken",
    "_csrf",
    "_token",
    "authenticity_token",
    "__requestverificationtoken",
];

/// Name of the `<select>` holding the profile options
const PROFILE_SELECT_NAME: &str = "profile";

/// Hidden form fields in page order; later duplicates overwrite earlier values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HiddenFields {
    fields: Vec<(String, String)>,
}

impl HiddenFields {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Result of scraping the profile page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedForm {
    pub hidden_fields: HiddenFields,
    /// Every option of the profile select in page order, placeholders included
    pub profiles: Vec<Profile>,
}

/// Extract hidden fields and the profile option list from the form page
pub fn scrape_form(html: &str) -> ScrapedForm {
    ScrapedForm {
        hidden_fields: parse_hidden_fields(html),
        profiles: parse_profile_options(html),
    }
}

// A tag body: anything but '>' unless it sits inside quotes
const TAG_BODY: &str = r#"((?:[^>"']|"[^"]*"|'[^']*')*)>"#;

fn input_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"(?i)<input\b{}", TAG_BODY)).expect("valid regex"))
}

fn select_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"(?i)<select\b{}", TAG_BODY)).expect("valid regex"))
}

fn select_close_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</select\s*>").expect("valid regex"))
}

fn option_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"(?i)<option\b{}", TAG_BODY)).expect("valid regex"))
}

fn option_close_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</option\s*>").expect("valid regex"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([^\s"'<>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
            .expect("valid regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}

/// Parse the attributes of a tag body into lowercase-name / value pairs.
///
/// Double-quoted, single-quoted and unquoted values are accepted; a bare
/// attribute yields an empty value.
fn parse_attributes(body: &str) -> Vec<(String, String)> {
    // Drop the self-closing slash, but keep a slash that ends an unquoted value
    let trimmed = body.trim_end();
    let body = match trimmed.strip_suffix('/') {
        Some(rest)
            if rest.is_empty() || rest.ends_with(|c: char| c.is_whitespace() || c == '"' || c == '\'') =>
        {
            rest
        }
        _ => trimmed,
    };

    attribute_regex()
        .captures_iter(body)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn parse_hidden_fields(html: &str) -> HiddenFields {
    let mut fields = HiddenFields::default();

    for caps in input_regex().captures_iter(html) {
        let attrs = parse_attributes(&caps[1]);
        let Some(name) = attribute(&attrs, "name").filter(|n| !n.is_empty()) else {
            continue;
        };

        let hidden = attribute(&attrs, "type")
            .map(|t| t.eq_ignore_ascii_case("hidden"))
            .unwrap_or(false);
        let token = TOKEN_FIELD_NAMES.contains(&name.to_ascii_lowercase().as_str());

        if hidden || token {
            fields.insert(name, attribute(&attrs, "value").unwrap_or_default());
        }
    }

    fields
}

/// Inner HTML of the first `<select name="profile">`, if any
fn profile_select_inner(html: &str) -> Option<&str> {
    let open = select_regex().captures_iter(html).find(|caps| {
        let attrs = parse_attributes(&caps[1]);
        attribute(&attrs, "name") == Some(PROFILE_SELECT_NAME)
    })?;

    let start = open.get(0)?.end();
    let end = select_close_regex()
        .find(&html[start..])
        .map(|m| start + m.start())
        .unwrap_or(html.len());

    Some(&html[start..end])
}

fn parse_profile_options(html: &str) -> Vec<Profile> {
    let Some(inner) = profile_select_inner(html) else {
        tracing::debug!("No profile <select> found in page");
        return Vec::new();
    };

    let opens: Vec<_> = option_regex().captures_iter(inner).collect();
    let mut profiles = Vec::with_capacity(opens.len());

    for (i, caps) in opens.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let text_start = whole.end();
        // Options may omit their closing tag
        let next_open = opens
            .get(i + 1)
            .and_then(|c| c.get(0))
            .map(|m| m.start())
            .unwrap_or(inner.len());
        let text_end = option_close_regex()
            .find(&inner[text_start..next_open])
            .map(|m| text_start + m.start())
            .unwrap_or(next_open);

        let text = inner_text(&inner[text_start..text_end]);
        let attrs = parse_attributes(&caps[1]);

        let id = match attribute(&attrs, "value") {
            Some(value) if !value.trim().is_empty() => value.to_string(),
            _ => text.clone(),
        };

        profiles.push(Profile::new(id, text));
    }

    profiles
}

/// Strip tags, decode entities and collapse whitespace
fn inner_text(fragment: &str) -> String {
    let stripped = tag_regex().replace_all(fragment, " ");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &after[..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, semi))
        });

        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <form method="post" action="/profile.html">
            <input type="hidden" name="session" value="abc123">
            <input type='hidden' name='step' value='2' />
            <input type=hidden name=mode value=apply>
            <input name="csrf_token" value="tok&amp;en">
            <input type="text" name="comment" value="ignored">
            <input type="hidden" name="empty">
            <select name="output"><option value="x">Not a profile</option></select>
            <select id="p" name="profile">
                <option value="">Default</option>
                <option value="zen" selected>Zen   Mode</option>
                <option value="classical">
                    Classical
                </option>
                <option>Late Night</option>
            </select>
        </form>
        </body></html>
    "#;

    #[test]
    fn test_hidden_fields() {
        let form = scrape_form(PAGE);
        let fields = &form.hidden_fields;

        assert_eq!(fields.get("session"), Some("abc123"));
        assert_eq!(fields.get("step"), Some("2"));
        assert_eq!(fields.get("mode"), Some("apply"));
        assert_eq!(fields.get("csrf_token"), Some("tok&en"));
        assert_eq!(fields.get("empty"), Some(""));
        assert_eq!(fields.get("comment"), None);
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn test_profile_options() {
        let form = scrape_form(PAGE);
        let ids: Vec<_> = form.profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["Default", "zen", "classical", "Late Night"]);

        assert_eq!(form.profiles[1].title, "Zen Mode");
        assert_eq!(form.profiles[2].title, "Classical");
        assert_eq!(form.profiles[3].title, "Late Night");
    }

    #[test]
    fn test_default_option_is_not_usable() {
        let html = r#"<select name="profile"><option value="">Default</option><option value="zen">Zen Mode</option></select>"#;
        let form = scrape_form(html);
        let usable = crate::resolver::usable_profiles(&form.profiles);
        assert_eq!(usable, vec![Profile::new("zen", "Zen Mode")]);
    }

    #[test]
    fn test_options_without_closing_tags() {
        let html = r#"<SELECT NAME="profile"><OPTION VALUE=a>Alpha<OPTION VALUE=b>Beta</SELECT>"#;
        let form = scrape_form(html);
        assert_eq!(
            form.profiles,
            vec![Profile::new("a", "Alpha"), Profile::new("b", "Beta")]
        );
    }

    #[test]
    fn test_option_value_kept_verbatim() {
        let html = r#"<select name="profile"><option value=" late night ">Late</option><option value="  ">Blank</option></select>"#;
        let form = scrape_form(html);
        let ids: Vec<_> = form.profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, [" late night ", "Blank"]);
    }

    #[test]
    fn test_missing_select() {
        let form = scrape_form("<p>login required</p>");
        assert!(form.profiles.is_empty());
        assert!(form.hidden_fields.is_empty());
    }

    #[test]
    fn test_unquoted_value_keeps_slash() {
        let attrs = parse_attributes(r#" type=hidden name=path value=/a/b/"#);
        assert_eq!(attribute(&attrs, "value"), Some("/a/b/"));

        let attrs = parse_attributes(r#" type="hidden" name="x" value="1" /"#);
        assert_eq!(attribute(&attrs, "value"), Some("1"));
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a&amp;b &#65;&#x42; &bogus"), "a&b AB &bogus");
    }
}
