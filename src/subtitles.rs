use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_LINE_PERCENT: u8 = 90;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HorizontalAlign {
    Start,
    #[default]
    Center,
    End,
    Left,
    Right,
}

impl HorizontalAlign {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "center" | "middle" => Some(Self::Center),
            "end" => Some(Self::End),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// One timed caption with its markup already resolved for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Vertical slot, 0 = top of the screen.
    pub line_percent: u8,
    pub align: HorizontalAlign,
    pub size_percent: Option<f32>,
}

#[derive(Debug, Error)]
enum CueRejected {
    #[error("no timing line")]
    MissingTiming,
    #[error("unreadable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("end {end} is not after start {start}")]
    NonPositiveDuration { start: f64, end: f64 },
    #[error("no visible text")]
    EmptyText,
}

/// Class name to `#RRGGBB` color, collected from STYLE blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleSheet {
    classes: HashMap<String, String>,
}

impl StyleSheet {
    /// Collects color rules from `STYLE` blocks and from `NOTE` blocks carrying
    /// a `Style:` section.
    pub fn from_track(content: &str) -> Self {
        let mut sheet = Self::default();
        for block in blocks(content) {
            let head = block.trim_start();
            if let Some(rest) = strip_prefix_ci(head, "STYLE") {
                sheet.add_css(rest);
            } else if strip_prefix_ci(head, "NOTE").is_some() {
                let lower = head.to_ascii_lowercase();
                if let Some(pos) = lower.find("style:") {
                    sheet.add_css(&head[pos + "style:".len()..]);
                }
            }
        }
        sheet
    }

    pub fn add_css(&mut self, css: &str) {
        let (Some(rule_re), Some(color_re), Some(cue_re)) = (css_rule_re(), css_color_re(), cue_selector_re())
        else {
            return;
        };

        for rule in rule_re.captures_iter(css) {
            let selector = rule.get(1).map(|m| m.as_str()).unwrap_or("");
            let properties = rule.get(2).map(|m| m.as_str()).unwrap_or("");
            let color = match color_re
                .captures(properties)
                .and_then(|c| c.get(1))
                .and_then(|m| parse_color(m.as_str()))
            {
                Some(v) => v,
                None => continue,
            };

            let mut names: Vec<String> = Vec::new();
            if let Some(cue) = cue_re.captures(selector).and_then(|c| c.get(1)) {
                names.push(cue.as_str().to_ascii_lowercase());
            }
            for part in selector.split('.').skip(1) {
                let name: String = part
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                if !name.is_empty() {
                    names.push(name.to_ascii_lowercase());
                }
            }
            for name in names {
                self.classes.insert(name, color.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Color for an opening tag such as `c.yellow`, `yellow` or `c.loud.red`.
    pub fn color_for(&self, tag: &str) -> Option<String> {
        let tag = tag.to_ascii_lowercase();
        let mut parts = tag.split('.');
        let base = parts.next().unwrap_or("");
        let classes: Vec<&str> = parts.filter(|p| !p.is_empty()).collect();

        for class in &classes {
            if let Some(color) = self.classes.get(*class) {
                return Some(color.clone());
            }
        }
        if let Some(color) = self.classes.get(base) {
            return Some(color.clone());
        }
        classes
            .iter()
            .chain(std::iter::once(&base))
            .find_map(|name| named_color(name))
            .map(str::to_string)
    }
}

/// Parses a WebVTT-style track into cues sorted by start time.
///
/// Blocks that fail to parse are dropped individually.
pub fn parse_vtt(content: &str) -> Vec<SubtitleCue> {
    let styles = StyleSheet::from_track(content);
    parse_vtt_with_styles(content, &styles)
}

pub fn parse_vtt_with_styles(content: &str, styles: &StyleSheet) -> Vec<SubtitleCue> {
    let mut cues = Vec::new();
    let mut rejected = 0_usize;
    for block in blocks(content) {
        let trimmed = block.trim();
        if trimmed.is_empty() || is_metadata_block(trimmed) {
            continue;
        }
        match parse_cue_block(trimmed, styles) {
            Ok(cue) => cues.push(cue),
            Err(reason) => {
                rejected += 1;
                tracing::debug!(%reason, block = trimmed, "caption cue dropped");
            }
        }
    }
    cues.sort_by(|a, b| a.start.total_cmp(&b.start));
    if rejected > 0 {
        tracing::debug!(kept = cues.len(), rejected, "caption track parsed");
    }
    cues
}

/// Accepts `HH:MM:SS.mmm`, `MM:SS.mmm` and plain seconds; `,` may replace `.`.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let normalized = value.trim().replace(',', ".");
    if normalized.is_empty() {
        return None;
    }
    let parts: Vec<&str> = normalized.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, *s),
        [m, s] => (0, m.parse::<u64>().ok()?, *s),
        [s] => (0, 0, *s),
        _ => return None,
    };
    let seconds: f64 = seconds.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Some(whole as f64 + seconds)
}

fn blocks(content: &str) -> Vec<String> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in normalized.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

fn is_metadata_block(block: &str) -> bool {
    ["WEBVTT", "Kind:", "Language:", "STYLE", "NOTE", "REGION"]
        .iter()
        .any(|prefix| block.starts_with(prefix))
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn parse_cue_block(block: &str, styles: &StyleSheet) -> Result<SubtitleCue, CueRejected> {
    let lines: Vec<&str> = block.lines().collect();
    let timing_index = lines
        .iter()
        .position(|l| l.contains("-->"))
        .ok_or(CueRejected::MissingTiming)?;

    let timing = lines[timing_index].trim();
    let (start_raw, rest) = timing
        .split_once("-->")
        .ok_or(CueRejected::MissingTiming)?;
    let rest = rest.trim_start();
    let (end_raw, attributes) = match rest.find(char::is_whitespace) {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    let start = parse_timestamp(start_raw)
        .ok_or_else(|| CueRejected::BadTimestamp(start_raw.trim().to_string()))?;
    let end = parse_timestamp(end_raw)
        .ok_or_else(|| CueRejected::BadTimestamp(end_raw.trim().to_string()))?;
    if end <= start {
        return Err(CueRejected::NonPositiveDuration { start, end });
    }

    let text_lines: Vec<&str> = lines[timing_index + 1..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if text_lines.is_empty() {
        return Err(CueRejected::EmptyText);
    }
    let text = resolve_markup(&text_lines.join("\n"), styles);
    if visible_text(&text).is_empty() {
        return Err(CueRejected::EmptyText);
    }

    let mut cue = SubtitleCue {
        start,
        end,
        text,
        line_percent: DEFAULT_LINE_PERCENT,
        align: HorizontalAlign::Center,
        size_percent: None,
    };
    apply_cue_settings(&mut cue, attributes);
    Ok(cue)
}

fn apply_cue_settings(cue: &mut SubtitleCue, attributes: &str) {
    for setting in attributes.split_whitespace() {
        let Some((key, value)) = setting.split_once(':') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "line" => {
                // Only percentages map onto a slot; line numbers are ignored.
                let Some(pct) = value.split(',').next().and_then(|v| v.strip_suffix('%')) else {
                    continue;
                };
                if let Ok(pct) = pct.parse::<f64>() {
                    cue.line_percent = pct.round().clamp(0.0, 100.0) as u8;
                }
            }
            "align" => {
                if let Some(align) = HorizontalAlign::parse(value) {
                    cue.align = align;
                }
            }
            "size" => {
                if let Ok(size) = value.trim_end_matches('%').parse::<f32>() {
                    if size.is_finite() && size >= 0.0 {
                        cue.size_percent = Some(size);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Translates cue markup into display markup.
///
/// Closing tags pop whatever their opener pushed, so stripped tags stay
/// balanced with the ones that are kept.
pub fn resolve_markup(raw: &str, styles: &StyleSheet) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut closers: Vec<&'static str> = Vec::new();
    let mut rest = raw;

    while let Some(open) = rest.find('<') {
        push_text(&mut out, &rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            push_text(&mut out, &rest[open..]);
            rest = "";
            break;
        };
        let tag = after[..close].trim();
        rest = &after[close + 1..];

        if tag.is_empty() || is_timestamp_tag(tag) {
            continue;
        }
        if tag.starts_with('/') {
            if let Some(closer) = closers.pop() {
                out.push_str(closer);
            }
            continue;
        }
        closers.push(open_tag(tag, styles, &mut out));
    }
    push_text(&mut out, rest);
    while let Some(closer) = closers.pop() {
        out.push_str(closer);
    }

    out.trim().replace('\n', "<br>")
}

fn open_tag(tag: &str, styles: &StyleSheet, out: &mut String) -> &'static str {
    let (name, annotation) = match tag.find(char::is_whitespace) {
        Some(pos) => (&tag[..pos], tag[pos..].trim()),
        None => (tag, ""),
    };
    let name = name.to_ascii_lowercase();
    let base = name.split('.').next().unwrap_or("");

    match base {
        "b" => {
            out.push_str("<b>");
            "</b>"
        }
        "i" => {
            out.push_str("<i>");
            "</i>"
        }
        "u" => {
            out.push_str("<u>");
            "</u>"
        }
        "s" => {
            out.push_str("<s>");
            "</s>"
        }
        "v" => {
            if !annotation.is_empty() {
                out.push_str("<i>[");
                out.push_str(&decode_entities(annotation));
                out.push_str("]:</i> ");
            }
            ""
        }
        "ruby" | "rt" | "lang" => "",
        _ => match styles.color_for(&name) {
            Some(color) if color.starts_with('#') => {
                out.push_str("<font color='");
                out.push_str(&color);
                out.push_str("'>");
                "</font>"
            }
            _ => "",
        },
    }
}

fn push_text(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    let decoded = decode_entities(text);
    let mut last_space = out.ends_with(' ');
    for ch in decoded.chars() {
        match ch {
            '\n' => {
                while out.ends_with(' ') {
                    out.pop();
                }
                out.push('\n');
                last_space = true;
            }
            c if c.is_whitespace() => {
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
            c => {
                out.push(c);
                last_space = false;
            }
        }
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace('\u{00A0}', " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn is_timestamp_tag(tag: &str) -> bool {
    tag.chars().all(|c| c.is_ascii_digit() || c == ':' || c == '.')
}

/// Text with every markup tag removed.
///
/// A `<` only opens a tag when a `>` follows before the next `<`, so text like
/// `<3` stays visible.
pub fn visible_text(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut rest = markup;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('>');
        let next_open = after.find('<');
        match close {
            Some(close) if next_open.map_or(true, |next| close < next) => {
                rest = &after[close + 1..];
            }
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// `#RRGGBB` for hex, `rgb()`/`rgba()` and named colors.
pub fn parse_color(value: &str) -> Option<String> {
    let value = value.trim().trim_end_matches("!important").trim().to_ascii_lowercase();
    if let Some(hex) = value.strip_prefix('#') {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        return match hex.len() {
            3 | 4 => {
                let expanded: String = hex.chars().take(3).flat_map(|c| [c, c]).collect();
                Some(format!("#{}", expanded.to_ascii_uppercase()))
            }
            6 | 8 => Some(format!("#{}", hex[..6].to_ascii_uppercase())),
            _ => None,
        };
    }
    if let Some(caps) = rgb_re().and_then(|re| re.captures(&value)) {
        let channel = |i: usize| -> Option<u8> {
            let raw: u32 = caps.get(i)?.as_str().parse().ok()?;
            Some(raw.min(255) as u8)
        };
        return Some(format!("#{:02X}{:02X}{:02X}", channel(1)?, channel(2)?, channel(3)?));
    }
    named_color(&value).map(str::to_string)
}

fn named_color(name: &str) -> Option<&'static str> {
    let hex = match name {
        "white" => "#FFFFFF",
        "black" => "#000000",
        "red" => "#FF0000",
        "green" | "lime" => "#00FF00",
        "blue" => "#0000FF",
        "yellow" => "#FFFF00",
        "cyan" | "aqua" => "#00FFFF",
        "magenta" | "fuchsia" => "#FF00FF",
        "silver" => "#C0C0C0",
        "gray" | "grey" => "#808080",
        "maroon" => "#800000",
        "olive" => "#808000",
        "teal" => "#008080",
        "navy" => "#000080",
        "purple" => "#800080",
        "orange" => "#FFA500",
        "pink" => "#FFC0CB",
        "brown" => "#A52A2A",
        "gold" => "#FFD700",
        "violet" => "#EE82EE",
        _ => return None,
    };
    Some(hex)
}

fn css_rule_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^{}]+)\{([^}]*)\}").ok())
        .as_ref()
}

fn css_color_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // Anchored so `background-color` does not count.
    RE.get_or_init(|| Regex::new(r"(?i)(?:^|[;\s])color\s*:\s*([^;]+)").ok())
        .as_ref()
}

fn cue_selector_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)::cue\s*\(\s*\.?([a-z0-9_-]+)\s*\)").ok())
        .as_ref()
}

fn rgb_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"rgba?\s*\(\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)").ok())
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "WEBVTT\nKind: captions\nLanguage: en\n\n00:00:00.000 --> 00:00:02.000\nHello\n\n00:00:02.000 --> 00:00:05.000\nWorld\n";

    #[test]
    fn known_fixture_parses_in_order() {
        let cues = parse_vtt(FIXTURE);
        assert_eq!(cues.len(), 2);
        assert_eq!((cues[0].start, cues[0].end, cues[0].text.as_str()), (0.0, 2.0, "Hello"));
        assert_eq!((cues[1].start, cues[1].end, cues[1].text.as_str()), (2.0, 5.0, "World"));
        assert_eq!(cues[0].line_percent, DEFAULT_LINE_PERCENT);
        assert_eq!(cues[0].align, HorizontalAlign::Center);
    }

    #[test]
    fn inverted_and_empty_blocks_are_dropped() {
        let track = "WEBVTT\n\n00:05.000 --> 00:04.000\nbackwards\n\n00:06.000 --> 00:06.000\nzero\n\n1\n00:07.000 --> 00:08.000\n\n00:09.000 --> 00:10.000\n<i></i>\n\n00:11.000 --> 00:12.000\nkept\n";
        let cues = parse_vtt(track);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "kept");
        assert_eq!(cues[0].start, 11.0);
    }

    #[test]
    fn malformed_timing_only_drops_that_cue() {
        let track = "WEBVTT\n\nxx:yy --> 00:01.000\nbroken\n\n00:01.000 --> 00:02.000\nfine\n";
        let cues = parse_vtt(track);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "fine");
    }

    #[test]
    fn oversized_hours_drop_the_cue_instead_of_overflowing() {
        assert_eq!(parse_timestamp("99999999999999999:00:00.000"), None);
        assert_eq!(parse_timestamp("00:99999999999999999999:00.000"), None);

        let track = "WEBVTT\n\n99999999999999999:00:00.000 --> 99999999999999999:00:01.000\nhuge\n\n00:01.000 --> 00:02.000\nfine\n";
        let cues = parse_vtt(track);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "fine");
    }

    #[test]
    fn lone_angle_brackets_are_visible_text() {
        let track = "WEBVTT\n\n00:01.000 --> 00:02.000\n&lt;3\n\n00:03.000 --> 00:04.000\n< 3\n";
        let cues = parse_vtt(track);
        let texts: Vec<&str> = cues.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["<3", "< 3"]);

        assert_eq!(visible_text("<3 <b>hi</b>"), "<3 hi");
        assert_eq!(visible_text("<i>x</i>"), "x");
    }

    #[test]
    fn cues_are_sorted_and_crlf_is_accepted() {
        let track = "WEBVTT\r\n\r\n00:00:04.000 --> 00:00:05.000\r\nsecond\r\n\r\n00:00:01.000 --> 00:00:02.000\r\nfirst\r\n";
        let cues = parse_vtt(track);
        let texts: Vec<&str> = cues.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn timestamps_accept_all_forms() {
        assert_eq!(parse_timestamp("01:02:03.500"), Some(3723.5));
        assert_eq!(parse_timestamp("02:03.250"), Some(123.25));
        assert_eq!(parse_timestamp("00:00:01,200"), Some(1.2));
        assert_eq!(parse_timestamp("42.5"), Some(42.5));
        assert_eq!(parse_timestamp("a:b"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn multi_line_text_joins_with_breaks() {
        let track = "WEBVTT\n\n00:01.000 --> 00:02.000\nfirst   line\n  second line  \n";
        let cues = parse_vtt(track);
        assert_eq!(cues[0].text, "first line<br>second line");
    }

    #[test]
    fn cue_settings_are_read() {
        let track = "WEBVTT\n\n00:01.000 --> 00:02.000 line:10% align:middle size:50%\ntop\n\n00:03.000 --> 00:04.000 line:150% align:left\nclamped\n\n00:05.000 --> 00:06.000 line:3\nline number\n";
        let cues = parse_vtt(track);
        assert_eq!(cues[0].line_percent, 10);
        assert_eq!(cues[0].align, HorizontalAlign::Center);
        assert_eq!(cues[0].size_percent, Some(50.0));
        assert_eq!(cues[1].line_percent, 100);
        assert_eq!(cues[1].align, HorizontalAlign::Left);
        assert_eq!(cues[2].line_percent, DEFAULT_LINE_PERCENT);
    }

    #[test]
    fn basic_markup_and_voice_are_translated() {
        let styles = StyleSheet::default();
        assert_eq!(
            resolve_markup("<b>bold</b> <i>it</i> <u>u</u> <s>s</s>", &styles),
            "<b>bold</b> <i>it</i> <u>u</u> <s>s</s>"
        );
        assert_eq!(
            resolve_markup("<v Roger Bingham>We are in New York</v>", &styles),
            "<i>[Roger Bingham]:</i> We are in New York"
        );
    }

    #[test]
    fn unknown_and_timestamp_tags_are_stripped_but_balanced() {
        let styles = StyleSheet::default();
        assert_eq!(
            resolve_markup("<b><c.nothing>one</c> <00:00:01.500>two</b>", &styles),
            "<b>one two</b>"
        );
        assert_eq!(resolve_markup("<i>unclosed", &styles), "<i>unclosed</i>");
        assert_eq!(resolve_markup("a < b", &styles), "a < b");
    }

    #[test]
    fn entities_are_decoded() {
        let styles = StyleSheet::default();
        assert_eq!(
            resolve_markup("Tom &amp; Jerry&nbsp;&quot;x&quot; &#39;y&#39;", &styles),
            "Tom & Jerry \"x\" 'y'"
        );
    }

    #[test]
    fn style_block_classes_become_font_colors() {
        let track = "WEBVTT\n\nSTYLE\n::cue(.hot) { color: rgb(255, 128, 0); }\n.cool { background-color: #000; color: #0af }\n\nNOTE notes\nStyle: .note { color: lime }\n\n00:01.000 --> 00:02.000\n<c.hot>warm</c> <c.cool>cold</c> <c.note>n</c> <c.yellow>y</c>\n";
        let cues = parse_vtt(track);
        assert_eq!(
            cues[0].text,
            "<font color='#FF8000'>warm</font> <font color='#00AAFF'>cold</font> <font color='#00FF00'>n</font> <font color='#FFFF00'>y</font>"
        );
    }

    #[test]
    fn background_color_alone_is_ignored() {
        let mut sheet = StyleSheet::default();
        sheet.add_css(".bg { background-color: red }");
        assert!(sheet.is_empty());
    }

    #[test]
    fn color_values_normalize_to_hex() {
        assert_eq!(parse_color("#abc").as_deref(), Some("#AABBCC"));
        assert_eq!(parse_color("#12ab34").as_deref(), Some("#12AB34"));
        assert_eq!(parse_color("rgba(1, 2, 300, 0.5)").as_deref(), Some("#0102FF"));
        assert_eq!(parse_color(" Orange ").as_deref(), Some("#FFA500"));
        assert_eq!(parse_color("transparent"), None);
        assert_eq!(parse_color("#zzz"), None);
    }
}
