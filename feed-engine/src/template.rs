//! Output-format templates: `{path|function:arg|...}` placeholders in plain
//! text. Templates are parsed once into segments and transform stages, so
//! every configuration problem (unknown function, bad count, bad regex)
//! surfaces from [`Template::parse`] rather than while rendering.

use crate::feed_utils::{text::html_to_text, time::format_age};
use crate::types::{EngineError, Item, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};

const FUNCTIONS: &[&str] = &[
    "truncate",
    "word_wrap",
    "first_words",
    "regex",
    "if_regex",
    "switch",
    "regex_cond",
];

const FALLBACK_EMOJI: &[&str] = &["📢", "📰", "📡", "🔔", "📣", "🗞️"];

/// Emoji for a subscription's display name: keyword matches first, then a
/// stable pick from a fixed set.
pub fn emoji_for(feed_name: &str) -> &'static str {
    let name = feed_name.to_lowercase();
    if name.contains("emergency") || name.contains("alert") {
        "🚨"
    } else if name.contains("warning") {
        "⚠️"
    } else if name.contains("info") || name.contains("news") {
        "ℹ️"
    } else {
        let digest = Sha256::digest(name.as_bytes());
        FALLBACK_EMOJI[digest[0] as usize % FALLBACK_EMOJI.len()]
    }
}

/// Values that are not part of the item itself.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub feed_name: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Transform {
    Truncate(usize),
    WordWrap(usize),
    FirstWords(usize),
    Regex {
        re: Regex,
        group: Option<usize>,
    },
    IfRegex {
        re: Regex,
        then: String,
        otherwise: String,
    },
    Switch {
        pairs: Vec<(String, String)>,
        default: String,
    },
    RegexCond {
        extract: Regex,
        check: String,
        check_re: Regex,
        then: String,
        group: usize,
    },
}

fn template_regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| EngineError::Template(format!("invalid regex '{}': {}", pattern, e)))
}

fn parse_count(function: &str, arg: &str) -> Result<usize> {
    arg.trim().parse::<usize>().map_err(|_| {
        EngineError::Template(format!("{} expects a number, got '{}'", function, arg))
    })
}

impl Transform {
    pub fn parse(stage: &str) -> Result<Self> {
        let (name, args) = stage.split_once(':').unwrap_or((stage, ""));
        let name = name.trim();

        let transform = match name {
            "truncate" => Transform::Truncate(parse_count(name, args)?),
            "word_wrap" => Transform::WordWrap(parse_count(name, args)?),
            "first_words" => Transform::FirstWords(parse_count(name, args)?),
            "regex" => {
                let (pattern, group) = match args.rsplit_once(':') {
                    Some((pattern, group))
                        if !pattern.is_empty()
                            && !group.is_empty()
                            && group.bytes().all(|b| b.is_ascii_digit()) =>
                    {
                        (pattern, group.parse::<usize>().ok())
                    }
                    _ => (args, None),
                };
                if pattern.is_empty() {
                    return Err(EngineError::Template("regex needs a pattern".into()));
                }
                Transform::Regex {
                    re: template_regex(pattern)?,
                    group,
                }
            }
            "if_regex" => {
                let parts: Vec<&str> = args.splitn(3, ':').collect();
                if parts.len() < 3 || parts[0].is_empty() {
                    return Err(EngineError::Template(
                        "if_regex expects pattern:then:else".into(),
                    ));
                }
                Transform::IfRegex {
                    re: template_regex(parts[0])?,
                    then: parts[1].to_string(),
                    otherwise: parts[2].to_string(),
                }
            }
            "switch" => {
                let parts: Vec<&str> = args.split(':').collect();
                if parts.len() < 2 {
                    return Err(EngineError::Template(
                        "switch expects value:result pairs and a default".into(),
                    ));
                }
                let last = parts.len() - 1;
                let pairs = (0..last)
                    .step_by(2)
                    .map(|i| (parts[i].trim().to_lowercase(), parts[i + 1].to_string()))
                    .collect();
                Transform::Switch {
                    pairs,
                    default: parts[last].to_string(),
                }
            }
            "regex_cond" => {
                let parts: Vec<&str> = args.splitn(4, ':').collect();
                if parts.len() < 4 || parts[0].is_empty() {
                    return Err(EngineError::Template(
                        "regex_cond expects extract:check:then:group".into(),
                    ));
                }
                let group = if parts[3].trim().is_empty() {
                    1
                } else {
                    parse_count(name, parts[3])?
                };
                Transform::RegexCond {
                    extract: template_regex(parts[0])?,
                    check: parts[1].to_string(),
                    check_re: template_regex(parts[1])?,
                    then: parts[2].to_string(),
                    group,
                }
            }
            other => {
                return Err(EngineError::Template(format!(
                    "unknown function '{}'",
                    other
                )))
            }
        };
        Ok(transform)
    }

    pub fn apply(&self, value: String) -> String {
        match self {
            Transform::Truncate(n) => value.chars().take(*n).collect(),
            Transform::WordWrap(n) => word_wrap(&value, *n),
            Transform::FirstWords(n) => value.split_whitespace().take(*n).collect::<Vec<_>>().join(" "),
            Transform::Regex { re, group } => {
                let Some(caps) = re.captures(&value) else {
                    return String::new();
                };
                let group = group.unwrap_or(if caps.len() > 1 { 1 } else { 0 });
                caps.get(group)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }
            Transform::IfRegex { re, then, otherwise } => {
                if re.is_match(&value) {
                    then.clone()
                } else {
                    otherwise.clone()
                }
            }
            Transform::Switch { pairs, default } => {
                let needle = value.trim().to_lowercase();
                pairs
                    .iter()
                    .find(|(candidate, _)| *candidate == needle)
                    .map(|(_, result)| result.clone())
                    .unwrap_or_else(|| default.clone())
            }
            Transform::RegexCond {
                extract,
                check,
                check_re,
                then,
                group,
            } => {
                let Some(caps) = extract.captures(&value) else {
                    return String::new();
                };
                let matched = if caps.len() > 1 {
                    caps.get(*group).or_else(|| caps.get(1))
                } else {
                    caps.get(0)
                };
                let extracted = matched.map(|m| m.as_str().trim()).unwrap_or("");
                if !check.is_empty()
                    && (extracted.to_lowercase() == check.to_lowercase()
                        || check_re.is_match(extracted))
                {
                    then.clone()
                } else {
                    extracted.to_string()
                }
            }
        }
    }
}

/// Keeps at most `width` characters, cutting at the last word boundary; a
/// single word longer than `width` is cut hard.
fn word_wrap(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let cut: String = value.chars().take(width).collect();
    let next_is_space = value.chars().nth(width).is_some_and(char::is_whitespace);
    if next_is_space {
        return cut.trim_end().to_string();
    }
    match cut.rfind(char::is_whitespace) {
        Some(idx) if !cut[..idx].trim().is_empty() => cut[..idx].trim_end().to_string(),
        _ => cut,
    }
}

#[derive(Debug, Clone)]
struct Placeholder {
    path: String,
    stages: Vec<Transform>,
}

fn starts_with_function(part: &str) -> bool {
    let name = part.split(':').next().unwrap_or("").trim();
    FUNCTIONS.contains(&name)
}

impl Placeholder {
    fn parse(expr: &str) -> Result<Self> {
        let mut parts = expr.split('|');
        let path = parts.next().unwrap_or("").trim().to_string();

        // A `|` inside a regex argument stays part of that argument unless
        // the text after it names a function.
        let mut raw_stages: Vec<String> = Vec::new();
        for part in parts {
            match raw_stages.last_mut() {
                Some(previous) if !starts_with_function(part) => {
                    previous.push('|');
                    previous.push_str(part);
                }
                _ => raw_stages.push(part.to_string()),
            }
        }

        let stages = raw_stages
            .iter()
            .map(|stage| Transform::parse(stage.trim()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { path, stages })
    }

    fn base_value(&self, item: &Item, ctx: &RenderContext<'_>) -> String {
        match self.path.as_str() {
            "title" => item.title.clone(),
            "body" | "description" => html_to_text(&item.body),
            "link" => item.link.clone(),
            "id" => item.id.clone(),
            "date" => item
                .timestamp
                .map(|t| format_age(t, ctx.now))
                .unwrap_or_default(),
            "emoji" => emoji_for(ctx.feed_name).to_string(),
            other => item.field_text(other),
        }
    }

    fn render(&self, item: &Item, ctx: &RenderContext<'_>) -> String {
        self.stages
            .iter()
            .fold(self.base_value(item, ctx), |value, stage| stage.apply(value))
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A parsed output format.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// Byte offset of the `}` closing a placeholder whose `{` precedes `s`.
fn matching_close(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = matching_close(after) else {
                // Unclosed brace: the remainder is plain text.
                literal.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let expr = &after[..close];
            if expr.trim().is_empty() {
                literal.push('{');
                literal.push_str(expr);
                literal.push('}');
            } else {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(Placeholder::parse(expr)?));
            }
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn render(&self, item: &Item, ctx: &RenderContext<'_>) -> String {
        let mut out = String::with_capacity(self.source.len() + 64);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => out.push_str(&p.render(item, ctx)),
            }
        }
        out
    }

    /// Renders and applies the overall message length cap.
    pub fn render_message(&self, item: &Item, ctx: &RenderContext<'_>, max_len: usize) -> String {
        cap_message(&self.render(item, ctx), max_len)
    }
}

/// Rejects templates that would fail to parse.
pub fn validate(source: &str) -> Result<()> {
    Template::parse(source).map(|_| ())
}

/// Caps a rendered message at `max_len` characters. Multi-line messages keep
/// their earlier lines and shorten the last one when enough room is left.
pub fn cap_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    if max_len <= 3 {
        return message.chars().take(max_len).collect();
    }

    let lines: Vec<&str> = message.split('\n').collect();
    if lines.len() > 1 {
        let head: usize = lines[..lines.len() - 1]
            .iter()
            .map(|line| line.chars().count() + 1)
            .sum();
        let remaining = max_len as isize - head as isize - 3;
        if remaining > 20 {
            let last: String = lines[lines.len() - 1]
                .chars()
                .take(remaining as usize)
                .collect();
            let mut out = lines[..lines.len() - 1].join("\n");
            out.push('\n');
            out.push_str(&last);
            out.push_str("...");
            return out;
        }
    }

    let mut out: String = message.chars().take(max_len - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn ctx() -> RenderContext<'static> {
        RenderContext {
            feed_name: "County Emergency Alerts",
            now: now(),
        }
    }

    fn item() -> Item {
        Item {
            id: "a-1".into(),
            title: "Severe Weather Warning".into(),
            body: "<p>Gusts up to 60&nbsp;mph</p>".into(),
            link: "https://alerts.example.com/a-1".into(),
            timestamp: Some(now() - Duration::minutes(150)),
            raw: json!({
                "Priority": "Highest",
                "EventCategory": "Collision",
                "HeadlineDescription": "Lane 2 blocked near Exit 5: expect delays",
                "StartRoadwayLocation": {"RoadName": "I-5", "MilePost": 12.5},
                "Lanes": ["left", "right"]
            }),
        }
    }

    fn render(source: &str) -> String {
        Template::parse(source).unwrap().render(&item(), &ctx())
    }

    #[test]
    fn emoji_and_truncated_title() {
        assert_eq!(render("{emoji} {title|truncate:10}"), "🚨 Severe Weat");
    }

    #[test]
    fn builtin_paths() {
        assert_eq!(render("{body}"), "Gusts up to 60 mph");
        assert_eq!(render("{date}"), "2h 30m ago");
        assert_eq!(render("{link}"), "https://alerts.example.com/a-1");
        assert_eq!(render("{raw.StartRoadwayLocation.RoadName}"), "I-5");
        assert_eq!(render("{raw.Lanes}"), r#"["left","right"]"#);
        assert_eq!(render("[{raw.Missing.Path}]"), "[]");
    }

    #[test]
    fn truncate_never_exceeds_its_bound() {
        for n in 0..30 {
            let out = render(&format!("{{title|truncate:{n}}}"));
            assert!(out.chars().count() <= n);
        }
    }

    #[test]
    fn word_wrap_and_first_words() {
        assert_eq!(render("{title|word_wrap:16}"), "Severe Weather");
        assert_eq!(render("{title|word_wrap:14}"), "Severe Weather");
        assert_eq!(render("{title|word_wrap:4}"), "Seve");
        assert_eq!(render("{title|word_wrap:100}"), "Severe Weather Warning");
        assert_eq!(render("{title|first_words:2}"), "Severe Weather");
    }

    #[test]
    fn regex_groups() {
        assert_eq!(render(r"{raw.HeadlineDescription|regex:Exit (\d+)}"), "5");
        assert_eq!(render(r"{raw.HeadlineDescription|regex:Exit (\d+):0}"), "Exit 5");
        assert_eq!(render(r"{raw.HeadlineDescription|regex:blocked}"), "blocked");
        assert_eq!(render(r"{raw.HeadlineDescription|regex:Mile (\d+)}"), "");
    }

    #[test]
    fn regex_alternation_survives_pipe_splitting() {
        assert_eq!(
            render(r"{raw.EventCategory|regex:(Collision|Fire)|truncate:4}"),
            "Coll"
        );
    }

    #[test]
    fn if_regex_and_switch() {
        assert_eq!(render("{raw.Priority|if_regex:high:!!:-}"), "!!");
        assert_eq!(render("{raw.EventCategory|if_regex:fire:F:other}"), "other");
        assert_eq!(
            render("{raw.Priority|switch:highest:P1:high:P2:medium:P3:P?}"),
            "P1"
        );
        assert_eq!(render("{raw.EventCategory|switch:fire:F:none}"), "none");
    }

    #[test]
    fn regex_cond_extracts_then_checks() {
        let src = r"{raw.HeadlineDescription|regex_cond:Lane (\d+):2:second lane:1}";
        assert_eq!(render(src), "second lane");
        let src = r"{raw.HeadlineDescription|regex_cond:Exit (\d+):9:nine:1}";
        assert_eq!(render(src), "5");
        let src = r"{raw.HeadlineDescription|regex_cond:Ramp (\d+):1:x:1}";
        assert_eq!(render(src), "");
    }

    #[test]
    fn configuration_errors_surface_at_parse_time() {
        assert!(Template::parse("{title|shout}").is_err());
        assert!(Template::parse("{title|truncate:many}").is_err());
        assert!(Template::parse("{title|regex:(open}").is_err());
        assert!(Template::parse("{title|if_regex:x:y}").is_err());
        assert!(validate("{emoji} {body|truncate:100} - {date}\n{link|truncate:50}").is_ok());
    }

    #[test]
    fn stray_braces_are_literal() {
        assert_eq!(render("{} and {title"), "{} and {title");
        assert_eq!(render(r"{raw.HeadlineDescription|regex:(\d{1})}"), "2");
    }

    #[test]
    fn message_cap_shortens_last_line_or_whole_message() {
        let long_link = format!("https://example.com/{}", "x".repeat(200));
        let message = format!("Short first line\n{}", long_link);
        let capped = cap_message(&message, 130);
        assert_eq!(capped.chars().count(), 130);
        assert!(capped.starts_with("Short first line\nhttps://"));
        assert!(capped.ends_with("..."));

        let single = "y".repeat(200);
        let capped = cap_message(&single, 130);
        assert_eq!(capped.chars().count(), 130);
        assert!(capped.ends_with("..."));

        assert_eq!(cap_message("fits", 130), "fits");
    }

    #[test]
    fn emoji_is_deterministic() {
        assert_eq!(emoji_for("Road Warning Feed"), "⚠️");
        assert_eq!(emoji_for("Local News"), "ℹ️");
        assert_eq!(emoji_for("Ferry schedule"), emoji_for("Ferry schedule"));
        assert!(FALLBACK_EMOJI.contains(&emoji_for("Ferry schedule")));
    }
}
