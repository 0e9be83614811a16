//! Path tag derivation: maps a note's source directory onto classification
//! tags according to the level schema in the project config.
//!
//! Tags are sanitized to the character set Anki accepts, `::` builds
//! hierarchical tags, and a level's `value_template` may interpolate its own
//! segment (`{value}`) or any other level's resolved segment (`{level_name}`).

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::OnceLock,
};

use regex::Regex;

use crate::{
    config::PathTagsConfig,
    core::DecksmithError,
};

fn sanitize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9A-Za-z:_-]+").expect("valid sanitize pattern"))
}

/// Collapses a raw value into a single flat tag token. Whitespace becomes
/// `_`, anything outside `[0-9A-Za-z:_-]` becomes `_`, and leading/trailing
/// underscores are trimmed. May produce an empty string.
pub fn sanitize_tag_token(raw: &str) -> String {
    let token = raw.trim().replace(' ', "_");
    let token = sanitize_re().replace_all(&token, "_");
    token.trim_matches('_').to_string()
}

/// Joins a sanitized prefix with the sanitized `::`-components of `value`
/// into one hierarchical tag.
fn hierarchical_tag(prefix: &str, value: &str) -> String {
    let base = sanitize_tag_token(prefix);
    let components: Vec<String> =
        value.split("::").map(sanitize_tag_token).filter(|c| !c.is_empty()).collect();

    if base.is_empty() {
        return components.join("::");
    }
    if components.is_empty() {
        return base;
    }
    let mut parts = vec![base];
    parts.extend(components);
    parts.join("::")
}

fn split_path(raw_path: &str) -> Vec<&str> {
    raw_path
        .trim()
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect()
}

/// Deduplicates tags across groups, keeping first-seen order.
pub fn merge_tags<I>(groups: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut result = Vec::new();
    let mut known = HashSet::new();
    for group in groups {
        for tag in group {
            if !tag.is_empty() && known.insert(tag.clone()) {
                result.push(tag);
            }
        }
    }
    result
}

/// Flat substitution of `{name}` placeholders from `context`. `{{` and `}}`
/// escape literal braces. An unresolvable placeholder is a hard error.
fn render_template(
    template: &str,
    context: &HashMap<&str, &str>,
    level: &str,
    path: &str,
) -> Result<String, DecksmithError> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                result.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                result.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(DecksmithError::custom(format!(
                        "Cannot render value_template for level '{}' and path '{}': unterminated '{{' in '{}'",
                        level, path, template
                    )));
                }
                match context.get(name.as_str()) {
                    Some(value) => result.push_str(value),
                    None => {
                        return Err(DecksmithError::UnresolvedPlaceholder {
                            level: level.to_string(),
                            path: path.to_string(),
                            placeholder: name,
                        });
                    }
                }
            }
            _ => result.push(c),
        }
    }
    Ok(result)
}

/// Derives the ordered, deduplicated tag list for a source directory path.
pub fn derive_tags_from_path(
    raw_path: &str,
    config: &PathTagsConfig,
) -> Result<Vec<String>, DecksmithError> {
    let parts = split_path(raw_path);
    if parts.is_empty() {
        return Ok(Vec::new());
    }

    // Resolve each level's observed segment first so templates can reference
    // any level by name, independent of level order.
    let mut level_values: HashMap<&str, &str> = HashMap::new();
    let mut claimed = HashSet::new();
    for level in &config.levels {
        claimed.insert(level.index);
        if let Some(value) = parts.get(level.index).copied() {
            if !value.is_empty() {
                level_values.insert(level.name.as_str(), value);
            }
        }
    }

    let mut tags = Vec::new();
    for level in &config.levels {
        let value = match level_values.get(level.name.as_str()) {
            Some(value) => *value,
            None => continue,
        };

        if level.emit_value_tag {
            let tag = match &level.value_tag_prefix {
                Some(prefix) => hierarchical_tag(prefix, value),
                None => sanitize_tag_token(value),
            };
            if !tag.is_empty() {
                tags.push(tag);
            }
        }

        if let Some(tag_name) = &level.tag_name {
            let mut context = level_values.clone();
            context.insert("value", value);
            let rendered =
                render_template(&level.value_template, &context, &level.name, raw_path)?;
            let tag = hierarchical_tag(tag_name, &rendered);
            if !tag.is_empty() {
                tags.push(tag);
            }
        }
    }

    if config.include_other_segments {
        for (idx, value) in parts.iter().enumerate() {
            if claimed.contains(&idx) {
                continue;
            }
            let tag = sanitize_tag_token(value);
            if !tag.is_empty() {
                tags.push(tag);
            }
        }
    }

    Ok(merge_tags([tags]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LevelConfig,
        PathTagsConfig,
    };

    fn level(name: &str, index: usize) -> LevelConfig {
        LevelConfig {
            name: name.to_string(),
            index,
            emit_value_tag: true,
            value_tag_prefix: None,
            tag_name: None,
            value_template: "{value}".to_string(),
        }
    }

    fn schema(levels: Vec<LevelConfig>, include_other_segments: bool) -> PathTagsConfig {
        PathTagsConfig { levels, include_other_segments }
    }

    #[test]
    fn sanitize_replaces_disallowed_chars() {
        assert_eq!(sanitize_tag_token("  Déjà vu! "), "D_j__vu");
        assert_eq!(sanitize_tag_token("math"), "math");
        assert_eq!(sanitize_tag_token("a::b"), "a::b");
        assert_eq!(sanitize_tag_token("***"), "");
    }

    #[test]
    fn claimed_segment_plus_unclaimed_fallthrough() {
        let config = schema(vec![level("subject", 0)], true);
        let tags = derive_tags_from_path("math/algebra", &config).unwrap();
        assert_eq!(tags, vec!["math", "algebra"]);
    }

    #[test]
    fn unclaimed_segments_suppressed_when_flag_off() {
        let config = schema(vec![level("subject", 0)], false);
        let tags = derive_tags_from_path("math/algebra", &config).unwrap();
        assert_eq!(tags, vec!["math"]);
    }

    #[test]
    fn empty_path_yields_no_tags() {
        let config = schema(vec![level("subject", 0)], true);
        assert!(derive_tags_from_path("", &config).unwrap().is_empty());
        assert!(derive_tags_from_path("./..", &config).unwrap().is_empty());
    }

    #[test]
    fn value_tag_prefix_builds_hierarchical_tag() {
        let mut subject = level("subject", 0);
        subject.value_tag_prefix = Some("Subject".to_string());
        let config = schema(vec![subject], false);
        let tags = derive_tags_from_path("math/algebra", &config).unwrap();
        assert_eq!(tags, vec!["Subject::math"]);
    }

    #[test]
    fn named_template_interpolates_other_levels() {
        let subject = level("subject", 0);
        let mut topic = level("topic", 1);
        topic.emit_value_tag = false;
        topic.tag_name = Some("Topic".to_string());
        topic.value_template = "{subject}::{value}".to_string();
        let config = schema(vec![subject, topic], false);

        let tags = derive_tags_from_path("math/algebra", &config).unwrap();
        assert_eq!(tags, vec!["math", "Topic::math::algebra"]);
    }

    #[test]
    fn unresolvable_placeholder_is_hard_error() {
        let mut subject = level("subject", 0);
        subject.tag_name = Some("Subject".to_string());
        subject.value_template = "{nope}".to_string();
        let config = schema(vec![subject], false);

        let err = derive_tags_from_path("math", &config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("subject"));
        assert!(message.contains("nope"));
    }

    #[test]
    fn absent_segment_contributes_nothing() {
        let config = schema(vec![level("subject", 0), level("deep", 5)], false);
        let tags = derive_tags_from_path("math", &config).unwrap();
        assert_eq!(tags, vec!["math"]);
    }

    #[test]
    fn duplicate_tags_across_levels_deduplicated() {
        let a = level("a", 0);
        let b = level("b", 0);
        let config = schema(vec![a, b], true);
        let tags = derive_tags_from_path("math/extra", &config).unwrap();
        assert_eq!(tags, vec!["math", "extra"]);
    }

    #[test]
    fn derivation_is_deterministic() {
        let config = schema(vec![level("subject", 0)], true);
        let first = derive_tags_from_path("a/b/c", &config).unwrap();
        let second = derive_tags_from_path("a/b/c", &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn backslash_separators_normalized() {
        let config = schema(vec![level("subject", 0)], true);
        let tags = derive_tags_from_path(r"math\algebra", &config).unwrap();
        assert_eq!(tags, vec!["math", "algebra"]);
    }
}
