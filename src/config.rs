//! Project configuration (`decksmith.yaml`): where to crawl for note data
//! files and how to turn source paths into classification tags.

use std::path::{
    Path,
    PathBuf,
};

use serde::Deserialize;

use crate::{
    core::DecksmithError,
    persistence,
};

pub const PROJECT_CONFIG_FILE: &str = "decksmith.yaml";
pub const DEFAULT_CRAWL_INCLUDE: &str = "**/data.yaml";

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub config_path: PathBuf,
    pub crawl_root: PathBuf,
    pub crawl_include: Vec<String>,
    pub crawl_exclude: Vec<String>,
    pub path_tags: Option<PathTagsConfig>,
}

#[derive(Debug, Clone)]
pub struct PathTagsConfig {
    pub levels: Vec<LevelConfig>,
    pub include_other_segments: bool,
}

/// One entry of the path-tag level schema. `index` is the zero-based path
/// segment the level observes; several levels may observe the same segment.
#[derive(Debug, Clone)]
pub struct LevelConfig {
    pub name: String,
    pub index: usize,
    pub emit_value_tag: bool,
    pub value_tag_prefix: Option<String>,
    pub tag_name: Option<String>,
    pub value_template: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawProjectConfig {
    #[serde(default)]
    crawl: RawCrawlConfig,
    #[serde(default)]
    path_tags: Option<RawPathTagsConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCrawlConfig {
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    include: Option<StringOrList>,
    #[serde(default)]
    exclude: Option<StringOrList>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawPathTagsConfig {
    levels: Vec<RawLevelConfig>,
    #[serde(default)]
    include_other_segments: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLevelConfig {
    name: String,
    index: i64,
    #[serde(default)]
    emit_value_tag: Option<bool>,
    #[serde(default)]
    value_tag_prefix: Option<String>,
    #[serde(default, alias = "tag")]
    tag_name: Option<String>,
    #[serde(default)]
    value_template: Option<String>,
}

pub fn load_project_config(src_dir: &Path) -> Result<ProjectConfig, DecksmithError> {
    let config_path = src_dir.join(PROJECT_CONFIG_FILE);
    let raw: RawProjectConfig =
        persistence::load_yaml(&config_path, false)?.unwrap_or_default();

    let crawl_root = raw.crawl.root.as_deref().map(str::trim).unwrap_or(".");
    if crawl_root.is_empty() {
        return Err(DecksmithError::document(&config_path, "Invalid 'crawl.root': empty value"));
    }
    let crawl_root = if Path::new(crawl_root).is_absolute() {
        PathBuf::from(crawl_root)
    } else {
        src_dir.join(crawl_root)
    };
    if !crawl_root.is_dir() {
        return Err(DecksmithError::custom(format!(
            "crawl.root directory does not exist: {}",
            crawl_root.display()
        )));
    }

    let mut crawl_include = normalize_string_list(raw.crawl.include, "crawl.include")?;
    if crawl_include.is_empty() {
        crawl_include.push(DEFAULT_CRAWL_INCLUDE.to_string());
    }
    let crawl_exclude = normalize_string_list(raw.crawl.exclude, "crawl.exclude")?;

    let path_tags = match raw.path_tags {
        Some(raw_tags) => Some(normalize_path_tags(raw_tags)?),
        None => None,
    };

    Ok(ProjectConfig { config_path, crawl_root, crawl_include, crawl_exclude, path_tags })
}

fn normalize_string_list(
    value: Option<StringOrList>,
    key_name: &str,
) -> Result<Vec<String>, DecksmithError> {
    let items = match value {
        None => return Ok(Vec::new()),
        Some(StringOrList::One(item)) => vec![item],
        Some(StringOrList::Many(items)) => items,
    };

    let mut normalized = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            return Err(DecksmithError::custom(format!(
                "Invalid '{}' value at index {}: empty string",
                key_name, idx
            )));
        }
        normalized.push(trimmed.to_string());
    }
    Ok(normalized)
}

fn normalize_path_tags(raw: RawPathTagsConfig) -> Result<PathTagsConfig, DecksmithError> {
    if raw.levels.is_empty() {
        return Err(DecksmithError::custom(
            "Path tags config must contain a non-empty 'levels' list.",
        ));
    }

    let mut levels = Vec::with_capacity(raw.levels.len());
    let mut known_names = std::collections::HashSet::new();
    for (i, level) in raw.levels.into_iter().enumerate() {
        let name = level.name.trim().to_string();
        if name.is_empty() {
            return Err(DecksmithError::custom(format!("Invalid level name at index {}", i)));
        }
        if !known_names.insert(name.clone()) {
            return Err(DecksmithError::custom(format!(
                "Duplicate level name in path tags config: {}",
                name
            )));
        }

        if level.index < 0 {
            return Err(DecksmithError::custom(format!(
                "Invalid level index for '{}': {}",
                name, level.index
            )));
        }

        let tag_name =
            level.tag_name.as_deref().map(str::trim).filter(|t| !t.is_empty()).map(String::from);
        let value_tag_prefix = level
            .value_tag_prefix
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from);
        // When no named tag is configured the level defaults to emitting the
        // raw segment value.
        let emit_value_tag = level.emit_value_tag.unwrap_or(tag_name.is_none());

        let value_template = level.value_template.unwrap_or_else(|| "{value}".to_string());
        if value_template.is_empty() {
            return Err(DecksmithError::custom(format!(
                "Invalid value_template for level '{}': empty string",
                name
            )));
        }

        levels.push(LevelConfig {
            name,
            index: level.index as usize,
            emit_value_tag,
            value_tag_prefix,
            tag_name,
            value_template,
        });
    }

    let include_other_segments = raw.include_other_segments.unwrap_or(true);
    Ok(PathTagsConfig { levels, include_other_segments })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_path_tags(yaml: &str) -> Result<PathTagsConfig, DecksmithError> {
        let raw: RawPathTagsConfig = serde_yaml::from_str(yaml).unwrap();
        normalize_path_tags(raw)
    }

    #[test]
    fn level_defaults() {
        let config = parse_path_tags(
            "levels:\n  - name: subject\n    index: 0\n",
        )
        .unwrap();
        assert!(config.include_other_segments);
        let level = &config.levels[0];
        assert!(level.emit_value_tag);
        assert_eq!(level.value_template, "{value}");
        assert!(level.tag_name.is_none());
    }

    #[test]
    fn named_tag_suppresses_value_tag_by_default() {
        let config = parse_path_tags(
            "levels:\n  - name: subject\n    index: 0\n    tag: Subject\n",
        )
        .unwrap();
        let level = &config.levels[0];
        assert_eq!(level.tag_name.as_deref(), Some("Subject"));
        assert!(!level.emit_value_tag);
    }

    #[test]
    fn duplicate_level_names_rejected() {
        let result = parse_path_tags(
            "levels:\n  - name: a\n    index: 0\n  - name: a\n    index: 1\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn negative_index_rejected() {
        let result = parse_path_tags("levels:\n  - name: a\n    index: -1\n");
        assert!(result.is_err());
    }
}
