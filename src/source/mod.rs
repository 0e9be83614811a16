//! Source-tree loading: crawling note data files, parsing note records,
//! model definitions and per-deck build descriptors, and resolving a note's
//! per-language field values.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    path::{
        Path,
        PathBuf,
    },
};

use serde::{
    Deserialize,
    Deserializer,
    Serialize,
};

use crate::{
    config::ProjectConfig,
    core::DecksmithError,
    persistence,
};

/// Sentinel language: the note's base fields with no overrides applied.
pub const DEFAULT_LANG: &str = "default";

pub const MODELS_FILE: &str = "models.yaml";
pub const DECKS_DIR: &str = "decks";
pub const MEDIA_DIR: &str = "media";

/// One note as authored in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct NoteRecord {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub fields_by_lang: HashMap<String, HashMap<String, String>>,
    #[serde(default, deserialize_with = "tags_string_or_list")]
    pub tags: Vec<String>,
}

/// A note plus its provenance within the source tree. `guid` is the short
/// token assigned by the guid engine, absent until assignment runs.
#[derive(Debug, Clone)]
pub struct NoteEntry {
    pub note: NoteRecord,
    pub note_index: usize,
    pub source_file: PathBuf,
    pub source_rel_file: String,
    pub source_rel_dir: String,
    pub guid: Option<String>,
}

impl NoteEntry {
    /// `relative/path/data.yaml#3`, used in every note-attributed error.
    pub fn reference(&self) -> String {
        format!("{}#{}", self.source_rel_file, self.note_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTemplate {
    pub name: String,
    #[serde(default)]
    pub qfmt: String,
    #[serde(default)]
    pub afmt: String,
    #[serde(default)]
    pub bqfmt: String,
    #[serde(default)]
    pub bafmt: String,
    #[serde(default)]
    pub did: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub info: serde_json::Map<String, serde_json::Value>,
    pub fields: Vec<String>,
    pub templates: Vec<ModelTemplate>,
    #[serde(default)]
    pub css: String,
}

/// Globally defined models, in declaration order, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    models: Vec<ModelDefinition>,
    by_id: HashMap<String, usize>,
}

impl ModelSet {
    pub fn get(&self, id: &str) -> Option<&ModelDefinition> {
        self.by_id.get(id).map(|&idx| &self.models[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDefinition> {
        self.models.iter()
    }
}

/// Deck-local model enablement: uuid is required, name defaults to the
/// model's global display name.
#[derive(Debug, Clone, Deserialize)]
pub struct DeckModelConfig {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeckModelBinding {
    pub model_id: String,
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UuidBlock {
    uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedUuidBlock {
    uuid: String,
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DeckBuildFile {
    #[serde(default)]
    deck: Option<UuidBlock>,
    #[serde(default)]
    config: Option<NamedUuidBlock>,
    #[serde(default)]
    models: HashMap<String, DeckModelConfig>,
}

/// A fully read per-deck build descriptor: identity uuids plus the deck-local
/// override layers that win over the global deck/config/description.
#[derive(Debug, Clone)]
pub struct DeckDescriptor {
    pub dir_name: String,
    pub deck_uuid: String,
    pub config_uuid: String,
    pub config_name: String,
    pub models: HashMap<String, DeckModelConfig>,
    pub deck_overrides: serde_json::Map<String, serde_json::Value>,
    pub config_overrides: serde_json::Map<String, serde_json::Value>,
    pub description: Option<String>,
}

fn tags_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagList {
        One(String),
        Many(Vec<Option<String>>),
    }

    let tags = match Option::<TagList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(TagList::One(text)) => {
            text.split(' ').filter(|t| !t.is_empty()).map(String::from).collect()
        }
        Some(TagList::Many(items)) => items
            .into_iter()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
    };
    Ok(tags)
}

/// Anki rejects these in field names; catching them here keeps a broken
/// source tree from producing an unimportable export.
pub fn check_field_name(name: &str) -> Result<(), DecksmithError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DecksmithError::custom("Invalid field name: empty string"));
    }
    if trimmed.starts_with(['#', '^', '/']) {
        return Err(DecksmithError::custom(format!(
            "Invalid field name '{}': cannot start with '#', '^' or '/'",
            trimmed
        )));
    }
    if trimmed.contains([':', '"', '{', '}']) {
        return Err(DecksmithError::custom(format!(
            "Invalid field name '{}': cannot contain ':', '\"', '{{' or '}}'",
            trimmed
        )));
    }
    Ok(())
}

/// CrowdAnki nests decks with `::`; on disk that becomes `__`.
pub fn deck_to_filename(deck: &str) -> String {
    deck.replace("::", "__")
}

pub fn filename_to_deck(filename: &str) -> String {
    filename.replace("__", "::")
}

#[derive(Debug, Clone)]
pub struct DataFileRef {
    pub path: PathBuf,
    pub rel_path: String,
    pub rel_dir: String,
}

fn rel_path_string(path: &Path, root: &Path) -> Result<String, DecksmithError> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut parts = Vec::new();
    for component in rel.components() {
        match component.as_os_str().to_str() {
            Some(part) => parts.push(part),
            None => return Err(DecksmithError::document(path, "non-UTF-8 path")),
        }
    }
    Ok(parts.join("/"))
}

/// Crawls the source tree for note data files. Include patterns are globbed
/// under the crawl root, excludes are matched against the normalized relative
/// path, and the result is deduplicated and sorted lexicographically so the
/// note discovery order is stable across runs.
pub fn find_data_files(config: &ProjectConfig) -> Result<Vec<DataFileRef>, DecksmithError> {
    let exclude: Vec<glob::Pattern> = config
        .crawl_exclude
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<_, _>>()?;

    let mut result: Vec<DataFileRef> = Vec::new();
    let mut known = HashSet::new();

    for pattern in &config.crawl_include {
        let full_pattern = config.crawl_root.join(pattern);
        let full_pattern = full_pattern
            .to_str()
            .ok_or_else(|| DecksmithError::document(&full_pattern, "non-UTF-8 path"))?;

        for path in glob::glob(full_pattern)? {
            let path = path?;
            if !path.is_file() {
                continue;
            }

            let rel_path = rel_path_string(&path, &config.crawl_root)?;
            if exclude.iter().any(|p| p.matches(&rel_path)) {
                continue;
            }
            if !known.insert(rel_path.clone()) {
                continue;
            }

            let rel_dir = match rel_path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
            result.push(DataFileRef { path, rel_path, rel_dir });
        }
    }

    result.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(result)
}

#[derive(Debug, Deserialize)]
struct DataFile {
    notes: Vec<NoteRecord>,
}

/// Loads every crawled data file into provenance-tagged note entries.
pub fn load_notes(config: &ProjectConfig) -> Result<Vec<NoteEntry>, DecksmithError> {
    let mut entries = Vec::new();
    for data_file in find_data_files(config)? {
        let parsed: DataFile = persistence::load_yaml(&data_file.path, true)?
            .ok_or_else(|| DecksmithError::document(&data_file.path, "file not found"))?;

        for (note_index, note) in parsed.notes.into_iter().enumerate() {
            entries.push(NoteEntry {
                note,
                note_index,
                source_file: data_file.path.clone(),
                source_rel_file: data_file.rel_path.clone(),
                source_rel_dir: data_file.rel_dir.clone(),
                guid: None,
            });
        }
    }
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<ModelDefinition>,
}

pub fn load_models(src_dir: &Path) -> Result<ModelSet, DecksmithError> {
    let models_path = src_dir.join(MODELS_FILE);
    let parsed: ModelsFile = persistence::load_yaml(&models_path, true)?
        .ok_or_else(|| DecksmithError::document(&models_path, "file not found"))?;

    if parsed.models.is_empty() {
        return Err(DecksmithError::document(
            &models_path,
            "must contain a non-empty 'models' list",
        ));
    }

    let mut set = ModelSet::default();
    for mut model in parsed.models {
        model.id = model.id.trim().to_string();
        model.name = model.name.trim().to_string();
        model.uuid = model.uuid.trim().to_string();
        if model.id.is_empty() {
            return Err(DecksmithError::document(&models_path, "model with empty id"));
        }
        if model.name.is_empty() {
            return Err(DecksmithError::document(
                &models_path,
                format!("model '{}' has an empty name", model.id),
            ));
        }
        if model.uuid.is_empty() {
            return Err(DecksmithError::document(
                &models_path,
                format!("model '{}' is missing a uuid", model.id),
            ));
        }
        if model.fields.is_empty() {
            return Err(DecksmithError::document(
                &models_path,
                format!("model '{}' must define non-empty 'fields'", model.id),
            ));
        }
        if model.templates.is_empty() {
            return Err(DecksmithError::document(
                &models_path,
                format!("model '{}' must define non-empty 'templates'", model.id),
            ));
        }

        let mut seen_fields = HashSet::new();
        for field in &model.fields {
            check_field_name(field)?;
            if !seen_fields.insert(field.clone()) {
                return Err(DecksmithError::document(
                    &models_path,
                    format!("model '{}' declares duplicate field '{}'", model.id, field),
                ));
            }
        }
        for template in &model.templates {
            if template.name.trim().is_empty() {
                return Err(DecksmithError::document(
                    &models_path,
                    format!("model '{}' has a template with an empty name", model.id),
                ));
            }
        }

        if set.by_id.insert(model.id.clone(), set.models.len()).is_some() {
            return Err(DecksmithError::document(
                &models_path,
                format!("duplicate model id '{}'", model.id),
            ));
        }
        set.models.push(model);
    }
    Ok(set)
}

/// Enabled models for a deck, in global declaration order: each binding gets
/// the deck-local uuid (required) and the display name override if any.
pub fn resolve_deck_models(
    deck: &DeckDescriptor,
    models: &ModelSet,
) -> Result<Vec<DeckModelBinding>, DecksmithError> {
    if deck.models.is_empty() {
        return Err(DecksmithError::custom(format!(
            "Deck '{}' build file is missing required 'models' map.",
            deck.dir_name
        )));
    }
    for model_id in deck.models.keys() {
        if !models.contains(model_id) {
            return Err(DecksmithError::custom(format!(
                "Deck '{}' references unknown model '{}'.",
                deck.dir_name, model_id
            )));
        }
    }

    let mut bindings = Vec::new();
    for model in models.iter() {
        let Some(config) = deck.models.get(&model.id) else {
            continue;
        };
        let uuid = config
            .uuid
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                DecksmithError::custom(format!(
                    "Model '{}' is missing uuid in deck '{}' build file.",
                    model.id, deck.dir_name
                ))
            })?;
        let name = config
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&model.name);
        bindings.push(DeckModelBinding {
            model_id: model.id.clone(),
            uuid: uuid.to_string(),
            name: name.to_string(),
        });
    }
    Ok(bindings)
}

fn read_deck(dir: &Path, dir_name: &str) -> Result<DeckDescriptor, DecksmithError> {
    let build: DeckBuildFile =
        persistence::load_json(&dir.join("build.json"), false)?.unwrap_or_default();

    let deck = build.deck.ok_or_else(|| {
        DecksmithError::custom(format!(
            "Deck '{}' build file is missing the required 'deck' section.",
            dir_name
        ))
    })?;
    let config = build.config.ok_or_else(|| {
        DecksmithError::custom(format!(
            "Deck '{}' build file is missing the required 'config' section.",
            dir_name
        ))
    })?;

    Ok(DeckDescriptor {
        dir_name: dir_name.to_string(),
        deck_uuid: deck.uuid.trim().to_string(),
        config_uuid: config.uuid.trim().to_string(),
        config_name: config.name,
        models: build.models,
        deck_overrides: persistence::load_json_map(&dir.join("deck.json"), false)?,
        config_overrides: persistence::load_json_map(&dir.join("config.json"), false)?,
        description: persistence::read_text(&dir.join("info.html"), false)?,
    })
}

/// Reads the requested decks (by name, `::` or `__` form) from the decks
/// directory; with no selection every discovered deck directory is used.
pub fn read_decks(
    selected: &[String],
    decks_dir: &Path,
) -> Result<Vec<DeckDescriptor>, DecksmithError> {
    let names: Vec<String> = if selected.is_empty() {
        persistence::list_dir_names(decks_dir)?
    } else {
        selected.iter().map(|deck| deck_to_filename(deck)).collect()
    };

    if names.is_empty() {
        return Err(DecksmithError::custom(format!(
            "No decks found under: {}",
            decks_dir.display()
        )));
    }

    let mut decks = Vec::with_capacity(names.len());
    for name in names {
        let dir = decks_dir.join(&name);
        if !dir.is_dir() {
            return Err(DecksmithError::custom(format!("Deck not found: {}", dir.display())));
        }
        decks.push(read_deck(&dir, &name)?);
    }
    Ok(decks)
}

/// Every language any note declares overrides for, plus the default, sorted.
pub fn supported_languages(entries: &[NoteEntry]) -> Vec<String> {
    let mut langs: HashSet<String> = HashSet::new();
    langs.insert(DEFAULT_LANG.to_string());
    for entry in entries {
        for code in entry.note.fields_by_lang.keys() {
            langs.insert(code.clone());
        }
    }
    let mut langs: Vec<String> = langs.into_iter().collect();
    langs.sort();
    langs
}

/// The note's base fields with the language's overrides shallow-merged on
/// top. The default language never applies overrides.
pub fn localized_fields(
    entry: &NoteEntry,
    lang: &str,
) -> Result<HashMap<String, String>, DecksmithError> {
    let base = entry.note.fields.as_ref().ok_or_else(|| {
        DecksmithError::custom(format!(
            "Note '{}' is missing object field 'fields'.",
            entry.reference()
        ))
    })?;

    let mut resolved = base.clone();
    if lang != DEFAULT_LANG {
        if let Some(localized) = entry.note.fields_by_lang.get(lang) {
            for (field, value) in localized {
                resolved.insert(field.clone(), value.clone());
            }
        }
    }
    Ok(resolved)
}

/// Projects a note's localized fields onto the model's declared field order.
pub fn project_fields(
    entry: &NoteEntry,
    model: &ModelDefinition,
    lang: &str,
) -> Result<Vec<String>, DecksmithError> {
    let by_name = localized_fields(entry, lang)?;
    let mut values = Vec::with_capacity(model.fields.len());
    for field_name in &model.fields {
        match by_name.get(field_name) {
            Some(value) => values.push(value.clone()),
            None => {
                return Err(DecksmithError::MissingField {
                    note: entry.reference(),
                    field: field_name.clone(),
                    model: model.id.clone(),
                });
            }
        }
    }
    Ok(values)
}
