//! Reverse transform: pulls an existing CrowdAnki export back into source
//! form. Imports trust the export's guid/model linkage; tags and guids are
//! not re-derived, only the mechanical shell is reconstructed, with fresh
//! build uuids so the imported tree is a new namespace.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    path::PathBuf,
    sync::OnceLock,
};

use serde::Serialize;
use serde_json::{
    json,
    Map,
    Value,
};
use uuid::Uuid;

use crate::{
    core::DecksmithError,
    guid,
    persistence,
    source::{
        self,
        ModelDefinition,
        ModelTemplate,
        MEDIA_DIR,
    },
};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// The exported deck directory (containing `<name>.json` or `deck.json`).
    pub path: PathBuf,
    /// The source tree to (re)create.
    pub target_dir: PathBuf,
    /// Overrides the deck name recorded in the export.
    pub deck: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImportedNote {
    model: String,
    fields: BTreeMap<String, String>,
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ImportedModelsFile {
    models: Vec<ModelDefinition>,
}

#[derive(Debug, Serialize)]
struct ImportedDataFile {
    notes: Vec<ImportedNote>,
}

/// Copies only the named keys that are present.
fn slice(map: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    let mut result = Map::new();
    for key in keys {
        if let Some(value) = map.get(*key) {
            result.insert((*key).to_string(), value.clone());
        }
    }
    result
}

fn model_id_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[^0-9A-Za-z_]+").expect("valid model id pattern"))
}

/// Sanitizes a model display name into a unique source-side model id.
fn make_model_id(model_name: &str, known_ids: &HashMap<String, ModelDefinition>) -> String {
    let lowered = model_name.trim().to_lowercase();
    let mut base = model_id_re().replace_all(&lowered, "_").trim_matches('_').to_string();
    if base.is_empty() {
        base = "model".to_string();
    }

    let mut model_id = base.clone();
    let mut idx = 2;
    while known_ids.contains_key(&model_id) {
        model_id = format!("{}_{}", base, idx);
        idx += 1;
    }
    model_id
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn string_or_default(map: &Map<String, Value>, key: &str) -> String {
    str_field(map, key).unwrap_or_default().to_string()
}

fn note_label(note: &Map<String, Value>) -> String {
    str_field(note, "guid").unwrap_or("<missing-guid>").to_string()
}

fn tags_from_value(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::String(text)) => {
            text.split(' ').filter(|t| !t.is_empty()).map(String::from).collect()
        }
        _ => Vec::new(),
    }
}

pub fn import_deck(opts: &ImportOptions) -> Result<(), DecksmithError> {
    let basename = opts
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DecksmithError::document(&opts.path, "not a deck directory"))?;
    let mut deck_file = opts.path.join(format!("{}.json", basename));
    if !deck_file.is_file() {
        deck_file = opts.path.join("deck.json");
    }
    let deck_data = persistence::load_json_map(&deck_file, true)?;

    let configurations = deck_data
        .get("deck_configurations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let note_models =
        deck_data.get("note_models").and_then(Value::as_array).cloned().unwrap_or_default();
    if configurations.len() > 1 {
        return Err(DecksmithError::custom(
            "Multiple deck configurations per deck is not supported",
        ));
    }
    if configurations.is_empty() || note_models.is_empty() {
        return Err(DecksmithError::custom(
            "Decks with empty models or configurations are not supported. Try adding one card in your deck.",
        ));
    }

    persistence::prepare_dir(&opts.target_dir)?;

    let deck_build_uuid = Uuid::new_v4().to_string();

    let mut deck_info = slice(&deck_data, &["dyn", "extendNew", "extendRev"]);
    deck_info.insert("children".to_string(), json!([]));
    persistence::write_json_pretty(&opts.target_dir.join("deck.json"), &deck_info)?;

    let configuration = configurations[0]
        .as_object()
        .ok_or_else(|| DecksmithError::document(&deck_file, "invalid deck configuration"))?;
    let config_build_uuid = Uuid::new_v4().to_string();
    let config_name = string_or_default(configuration, "name");
    let configuration_info = slice(
        configuration,
        &["autoplay", "dyn", "lapse", "maxTaken", "new", "replayq", "rev", "timer"],
    );
    persistence::write_json_pretty(&opts.target_dir.join("config.json"), &configuration_info)?;

    persistence::write_text(
        &opts.target_dir.join("desc.html"),
        &string_or_default(&deck_data, "desc"),
    )?;

    let mut models_data: Vec<ModelDefinition> = Vec::new();
    let mut model_uuid_to_id: HashMap<String, String> = HashMap::new();
    let mut model_by_id: HashMap<String, ModelDefinition> = HashMap::new();
    for model in &note_models {
        let model = model
            .as_object()
            .ok_or_else(|| DecksmithError::document(&deck_file, "invalid note model"))?;
        let name = str_field(model, "name").unwrap_or("model").to_string();
        let model_id = make_model_id(&name, &model_by_id);
        let build_uuid = Uuid::new_v4().to_string();

        let exported_uuid = str_field(model, "crowdanki_uuid").ok_or_else(|| {
            DecksmithError::custom(format!("Model '{}' is missing crowdanki_uuid.", name))
        })?;
        model_uuid_to_id.insert(exported_uuid.to_string(), model_id.clone());

        let mut info = slice(model, &["latexPost", "latexPre", "type", "vers"]);
        info.entry("vers".to_string()).or_insert_with(|| json!([]));

        let mut fields = Vec::new();
        for field in model.get("flds").and_then(Value::as_array).into_iter().flatten() {
            let field_name = field
                .as_object()
                .and_then(|f| str_field(f, "name"))
                .ok_or_else(|| DecksmithError::document(&deck_file, "invalid field entry"))?;
            source::check_field_name(field_name)?;
            fields.push(field_name.trim().to_string());
        }

        let mut templates = Vec::new();
        for template in model.get("tmpls").and_then(Value::as_array).into_iter().flatten() {
            let template = template
                .as_object()
                .ok_or_else(|| DecksmithError::document(&deck_file, "invalid template entry"))?;
            templates.push(ModelTemplate {
                name: string_or_default(template, "name"),
                qfmt: string_or_default(template, "qfmt"),
                afmt: string_or_default(template, "afmt"),
                bqfmt: string_or_default(template, "bqfmt"),
                bafmt: string_or_default(template, "bafmt"),
                did: template.get("did").filter(|d| !d.is_null()).cloned(),
            });
        }

        let definition = ModelDefinition {
            id: model_id.clone(),
            name,
            uuid: build_uuid,
            info,
            fields,
            templates,
            css: string_or_default(model, "css"),
        };
        models_data.push(definition.clone());
        model_by_id.insert(model_id, definition);
    }
    persistence::write_yaml(
        &opts.target_dir.join(source::MODELS_FILE),
        &ImportedModelsFile { models: models_data },
    )?;

    persistence::write_text(
        &opts.target_dir.join(crate::config::PROJECT_CONFIG_FILE),
        "crawl:\n  root: .\n  include:\n    - '**/data.yaml'\n  exclude:\n    - 'build/**'\n",
    )?;

    let rel_data_file = "data.yaml";
    let mut notes_data = Vec::new();
    let mut guid_map: HashMap<String, String> = HashMap::new();
    for (i, note) in
        deck_data.get("notes").and_then(Value::as_array).into_iter().flatten().enumerate()
    {
        let note = note
            .as_object()
            .ok_or_else(|| DecksmithError::document(&deck_file, "invalid note entry"))?;
        let model_uuid = str_field(note, "note_model_uuid").unwrap_or_default();
        let model_id = model_uuid_to_id.get(model_uuid).ok_or_else(|| {
            DecksmithError::custom(format!(
                "Cannot find note model for note: {}",
                note_label(note)
            ))
        })?;
        let model = &model_by_id[model_id];

        let values = note.get("fields").and_then(Value::as_array).cloned().unwrap_or_default();
        if values.len() != model.fields.len() {
            return Err(DecksmithError::custom(format!(
                "Field count mismatch for note '{}' in model '{}'. Expected {} fields, got {}.",
                note_label(note),
                model.name,
                model.fields.len(),
                values.len()
            )));
        }
        let mut fields_data = BTreeMap::new();
        for (field_name, value) in model.fields.iter().zip(&values) {
            let value = value.as_str().ok_or_else(|| {
                DecksmithError::custom(format!(
                    "Non-string field value on note '{}'.",
                    note_label(note)
                ))
            })?;
            fields_data.insert(field_name.clone(), value.to_string());
        }

        let exported_guid = str_field(note, "guid").ok_or_else(|| {
            DecksmithError::custom(format!("Note #{} is missing its guid.", i))
        })?;
        guid_map.insert(
            format!("idx:{}#{}", rel_data_file, i),
            guid::decode_guid(exported_guid, &model.uuid)?,
        );

        notes_data.push(ImportedNote {
            model: model_id.clone(),
            fields: fields_data,
            tags: tags_from_value(note.get("tags")),
        });
    }
    persistence::write_yaml(
        &opts.target_dir.join(rel_data_file),
        &ImportedDataFile { notes: notes_data },
    )?;
    guid::write_guid_map(&opts.target_dir.join(guid::GUID_MAP_FILE), &guid_map)?;

    let media_out = opts.target_dir.join(MEDIA_DIR);
    persistence::prepare_dir(&media_out)?;
    for media_file in
        deck_data.get("media_files").and_then(Value::as_array).into_iter().flatten()
    {
        let Some(name) = media_file.as_str() else {
            continue;
        };
        persistence::copy_file(
            &opts.path.join(MEDIA_DIR).join(name),
            &media_out.join(name),
        )?;
    }

    let deck_name = match &opts.deck {
        Some(name) => name.clone(),
        None => str_field(&deck_data, "name")
            .ok_or_else(|| DecksmithError::document(&deck_file, "deck has no name"))?
            .to_string(),
    };
    let deck_dir =
        opts.target_dir.join(source::DECKS_DIR).join(source::deck_to_filename(&deck_name));
    persistence::prepare_dir(&deck_dir)?;

    let mut build_models = Map::new();
    for model in model_by_id.values() {
        build_models.insert(
            model.id.clone(),
            json!({ "uuid": model.uuid, "name": model.name }),
        );
    }
    let build_info = json!({
        "deck": { "uuid": deck_build_uuid },
        "config": { "uuid": config_build_uuid, "name": config_name },
        "models": build_models,
    });
    persistence::write_json_pretty(&deck_dir.join("build.json"), &build_info)?;

    println!("Created deck: {}", deck_name);
    Ok(())
}
