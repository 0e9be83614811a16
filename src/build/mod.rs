//! The deck build pipeline: one pass per (deck × language) over a static
//! snapshot of the source tree, producing a CrowdAnki export directory per
//! pass. Any validation failure aborts the build before the failing
//! combination writes output; already-written combinations are left as-is.

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

use serde_json::{
    json,
    Map,
    Value,
};

use crate::{
    config::{
        self,
        PathTagsConfig,
    },
    core::DecksmithError,
    guid,
    persistence,
    source::{
        self,
        DeckDescriptor,
        ModelDefinition,
        ModelSet,
        NoteEntry,
        DECKS_DIR,
        DEFAULT_LANG,
        MEDIA_DIR,
    },
    tags,
};

pub const DEFAULT_BUILD_DIR: &str = "build";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub decks: Vec<String>,
    pub lang: Option<String>,
    pub src_dir: PathBuf,
    pub build_dir: Option<PathBuf>,
}

/// Everything read once up front and shared by every deck × language pass.
struct Globals {
    deck: Map<String, Value>,
    config: Map<String, Value>,
    media: Vec<String>,
    models: ModelSet,
    desc: String,
}

/// Applies partial-object overlays left to right; later sources win per key.
fn apply_overlays(target: &mut Map<String, Value>, overlays: &[&Map<String, Value>]) {
    for overlay in overlays {
        for (key, value) in overlay.iter() {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Field values are scanned for known media filenames as substrings; order is
/// first-seen across values.
fn collect_note_media(media_files: &[String], values: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();
    for value in values {
        if value.is_empty() {
            continue;
        }
        for media_file in media_files {
            if seen.contains(media_file.as_str()) {
                continue;
            }
            if value.contains(media_file.as_str()) {
                seen.insert(media_file.clone());
                result.push(media_file.clone());
            }
        }
    }
    result
}

fn field_descriptor(name: &str, ord: usize) -> Value {
    json!({
        "name": name,
        "ord": ord,
        "font": "Arial",
        "media": [],
        "rtl": false,
        "size": 20,
        "sticky": false,
    })
}

/// One exported `note_models` entry: the model's field/template metadata
/// under the deck-local uuid and display name, with the model's passthrough
/// `info` merged verbatim on top.
fn note_model_descriptor(model: &ModelDefinition, model_uuid: &str, model_name: &str) -> Value {
    let flds: Vec<Value> =
        model.fields.iter().enumerate().map(|(ord, name)| field_descriptor(name, ord)).collect();

    let tmpls: Vec<Value> = model
        .templates
        .iter()
        .enumerate()
        .map(|(ord, template)| {
            json!({
                "name": template.name,
                "qfmt": template.qfmt,
                "afmt": template.afmt,
                "bqfmt": template.bqfmt,
                "bafmt": template.bafmt,
                "did": template.did.clone().unwrap_or(Value::Null),
                "ord": ord,
            })
        })
        .collect();

    let mut data = Map::new();
    data.insert("__type__".to_string(), json!("NoteModel"));
    data.insert("crowdanki_uuid".to_string(), json!(model_uuid));
    data.insert("name".to_string(), json!(model_name));
    data.insert("flds".to_string(), Value::Array(flds));
    data.insert("tmpls".to_string(), Value::Array(tmpls));
    data.insert("css".to_string(), json!(model.css));
    apply_overlays(&mut data, &[&model.info]);
    data.entry("vers".to_string()).or_insert_with(|| json!([]));
    Value::Object(data)
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Runs the whole build: crawl, guid assignment, then one export per
/// requested deck and language.
pub fn build(opts: &BuildOptions) -> Result<(), DecksmithError> {
    let project = config::load_project_config(&opts.src_dir)?;
    let mut notes = source::load_notes(&project)?;
    let assignment = guid::assign_note_guids(&mut notes, &opts.src_dir, false)?;
    if assignment.changed {
        println!("Updated guid map: {}", file_name(&assignment.path));
    }

    let globals = Globals {
        deck: persistence::load_json_map(&opts.src_dir.join("deck.json"), true)?,
        config: persistence::load_json_map(&opts.src_dir.join("config.json"), true)?,
        media: persistence::list_file_names(&opts.src_dir.join(MEDIA_DIR))?,
        models: source::load_models(&opts.src_dir)?,
        desc: persistence::read_required_text(&opts.src_dir.join("desc.html"))?,
    };

    let mut languages = source::supported_languages(&notes);
    if let Some(lang) = &opts.lang {
        if !languages.contains(lang) {
            return Err(DecksmithError::custom(format!("Language '{}' is not available.", lang)));
        }
        languages = vec![lang.clone()];
    }

    let decks = source::read_decks(&opts.decks, &opts.src_dir.join(DECKS_DIR))?;
    let build_dir =
        opts.build_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR));

    for language in &languages {
        for deck in &decks {
            println!("Building deck: {} (Language: {})", deck.dir_name, language);
            build_deck(
                &opts.src_dir,
                &build_dir,
                deck,
                language,
                &globals,
                project.path_tags.as_ref(),
                &notes,
            )?;
        }
    }
    Ok(())
}

fn build_deck(
    src_dir: &Path,
    build_dir: &Path,
    deck: &DeckDescriptor,
    language: &str,
    globals: &Globals,
    path_tags: Option<&PathTagsConfig>,
    notes: &[NoteEntry],
) -> Result<(), DecksmithError> {
    let deck_uuid = guid::language_scoped_uuid(&deck.deck_uuid, language)?;
    let config_uuid = guid::language_scoped_uuid(&deck.config_uuid, language)?;

    let bindings = source::resolve_deck_models(deck, &globals.models)?;
    let mut localized_model_uuids: HashMap<String, String> = HashMap::new();
    for binding in &bindings {
        localized_model_uuids.insert(
            binding.model_id.clone(),
            guid::language_scoped_uuid(&binding.uuid, language)?,
        );
    }

    // Deck metadata: built-in defaults, then global deck.json, then the
    // deck-local override block.
    let localized_name = if language == DEFAULT_LANG {
        deck.dir_name.clone()
    } else {
        format!("{}[{}]", deck.dir_name, language)
    };
    let mut deck_data = Map::new();
    deck_data.insert("__type__".to_string(), json!("Deck"));
    deck_data.insert("crowdanki_uuid".to_string(), json!(deck_uuid));
    deck_data.insert("name".to_string(), json!(source::filename_to_deck(&localized_name)));
    // A non-empty deck-local description replaces the global one entirely.
    let desc = deck
        .description
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or(&globals.desc);
    deck_data.insert("desc".to_string(), json!(desc));
    apply_overlays(&mut deck_data, &[&globals.deck, &deck.deck_overrides]);

    let mut config_data = Map::new();
    config_data.insert("__type__".to_string(), json!("DeckConfig"));
    config_data.insert("crowdanki_uuid".to_string(), json!(config_uuid));
    config_data.insert("name".to_string(), json!(deck.config_name));
    apply_overlays(&mut config_data, &[&globals.config, &deck.config_overrides]);
    deck_data
        .insert("deck_configurations".to_string(), json!([Value::Object(config_data)]));
    deck_data.insert("deck_config_uuid".to_string(), json!(config_uuid));

    let note_models: Vec<Value> = bindings
        .iter()
        .map(|binding| {
            let model = globals.models.get(&binding.model_id).ok_or_else(|| {
                DecksmithError::custom(format!("Model '{}' vanished mid-build", binding.model_id))
            })?;
            Ok(note_model_descriptor(
                model,
                &localized_model_uuids[&binding.model_id],
                &binding.name,
            ))
        })
        .collect::<Result<_, DecksmithError>>()?;
    deck_data.insert("note_models".to_string(), Value::Array(note_models));

    let mut deck_notes = Vec::new();
    let mut deck_media: Vec<String> = Vec::new();
    let mut seen_media = HashSet::new();
    let mut seen_guids = HashSet::new();

    for entry in notes {
        let model_id = entry.note.model.as_deref().unwrap_or("");
        let Some(model) = globals.models.get(model_id) else {
            return Err(DecksmithError::UnknownModel {
                note: entry.reference(),
                model: model_id.to_string(),
            });
        };
        let Some(model_uuid) = localized_model_uuids.get(model_id) else {
            return Err(DecksmithError::ModelNotEnabled {
                note: entry.reference(),
                model: model_id.to_string(),
                deck: deck.dir_name.clone(),
            });
        };

        let fields = source::project_fields(entry, model, language)?;

        for media_file in collect_note_media(&globals.media, &fields) {
            if seen_media.insert(media_file.clone()) {
                deck_media.push(media_file);
            }
        }

        let note_tags = match path_tags {
            Some(schema) => tags::merge_tags([
                entry.note.tags.clone(),
                tags::derive_tags_from_path(&entry.source_rel_dir, schema)?,
            ]),
            None => entry.note.tags.clone(),
        };

        let token = entry.guid.as_deref().ok_or_else(|| {
            DecksmithError::custom(format!("Note '{}' has no assigned guid", entry.reference()))
        })?;
        let final_guid = guid::encode_guid(token, model_uuid)?;
        if !seen_guids.insert(final_guid.clone()) {
            return Err(DecksmithError::DuplicateGuid(entry.reference()));
        }

        deck_notes.push(json!({
            "__type__": "Note",
            "data": "",
            "fields": fields,
            "flags": 0,
            "guid": final_guid,
            "note_model_uuid": model_uuid,
            "tags": note_tags,
        }));
    }

    deck_data.insert("media_files".to_string(), json!(deck_media));
    deck_data.insert("notes".to_string(), Value::Array(deck_notes));

    // All validation passed; only now touch the output directory.
    let localized_deck = if language == DEFAULT_LANG {
        deck.dir_name.clone()
    } else {
        format!("{}_{}", deck.dir_name, language)
    };
    let deck_dir = build_dir.join(&localized_deck);
    persistence::prepare_dir(&deck_dir)?;
    persistence::write_json_pretty(
        &deck_dir.join(format!("{}.json", localized_deck)),
        &Value::Object(deck_data),
    )?;

    let media_out = deck_dir.join(MEDIA_DIR);
    persistence::prepare_dir(&media_out)?;
    for media_file in &deck_media {
        persistence::copy_file(
            &src_dir.join(MEDIA_DIR).join(media_file),
            &media_out.join(media_file),
        )?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn overlays_apply_left_to_right() {
        let mut target = Map::new();
        target.insert("a".to_string(), json!(1));
        target.insert("b".to_string(), json!(1));
        target.insert("c".to_string(), json!(1));

        let mut global = Map::new();
        global.insert("b".to_string(), json!(2));
        global.insert("c".to_string(), json!(2));
        let mut local = Map::new();
        local.insert("c".to_string(), json!(3));

        apply_overlays(&mut target, &[&global, &local]);
        assert_eq!(target["a"], json!(1));
        assert_eq!(target["b"], json!(2));
        assert_eq!(target["c"], json!(3));
    }

    #[test]
    fn media_collected_in_first_seen_order() {
        let media = vec!["a.png".to_string(), "b.png".to_string()];
        let values =
            vec!["see b.png here".to_string(), "a.png and b.png again".to_string()];
        assert_eq!(collect_note_media(&media, &values), vec!["b.png", "a.png"]);
        assert!(collect_note_media(&media, &["plain text".to_string()]).is_empty());
    }

    #[test]
    fn note_model_descriptor_orders_and_merges_info() {
        let mut info = Map::new();
        info.insert("latexPre".to_string(), json!("\\begin{document}"));
        let model = ModelDefinition {
            id: "basic".to_string(),
            name: "Basic".to_string(),
            uuid: "11111111-1111-4111-8111-111111111111".to_string(),
            info,
            fields: vec!["Front".to_string(), "Back".to_string()],
            templates: vec![crate::source::ModelTemplate {
                name: "Card 1".to_string(),
                qfmt: "{{Front}}".to_string(),
                afmt: "{{Back}}".to_string(),
                bqfmt: String::new(),
                bafmt: String::new(),
                did: None,
            }],
            css: ".card {}".to_string(),
        };

        let descriptor =
            note_model_descriptor(&model, "22222222-2222-4222-8222-222222222222", "Basic (fr)");
        assert_eq!(descriptor["__type__"], json!("NoteModel"));
        assert_eq!(descriptor["name"], json!("Basic (fr)"));
        assert_eq!(descriptor["flds"][0]["ord"], json!(0));
        assert_eq!(descriptor["flds"][1]["ord"], json!(1));
        assert_eq!(descriptor["flds"][1]["name"], json!("Back"));
        assert_eq!(descriptor["tmpls"][0]["ord"], json!(0));
        assert_eq!(descriptor["latexPre"], json!("\\begin{document}"));
        assert_eq!(descriptor["vers"], json!([]));
    }

    pub(crate) fn write_fixture_tree(src: &Path) {
        fs::create_dir_all(src.join("math/algebra")).unwrap();
        fs::create_dir_all(src.join("decks/main")).unwrap();
        fs::create_dir_all(src.join("media")).unwrap();

        fs::write(
            src.join("decksmith.yaml"),
            "crawl:\n  root: .\n  include: '**/data.yaml'\npath_tags:\n  levels:\n    - name: subject\n      index: 0\n  include_other_segments: true\n",
        )
        .unwrap();
        fs::write(
            src.join("models.yaml"),
            concat!(
                "models:\n",
                "  - id: basic\n",
                "    name: Basic\n",
                "    uuid: 11111111-1111-4111-8111-111111111111\n",
                "    fields: [Front, Back]\n",
                "    templates:\n",
                "      - name: Card 1\n",
                "        qfmt: '{{Front}}'\n",
                "        afmt: '{{Back}}'\n",
            ),
        )
        .unwrap();
        fs::write(src.join("deck.json"), "{\"dyn\": 0, \"extendNew\": 10}").unwrap();
        fs::write(src.join("config.json"), "{\"autoplay\": true}").unwrap();
        fs::write(src.join("desc.html"), "A test deck").unwrap();
        fs::write(src.join("media/img.png"), b"png").unwrap();
        fs::write(
            src.join("decks/main/build.json"),
            concat!(
                "{\"deck\": {\"uuid\": \"33333333-3333-4333-8333-333333333333\"},\n",
                " \"config\": {\"uuid\": \"44444444-4444-4444-8444-444444444444\", \"name\": \"Default\"},\n",
                " \"models\": {\"basic\": {\"uuid\": \"55555555-5555-4555-8555-555555555555\"}}}",
            ),
        )
        .unwrap();
        fs::write(
            src.join("math/algebra/data.yaml"),
            concat!(
                "notes:\n",
                "  - model: basic\n",
                "    fields:\n",
                "      Front: What is x? <img src=\"img.png\">\n",
                "      Back: An unknown\n",
                "    fields_by_lang:\n",
                "      fr:\n",
                "        Front: Quel est x?\n",
                "    tags: [declared]\n",
                "  - model: basic\n",
                "    fields:\n",
                "      Front: Second question\n",
                "      Back: Second answer\n",
            ),
        )
        .unwrap();
    }

    fn read_deck_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn end_to_end_default_build() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        write_fixture_tree(&src);

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src.clone(),
            build_dir: Some(out.clone()),
        };
        build(&opts).unwrap();

        let deck = read_deck_json(&out.join("main/main.json"));
        assert_eq!(deck["__type__"], json!("Deck"));
        assert_eq!(deck["name"], json!("main"));
        assert_eq!(deck["desc"], json!("A test deck"));
        assert_eq!(deck["extendNew"], json!(10));
        assert_eq!(deck["deck_configurations"][0]["autoplay"], json!(true));
        assert_eq!(deck["deck_configurations"][0]["name"], json!("Default"));
        assert_eq!(deck["deck_config_uuid"], deck["deck_configurations"][0]["crowdanki_uuid"]);
        assert_eq!(deck["media_files"], json!(["img.png"]));
        assert!(out.join("main/media/img.png").is_file());

        let notes = deck["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0]["fields"][1], json!("An unknown"));
        assert_eq!(notes[0]["tags"], json!(["declared", "math", "algebra"]));
        assert_eq!(notes[1]["tags"], json!(["math", "algebra"]));
        assert_eq!(notes[0]["note_model_uuid"], json!("55555555-5555-4555-8555-555555555555"));
        assert_ne!(notes[0]["guid"], notes[1]["guid"]);
        assert_eq!(notes[0]["guid"].as_str().unwrap().len(), crate::guid::GUID_LEN);

        assert!(src.join("guid-map.yaml").is_file());
    }

    #[test]
    fn language_pass_localizes_fields_name_and_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        write_fixture_tree(&src);

        let opts = BuildOptions {
            decks: vec!["main".to_string()],
            lang: None,
            src_dir: src.clone(),
            build_dir: Some(out.clone()),
        };
        build(&opts).unwrap();

        let default_deck = read_deck_json(&out.join("main/main.json"));
        let fr_deck = read_deck_json(&out.join("main_fr/main_fr.json"));

        assert_eq!(fr_deck["name"], json!("main[fr]"));
        let fr_notes = fr_deck["notes"].as_array().unwrap();
        assert_eq!(fr_notes[0]["fields"][0], json!("Quel est x?"));
        // Override is per-field; Back keeps the base value.
        assert_eq!(fr_notes[0]["fields"][1], json!("An unknown"));
        assert_ne!(fr_deck["crowdanki_uuid"], default_deck["crowdanki_uuid"]);
        assert_ne!(
            fr_notes[0]["note_model_uuid"],
            default_deck["notes"][0]["note_model_uuid"]
        );
        // Same short token, different namespace, different final guid.
        assert_ne!(fr_notes[0]["guid"], default_deck["notes"][0]["guid"]);
    }

    #[test]
    fn rebuild_reuses_guids() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_fixture_tree(&src);

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src.clone(),
            build_dir: Some(dir.path().join("out1")),
        };
        build(&opts).unwrap();
        let first = fs::read_to_string(src.join("guid-map.yaml")).unwrap();

        let opts =
            BuildOptions { build_dir: Some(dir.path().join("out2")), ..opts };
        build(&opts).unwrap();
        let second = fs::read_to_string(src.join("guid-map.yaml")).unwrap();
        assert_eq!(first, second);

        let a = read_deck_json(&dir.path().join("out1/main/main.json"));
        let b = read_deck_json(&dir.path().join("out2/main/main.json"));
        assert_eq!(a["notes"][0]["guid"], b["notes"][0]["guid"]);
    }

    #[test]
    fn empty_deck_description_falls_back_to_global() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        write_fixture_tree(&src);
        fs::write(src.join("decks/main/info.html"), "").unwrap();

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src.clone(),
            build_dir: Some(out.clone()),
        };
        build(&opts).unwrap();
        let deck = read_deck_json(&out.join("main/main.json"));
        assert_eq!(deck["desc"], json!("A test deck"));

        fs::write(src.join("decks/main/info.html"), "Deck-local intro").unwrap();
        build(&opts).unwrap();
        let deck = read_deck_json(&out.join("main/main.json"));
        assert_eq!(deck["desc"], json!("Deck-local intro"));
    }

    #[test]
    fn missing_global_description_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_fixture_tree(&src);
        fs::remove_file(src.join("desc.html")).unwrap();

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src,
            build_dir: Some(dir.path().join("out")),
        };
        let err = build(&opts).unwrap_err();
        assert!(err.to_string().contains("desc.html"));
    }

    #[test]
    fn missing_field_aborts_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        write_fixture_tree(&src);
        fs::write(
            src.join("math/algebra/data.yaml"),
            "notes:\n  - model: basic\n    fields:\n      Front: Only front\n",
        )
        .unwrap();

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src,
            build_dir: Some(out.clone()),
        };
        let err = build(&opts).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Back"));
        assert!(message.contains("math/algebra/data.yaml#0"));
        assert!(!out.join("main/main.json").exists());
    }

    #[test]
    fn note_model_must_be_enabled_for_deck() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_fixture_tree(&src);
        // Second model exists globally but is not enabled for the deck.
        let models = fs::read_to_string(src.join("models.yaml")).unwrap();
        let extra = concat!(
            "  - id: extra\n",
            "    name: Extra\n",
            "    uuid: 66666666-6666-4666-8666-666666666666\n",
            "    fields: [Front]\n",
            "    templates:\n",
            "      - name: Card 1\n",
            "        qfmt: '{{Front}}'\n",
            "        afmt: '{{Front}}'\n",
        );
        fs::write(src.join("models.yaml"), format!("{}{}", models, extra)).unwrap();
        fs::write(
            src.join("math/algebra/data.yaml"),
            "notes:\n  - model: extra\n    fields:\n      Front: Q\n",
        )
        .unwrap();

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some(DEFAULT_LANG.to_string()),
            src_dir: src,
            build_dir: Some(dir.path().join("out")),
        };
        let err = build(&opts).unwrap_err();
        assert!(matches!(err, DecksmithError::ModelNotEnabled { .. }));
    }

    #[test]
    fn unknown_language_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_fixture_tree(&src);

        let opts = BuildOptions {
            decks: Vec::new(),
            lang: Some("zz".to_string()),
            src_dir: src,
            build_dir: Some(dir.path().join("out")),
        };
        let err = build(&opts).unwrap_err();
        assert!(err.to_string().contains("'zz'"));
    }
}
