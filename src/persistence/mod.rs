//! Structured-document I/O shared by the build and import pipelines. Every
//! loader reports the offending file path so failures are locatable.

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use serde::{
    de::DeserializeOwned,
    Serialize,
};

use crate::core::DecksmithError;

/// Loads a YAML document, or `None` when the file is absent and not required.
pub fn load_yaml<T: DeserializeOwned>(
    path: &Path,
    required: bool,
) -> Result<Option<T>, DecksmithError> {
    match read_text(path, required)? {
        Some(text) => {
            let value = serde_yaml::from_str(&text)
                .map_err(|e| DecksmithError::document(path, e))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Loads a JSON document, or `None` when the file is absent and not required.
pub fn load_json<T: DeserializeOwned>(
    path: &Path,
    required: bool,
) -> Result<Option<T>, DecksmithError> {
    match read_text(path, required)? {
        Some(text) => {
            let value = serde_json::from_str(&text)
                .map_err(|e| DecksmithError::document(path, e))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Loads a JSON object, defaulting to an empty map when the file is absent
/// (or, permissively, not an object) and not required.
pub fn load_json_map(
    path: &Path,
    required: bool,
) -> Result<serde_json::Map<String, serde_json::Value>, DecksmithError> {
    match load_json::<serde_json::Value>(path, required)? {
        Some(serde_json::Value::Object(map)) => Ok(map),
        Some(_) if required => {
            Err(DecksmithError::document(path, "expected a top-level object"))
        }
        _ => Ok(serde_json::Map::new()),
    }
}

pub fn read_required_text(path: &Path) -> Result<String, DecksmithError> {
    if !path.is_file() {
        return Err(DecksmithError::document(path, "file not found"));
    }
    fs::read_to_string(path).map_err(|e| DecksmithError::document(path, e))
}

pub fn read_text(path: &Path, required: bool) -> Result<Option<String>, DecksmithError> {
    if !path.is_file() {
        if required {
            return Err(DecksmithError::document(path, "file not found"));
        }
        return Ok(None);
    }
    fs::read_to_string(path).map(Some).map_err(|e| DecksmithError::document(path, e))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<(), DecksmithError> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| DecksmithError::document(path, e))
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), DecksmithError> {
    let text = serde_yaml::to_string(value)?;
    fs::write(path, text).map_err(|e| DecksmithError::document(path, e))
}

pub fn write_text(path: &Path, text: &str) -> Result<(), DecksmithError> {
    fs::write(path, text).map_err(|e| DecksmithError::document(path, e))
}

/// Creates the directory and any missing parents. Idempotent.
pub fn prepare_dir(path: &Path) -> Result<(), DecksmithError> {
    fs::create_dir_all(path).map_err(|e| DecksmithError::document(path, e))
}

/// Names of the regular files directly inside `dir`, sorted. An absent
/// directory yields an empty list.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>, DecksmithError> {
    list_dir_entries(dir, |path| path.is_file())
}

/// Names of the subdirectories directly inside `dir`, sorted.
pub fn list_dir_names(dir: &Path) -> Result<Vec<String>, DecksmithError> {
    list_dir_entries(dir, |path| path.is_dir())
}

fn list_dir_entries(
    dir: &Path,
    keep: impl Fn(&PathBuf) -> bool,
) -> Result<Vec<String>, DecksmithError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| DecksmithError::document(dir, e))? {
        let entry = entry.map_err(|e| DecksmithError::document(dir, e))?;
        let path = entry.path();
        if !keep(&path) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(_) => {
                return Err(DecksmithError::document(&path, "non-UTF-8 file name"));
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn copy_file(from: &Path, to: &Path) -> Result<(), DecksmithError> {
    fs::copy(from, to).map(|_| ()).map_err(|e| DecksmithError::document(from, e))
}
