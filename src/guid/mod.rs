//! Stable note guid assignment and the identity-namespacing primitives.
//!
//! Each note owns an identity key derived from its source location. The key
//! maps to a short 12-character token which is persisted in `guid-map.yaml`
//! and reused on later builds so downstream review history survives rebuilds.
//! Fresh tokens come from a sha256 digest of the key, re-encoded over the
//! CrowdAnki guid alphabet; a salt advances on collision until the token is
//! unique within the pass.

use std::{
    collections::{
        BTreeMap,
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
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use uuid::Uuid;

use crate::{
    core::DecksmithError,
    persistence,
    source::{
        NoteEntry,
        DEFAULT_LANG,
    },
};

pub const GUID_MAP_FILE: &str = "guid-map.yaml";
pub const GUID_LEN: usize = 12;

/// The 91 characters Anki itself uses for note guids: letters, digits and
/// printable punctuation minus quote and backslash.
pub const GUID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#$%&()*+,-./:;<=>?@[]^_`{|}~";

/// Outcome of one assignment pass over the source tree.
#[derive(Debug)]
pub struct GuidAssignment {
    pub changed: bool,
    pub path: PathBuf,
}

/// `id:<rel>#<id>` when the note declares an explicit id, otherwise
/// `idx:<rel>#<position>`.
pub fn note_identity_key(entry: &NoteEntry) -> Result<String, DecksmithError> {
    match &entry.note.id {
        Some(id) => {
            let id = id.trim();
            if id.is_empty() {
                return Err(DecksmithError::custom(format!(
                    "Invalid note id on '{}': empty string",
                    entry.reference()
                )));
            }
            Ok(format!("id:{}#{}", entry.source_rel_file, id))
        }
        None => Ok(format!("idx:{}#{}", entry.source_rel_file, entry.note_index)),
    }
}

/// Divides the big-endian byte string in place by `radix`, returning the
/// remainder.
fn divmod_in_place(value: &mut Vec<u8>, radix: u32) -> u32 {
    let mut rem: u32 = 0;
    for byte in value.iter_mut() {
        let acc = rem * 256 + u32::from(*byte);
        *byte = (acc / radix) as u8;
        rem = acc % radix;
    }
    while value.first() == Some(&0) {
        value.remove(0);
    }
    rem
}

/// Deterministic token for an identity key. Digits are emitted in remainder
/// order (least-significant first) and the token is right-padded with the
/// alphabet's first character; existing deployments depend on this exact
/// encoding, so it must not be normalized to canonical base-N.
pub fn deterministic_token(key: &str, salt: u64) -> String {
    let seed = if salt == 0 { key.to_string() } else { format!("{}#{}", key, salt) };
    let mut value = Sha256::digest(seed.as_bytes()).to_vec();

    let radix = GUID_ALPHABET.len() as u32;
    let mut token = String::with_capacity(GUID_LEN);
    while !value.is_empty() && token.len() < GUID_LEN {
        let rem = divmod_in_place(&mut value, radix);
        token.push(GUID_ALPHABET[rem as usize] as char);
    }
    while token.len() < GUID_LEN {
        token.push(GUID_ALPHABET[0] as char);
    }
    token
}

/// First deterministic token for `key` not yet claimed in this pass.
pub fn unique_token(key: &str, claimed: &HashSet<String>) -> String {
    let mut salt = 0;
    loop {
        let token = deterministic_token(key, salt);
        if !claimed.contains(&token) {
            return token;
        }
        salt += 1;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GuidMapFile {
    guids: BTreeMap<String, String>,
}

pub fn load_guid_map(src_dir: &Path) -> Result<(HashMap<String, String>, PathBuf), DecksmithError> {
    let path = src_dir.join(GUID_MAP_FILE);
    let raw: Option<serde_yaml::Value> = persistence::load_yaml(&path, false)?;

    let Some(raw) = raw else {
        return Ok((HashMap::new(), path));
    };

    // `guids:` wrapper preferred; a bare mapping is accepted for
    // hand-maintained files.
    let mapping = match &raw {
        serde_yaml::Value::Mapping(map) => match map.get("guids") {
            Some(inner) => inner,
            None => &raw,
        },
        _ => {
            return Err(DecksmithError::document(&path, "must contain a top-level object"));
        }
    };
    let serde_yaml::Value::Mapping(mapping) = mapping else {
        return Err(DecksmithError::document(&path, "must contain a 'guids' object"));
    };

    let mut guid_map = HashMap::with_capacity(mapping.len());
    for (key, value) in mapping {
        let (Some(key), Some(value)) = (key.as_str(), value.as_str()) else {
            return Err(DecksmithError::document(&path, "guid map entries must be strings"));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(DecksmithError::document(&path, "guid map entries must be non-empty"));
        }
        guid_map.insert(key.to_string(), value.to_string());
    }
    Ok((guid_map, path))
}

pub fn write_guid_map(path: &Path, map: &HashMap<String, String>) -> Result<(), DecksmithError> {
    // Re-sorted by key so the persisted file diffs cleanly.
    let ordered: BTreeMap<String, String> =
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    persistence::write_yaml(path, &GuidMapFile { guids: ordered })
}

/// Core assignment policy over the notes of one pass, in document order.
/// Without `full_reindex`, a persisted token is reused unless another key
/// already claimed it; otherwise a fresh deterministic token is derived.
/// The returned map holds exactly the keys of this pass.
pub fn assign_tokens(
    entries: &mut [NoteEntry],
    persisted: &HashMap<String, String>,
    full_reindex: bool,
) -> Result<(HashMap<String, String>, bool), DecksmithError> {
    let mut claimed: HashSet<String> = HashSet::new();
    let mut next_map: HashMap<String, String> = HashMap::with_capacity(entries.len());
    let mut claimants: HashMap<String, String> = HashMap::with_capacity(entries.len());

    for entry in entries.iter_mut() {
        let key = note_identity_key(entry)?;
        if let Some(first) = claimants.get(&key) {
            return Err(DecksmithError::DuplicateIdentityKey {
                key,
                first: first.clone(),
                second: entry.reference(),
            });
        }
        claimants.insert(key.clone(), entry.reference());

        let reusable = (!full_reindex)
            .then(|| persisted.get(&key))
            .flatten()
            .filter(|token| !claimed.contains(*token));
        let token = match reusable {
            Some(token) => token.clone(),
            None => unique_token(&key, &claimed),
        };

        claimed.insert(token.clone());
        entry.guid = Some(token.clone());
        next_map.insert(key, token);
    }

    let changed = next_map != *persisted;
    Ok((next_map, changed))
}

/// Loads the persisted guid map, assigns tokens to every note and rewrites
/// the map if anything changed.
pub fn assign_note_guids(
    entries: &mut [NoteEntry],
    src_dir: &Path,
    full_reindex: bool,
) -> Result<GuidAssignment, DecksmithError> {
    let (persisted, path) = load_guid_map(src_dir)?;
    let (next_map, changed) = assign_tokens(entries, &persisted, full_reindex)?;
    if changed {
        write_guid_map(&path, &next_map)?;
    }
    Ok(GuidAssignment { changed, path })
}

/// Language-scoped identity for a deck, config or model uuid: the default
/// language keeps the base uuid, every other language gets a stable uuid v5
/// derived in the base uuid's namespace.
pub fn language_scoped_uuid(base_uuid: &str, lang: &str) -> Result<String, DecksmithError> {
    let base = Uuid::parse_str(base_uuid.trim())?;
    if lang == DEFAULT_LANG {
        return Ok(base.to_string());
    }
    Ok(Uuid::new_v5(&base, lang.as_bytes()).to_string())
}

fn keystream(namespace_uuid: &str) -> Vec<u8> {
    Sha256::digest(namespace_uuid.as_bytes()).to_vec()
}

fn alphabet_index(c: char, guid: &str) -> Result<usize, DecksmithError> {
    GUID_ALPHABET.iter().position(|&b| b as char == c).ok_or_else(|| {
        DecksmithError::custom(format!("Invalid guid character '{}' in '{}'", c, guid))
    })
}

/// Final exported guid for a short token within a namespace. A position-wise
/// modular shift over the guid alphabet, so each namespace maps tokens to
/// final guids bijectively.
pub fn encode_guid(token: &str, namespace_uuid: &str) -> Result<String, DecksmithError> {
    shift_guid(token, namespace_uuid, true)
}

/// Inverse of [`encode_guid`], used on import to recover the short token.
pub fn decode_guid(final_guid: &str, namespace_uuid: &str) -> Result<String, DecksmithError> {
    shift_guid(final_guid, namespace_uuid, false)
}

fn shift_guid(guid: &str, namespace_uuid: &str, forward: bool) -> Result<String, DecksmithError> {
    let key = keystream(namespace_uuid);
    let radix = GUID_ALPHABET.len();

    let mut result = String::with_capacity(guid.len());
    for (i, c) in guid.chars().enumerate() {
        let index = alphabet_index(c, guid)?;
        let offset = key[i % key.len()] as usize % radix;
        let shifted = if forward {
            (index + offset) % radix
        } else {
            (index + radix - offset) % radix
        };
        result.push(GUID_ALPHABET[shifted] as char);
    }
    Ok(result)
}
