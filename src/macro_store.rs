use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const FILE_HEADER: &str =
    "# SonosSoundHub Macros\n# Format: macro_name = speaker action args : speaker action args\n";
const DEFAULT_CONTENT: &str = "# SonosSoundHub Macros\n# Format: macro_name = speaker action args : speaker action args\n# Example: morning = Kitchen volume 40 : Kitchen play_favourite \"Radio 4\"\n\n";

static APPLE_MUSIC_TRACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https://music\.apple\.com/[^\s:]+)\?i=[0-9]+").expect("valid regex")
});
static PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(\d+)").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MacroParameter {
    pub position: u32,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub default_value: Option<String>,
}

impl MacroParameter {
    fn detected(position: u32) -> Self {
        Self {
            position,
            name: format!("Parameter {position}"),
            description: None,
            kind: "string".to_string(),
            default_value: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Macro {
    pub name: String,
    pub definition: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_favorite: bool,
    pub parameters: Vec<MacroParameter>,
}

/// One sidecar entry. Definitions live only in the text file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MacroMetadata {
    name: String,
    description: Option<String>,
    category: Option<String>,
    is_favorite: bool,
    parameters: Vec<MacroParameter>,
}

impl From<&Macro> for MacroMetadata {
    fn from(entry: &Macro) -> Self {
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            category: entry.category.clone(),
            is_favorite: entry.is_favorite,
            parameters: entry.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroFileInfo {
    pub file_path: String,
    pub file_exists: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    pub message: String,
    pub imported_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum MacroStoreError {
    #[error("macro file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("macro metadata could not be encoded: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Macro definitions in soco-cli's flat text format plus a JSON metadata sidecar.
pub struct MacroStore {
    macros_path: PathBuf,
    metadata_path: PathBuf,
    write_lock: Mutex<()>,
}

impl MacroStore {
    pub fn new(macros_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            macros_path: macros_path.into(),
            metadata_path: metadata_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn ensure_file_exists(&self) -> Result<(), MacroStoreError> {
        if let Some(dir) = self.macros_path.parent() {
            if !dir.as_os_str().is_empty() && !fs::try_exists(dir).await? {
                fs::create_dir_all(dir).await?;
                info!(dir = %dir.display(), "created data directory");
            }
        }
        if !fs::try_exists(&self.macros_path).await? {
            fs::write(&self.macros_path, DEFAULT_CONTENT).await?;
            info!(path = %self.macros_path.display(), "created default macros file");
        }
        Ok(())
    }

    pub async fn file_info(&self) -> MacroFileInfo {
        MacroFileInfo {
            file_path: self.macros_path.display().to_string(),
            file_exists: fs::try_exists(&self.macros_path).await.unwrap_or(false),
        }
    }

    pub async fn list(&self) -> Result<Vec<Macro>, MacroStoreError> {
        let content = self.export().await?;
        let metadata = self.load_metadata().await;
        let macros = parse_definitions(&content)
            .into_iter()
            .map(|(name, definition)| match metadata.get(&name) {
                Some(meta) => Macro {
                    name,
                    definition,
                    description: meta.description.clone(),
                    category: meta.category.clone(),
                    is_favorite: meta.is_favorite,
                    parameters: meta.parameters.clone(),
                },
                None => Macro {
                    parameters: detect_parameters(&definition),
                    name,
                    definition,
                    ..Macro::default()
                },
            })
            .collect();
        Ok(macros)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Macro>, MacroStoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|candidate| candidate.name.eq_ignore_ascii_case(name)))
    }

    /// Creates or replaces a macro by case-insensitive name.
    pub async fn save(&self, mut entry: Macro) -> Result<Macro, MacroStoreError> {
        let _guard = self.write_lock.lock().await;
        entry.definition = clean_share_links(&entry.definition);

        let mut macros = self.list().await?;
        macros.retain(|existing| !existing.name.eq_ignore_ascii_case(&entry.name));
        macros.push(entry.clone());
        self.persist(&mut macros).await?;
        info!(name = %entry.name, "saved macro");
        Ok(entry)
    }

    pub async fn delete(&self, name: &str) -> Result<bool, MacroStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut macros = self.list().await?;
        let before = macros.len();
        macros.retain(|existing| !existing.name.eq_ignore_ascii_case(name));
        if macros.len() == before {
            return Ok(false);
        }
        self.persist(&mut macros).await?;
        info!(name, "deleted macro");
        Ok(true)
    }

    pub async fn duplicate(&self, source_name: &str) -> Result<Option<Macro>, MacroStoreError> {
        let macros = self.list().await?;
        let Some(source) = macros
            .iter()
            .find(|candidate| candidate.name.eq_ignore_ascii_case(source_name))
        else {
            warn!(name = source_name, "source macro not found");
            return Ok(None);
        };

        let base = format!("{source_name}_copy");
        let mut name = base.clone();
        let mut counter = 1;
        while macros
            .iter()
            .any(|existing| existing.name.eq_ignore_ascii_case(&name))
        {
            counter += 1;
            name = format!("{base}_{counter}");
        }

        let copy = Macro {
            name,
            is_favorite: false,
            ..source.clone()
        };
        let saved = self.save(copy).await?;
        info!(source = source_name, copy = %saved.name, "duplicated macro");
        Ok(Some(saved))
    }

    /// Raw file content; empty when the file does not exist yet.
    pub async fn export(&self) -> Result<String, MacroStoreError> {
        match fs::read_to_string(&self.macros_path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn import(
        &self,
        content: &str,
        merge: bool,
    ) -> Result<ImportOutcome, MacroStoreError> {
        let _guard = self.write_lock.lock().await;
        let imported = parse_definitions(content);
        if imported.is_empty() {
            return Ok(ImportOutcome {
                success: false,
                message: "No valid macros found in the imported file".to_string(),
                imported_count: 0,
            });
        }

        if !merge {
            fs::write(&self.macros_path, content).await?;
            let count = imported.len();
            return Ok(ImportOutcome {
                success: true,
                message: format!("Imported {count} macros (replaced existing file)"),
                imported_count: count,
            });
        }

        let existing: Vec<String> = parse_definitions(&self.export().await?)
            .into_iter()
            .map(|(name, _)| name.to_lowercase())
            .collect();
        let new_lines: Vec<String> = imported
            .iter()
            .filter(|(name, _)| !existing.contains(&name.to_lowercase()))
            .map(|(name, definition)| format!("{name} = {definition}"))
            .collect();

        if new_lines.is_empty() {
            return Ok(ImportOutcome {
                success: true,
                message: "All macros already exist, nothing to import".to_string(),
                imported_count: 0,
            });
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.macros_path)
            .await?;
        let appended = format!("\n# Imported macros\n{}\n", new_lines.join("\n"));
        file.write_all(appended.as_bytes()).await?;
        file.flush().await?;

        let count = new_lines.len();
        Ok(ImportOutcome {
            success: true,
            message: format!(
                "Merged {count} new macros (skipped {} existing)",
                imported.len() - count
            ),
            imported_count: count,
        })
    }

    async fn persist(&self, macros: &mut [Macro]) -> Result<(), MacroStoreError> {
        macros.sort_by(|a, b| a.name.cmp(&b.name));
        fs::write(&self.macros_path, render_file(macros)).await?;
        let metadata: Vec<MacroMetadata> = macros.iter().map(MacroMetadata::from).collect();
        let metadata = serde_json::to_string_pretty(&metadata)?;
        fs::write(&self.metadata_path, metadata).await?;
        Ok(())
    }

    async fn load_metadata(&self) -> HashMap<String, MacroMetadata> {
        let content = match fs::read_to_string(&self.metadata_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                error!(error = %err, "failed to read macro metadata");
                return HashMap::new();
            }
        };
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Array(entries)) => index_metadata(entries),
            Ok(_) => HashMap::new(),
            Err(err) => {
                error!(error = %err, "failed to parse macro metadata");
                HashMap::new()
            }
        }
    }
}

fn index_metadata(entries: Vec<serde_json::Value>) -> HashMap<String, MacroMetadata> {
    let mut indexed = HashMap::new();
    for entry in entries {
        let Ok(meta) = serde_json::from_value::<MacroMetadata>(entry) else {
            continue;
        };
        if meta.name.is_empty() {
            continue;
        }
        indexed.entry(meta.name.clone()).or_insert(meta);
    }
    indexed
}

fn render_file(macros: &[Macro]) -> String {
    let mut content = format!("{FILE_HEADER}\n");
    for entry in macros {
        if let Some(description) = entry.description.as_deref().filter(|d| !d.is_empty()) {
            content.push_str(&format!("# {description}\n"));
        }
        content.push_str(&format!("{} = {}\n\n", entry.name, entry.definition));
    }
    content
}

/// `name = definition` pairs in file order; a repeated name keeps its first position.
pub fn parse_definitions(content: &str) -> Vec<(String, String)> {
    let mut parsed: Vec<(String, String)> = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, definition)) = line.split_once('=') else {
            continue;
        };
        let (name, definition) = (name.trim(), definition.trim());
        if name.is_empty() || definition.is_empty() {
            continue;
        }
        match parsed.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = definition.to_string(),
            None => parsed.push((name.to_string(), definition.to_string())),
        }
    }
    parsed
}

/// Finds `%N` placeholders, one parameter per distinct position.
pub fn detect_parameters(definition: &str) -> Vec<MacroParameter> {
    let mut positions: Vec<u32> = PARAMETER
        .captures_iter(definition)
        .filter_map(|captures| captures[1].parse().ok())
        .collect();
    positions.sort_unstable();
    positions.dedup();
    positions.into_iter().map(MacroParameter::detected).collect()
}

/// Drops the track-specific `?i=` suffix from Apple Music share links.
pub fn clean_share_links(definition: &str) -> String {
    APPLE_MUSIC_TRACK.replace_all(definition, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn store_in(dir: &Path) -> MacroStore {
        MacroStore::new(dir.join("data/macros.txt"), dir.join("data/macros-metadata.json"))
    }

    fn named(name: &str, definition: &str) -> Macro {
        Macro {
            name: name.to_string(),
            definition: definition.to_string(),
            ..Macro::default()
        }
    }

    #[tokio::test]
    async fn creates_default_file_with_no_macros() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();

        assert!(store.file_info().await.file_exists);
        assert!(store.export().await.unwrap().contains("# Example"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_case_insensitively_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();

        store.save(named("zebra", "Den play")).await.unwrap();
        store
            .save(Macro {
                description: Some("wake up".to_string()),
                ..named("Morning", "Kitchen volume 40")
            })
            .await
            .unwrap();
        store.save(named("morning", "Kitchen volume 20")).await.unwrap();

        let macros = store.list().await.unwrap();
        let names: Vec<&str> = macros.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["morning", "zebra"]);
        assert_eq!(macros[0].definition, "Kitchen volume 20");

        let file = store.export().await.unwrap();
        assert!(file.find("morning =").unwrap() < file.find("zebra =").unwrap());
    }

    #[tokio::test]
    async fn metadata_round_trips_through_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();

        let entry = Macro {
            description: Some("Evening radio".to_string()),
            category: Some("radio".to_string()),
            is_favorite: true,
            parameters: vec![MacroParameter {
                position: 1,
                name: "Room".to_string(),
                description: None,
                kind: "speaker".to_string(),
                default_value: Some("Kitchen".to_string()),
            }],
            ..named("evening", "%1 play_favourite \"Radio 4\"")
        };
        store.save(entry.clone()).await.unwrap();

        let loaded = store.get("EVENING").await.unwrap().unwrap();
        assert_eq!(loaded, entry);
        let file = store.export().await.unwrap();
        assert!(file.contains("# Evening radio\nevening = "));
    }

    #[tokio::test]
    async fn sidecar_holds_metadata_but_not_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store
            .save(Macro {
                is_favorite: true,
                ..named("wake", "Kitchen volume 40")
            })
            .await
            .unwrap();

        let sidecar = fs::read_to_string(dir.path().join("data/macros-metadata.json"))
            .await
            .unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "wake");
        assert_eq!(entries[0]["isFavorite"], true);
        assert!(entries[0].get("definition").is_none());
        assert!(!sidecar.contains("Kitchen volume 40"));
    }

    #[tokio::test]
    async fn legacy_sidecar_definitions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store.save(named("wake", "Kitchen volume 40")).await.unwrap();
        fs::write(
            dir.path().join("data/macros-metadata.json"),
            r#"[{"name": "wake", "definition": "Den stop", "category": "morning"}]"#,
        )
        .await
        .unwrap();

        let loaded = store.get("wake").await.unwrap().unwrap();
        assert_eq!(loaded.definition, "Kitchen volume 40");
        assert_eq!(loaded.category.as_deref(), Some("morning"));
    }

    #[tokio::test]
    async fn parameters_are_detected_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store
            .import("party = %2 volume %1 : %2 play_favourite %3 : %1 x\n", false)
            .await
            .unwrap();

        let party = store.get("party").await.unwrap().unwrap();
        let positions: Vec<u32> = party.parameters.iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(party.parameters[0].name, "Parameter 1");
        assert_eq!(party.parameters[0].kind, "string");
    }

    #[tokio::test]
    async fn delete_reports_missing_macros() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store.save(named("a", "Kitchen play")).await.unwrap();

        assert!(!store.delete("b").await.unwrap());
        assert!(store.delete("A").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_picks_the_next_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store
            .save(Macro {
                is_favorite: true,
                ..named("wake", "Kitchen play")
            })
            .await
            .unwrap();

        let first = store.duplicate("wake").await.unwrap().unwrap();
        let second = store.duplicate("wake").await.unwrap().unwrap();
        assert_eq!(first.name, "wake_copy");
        assert_eq!(second.name, "wake_copy_2");
        assert!(!first.is_favorite);
        assert_eq!(second.definition, "Kitchen play");
        assert!(store.duplicate("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_import_only_appends_new_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store.save(named("wake", "Kitchen play")).await.unwrap();

        let outcome = store
            .import("WAKE = Den play\nsleep = Den stop\n# note\n", true)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.imported_count, 1);
        assert_eq!(outcome.message, "Merged 1 new macros (skipped 1 existing)");

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["wake", "sleep"]);

        let again = store.import("sleep = Den stop", true).await.unwrap();
        assert_eq!(again.imported_count, 0);
        assert_eq!(again.message, "All macros already exist, nothing to import");
    }

    #[tokio::test]
    async fn import_without_definitions_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();

        let outcome = store.import("# just a comment\n=nothing\n", false).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.imported_count, 0);
    }

    #[tokio::test]
    async fn broken_metadata_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_file_exists().await.unwrap();
        store.import("a = Kitchen play %1", false).await.unwrap();
        fs::write(dir.path().join("data/macros-metadata.json"), "{not json")
            .await
            .unwrap();

        let macros = store.list().await.unwrap();
        assert_eq!(macros.len(), 1);
        assert_eq!(macros[0].parameters.len(), 1);
    }

    #[test]
    fn metadata_index_keeps_first_entry_per_name() {
        let entries = vec![
            serde_json::json!({"name": "a", "description": "first"}),
            serde_json::json!({"name": "a", "description": "second"}),
            serde_json::json!({"description": "nameless"}),
            serde_json::json!(42),
        ];
        let indexed = index_metadata(entries);
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed["a"].description.as_deref(), Some("first"));
    }

    #[test]
    fn apple_music_track_suffix_is_removed() {
        let cleaned = clean_share_links(
            "Kitchen add_sharelink_to_queue https://music.apple.com/gb/album/x/123?i=456 : Kitchen play",
        );
        assert_eq!(
            cleaned,
            "Kitchen add_sharelink_to_queue https://music.apple.com/gb/album/x/123 : Kitchen play"
        );
    }

    #[test]
    fn definitions_need_name_and_body() {
        let parsed = parse_definitions("a = x\n = y\nb =\nc=z=w\n# d = e\na = again\n");
        assert_eq!(
            parsed,
            vec![
                ("a".to_string(), "again".to_string()),
                ("c".to_string(), "z=w".to_string()),
            ]
        );
    }
}
