use std::fs;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{
    CreateStoreDirectorySnafu, ParseStateSnafu, ReadStoreSnafu, ReplaceStoreSnafu,
    SerializeStateSnafu, StorageResult, WriteStoreSnafu,
};
use crate::types::ChatStateRecord;
use crate::StateStore;

pub const DEFAULT_STORE_RELATIVE_PATH: &str = ".quill/sessions.json";

/// Persists the whole chat state as one pretty-printed JSON document.
///
/// Writes go through a sibling temp file and a rename so a crash mid-write
/// never leaves a truncated store behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_display(&self) -> String {
        self.path.display().to_string()
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> StorageResult<Option<ChatStateRecord>> {
        let payload = match fs::read_to_string(&self.path) {
            Ok(payload) => payload,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path_display(), "no chat state on disk yet");
                return Ok(None);
            }
            Err(source) => {
                return Err(source).context(ReadStoreSnafu {
                    stage: "load-read",
                    path: self.path_display(),
                });
            }
        };

        let record = serde_json::from_str(&payload).context(ParseStateSnafu {
            stage: "load-parse",
            path: self.path_display(),
        })?;
        Ok(Some(record))
    }

    fn save(&self, state: &ChatStateRecord) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context(CreateStoreDirectorySnafu {
                stage: "save-create-dir",
                path: parent.display().to_string(),
            })?;
        }

        let payload = serde_json::to_string_pretty(state).context(SerializeStateSnafu {
            stage: "save-serialize",
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).context(WriteStoreSnafu {
            stage: "save-write-tmp",
            path: tmp_path.display().to_string(),
        })?;
        fs::rename(&tmp_path, &self.path).context(ReplaceStoreSnafu {
            stage: "save-rename",
            path: self.path_display(),
        })?;

        tracing::debug!(
            path = %self.path_display(),
            session_count = state.sessions.len(),
            "chat state persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::{
        DEFAULT_SESSION_TOPIC, MessageRecord, MessageRole, MessageStatusRecord, SessionRecord,
    };

    fn sample_state() -> ChatStateRecord {
        ChatStateRecord {
            sessions: vec![SessionRecord {
                id: 1,
                topic: DEFAULT_SESSION_TOPIC.to_string(),
                updated_at_unix_seconds: 1_700_000_000,
                messages: vec![MessageRecord {
                    role: MessageRole::User,
                    content: "Hello".to_string(),
                    created_at_unix_seconds: 1_700_000_000,
                    status: MessageStatusRecord::Done,
                }],
            }],
            current_index: 0,
        }
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/sessions.json"));

        let state = sample_state();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_returns_none_when_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_error_for_malformed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::new(&path);
        let error = store.load().unwrap_err();
        assert!(matches!(error, StorageError::ParseState { .. }));
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions.json"));
        store.save(&sample_state()).unwrap();

        assert!(!dir.path().join("sessions.json.tmp").exists());
        assert!(dir.path().join("sessions.json").exists());
    }

    #[test]
    fn current_index_defaults_to_zero_for_older_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, r#"{"sessions": []}"#).unwrap();

        let store = JsonFileStore::new(&path);
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.current_index, 0);
    }
}
