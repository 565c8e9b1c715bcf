use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, Tempo};

const STATE_DIR: &str = "metronome";
const STATE_FILE: &str = "state.json";

/// Settings carried between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_tempo: Tempo,
}

impl PersistedState {
    /// Reads the state file. A missing file, unreadable JSON, or a tempo that
    /// is not a valid integer in range all fall back to the defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(?path, "no saved state, using defaults");
                return Self::default();
            }
            Err(err) => {
                tracing::warn!(?path, %err, "could not read saved state, using defaults");
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Some(state) => state,
            None => {
                tracing::warn!(?path, "saved state is invalid, using defaults");
                Self::default()
            }
        }
    }

    /// Accepts the tempo as a JSON integer or as a numeric string.
    fn parse(contents: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(contents).ok()?;
        let last_tempo = match value.get("last_tempo")? {
            Value::Number(number) => Tempo::new(number.as_i64()?).ok()?,
            Value::String(text) => text.parse().ok()?,
            _ => return None,
        };
        Some(Self { last_tempo })
    }

    /// Writes the state file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::debug!(?path, tempo = self.last_tempo.bpm(), "saved state");
        Ok(())
    }
}

/// Platform location for the state file, if the platform has one.
pub fn default_state_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_dir)
        .map(|dir| dir.join(STATE_DIR).join(STATE_FILE))
}
