//! Where settings and Whisper models live on disk.
//!
//! Settings go in the platform config dir and models in the local data dir,
//! each under a `voice-roundtable` folder.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "voice-roundtable";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub settings_file: PathBuf,
    pub models_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let base = |dir: Option<PathBuf>| dir.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR);
        Self {
            settings_file: base(dirs::config_dir()).join("settings.toml"),
            models_dir: base(dirs::data_local_dir()).join("models"),
        }
    }

    /// Locate the Whisper model named in `[stt] model`.
    ///
    /// A bare stem such as `ggml-base.en` resolves to `<models_dir>/ggml-base.en.bin`;
    /// anything that already looks like a path is used as given.
    pub fn model_file(&self, model: &str) -> PathBuf {
        let given = Path::new(model);
        let is_path = given.components().count() > 1
            || given.extension().is_some_and(|ext| ext == "bin");
        if is_path {
            given.to_path_buf()
        } else {
            self.models_dir.join(format!("{model}.bin"))
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
