use std::path::{Path, PathBuf};

use crate::consts::{
    ARTIFACT_EXTENSION, ILLEGAL_PROJECT_CHARS, LEDGER_SUFFIX, MASTER_CONFIG_SUFFIX,
    REGISTRY_SUFFIX,
};
use crate::error::{Result, TomoError};
use crate::stage::Stage;

/// Explicit project context handed to every component.
///
/// All per-project artifacts live side by side in `root`, named
/// `<name>_<suffix>.toml`.
#[derive(Clone, Debug)]
pub struct Project {
    name: String,
    root: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TomoError::config("project", "project name is empty"));
        }
        if let Some(c) = name.chars().find(|c| ILLEGAL_PROJECT_CHARS.contains(c)) {
            return Err(TomoError::config(
                "project",
                format!("illegal character '{c}' in project name"),
            ));
        }
        Ok(Self {
            name,
            root: root.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact(&self, suffix: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}.{}", self.name, suffix, ARTIFACT_EXTENSION))
    }

    pub fn master_config_path(&self) -> PathBuf {
        self.artifact(MASTER_CONFIG_SUFFIX)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.artifact(REGISTRY_SUFFIX)
    }

    pub fn stage_config_path(&self, stage: Stage) -> PathBuf {
        self.artifact(stage.key())
    }

    pub fn ledger_path(&self, stage: Stage) -> PathBuf {
        self.artifact(&format!("{}_{}", stage.key(), LEDGER_SUFFIX))
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("{}.log", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_illegal_names() {
        assert!(Project::new("a/b", "/tmp").is_err());
        assert!(Project::new("a?b", "/tmp").is_err());
        assert!(Project::new("  ", "/tmp").is_err());
        assert!(Project::new("TS", "/tmp").is_ok());
    }

    #[test]
    fn artifact_names() {
        let p = Project::new("TS", "/data").unwrap();
        assert_eq!(p.master_config_path(), PathBuf::from("/data/TS_proj.toml"));
        assert_eq!(
            p.stage_config_path(Stage::MotionCorrection),
            PathBuf::from("/data/TS_motioncorr.toml")
        );
        assert_eq!(
            p.ledger_path(Stage::CtfEstimation),
            PathBuf::from("/data/TS_ctffind_ledger.toml")
        );
    }
}
