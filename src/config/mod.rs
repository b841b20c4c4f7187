//! Configuration loading: the project config (`tplbuild.yml`) and the user
//! config (`~/.tplbuildconfig.yml`), both YAML, both loaded the teacher's
//! way — read to string, deserialize, then run a validation pass that
//! collects every problem instead of failing on the first.

pub mod model;
pub mod template;

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use model::{ProjectConfig, UserConfig};

pub fn load_project_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: ProjectConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(config)
}

/// Loads the user config, or the documented defaults if the file is
/// absent — `~/.tplbuildconfig.yml` is optional.
pub fn load_user_config(path: &Path) -> Result<UserConfig, ConfigError> {
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: UserConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(config)
}

pub fn default_user_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tplbuildconfig.yml")
}

/// Validates cross-field invariants that `serde`'s structural deserialize
/// can't express, collecting every problem rather than stopping at the
/// first: an unknown `default_profile`, or a base stage declared without a
/// `base_image_repo`.
pub fn validate(
    config: &ProjectConfig,
    base_stage_names: &[String],
) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if !config.profiles.is_empty() && !config.profiles.contains_key(&config.default_profile) {
        errors.push(ConfigError::UnknownProfile {
            profile: config.default_profile.clone(),
        });
    }

    if config.base_image_repo.is_none() {
        for stage in base_stage_names {
            errors.push(ConfigError::MissingBaseImageRepo { stage: stage.clone() });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Walks up from `start` looking for `tplbuild.yml`, mirroring how the
/// teacher's config resolver walks up for its own project file.
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join("tplbuild.yml");
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn finds_project_config_in_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tplbuild.yml");
        fs::write(&path, "template_entrypoint: entry.dockerfile\n").unwrap();
        let child = dir.path().join("sub");
        fs::create_dir(&child).unwrap();
        assert_eq!(find_project_config(&child), Some(path));
    }

    #[test]
    fn missing_user_config_yields_defaults() {
        let cfg = load_user_config(Path::new("/no/such/tplbuildconfig.yml")).unwrap();
        assert_eq!(cfg.client.r#type, "docker");
    }

    #[test]
    fn validate_flags_unknown_default_profile() {
        let yaml = "template_entrypoint: e\ndefault_profile: missing\nprofiles:\n  release: {}\n";
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        let errors = validate(&config, &[]).unwrap_err();
        assert!(matches!(errors[0], ConfigError::UnknownProfile { .. }));
    }

    #[test]
    fn validate_flags_missing_base_image_repo() {
        let yaml = "template_entrypoint: e\n";
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        let errors = validate(&config, &["base-app".to_string()]).unwrap_err();
        assert!(matches!(errors[0], ConfigError::MissingBaseImageRepo { .. }));
    }
}
