//! State directory layout and `autoapply init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AgentConfig, write_config};
use super::profile::PROFILE_TEMPLATE;
use super::store::JobStore;

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".autoapply";

/// All canonical paths within a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub profile_path: PathBuf,
    pub db_path: PathBuf,
    pub attempts_dir: PathBuf,
    pub screens_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            config_path: state_dir.join("config.toml"),
            profile_path: state_dir.join("profile.toml"),
            db_path: state_dir.join("jobs.db"),
            attempts_dir: state_dir.join("attempts"),
            screens_dir: state_dir.join("screens"),
            gitignore_path: state_dir.join(".gitignore"),
            state_dir,
        }
    }

    /// Screenshot file for one worker; overwritten every capture.
    pub fn screenshot_path(&self, worker: &str) -> PathBuf {
        self.screens_dir.join(format!("{worker}.png"))
    }
}

/// Options for `init_state`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing config and profile files.
    pub force: bool,
}

/// Create the state directory with default config, a profile template and an empty database.
///
/// Fails if `config.toml` already exists unless `options.force` is set. The
/// job database is never reset.
pub fn init_state(state_dir: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(state_dir);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.attempts_dir)?;
    create_dir(&paths.screens_dir)?;

    write_config(&paths.config_path, &AgentConfig::default())?;
    write_file(&paths.profile_path, PROFILE_TEMPLATE)?;
    write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    JobStore::open(&paths.db_path)
        .with_context(|| format!("create job database {}", paths.db_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

/// The profile holds personal data and the database holds job history.
const STATE_GITIGNORE: &str = "*\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::profile::load_profile;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(&temp.path().join("state"), &InitOptions { force: false })
            .expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.attempts_dir.is_dir());
        assert!(paths.screens_dir.is_dir());
        assert!(paths.db_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            STATE_GITIGNORE
        );
        assert_eq!(
            fs::read_to_string(&paths.config_path)
                .map(|s| toml::from_str::<AgentConfig>(&s).expect("parse"))
                .expect("read"),
            AgentConfig::default()
        );
        assert!(load_config(&paths.config_path).is_ok());
        assert!(load_profile(&paths.profile_path).is_ok());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_state(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_state(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_rewrites_templates_but_keeps_jobs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.profile_path, "name = \"custom\"\n").expect("write custom");
        JobStore::open(&paths.db_path)
            .expect("open")
            .enqueue("https://ex.com/1", "", "")
            .expect("enqueue");

        init_state(temp.path(), &InitOptions { force: true }).expect("re-init");

        assert_eq!(
            fs::read_to_string(&paths.profile_path).expect("read"),
            PROFILE_TEMPLATE
        );
        let store = JobStore::open(&paths.db_path).expect("open");
        assert_eq!(store.list_all().expect("list").len(), 1);
    }

    #[test]
    fn screenshot_path_is_per_worker() {
        let paths = StatePaths::new("/tmp/state");
        assert_eq!(
            paths.screenshot_path("worker-1"),
            PathBuf::from("/tmp/state/screens/worker-1.png")
        );
    }
}
