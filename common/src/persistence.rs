// Trigger artifact persistence: one crontab file per schedule entry

use crate::config::CronConfig;
use crate::errors::PersistenceError;
use crate::models::ScheduleEntry;
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tracing::{debug, info, instrument};

/// Where resolved schedules are written for the host scheduler to pick up
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Write one trigger per entry; returns the number written
    async fn write_project(
        &self,
        project_id: &str,
        entries: &[ScheduleEntry],
    ) -> Result<usize, PersistenceError>;

    /// Remove every trigger owned by a project; returns the number removed
    async fn remove_project(&self, project_id: &str) -> Result<usize, PersistenceError>;

    /// Remove every trigger this store owns, whatever project wrote it
    async fn purge_all(&self) -> Result<usize, PersistenceError>;
}

fn trigger_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<project>[A-Za-z0-9_-]+)_[0-9a-f]{64}_[0-9]{4}$")
            .expect("Invalid regex pattern")
    })
}

/// Project ids become part of a file name; anything outside `[A-Za-z0-9_-]` is replaced
pub fn safe_project_component(project_id: &str) -> String {
    project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{project_id}_{sha256(branch)}_{index:04}`
pub fn trigger_file_name(project_id: &str, branch: &str, index: usize) -> String {
    let digest = Sha256::digest(branch.as_bytes());
    format!(
        "{}_{}_{:04}",
        safe_project_component(project_id),
        hex::encode(digest),
        index
    )
}

/// Project component of a trigger file name, if the name is one of ours
pub fn trigger_owner(file_name: &str) -> Option<&str> {
    trigger_name_pattern()
        .captures(file_name)
        .and_then(|c| c.name("project"))
        .map(|m| m.as_str())
}

/// Quote a value for a single-quoted shell word
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Cron treats an unescaped `%` in the command as a newline
fn escape_percent(command: &str) -> String {
    command.replace('%', r"\%")
}

/// Crontab-file writer over a directory such as `/etc/cron.d`
#[derive(Debug, Clone)]
pub struct CronDirectory {
    directory: PathBuf,
    run_as: String,
    workdir: String,
    scanner_command: String,
    log_target: String,
}

impl CronDirectory {
    pub fn new(config: &CronConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            run_as: config.run_as.clone(),
            workdir: config.workdir.clone(),
            scanner_command: config.scanner_command.clone(),
            log_target: config.log_target.clone(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// One crontab line that runs the scanner for `entry`
    pub fn render(&self, entry: &ScheduleEntry) -> String {
        let engines: Vec<String> = entry
            .engines()
            .iter()
            .map(|engine| format!("-e {}", engine))
            .collect();

        let command = format!(
            "cd {} && {} -p {} -b {} -r {} -s {} {} > {} 2>&1",
            self.workdir,
            self.scanner_command,
            shell_quote(entry.project_id()),
            shell_quote(entry.branch()),
            shell_quote(entry.repo_url()),
            shell_quote(entry.cron_expression()),
            engines.join(" "),
            self.log_target
        );

        format!(
            "{} {} {}\n",
            entry.cron_expression(),
            self.run_as,
            escape_percent(&command)
        )
    }

    /// Trigger files currently present, keyed by their project component
    pub async fn list_triggers(&self) -> Result<Vec<(String, PathBuf)>, PersistenceError> {
        let list_err = |source| PersistenceError::List {
            path: self.directory.display().to_string(),
            source,
        };

        let mut found = Vec::new();
        let mut dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(list_err(e)),
        };

        while let Some(item) = dir.next_entry().await.map_err(list_err)? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(owner) = trigger_owner(name) {
                found.push((owner.to_string(), item.path()));
            }
        }

        found.sort();
        Ok(found)
    }

    async fn remove_matching<F>(&self, keep: F) -> Result<usize, PersistenceError>
    where
        F: Fn(&str) -> bool + Send,
    {
        let mut removed = 0;
        for (owner, path) in self.list_triggers().await? {
            if keep(&owner) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed trigger file");
                    removed += 1;
                }
                // Already gone is as good as removed
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PersistenceError::Remove {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl TriggerStore for CronDirectory {
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    async fn write_project(
        &self,
        project_id: &str,
        entries: &[ScheduleEntry],
    ) -> Result<usize, PersistenceError> {
        for (index, entry) in entries.iter().enumerate() {
            let name = trigger_file_name(project_id, entry.branch(), index);
            let path = self.directory.join(&name);
            // Cron skips dot files, so a partial write is never picked up
            let staging = self.directory.join(format!(".{}.tmp", name));

            let write_err = |source| PersistenceError::Write {
                path: path.display().to_string(),
                source,
            };

            fs::write(&staging, self.render(entry))
                .await
                .map_err(write_err)?;
            fs::rename(&staging, &path).await.map_err(write_err)?;
            debug!(path = %path.display(), schedule = %entry, "Wrote trigger file");
        }
        Ok(entries.len())
    }

    async fn remove_project(&self, project_id: &str) -> Result<usize, PersistenceError> {
        let owner = safe_project_component(project_id);
        self.remove_matching(|o| o != owner).await
    }

    async fn purge_all(&self) -> Result<usize, PersistenceError> {
        let removed = self.remove_matching(|_| false).await?;
        info!(removed, directory = %self.directory.display(), "Purged trigger files");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CronDirectory {
        CronDirectory::new(&CronConfig {
            directory: dir.path().to_path_buf(),
            run_as: "nobody".to_string(),
            workdir: "/opt/scan-scheduler".to_string(),
            scanner_command: "./scanner".to_string(),
            log_target: "/opt/scan-scheduler/logfifo".to_string(),
        })
    }

    fn entry(project: &str, branch: &str, cron: &str) -> ScheduleEntry {
        let engines: BTreeSet<String> = ["sast", "kics"].iter().map(|s| s.to_string()).collect();
        ScheduleEntry::new(project, cron, branch, engines, "https://git/app.git").unwrap()
    }

    #[test]
    fn test_file_name_layout() {
        let name = trigger_file_name("p-1", "main", 3);
        assert!(name.starts_with("p-1_"));
        assert!(name.ends_with("_0003"));
        assert_eq!(trigger_owner(&name), Some("p-1"));
        assert_eq!(trigger_owner("p-1_nothex_0003"), None);
        assert_eq!(trigger_owner(".p-1_tmp"), None);
    }

    #[test]
    fn test_render_escapes_quotes_and_percent() {
        let dir = TempDir::new().unwrap();
        let line = store(&dir).render(&entry("p1", "it's-50%", "0 2 * * *"));
        assert_eq!(
            line,
            "0 2 * * * nobody cd /opt/scan-scheduler && ./scanner -p 'p1' -b 'it'\\''s-50\\%' \
             -r 'https://git/app.git' -s '0 2 * * *' -e kics -e sast > /opt/scan-scheduler/logfifo 2>&1\n"
        );
    }

    #[tokio::test]
    async fn test_write_and_remove_project() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let written = store
            .write_project("p1", &[entry("p1", "main", "0 * * * *"), entry("p1", "main", "0 0 * * 0")])
            .await
            .unwrap();
        assert_eq!(written, 2);
        store
            .write_project("p10", &[entry("p10", "dev", "0 * * * *")])
            .await
            .unwrap();

        assert_eq!(store.list_triggers().await.unwrap().len(), 3);

        // Prefix "p1" must not touch "p10"
        assert_eq!(store.remove_project("p1").await.unwrap(), 2);
        let left = store.list_triggers().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "p10");
    }

    #[tokio::test]
    async fn test_purge_leaves_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(dir.path().join("e2scrub_all"), "30 3 * * 0 root true\n").unwrap();
        store
            .write_project("p1", &[entry("p1", "main", "0 * * * *")])
            .await
            .unwrap();

        assert_eq!(store.purge_all().await.unwrap(), 1);
        assert!(dir.path().join("e2scrub_all").exists());
        assert!(store.list_triggers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let store = CronDirectory::new(&CronConfig {
            directory: dir.path().join("absent"),
            ..CronConfig::default()
        });
        assert!(store.list_triggers().await.unwrap().is_empty());
        assert!(store.write_project("p1", &[entry("p1", "main", "0 * * * *")]).await.is_err());
    }
}
