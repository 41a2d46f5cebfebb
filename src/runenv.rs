//! Isolated per-run environment.
//!
//! Each launch gets a private directory under the OS temp root holding its
//! own game configuration (write-data redirected into the directory), a
//! `script-output` link back into the real output tree, and a copy of the
//! player-state file. Overlapping runs therefore never collide on
//! configuration or logs, while screenshots still land in the shared output
//! tree. The directory and the link are removed on drop, on every exit path.

use std::path::{Path, PathBuf};

use crate::error::{MapforgeError, MapforgeResult};
use crate::options::RenderOptions;

/// Applies the override whitelist onto a base game configuration.
///
/// Comment lines are dropped (the game rewrites this file itself and does
/// the same); unrelated sections and keys are preserved in order. Only the
/// keys named in `overrides` are touched, appended to their section when
/// missing.
pub fn rewrite_config(base: &str, overrides: &[(&str, &str, String)]) -> String {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
    let mut current: Option<usize> = None;

    for raw in base.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            current = Some(section_index(&mut sections, name));
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let index = *current.get_or_insert_with(|| section_index(&mut sections, ""));
            sections[index].1.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    for (section, key, value) in overrides {
        let index = section_index(&mut sections, section);
        let entries = &mut sections[index].1;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.clone(),
            None => entries.push((key.to_string(), value.clone())),
        }
    }

    let mut out = String::from("; version=3\n");
    for (name, entries) in &sections {
        if !name.is_empty() {
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
        }
        for (key, value) in entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}

fn section_index(sections: &mut Vec<(String, Vec<(String, String)>)>, name: &str) -> usize {
    if let Some(index) = sections.iter().position(|(n, _)| n == name) {
        return index;
    }
    sections.push((name.to_string(), Vec::new()));
    sections.len() - 1
}

#[cfg(unix)]
fn link_dir(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn link_dir(link: &Path, target: &Path) -> std::io::Result<()> {
    let status = std::process::Command::new("cmd")
        .args(["/C", "mklink", "/J"])
        .arg(link)
        .arg(target)
        .stdout(std::process::Stdio::null())
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other("mklink /J failed"));
    }
    Ok(())
}

#[cfg(unix)]
fn remove_link(link: &Path) {
    let _ = std::fs::remove_file(link);
}

#[cfg(windows)]
fn remove_link(link: &Path) {
    let _ = std::fs::remove_dir(link);
}

/// One run's private environment. Removed on drop, and on interrupt where
/// drops never run.
pub struct RunEnv {
    pub dir: PathBuf,
    pub config_path: PathBuf,
    link: PathBuf,
    token: Option<crate::interrupt::CleanupToken>,
}

fn remove_env(link: &Path, dir: &Path) {
    remove_link(link);
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove run environment '{}': {e}", dir.display());
        }
    }
}

impl RunEnv {
    pub fn materialize(opts: &RenderOptions) -> MapforgeResult<Self> {
        let dir = std::env::temp_dir().join(format!("mapforge-{:08x}", rand::random::<u32>()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("config"))?;

        let base = std::fs::read_to_string(opts.base_config_path()).unwrap_or_default();
        let threads = opts.screenshot_thread_count().to_string();
        let overrides = [
            ("interface", "show-tips-and-tricks", "false".to_string()),
            ("path", "write-data", dir.display().to_string()),
            ("graphics", "screenshots-threads-count", threads.clone()),
            ("graphics", "max-threads", threads),
        ];
        let config_path = dir.join("config").join("config.ini");
        std::fs::write(&config_path, rewrite_config(&base, &overrides))?;

        let script_output = opts.script_output();
        std::fs::create_dir_all(&script_output)?;
        let target = std::fs::canonicalize(&script_output)?;
        let link = dir.join("script-output");
        link_dir(&link, &target)?;

        let player_data = opts.player_data_path();
        std::fs::copy(&player_data, dir.join("player-data.json")).map_err(|e| {
            MapforgeError::launch(format!(
                "failed to copy player state '{}': {e}",
                player_data.display()
            ))
        })?;

        tracing::debug!("run environment at {}", dir.display());
        let token = {
            let link = link.clone();
            let dir = dir.clone();
            crate::interrupt::on_interrupt(move || remove_env(&link, &dir))
        };
        Ok(Self {
            dir,
            config_path,
            link,
            token: Some(token),
        })
    }
}

impl Drop for RunEnv {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            crate::interrupt::dismiss(token);
        }
        remove_env(&self.link, &self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_existing_keys_in_place() {
        let base = "[interface]\nshow-tips-and-tricks=true\nscale=2\n";
        let out = rewrite_config(
            base,
            &[("interface", "show-tips-and-tricks", "false".to_string())],
        );
        assert!(out.contains("show-tips-and-tricks=false\n"));
        assert!(out.contains("scale=2\n"));
        assert_eq!(out.matches("[interface]").count(), 1);
    }

    #[test]
    fn overrides_append_missing_sections_and_keys() {
        let out = rewrite_config("", &[("path", "write-data", "/tmp/run".to_string())]);
        assert!(out.starts_with("; version=3\n"));
        assert!(out.contains("[path]\nwrite-data=/tmp/run\n"));
    }

    #[test]
    fn unrelated_sections_survive_untouched() {
        let base = "[sound]\nmaster-volume=0.5\n[graphics]\nfull-screen=true\n";
        let out = rewrite_config(
            base,
            &[("graphics", "max-threads", "4".to_string())],
        );
        assert!(out.contains("[sound]\nmaster-volume=0.5\n"));
        assert!(out.contains("full-screen=true\n"));
        assert!(out.contains("max-threads=4\n"));
    }

    #[test]
    fn comments_are_dropped_like_the_game_does() {
        let base = "; version=3\n[other]\n; a comment\nkey=value\n";
        let out = rewrite_config(base, &[]);
        assert_eq!(out, "; version=3\n[other]\nkey=value\n");
    }

    #[cfg(unix)]
    #[test]
    fn materialize_builds_and_drop_removes() {
        let user = std::env::temp_dir().join(format!("mapforge_runenv_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&user);
        std::fs::create_dir_all(user.join("config")).unwrap();
        std::fs::write(user.join("config").join("config.ini"), "[interface]\nscale=1\n")
            .unwrap();
        std::fs::write(user.join("player-data.json"), "{}").unwrap();

        let opts = RenderOptions {
            date: "07/08/26".to_string(),
            user_folder: user.clone(),
            ..RenderOptions::default()
        };

        let (dir, config_path) = {
            let env = RunEnv::materialize(&opts).unwrap();
            assert!(env.config_path.is_file());
            assert!(env.dir.join("player-data.json").is_file());
            assert!(env.dir.join("script-output").exists());
            let config = std::fs::read_to_string(&env.config_path).unwrap();
            assert!(config.contains("show-tips-and-tricks=false"));
            assert!(config.contains(&format!("write-data={}", env.dir.display())));
            (env.dir.clone(), env.config_path.clone())
        };

        assert!(!config_path.exists());
        assert!(!dir.exists());
        let _ = std::fs::remove_dir_all(&user);
    }
}
