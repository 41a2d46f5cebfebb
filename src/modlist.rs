//! The two mod-list operations the pipeline needs: enable our companion mod
//! before a run, restore it to disabled afterwards. The restore must happen
//! on every exit path, so it lives in a guard.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::error::{MapforgeError, MapforgeResult};

/// The companion mod's entry name in `mod-list.json`.
pub const MOD_NAME: &str = "L0laapk3_FactorioMaps";

/// Flips (or appends) the named mod's `enabled` flag in `mod-list.json`.
pub fn set_mod_enabled(path: &Path, name: &str, enabled: bool) -> MapforgeResult<()> {
    let text = std::fs::read_to_string(path)?;
    let mut doc: Value = serde_json::from_str(&text)
        .map_err(|e| MapforgeError::document(format!("mod-list '{}': {e}", path.display())))?;

    let mods = doc
        .get_mut("mods")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            MapforgeError::document(format!("mod-list '{}' has no mods array", path.display()))
        })?;

    let mut found = false;
    for entry in mods.iter_mut() {
        if entry.get("name").and_then(Value::as_str) == Some(name) {
            entry["enabled"] = Value::Bool(enabled);
            found = true;
        }
    }
    if !found {
        mods.push(json!({"name": name, "enabled": enabled}));
    }

    let out = serde_json::to_string_pretty(&doc)
        .map_err(|e| MapforgeError::document(e.to_string()))?;
    std::fs::write(path, out)?;
    Ok(())
}

/// Enables the companion mod on construction, disables it on drop — and on
/// interrupt, where drops never run.
pub struct ModListGuard {
    path: PathBuf,
    name: String,
    token: Option<crate::interrupt::CleanupToken>,
}

impl ModListGuard {
    pub fn enable(path: PathBuf, name: &str) -> MapforgeResult<Self> {
        set_mod_enabled(&path, name, true)?;
        let token = {
            let path = path.clone();
            let name = name.to_string();
            crate::interrupt::on_interrupt(move || {
                let _ = set_mod_enabled(&path, &name, false);
            })
        };
        Ok(Self {
            path,
            name: name.to_string(),
            token: Some(token),
        })
    }
}

impl Drop for ModListGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            crate::interrupt::dismiss(token);
        }
        if let Err(e) = set_mod_enabled(&self.path, &self.name, false) {
            tracing::error!("failed to restore mod-list '{}': {e}", self.path.display());
        }
    }
}
