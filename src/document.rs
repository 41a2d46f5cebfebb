//! The master map document and its merge contract.
//!
//! `mapInfo.json` is the root aggregate: an ordered list of per-snapshot
//! entries, each keyed by surface name, holding chunk lists, tag records and
//! link records. Earlier runs wrote history into it that the current run
//! cannot regenerate, so it is never replaced wholesale — the pyramid stage
//! emits a partial document and only three fields are overlaid per targeted
//! `(snapshot, surface, link)` triple: `chunks`, `links[].path` and
//! `links[].zoom.min`. Everything else is preserved byte-for-byte.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{MapforgeError, MapforgeResult};

pub const MAP_INFO_FILE: &str = "mapInfo.json";
pub const PARTIAL_FILE: &str = "mapInfo.out.json";
pub const CHUNK_CACHE_FILE: &str = "chunkCache.json";
pub const JS_EMBED_FILE: &str = "mapInfo.js";

fn read_json(path: &Path) -> MapforgeResult<Value> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| MapforgeError::document(format!("{}: {e}", path.display())))
}

/// Loads `mapInfo.json` if present.
pub fn load_map_info(workfolder: &Path) -> MapforgeResult<Option<Value>> {
    let path = workfolder.join(MAP_INFO_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

pub fn save_map_info(workfolder: &Path, doc: &Value) -> MapforgeResult<()> {
    let text = serde_json::to_string(doc).map_err(|e| MapforgeError::document(e.to_string()))?;
    std::fs::write(workfolder.join(MAP_INFO_FILE), text)?;
    Ok(())
}

/// Loads `chunkCache.json` if present. The cache carries no content hash or
/// schema version; whatever is on disk is trusted and carried verbatim into
/// the next run's configuration.
pub fn load_chunk_cache(workfolder: &Path) -> MapforgeResult<Option<Value>> {
    let path = workfolder.join(CHUNK_CACHE_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Overlays a pyramid-stage partial document into the master.
///
/// The partial's `maps` is an object keyed by stringified snapshot index;
/// the master's `maps` is an array. Only `chunks`, `links[i].path` and
/// `links[i].zoom.min` are written, and only where the target triple already
/// exists in the master — missing targets are skipped, never invented.
/// Applying the same partial twice yields the same master as applying it
/// once.
pub fn merge_partial(master: &mut Value, partial: &Value) -> MapforgeResult<()> {
    let Some(patches) = partial.get("maps").and_then(Value::as_object) else {
        return Err(MapforgeError::document(
            "partial document has no maps object",
        ));
    };

    for (index_str, map_patch) in patches {
        let index: usize = index_str.parse().map_err(|_| {
            MapforgeError::document(format!("partial map index '{index_str}' is not a number"))
        })?;
        let Some(target_map) = master
            .get_mut("maps")
            .and_then(Value::as_array_mut)
            .and_then(|maps| maps.get_mut(index))
        else {
            continue;
        };
        let Some(surface_patches) = map_patch.get("surfaces").and_then(Value::as_object) else {
            continue;
        };

        for (surface_name, patch) in surface_patches {
            let Some(target_surface) = target_map
                .get_mut("surfaces")
                .and_then(|s| s.get_mut(surface_name))
                .and_then(Value::as_object_mut)
            else {
                continue;
            };

            if let Some(chunks) = patch.get("chunks") {
                target_surface.insert("chunks".to_string(), chunks.clone());
            }

            let Some(link_patches) = patch.get("links").and_then(Value::as_array) else {
                continue;
            };
            let Some(target_links) = target_surface
                .get_mut("links")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            for (li, link_patch) in link_patches.iter().enumerate() {
                let Some(target_link) =
                    target_links.get_mut(li).and_then(Value::as_object_mut)
                else {
                    continue;
                };
                if let Some(path) = link_patch.get("path") {
                    target_link.insert("path".to_string(), path.clone());
                }
                if let Some(min) = link_patch.get("zoom").and_then(|z| z.get("min"))
                    && let Some(zoom) = target_link.get_mut("zoom").and_then(Value::as_object_mut)
                {
                    zoom.insert("min".to_string(), min.clone());
                }
            }
        }
    }
    Ok(())
}

/// Applies `mapInfo.out.json` into `mapInfo.json` if the partial exists,
/// then removes the partial. Returns whether anything was applied.
pub fn apply_partial_file(workfolder: &Path) -> MapforgeResult<bool> {
    let partial_path = workfolder.join(PARTIAL_FILE);
    if !partial_path.is_file() {
        return Ok(false);
    }
    let partial = read_json(&partial_path)?;
    let mut master = load_map_info(workfolder)?.ok_or_else(|| {
        MapforgeError::document(format!(
            "{PARTIAL_FILE} exists but {MAP_INFO_FILE} does not in '{}'",
            workfolder.display()
        ))
    })?;
    merge_partial(&mut master, &partial)?;
    save_map_info(workfolder, &master)?;
    std::fs::remove_file(&partial_path)?;
    Ok(true)
}

/// Writes the browser embed: the document as a JS string literal parsed at
/// load time, so the page needs no network fetch.
pub fn write_js_embed(workfolder: &Path) -> MapforgeResult<()> {
    let text = std::fs::read_to_string(workfolder.join(MAP_INFO_FILE))?;
    let literal =
        serde_json::to_string(&text).map_err(|e| MapforgeError::document(e.to_string()))?;
    let out = format!("\"use strict\";\nwindow.mapInfo = JSON.parse({literal});");
    std::fs::write(workfolder.join(JS_EMBED_FILE), out)?;
    Ok(())
}

/// The key tag records are filed under: icon type followed by the icon name
/// with its first letter uppercased.
pub fn tag_key(icon_type: &str, icon_name: &str) -> String {
    let mut chars = icon_name.chars();
    match chars.next() {
        Some(first) => format!("{icon_type}{}{}", first.to_uppercase(), chars.as_str()),
        None => icon_type.to_string(),
    }
}

/// Collects every tag record across all snapshots and surfaces.
pub fn collect_tags(map_info: &Value) -> BTreeMap<String, Value> {
    let mut tags = BTreeMap::new();
    let Some(maps) = map_info.get("maps").and_then(Value::as_array) else {
        return tags;
    };
    for map in maps {
        let Some(surfaces) = map.get("surfaces").and_then(Value::as_object) else {
            continue;
        };
        for surface in surfaces.values() {
            let Some(surface_tags) = surface.get("tags").and_then(Value::as_array) else {
                continue;
            };
            for tag in surface_tags {
                if let (Some(icon_type), Some(icon_name)) = (
                    tag.get("iconType").and_then(Value::as_str),
                    tag.get("iconName").and_then(Value::as_str),
                ) {
                    tags.insert(tag_key(icon_type, icon_name), tag.clone());
                }
            }
        }
    }
    tags
}

/// Warns about flags an existing timeline's recorded options override.
pub fn warn_overridden_flags(map_info: &Value, changed: &[&str]) {
    if map_info.get("options").is_none() {
        return;
    }
    for flag in changed {
        tracing::warn!(
            "flag '{flag}' is overridden by a previous setting found in the existing timeline"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn master() -> Value {
        json!({
            "maps": [{
                "surfaces": {
                    "nauvis": {
                        "chunks": [[0, 0]],
                        "tags": [{"iconType": "item", "iconName": "rail", "position": {"x": 1.0}}],
                        "links": [
                            {"path": "old/a", "zoom": {"min": 4, "max": 9}, "note": "keep"},
                            {"path": "old/b", "zoom": {"min": 5, "max": 9}}
                        ]
                    },
                    "underground": {"chunks": [], "links": []}
                }
            }]
        })
    }

    fn partial() -> Value {
        json!({
            "maps": {
                "0": {
                    "surfaces": {
                        "nauvis": {
                            "chunks": [[0, 0], [1, 0]],
                            "links": [{"path": "new/a", "zoom": {"min": 2, "max": 99}}]
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn merge_overlays_only_the_three_fields() {
        let mut doc = master();
        merge_partial(&mut doc, &partial()).unwrap();

        let surface = &doc["maps"][0]["surfaces"]["nauvis"];
        assert_eq!(surface["chunks"], json!([[0, 0], [1, 0]]));
        assert_eq!(surface["links"][0]["path"], json!("new/a"));
        assert_eq!(surface["links"][0]["zoom"]["min"], json!(2));
        // Siblings stay untouched: zoom.max, extra link fields, tags, the
        // second link and the other surface.
        assert_eq!(surface["links"][0]["zoom"]["max"], json!(9));
        assert_eq!(surface["links"][0]["note"], json!("keep"));
        assert_eq!(surface["links"][1], master()["maps"][0]["surfaces"]["nauvis"]["links"][1]);
        assert_eq!(surface["tags"], master()["maps"][0]["surfaces"]["nauvis"]["tags"]);
        assert_eq!(
            doc["maps"][0]["surfaces"]["underground"],
            master()["maps"][0]["surfaces"]["underground"]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let mut once = master();
        merge_partial(&mut once, &partial()).unwrap();
        let mut twice = once.clone();
        merge_partial(&mut twice, &partial()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_skips_missing_targets() {
        let mut doc = master();
        let stray = json!({
            "maps": {
                "7": {"surfaces": {"nauvis": {"chunks": [[9, 9]]}}},
                "0": {"surfaces": {"ghost-surface": {"chunks": [[9, 9]]}}}
            }
        });
        merge_partial(&mut doc, &stray).unwrap();
        assert_eq!(doc, master());
    }

    #[test]
    fn merge_rejects_non_numeric_index() {
        let mut doc = master();
        let bad = json!({"maps": {"first": {}}});
        assert!(merge_partial(&mut doc, &bad).is_err());
    }

    #[test]
    fn tag_key_uppercases_the_name() {
        assert_eq!(tag_key("item", "rail"), "itemRail");
        assert_eq!(tag_key("virtual", "X"), "virtualX");
    }

    #[test]
    fn collect_tags_walks_all_surfaces() {
        let tags = collect_tags(&master());
        assert_eq!(tags.len(), 1);
        assert!(tags.contains_key("itemRail"));
    }

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir =
            std::env::temp_dir().join(format!("mapforge_document_{}_{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn apply_partial_file_merges_and_removes() {
        let dir = scratch("apply");
        save_map_info(&dir, &master()).unwrap();
        std::fs::write(
            dir.join(PARTIAL_FILE),
            serde_json::to_string(&partial()).unwrap(),
        )
        .unwrap();

        assert!(apply_partial_file(&dir).unwrap());
        assert!(!dir.join(PARTIAL_FILE).exists());
        let merged = load_map_info(&dir).unwrap().unwrap();
        assert_eq!(merged["maps"][0]["surfaces"]["nauvis"]["links"][0]["path"], json!("new/a"));

        // Second call is a no-op.
        assert!(!apply_partial_file(&dir).unwrap());
    }

    #[test]
    fn js_embed_wraps_the_document_in_a_parse_call() {
        let dir = scratch("embed");
        save_map_info(&dir, &json!({"maps": []})).unwrap();
        write_js_embed(&dir).unwrap();
        let embed = std::fs::read_to_string(dir.join(JS_EMBED_FILE)).unwrap();
        assert!(embed.starts_with("\"use strict\";\nwindow.mapInfo = JSON.parse("));
        assert!(embed.ends_with(");"));
        assert!(embed.contains("maps"));
    }
}
