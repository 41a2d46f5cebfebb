use std::path::PathBuf;

use mapforge::{AutorunConfig, RenderOptions, document};
use serde_json::json;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mapforge_embed_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn options() -> RenderOptions {
    RenderOptions {
        date: "07/08/26".to_string(),
        ..RenderOptions::default()
    }
}

#[test]
fn unchanged_cache_file_renders_an_identical_configuration() {
    let dir = temp_dir("stable");
    let cache = json!({
        "nauvis": {"chunks": [[0, 0], [1, -3]], "box": [0, -3, 1, 0]},
        "Factory floor 1": {"chunks": [[2, 2]], "box": [2, 2, 2, 2]},
    });
    std::fs::write(
        dir.join("chunkCache.json"),
        serde_json::to_string(&cache).unwrap(),
    )
    .unwrap();

    let opts = options();
    let render = |dir: &PathBuf| {
        let cache = document::load_chunk_cache(dir).unwrap().unwrap();
        AutorunConfig::from_options(&opts, "base", json!({}), cache).render()
    };

    let first = render(&dir);
    let second = render(&dir);
    assert_eq!(first, second);
    assert!(first.contains(r#"["nauvis"] = {["box"] = {0, -3, 1, 0}, ["chunks"] = {{0, 0}, {1, -3}}}"#));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn prior_map_state_is_embedded_through_the_encoder() {
    let dir = temp_dir("map_state");
    let master = json!({
        "maps": [{"surfaces": {"nauvis": {"chunks": [[0, 0]], "links": []}}}],
        "options": {"hd": false},
    });
    std::fs::write(
        dir.join("mapInfo.json"),
        serde_json::to_string(&master).unwrap(),
    )
    .unwrap();

    let map_info = document::load_map_info(&dir).unwrap().unwrap();
    let rendered = AutorunConfig::from_options(&options(), "base", map_info, json!({})).render();
    assert!(rendered.contains(r#"mapInfo = {["maps"] = {{["surfaces"] = {["nauvis"] = "#));
    assert!(rendered.contains("name = \"base/\","));
    assert!(rendered.contains("date = \"07/08/26\","));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn js_embed_survives_quotes_in_the_document() {
    let dir = temp_dir("js");
    let master = json!({"maps": [], "note": "a \"quoted\" name"});
    document::save_map_info(&dir, &master).unwrap();
    document::write_js_embed(&dir).unwrap();

    let embed = std::fs::read_to_string(dir.join("mapInfo.js")).unwrap();
    assert!(embed.starts_with("\"use strict\";\nwindow.mapInfo = JSON.parse(\""));
    assert!(embed.ends_with("\");"));

    // The argument is one JS string literal; parsing it back yields the
    // original document text.
    let literal = embed
        .trim_start_matches("\"use strict\";\nwindow.mapInfo = JSON.parse(")
        .trim_end_matches(");");
    let inner: String = serde_json::from_str(literal).unwrap();
    let roundtrip: serde_json::Value = serde_json::from_str(&inner).unwrap();
    assert_eq!(roundtrip, master);

    let _ = std::fs::remove_dir_all(&dir);
}
