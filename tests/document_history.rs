use std::path::PathBuf;

use mapforge::document;
use serde_json::{Value, json};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mapforge_history_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn master_two_snapshots() -> Value {
    json!({
        "maps": [
            {
                "surfaces": {
                    "nauvis": {
                        "chunks": [[0, 0]],
                        "tags": [{"iconType": "item", "iconName": "rail", "iconPath": "Images/labels/rail.png"}],
                        "links": [{"path": "Images/old-1", "zoom": {"min": 17, "max": 20}}]
                    }
                }
            },
            {
                "surfaces": {
                    "nauvis": {
                        "chunks": [[0, 0], [1, 0]],
                        "links": [{"path": "Images/old-2", "zoom": {"min": 16, "max": 20}}]
                    }
                }
            }
        ]
    })
}

#[test]
fn later_runs_accumulate_history_without_clobbering_it() {
    let dir = temp_dir("accumulate");
    document::save_map_info(&dir, &master_two_snapshots()).unwrap();

    // A run that only reprocessed snapshot 1 leaves snapshot 0 untouched.
    let partial_one = json!({
        "maps": {"1": {"surfaces": {"nauvis": {
            "chunks": [[0, 0], [1, 0], [2, 0]],
            "links": [{"path": "Images/new-2", "zoom": {"min": 15}}]
        }}}}
    });
    std::fs::write(
        dir.join("mapInfo.out.json"),
        serde_json::to_string(&partial_one).unwrap(),
    )
    .unwrap();
    assert!(document::apply_partial_file(&dir).unwrap());

    let after_one = document::load_map_info(&dir).unwrap().unwrap();
    assert_eq!(
        after_one["maps"][0],
        master_two_snapshots()["maps"][0],
        "snapshot 0 written by an earlier, unrepeated run must be preserved"
    );
    assert_eq!(after_one["maps"][1]["surfaces"]["nauvis"]["links"][0]["path"], json!("Images/new-2"));
    assert_eq!(after_one["maps"][1]["surfaces"]["nauvis"]["links"][0]["zoom"]["min"], json!(15));
    assert_eq!(after_one["maps"][1]["surfaces"]["nauvis"]["links"][0]["zoom"]["max"], json!(20));

    // A later run touching snapshot 0 composes with the first.
    let partial_zero = json!({
        "maps": {"0": {"surfaces": {"nauvis": {
            "links": [{"path": "Images/new-1", "zoom": {"min": 14}}]
        }}}}
    });
    std::fs::write(
        dir.join("mapInfo.out.json"),
        serde_json::to_string(&partial_zero).unwrap(),
    )
    .unwrap();
    assert!(document::apply_partial_file(&dir).unwrap());

    let after_two = document::load_map_info(&dir).unwrap().unwrap();
    assert_eq!(after_two["maps"][0]["surfaces"]["nauvis"]["links"][0]["path"], json!("Images/new-1"));
    // Untouched fields still carry the original history.
    assert_eq!(after_two["maps"][0]["surfaces"]["nauvis"]["tags"], master_two_snapshots()["maps"][0]["surfaces"]["nauvis"]["tags"]);
    assert_eq!(after_two["maps"][1]["surfaces"]["nauvis"]["links"][0]["path"], json!("Images/new-2"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn applying_the_same_partial_twice_is_idempotent_at_the_file_level() {
    let dir = temp_dir("idempotent");
    document::save_map_info(&dir, &master_two_snapshots()).unwrap();

    let partial = json!({
        "maps": {"0": {"surfaces": {"nauvis": {
            "chunks": [[5, 5]],
            "links": [{"path": "Images/x", "zoom": {"min": 10}}]
        }}}}
    });
    for _ in 0..2 {
        std::fs::write(
            dir.join("mapInfo.out.json"),
            serde_json::to_string(&partial).unwrap(),
        )
        .unwrap();
        assert!(document::apply_partial_file(&dir).unwrap());
    }
    let first = std::fs::read_to_string(dir.join("mapInfo.json")).unwrap();

    std::fs::write(
        dir.join("mapInfo.out.json"),
        serde_json::to_string(&partial).unwrap(),
    )
    .unwrap();
    assert!(document::apply_partial_file(&dir).unwrap());
    let second = std::fs::read_to_string(dir.join("mapInfo.json")).unwrap();
    assert_eq!(first, second);

    let _ = std::fs::remove_dir_all(&dir);
}
