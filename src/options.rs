//! Immutable run options.
//!
//! Everything configurable is resolved once (by the CLI front-end) into a
//! [`RenderOptions`] value and passed by reference to every component. No
//! component mutates options or consults ambient global state, which keeps
//! each of them testable in isolation.
//!
//! The tool is expected to run from inside the companion mod's directory,
//! with the game's user folder two levels up (saves, mods, config,
//! script-output all hang off of it).

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{MapforgeError, MapforgeResult};

pub const DEFAULT_TAG_RANGE: f64 = 5.2;
pub const DEFAULT_BUILD_RANGE: f64 = 5.2;
pub const DEFAULT_CONNECT_RANGE: f64 = 1.2;
pub const DEFAULT_BASE_NAME: &str = "FactorioMaps";

#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub hd: bool,
    pub day_only: bool,
    pub night_only: bool,
    /// Entity info overlay ("alt mode") visible in screenshots.
    pub alt_mode: bool,
    /// Map tags captured and recorded.
    pub tags: bool,
    pub tag_range: f64,
    pub build_range: f64,
    pub connect_range: f64,
    /// Surfaces to capture; empty means "the surface the player is on".
    pub surfaces: Vec<String>,
    /// Snapshot date label, `dd/mm/yy`.
    pub date: String,
    pub verbose: bool,
    pub verbose_game: bool,
    pub max_threads: usize,
    pub crop_threads: Option<usize>,
    pub ref_threads: Option<usize>,
    pub zoom_threads: Option<usize>,
    pub screenshot_threads: Option<usize>,
    pub delete_existing: bool,
    pub dry_run: bool,
    /// Explicit game binary; when unset, conventional locations are probed.
    pub game_binary: Option<PathBuf>,
    pub mod_path: PathBuf,
    /// Output subdirectory under `script-output`.
    pub base_name: String,
    /// The game's user folder (saves/, mods/, config/, script-output/).
    pub user_folder: PathBuf,
}

impl Default for RenderOptions {
    fn default() -> Self {
        let user_folder = PathBuf::from("..").join("..");
        Self {
            hd: false,
            day_only: false,
            night_only: false,
            alt_mode: true,
            tags: true,
            tag_range: DEFAULT_TAG_RANGE,
            build_range: DEFAULT_BUILD_RANGE,
            connect_range: DEFAULT_CONNECT_RANGE,
            surfaces: Vec::new(),
            date: String::new(),
            verbose: false,
            verbose_game: false,
            max_threads: default_parallelism(),
            crop_threads: None,
            ref_threads: None,
            zoom_threads: None,
            screenshot_threads: None,
            delete_existing: false,
            dry_run: false,
            game_binary: None,
            mod_path: user_folder.join("mods"),
            base_name: DEFAULT_BASE_NAME.to_string(),
            user_folder,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RenderOptions {
    pub fn validate(&self) -> MapforgeResult<()> {
        if self.day_only && self.night_only {
            return Err(MapforgeError::validation(
                "day-only and night-only are mutually exclusive",
            ));
        }
        if self.max_threads == 0 {
            return Err(MapforgeError::validation("max-threads must be >= 1"));
        }
        static DATE: OnceLock<Regex> = OnceLock::new();
        let re = DATE.get_or_init(|| Regex::new(r"^(\d{2})/(\d{2})/(\d{2})$").unwrap());
        let Some(caps) = re.captures(&self.date) else {
            return Err(MapforgeError::validation(format!(
                "date '{}' is not of the form dd/mm/yy",
                self.date
            )));
        };
        let day: u32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        if !(1..=31).contains(&day) || !(1..=12).contains(&month) {
            return Err(MapforgeError::validation(format!(
                "date '{}' is out of range",
                self.date
            )));
        }
        for (name, threads) in [
            ("crop-threads", self.crop_threads),
            ("ref-threads", self.ref_threads),
            ("zoom-threads", self.zoom_threads),
            ("screenshot-threads", self.screenshot_threads),
        ] {
            if threads == Some(0) {
                return Err(MapforgeError::validation(format!(
                    "{name} must be >= 1 when set"
                )));
            }
        }
        Ok(())
    }

    pub fn saves_dir(&self) -> PathBuf {
        self.user_folder.join("saves")
    }

    pub fn script_output(&self) -> PathBuf {
        self.user_folder.join("script-output")
    }

    /// `script-output/<base_name>` — the root every generated map lives under.
    pub fn base_output(&self) -> PathBuf {
        self.script_output().join(&self.base_name)
    }

    pub fn workfolder(&self, foldername: &str) -> PathBuf {
        self.base_output().join(foldername)
    }

    pub fn mod_list_path(&self) -> PathBuf {
        self.mod_path.join("mod-list.json")
    }

    pub fn base_config_path(&self) -> PathBuf {
        self.user_folder.join("config").join("config.ini")
    }

    pub fn player_data_path(&self) -> PathBuf {
        self.user_folder.join("player-data.json")
    }

    /// Where the per-run configuration payload is written for the companion
    /// mod to pick up (the mod reads it relative to its own directory, which
    /// is where this tool runs from).
    pub fn autorun_path(&self) -> PathBuf {
        PathBuf::from("autorun.lua")
    }

    pub fn crop_thread_count(&self) -> usize {
        self.crop_threads.unwrap_or(self.max_threads)
    }

    pub fn ref_thread_count(&self) -> usize {
        self.ref_threads.unwrap_or(self.max_threads)
    }

    pub fn zoom_thread_count(&self) -> usize {
        self.zoom_threads.unwrap_or(self.max_threads)
    }

    pub fn screenshot_thread_count(&self) -> usize {
        self.screenshot_threads.unwrap_or(self.max_threads)
    }

    /// Flags that an existing timeline's recorded options would override.
    pub fn changed_timeline_flags(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.hd {
            changed.push("hd");
        }
        if self.day_only {
            changed.push("dayonly");
        }
        if self.night_only {
            changed.push("nightonly");
        }
        if self.build_range != DEFAULT_BUILD_RANGE {
            changed.push("build-range");
        }
        if self.connect_range != DEFAULT_CONNECT_RANGE {
            changed.push("connect-range");
        }
        if self.tag_range != DEFAULT_TAG_RANGE {
            changed.push("tag-range");
        }
        changed
    }

    /// Resolves the game binary: the explicit path if given, otherwise the
    /// first existing file among the conventional install locations.
    pub fn locate_game_binary(&self) -> MapforgeResult<PathBuf> {
        if let Some(explicit) = &self.game_binary {
            if explicit.is_file() {
                return Ok(explicit.clone());
            }
            return Err(MapforgeError::launch(format!(
                "game binary '{}' does not exist",
                explicit.display()
            )));
        }
        for candidate in self.binary_candidates() {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(MapforgeError::launch(
            "cannot find the game binary in any conventional location; pass --factorio=PATH",
        ))
    }

    fn binary_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![
            self.user_folder.join("bin").join("x64").join("factorio.exe"),
            self.user_folder.join("bin").join("x64").join("factorio"),
        ];
        if cfg!(windows) {
            for drive in ["C:", "D:", "E:"] {
                for rel in [
                    "Program Files/Factorio/bin/x64/factorio.exe",
                    "Games/Factorio/bin/x64/factorio.exe",
                    "Program Files (x86)/Steam/steamapps/common/Factorio/bin/x64/factorio.exe",
                    "Steam/steamapps/common/Factorio/bin/x64/factorio.exe",
                ] {
                    candidates.push(PathBuf::from(format!("{drive}/{rel}")));
                }
            }
        }
        candidates
    }
}
