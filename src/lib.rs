//! Mapforge turns a queue of game-world save snapshots into a browsable,
//! zoomable map.
//!
//! It drives the external game binary through an unstructured text channel,
//! scrapes the log stream for exactly the signals it needs (readiness, tag
//! data, completion), and assembles the rendered per-chunk screenshots into
//! an incrementally-updated multi-resolution tile pyramid with
//! cross-snapshot history.
//!
//! # Pipeline overview
//!
//! 1. **Supervise**: launch the game (directly or through a wrapper),
//!    recover the real pid, watch for completion, force-terminate.
//! 2. **Parse**: classify every log line through an explicit state machine;
//!    store tag exports into a write-once map.
//! 3. **Drive**: per save, render the run configuration (embedding the
//!    previous snapshot's map/chunk-cache state), materialize an isolated
//!    run environment, and dispatch each manifest record through the
//!    crop → cross-reference → zoom stages.
//! 4. **Merge**: overlay the pyramid stage's partial document into the
//!    master map document without disturbing recorded history.

#![forbid(unsafe_code)]

pub mod console;
pub mod document;
pub mod error;
pub mod interrupt;
pub mod logwatch;
pub mod modlist;
pub mod options;
pub mod poll;
pub mod process;
pub mod runconfig;
pub mod runenv;
pub mod snapshot;
pub mod stages;

pub use error::{MapforgeError, MapforgeResult};
pub use logwatch::{Action, Classifier, HandshakeKind, RawTags};
pub use options::RenderOptions;
pub use runconfig::AutorunConfig;
pub use snapshot::{ScreenshotRecord, SnapshotQueue, run};
pub use stages::{ChunkCacheEntry, StageEngine, TileEngine};
