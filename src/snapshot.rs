//! The per-save orchestration loop.
//!
//! Snapshots are processed strictly in order; exactly one screenshot phase
//! is active at a time. Postprocessing of a snapshot's final record is
//! handed to a depth-1 background worker so the next snapshot's screenshot
//! phase can start immediately, and that worker is joined again before the
//! next run configuration is rendered — the configuration embeds the chunk
//! cache and map state the worker writes, so the join is a hard durability
//! barrier, not an optimization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;

use crate::console;
use crate::document;
use crate::error::{MapforgeError, MapforgeResult};
use crate::logwatch::{self, RawTags, SessionConfig};
use crate::modlist::{MOD_NAME, ModListGuard};
use crate::options::RenderOptions;
use crate::poll;
use crate::process::{self, LaunchSpec, ProcessHandle};
use crate::runconfig::AutorunConfig;
use crate::runenv::RunEnv;
use crate::stages::{StageEngine, StagePools, TileEngine};

/// The completion manifest the game writes once a snapshot's batches are
/// all enumerated.
pub const MANIFEST_FILE: &str = "latest.txt";

/// Per-batch completion marker inside a batch's image directory.
pub const DONE_MARKER: &str = "done.txt";

/// Upper bound on one screenshot phase. Generous: megabase saves take a
/// long time, but "forever" is a liveness fault, not patience.
pub const SCREENSHOT_LIMIT: Duration = Duration::from_secs(4 * 60 * 60);

/// Upper bound on waiting for a single per-batch marker.
pub const MARKER_LIMIT: Duration = Duration::from_secs(60 * 60);

const AUTOSAVES: [&str; 3] = ["_autosave1", "_autosave2", "_autosave3"];

// ---------------------------------------------------------------------------
// Manifest records

/// One manifest line, parsed. Produced once by the game per finished batch,
/// consumed exactly once, in file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenshotRecord {
    /// Output folder name; the manifest encodes its spaces as slashes.
    pub out_folder: String,
    pub timestamp: String,
    pub daytime: String,
    pub surface: String,
    /// Game-defined positional fields, pipe-escaped spaces restored.
    pub extras: Vec<String>,
}

/// Parses `<folder> <timestamp> <daytime> <surface> <extras...>`, restoring
/// the folder's slash-encoded spaces and every other field's pipe-encoded
/// spaces.
pub fn parse_manifest_line(line: &str) -> MapforgeResult<ScreenshotRecord> {
    let mut fields = line.split(' ');
    let folder = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| MapforgeError::document(format!("malformed manifest line: {line:?}")))?;
    let rest: Vec<String> = fields.map(|f| f.replace('|', " ")).collect();
    if rest.len() < 3 {
        return Err(MapforgeError::document(format!(
            "manifest line has {} fields, expected at least 4: {line:?}",
            rest.len() + 1
        )));
    }
    Ok(ScreenshotRecord {
        out_folder: folder.replace('/', " "),
        timestamp: rest[0].clone(),
        daytime: rest[1].clone(),
        surface: rest[2].clone(),
        extras: rest[3..].to_vec(),
    })
}

pub fn parse_manifest(text: &str) -> MapforgeResult<Vec<ScreenshotRecord>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_manifest_line)
        .collect()
}

fn record_done_path(base_output: &Path, record: &ScreenshotRecord) -> PathBuf {
    base_output
        .join(&record.out_folder)
        .join("Images")
        .join(&record.timestamp)
        .join(&record.daytime)
        .join(&record.surface)
        .join(DONE_MARKER)
}

// ---------------------------------------------------------------------------
// Save queue

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotQueue {
    /// Timeline folder name under the output root.
    pub foldername: String,
    /// Save stems, ordered, deduplicated first-seen-wins.
    pub saves: Vec<String>,
}

/// Resolves the requested save names against the saves directory.
///
/// With no explicit folder the most recently modified save (autosaves
/// excluded) names the timeline; with no explicit saves the timeline's name
/// is the single save. Each name is globbed as-is and with `.zip`; an empty
/// match set is fatal.
pub fn resolve_save_queue(
    saves_dir: &Path,
    outfolder: Option<&str>,
    savenames: &[String],
) -> MapforgeResult<SnapshotQueue> {
    let foldername = match outfolder {
        Some(f) => f.to_string(),
        None => {
            let latest = latest_save_stem(saves_dir)?;
            tracing::info!("no save name passed; using most recent save: {latest}");
            latest
        }
    };
    let requested: Vec<String> = if savenames.is_empty() {
        vec![foldername.clone()]
    } else {
        savenames.to_vec()
    };

    let mut saves: Vec<String> = Vec::new();
    for name in &requested {
        let mut matches: Vec<PathBuf> = Vec::new();
        for pattern in [name.clone(), format!("{name}.zip")] {
            let full = saves_dir.join(&pattern).to_string_lossy().into_owned();
            let paths = glob::glob(&full).map_err(|e| {
                MapforgeError::validation(format!("bad save pattern \"{name}\": {e}"))
            })?;
            for path in paths.flatten() {
                if path.is_file() {
                    matches.push(path);
                }
            }
        }
        if matches.is_empty() {
            return Err(MapforgeError::validation(format!(
                "cannot find savefile: \"{name}\""
            )));
        }
        for path in matches {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && !saves.iter().any(|s| s == stem)
            {
                saves.push(stem.to_string());
            }
        }
    }
    Ok(SnapshotQueue { foldername, saves })
}

fn latest_save_stem(saves_dir: &Path) -> MapforgeResult<String> {
    let mut best: Option<(std::time::SystemTime, String)> = None;
    for entry in std::fs::read_dir(saves_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if AUTOSAVES.contains(&stem) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, stem.to_string()));
        }
    }
    best.map(|(_, stem)| stem)
        .ok_or_else(|| MapforgeError::validation("no save files found"))
}

fn resolve_save_file(saves_dir: &Path, savename: &str) -> MapforgeResult<PathBuf> {
    for candidate in [
        saves_dir.join(format!("{savename}.zip")),
        saves_dir.join(savename),
    ] {
        if candidate.exists() {
            return std::path::absolute(&candidate).map_err(MapforgeError::Io);
        }
    }
    Err(MapforgeError::validation(format!(
        "save \"{savename}\" disappeared from '{}'",
        saves_dir.display()
    )))
}

// ---------------------------------------------------------------------------
// Background worker

/// Depth-1 background work slot for a snapshot's deferred postprocessing.
///
/// `submit` joins any outstanding job first, so at most one job is ever in
/// flight; `barrier` joins without submitting and is the durability barrier
/// executed before each new snapshot's configuration render.
#[derive(Default)]
pub struct PostWorker {
    slot: Option<JoinHandle<MapforgeResult<()>>>,
}

impl PostWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(
        &mut self,
        job: impl FnOnce() -> MapforgeResult<()> + Send + 'static,
    ) -> MapforgeResult<()> {
        self.barrier()?;
        let handle = std::thread::Builder::new()
            .name("postprocess".to_string())
            .spawn(job)
            .map_err(|e| {
                MapforgeError::Other(anyhow::anyhow!("failed to spawn postprocess worker: {e}"))
            })?;
        self.slot = Some(handle);
        Ok(())
    }

    pub fn barrier(&mut self) -> MapforgeResult<()> {
        if let Some(handle) = self.slot.take() {
            handle
                .join()
                .map_err(|_| MapforgeError::Other(anyhow::anyhow!("postprocess worker panicked")))??;
        }
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.slot.is_none()
    }
}

fn join_jobs(jobs: Vec<JoinHandle<MapforgeResult<()>>>) -> MapforgeResult<()> {
    let mut first_err = None;
    for job in jobs {
        match job.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => {
                first_err.get_or_insert(MapforgeError::Other(anyhow::anyhow!(
                    "record postprocessing thread panicked"
                )));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Record dispatch

/// Walks a snapshot's records in file order.
///
/// Per record: wait for its batch marker, crop synchronously, then schedule
/// cross-reference+zoom — asynchronously for every record but the last.
/// `before_final` runs between the record walk and the final record's
/// postprocessing (the driver tears the game down there). The final
/// record's job joins the snapshot's async jobs, postprocesses, then
/// recomputes the render boxes; it runs synchronously for the queue's last
/// snapshot (the program must not exit before it finishes) and on the
/// background worker otherwise.
pub(crate) fn dispatch_records(
    engine: &Arc<dyn StageEngine>,
    worker: &mut PostWorker,
    records: &[ScreenshotRecord],
    snapshot_index: usize,
    is_last_snapshot: bool,
    wait_marker: &dyn Fn(&ScreenshotRecord) -> MapforgeResult<()>,
    before_final: impl FnOnce() -> MapforgeResult<()>,
) -> MapforgeResult<()> {
    let Some((last, rest)) = records.split_last() else {
        return Err(MapforgeError::document("completion manifest is empty"));
    };

    let mut timestamp = String::new();
    let mut daytime_surfaces: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut async_jobs: Vec<JoinHandle<MapforgeResult<()>>> = Vec::new();
    let total = records.len();

    for (jindex, record) in records.iter().enumerate() {
        console::progress(&format!(
            "processing {}/{}/{}/{} ({} of {})",
            record.out_folder,
            record.timestamp,
            record.daytime,
            record.surface,
            jindex + 1,
            total
        ));
        timestamp = record.timestamp.clone();
        daytime_surfaces
            .entry(record.surface.clone())
            .or_default()
            .push(record.daytime.clone());

        wait_marker(record)?;
        engine.crop(record)?;

        if jindex < rest.len() {
            let engine = engine.clone();
            let record = record.clone();
            let job = std::thread::Builder::new()
                .name(format!("post-{jindex}"))
                .spawn(move || {
                    engine.cross_reference(&record)?;
                    engine.zoom(&record, is_last_snapshot)
                })
                .map_err(|e| {
                    MapforgeError::Other(anyhow::anyhow!("failed to spawn record job: {e}"))
                })?;
            async_jobs.push(job);
        }
    }

    before_final()?;

    let engine = engine.clone();
    let last = last.clone();
    let final_job = move || -> MapforgeResult<()> {
        join_jobs(async_jobs)?;
        engine.cross_reference(&last)?;
        engine.zoom(&last, is_last_snapshot)?;
        engine.zoom_renderboxes(snapshot_index, &daytime_surfaces, &timestamp)
    };

    if is_last_snapshot {
        final_job()
    } else {
        worker.submit(final_job)
    }
}

// ---------------------------------------------------------------------------
// Driver

struct KillOnDrop {
    handle: ProcessHandle,
    token: Option<crate::interrupt::CleanupToken>,
}

impl KillOnDrop {
    fn new(handle: ProcessHandle) -> Self {
        let token = crate::interrupt::on_interrupt(move || {
            let _ = process::terminate(&handle, process::EXIT_LIMIT);
        });
        Self {
            handle,
            token: Some(token),
        }
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            crate::interrupt::dismiss(token);
        }
        if let Err(e) = process::terminate(&self.handle, process::EXIT_LIMIT) {
            tracing::warn!("{e}");
        }
    }
}

struct WatcherGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherGuard {
    /// Waits (bounded by the stop flag) for the per-batch marker of the
    /// manifest's last record, then takes the game down. The driver also
    /// terminates on its own path; double-termination is tolerated by
    /// design of [`process::terminate`].
    fn spawn(done_path: PathBuf, handle: ProcessHandle) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                if done_path.is_file() {
                    if let Err(e) = process::terminate(&handle, process::EXIT_LIMIT) {
                        tracing::warn!("{e}");
                    }
                    return;
                }
                std::thread::sleep(poll::MARKER_INTERVAL);
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Driver<'a> {
    opts: &'a RenderOptions,
    binary: PathBuf,
    queue: &'a SnapshotQueue,
    workfolder: PathBuf,
    base_output: PathBuf,
    engine: Arc<dyn StageEngine>,
    tags: Arc<RawTags>,
    worker: PostWorker,
    first_snapshot: bool,
}

impl Driver<'_> {
    fn run_queue(&mut self) -> MapforgeResult<()> {
        let queue = self.queue;
        for (index, savename) in queue.saves.iter().enumerate() {
            self.process_snapshot(index, savename)?;
        }
        // Drain the last deferred job before the caller merges documents.
        self.worker.barrier()
    }

    fn process_snapshot(&mut self, index: usize, savename: &str) -> MapforgeResult<()> {
        let is_last_snapshot = index + 1 == self.queue.saves.len();
        tracing::info!(
            "snapshot {}/{}: {savename}",
            index + 1,
            self.queue.saves.len()
        );

        console::progress("cleaning up");
        let manifest_path = self.workfolder.join(MANIFEST_FILE);
        if manifest_path.is_file() {
            std::fs::remove_file(&manifest_path)?;
        }

        // Hard barrier: the previous snapshot's deferred postprocessing
        // writes the state the next configuration embeds.
        self.worker.barrier()?;

        console::progress("building run configuration");
        let map_info = document::load_map_info(&self.workfolder)?;
        if self.first_snapshot {
            if let Some(info) = &map_info {
                document::warn_overridden_flags(info, &self.opts.changed_timeline_flags());
            }
            self.first_snapshot = false;
        }
        let chunk_cache = document::load_chunk_cache(&self.workfolder)?.unwrap_or_else(|| json!({}));
        let autorun = AutorunConfig::from_options(
            self.opts,
            &self.queue.foldername,
            map_info.unwrap_or_else(|| json!({})),
            chunk_cache,
        );
        let autorun_path = self.opts.autorun_path();
        std::fs::write(&autorun_path, autorun.render())?;
        if self.opts.verbose {
            tracing::debug!("autorun payload:\n{}", autorun.render());
        }

        console::progress("building run environment");
        let env = RunEnv::materialize(self.opts)?;

        console::progress("starting the game");
        let spec = LaunchSpec {
            binary: self.binary.clone(),
            save_file: resolve_save_file(&self.opts.saves_dir(), savename)?,
            config_path: env.config_path.clone(),
            mod_directory: self.opts.mod_path.clone(),
        };
        let blacklist = process::pid_snapshot(process::PROCESS_NAME);
        let mut child = process::launch(&spec)?;

        let session_cfg = SessionConfig {
            verbose: self.opts.verbose,
            verbose_game: self.opts.verbose_game,
            run_dir: env.dir.clone(),
            blacklist,
            discovery_limit: process::DISCOVERY_LIMIT,
        };
        let (handle, session) = match logwatch::start(&mut child, session_cfg, self.tags.clone()) {
            Ok(started) => started,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        let _kill = KillOnDrop::new(handle);

        let outcome = poll::wait_until(SCREENSHOT_LIMIT, poll::MARKER_INTERVAL, || {
            if manifest_path.is_file() {
                return Some(Ok(()));
            }
            if !process::is_pid_alive(handle.pid) {
                // Re-check: the game may have written the manifest and
                // exited between the two probes.
                if manifest_path.is_file() {
                    return Some(Ok(()));
                }
                return Some(Err(MapforgeError::launch(format!(
                    "the game (pid {}) exited before the completion manifest '{}' appeared; \
                     its run directory was '{}'",
                    handle.pid,
                    manifest_path.display(),
                    env.dir.display()
                ))));
            }
            None
        });
        outcome.required(&format!(
            "completion manifest '{}' (pid {})",
            manifest_path.display(),
            handle.pid
        ))??;

        // The payload was consumed at load; blank it so a later launch
        // outside this tool cannot replay it.
        std::fs::write(&autorun_path, "")?;

        let records = parse_manifest(&std::fs::read_to_string(&manifest_path)?)?;
        if records.is_empty() {
            return Err(MapforgeError::document(format!(
                "completion manifest '{}' is empty",
                manifest_path.display()
            )));
        }

        let last_done = record_done_path(&self.base_output, records.last().expect("non-empty"));
        let watcher = WatcherGuard::spawn(last_done, handle);

        let base_output = self.base_output.clone();
        let result = dispatch_records(
            &self.engine,
            &mut self.worker,
            &records,
            index,
            is_last_snapshot,
            &|record| {
                poll::wait_for_file(&record_done_path(&base_output, record), MARKER_LIMIT)
                    .required(&format!(
                        "batch marker for {}/{}/{}",
                        record.timestamp, record.daytime, record.surface
                    ))
            },
            || {
                // Everything we need is on disk; take the game down before
                // the final record's heavy postprocessing starts.
                process::terminate(&handle, process::EXIT_LIMIT)?;
                drop(watcher);
                if let Some(fault) = session.join() {
                    return Err(MapforgeError::protocol(fault));
                }
                Ok(())
            },
        );
        console::clear_progress();

        // Force-terminate if any path above skipped it (idempotent), then
        // reap the spawned child so it does not linger as a zombie. In
        // wrapped mode the child is the wrapper, which exits on its own.
        drop(_kill);
        let _ = poll::wait_until(process::EXIT_LIMIT, Duration::from_millis(100), || {
            child.try_wait().ok().flatten().map(|_| ())
        });

        result
    }
}

// ---------------------------------------------------------------------------
// Entry point

/// Runs the whole queue: resolve saves, enable the companion mod, process
/// each snapshot, then merge the partial document and rewrite the browser
/// embed. The mod-list toggle is restored on every exit path.
pub fn run(
    opts: &RenderOptions,
    outfolder: Option<&str>,
    savenames: &[String],
) -> MapforgeResult<()> {
    opts.validate()?;
    let queue = resolve_save_queue(&opts.saves_dir(), outfolder, savenames)?;
    tracing::info!("generating snapshots for {:?}", queue.saves);

    let binary = opts.locate_game_binary()?;
    tracing::info!("game binary: {}", binary.display());

    let workfolder = opts.workfolder(&queue.foldername);
    if opts.delete_existing && workfolder.exists() {
        tracing::info!("deleting output folder {}", workfolder.display());
        std::fs::remove_dir_all(&workfolder)?;
    }
    std::fs::create_dir_all(&workfolder)?;

    let _modlist = ModListGuard::enable(opts.mod_list_path(), MOD_NAME)?;
    let tags = Arc::new(RawTags::new());

    if !opts.dry_run {
        let pools = StagePools::build(opts)?;
        let engine: Arc<dyn StageEngine> = Arc::new(TileEngine::new(
            opts.base_output(),
            workfolder.clone(),
            pools,
        ));
        let mut driver = Driver {
            opts,
            binary,
            queue: &queue,
            workfolder: workfolder.clone(),
            base_output: opts.base_output(),
            engine,
            tags: tags.clone(),
            worker: PostWorker::new(),
            first_snapshot: true,
        };
        driver.run_queue()?;
    }

    if document::apply_partial_file(&workfolder)? {
        tracing::info!("merged partial map document");
    }

    if let Some(map_info) = document::load_map_info(&workfolder)? {
        let collected = document::collect_tags(&map_info);
        tags.mark_used();
        tracing::info!(
            "collected {} tag records ({} icon paths scraped from the log)",
            collected.len(),
            tags.len()
        );
        document::write_js_embed(&workfolder)?;
        tracing::info!("map document written to {}", workfolder.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn manifest_line_restores_escaped_separators() {
        let record =
            parse_manifest_line("my/base 0.17.79 day nauvis 12|5 -3|-7").unwrap();
        assert_eq!(record.out_folder, "my base");
        assert_eq!(record.timestamp, "0.17.79");
        assert_eq!(record.daytime, "day");
        assert_eq!(record.surface, "nauvis");
        assert_eq!(record.extras, vec!["12 5".to_string(), "-3 -7".to_string()]);
    }

    #[test]
    fn manifest_surface_may_contain_escaped_spaces() {
        let record = parse_manifest_line("base 123 night Factory|floor|1").unwrap();
        assert_eq!(record.surface, "Factory floor 1");
    }

    #[test]
    fn short_manifest_lines_are_rejected() {
        assert!(parse_manifest_line("base 123 day").is_err());
        assert!(parse_manifest_line("").is_err());
    }

    #[test]
    fn manifest_yields_records_in_file_order() {
        let text = "base 1 day nauvis x\nbase 1 night nauvis x\n\nbase 2 day mars x\n";
        let records = parse_manifest(text).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].daytime, "day");
        assert_eq!(records[1].daytime, "night");
        assert_eq!(records[2].surface, "mars");
    }

    #[test]
    fn post_worker_is_depth_one() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut worker = PostWorker::new();

        let log_a = log.clone();
        worker
            .submit(move || {
                std::thread::sleep(Duration::from_millis(50));
                log_a.lock().unwrap().push("a");
                Ok(())
            })
            .unwrap();

        // The second submit must join the first before spawning.
        let log_b = log.clone();
        worker
            .submit(move || {
                log_b.lock().unwrap().push("b");
                Ok(())
            })
            .unwrap();
        assert_eq!(log.lock().unwrap().first(), Some(&"a"));

        worker.barrier().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert!(worker.is_idle());
    }

    #[test]
    fn post_worker_barrier_propagates_job_errors() {
        let mut worker = PostWorker::new();
        worker
            .submit(|| Err(MapforgeError::document("boom")))
            .unwrap();
        assert!(worker.barrier().is_err());
        assert!(worker.is_idle());
    }

    struct StubEngine {
        log: Mutex<Vec<String>>,
        ref_delay: Duration,
    }

    impl StubEngine {
        fn new(ref_delay: Duration) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                ref_delay,
            }
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.log.lock().unwrap().push(event);
        }
    }

    impl crate::stages::StageEngine for StubEngine {
        fn crop(&self, record: &ScreenshotRecord) -> MapforgeResult<()> {
            self.push(format!("crop:{}", record.timestamp));
            Ok(())
        }

        fn cross_reference(&self, record: &ScreenshotRecord) -> MapforgeResult<()> {
            std::thread::sleep(self.ref_delay);
            self.push(format!("ref:{}", record.timestamp));
            Ok(())
        }

        fn zoom(&self, record: &ScreenshotRecord, needs_thumbnail: bool) -> MapforgeResult<()> {
            self.push(format!("zoom:{}:{}", record.timestamp, needs_thumbnail));
            Ok(())
        }

        fn zoom_renderboxes(
            &self,
            snapshot_index: usize,
            _daytime_surfaces: &BTreeMap<String, Vec<String>>,
            timestamp: &str,
        ) -> MapforgeResult<()> {
            self.push(format!("boxes:{snapshot_index}:{timestamp}"));
            Ok(())
        }
    }

    fn record(timestamp: &str) -> ScreenshotRecord {
        ScreenshotRecord {
            out_folder: "base".to_string(),
            timestamp: timestamp.to_string(),
            daytime: "day".to_string(),
            surface: "nauvis".to_string(),
            extras: vec![],
        }
    }

    #[test]
    fn last_record_of_last_snapshot_completes_before_return() {
        let stub = Arc::new(StubEngine::new(Duration::from_millis(150)));
        let engine: Arc<dyn crate::stages::StageEngine> = stub.clone();
        let mut worker = PostWorker::new();
        let records = [record("t1"), record("t2")];

        let teardown = stub.clone();
        dispatch_records(
            &engine,
            &mut worker,
            &records,
            0,
            true,
            &|_| Ok(()),
            move || {
                teardown.push("teardown".to_string());
                Ok(())
            },
        )
        .unwrap();

        // Record t1's cross-reference+zoom ran asynchronously: its delayed
        // "ref" landed after t2's synchronous crop and after teardown. The
        // final record's work and the renderbox pass completed before
        // dispatch returned.
        let events = stub.events();
        assert_eq!(
            events,
            vec![
                "crop:t1", "crop:t2", "teardown", "ref:t1", "zoom:t1:true", "ref:t2",
                "zoom:t2:true", "boxes:0:t2",
            ]
        );
        assert!(worker.is_idle());
    }

    #[test]
    fn last_record_of_non_final_snapshot_is_deferred_to_the_worker() {
        let stub = Arc::new(StubEngine::new(Duration::from_millis(100)));
        let engine: Arc<dyn crate::stages::StageEngine> = stub.clone();
        let mut worker = PostWorker::new();
        let records = [record("t1"), record("t2")];

        dispatch_records(&engine, &mut worker, &records, 0, false, &|_| Ok(()), || Ok(()))
            .unwrap();

        // The final record's postprocessing is still in flight when
        // dispatch returns (the next snapshot's screenshot phase would
        // start here).
        assert!(!worker.is_idle());
        assert!(!stub.events().iter().any(|e| e.starts_with("boxes")));

        // The barrier drains it before the next configuration render.
        worker.barrier().unwrap();
        let events = stub.events();
        assert_eq!(
            events[events.len() - 5..],
            [
                "ref:t1".to_string(),
                "zoom:t1:false".to_string(),
                "ref:t2".to_string(),
                "zoom:t2:false".to_string(),
                "boxes:0:t2".to_string(),
            ]
        );
        assert!(worker.is_idle());
    }

    #[test]
    fn empty_manifest_is_rejected_by_dispatch() {
        let stub = Arc::new(StubEngine::new(Duration::ZERO));
        let engine: Arc<dyn crate::stages::StageEngine> = stub;
        let mut worker = PostWorker::new();
        let err =
            dispatch_records(&engine, &mut worker, &[], 0, true, &|_| Ok(()), || Ok(()))
                .unwrap_err();
        assert!(err.to_string().contains("manifest is empty"));
    }

    fn scratch_saves(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("mapforge_saves_{}_{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_queue_globs_and_deduplicates() {
        let dir = scratch_saves("dedup");
        for file in ["alpha.zip", "beta.zip"] {
            std::fs::write(dir.join(file), "x").unwrap();
        }
        let queue = resolve_save_queue(
            &dir,
            Some("timeline"),
            &["alpha".to_string(), "*".to_string(), "beta".to_string()],
        )
        .unwrap();
        assert_eq!(queue.foldername, "timeline");
        assert_eq!(queue.saves, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn missing_save_is_fatal() {
        let dir = scratch_saves("missing");
        let err =
            resolve_save_queue(&dir, Some("t"), &["nosuch".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nosuch"));
    }

    #[test]
    fn latest_save_skips_autosaves() {
        let dir = scratch_saves("latest");
        std::fs::write(dir.join("old.zip"), "x").unwrap();
        std::fs::write(dir.join("_autosave1.zip"), "x").unwrap();
        // Ensure a strictly newer mtime on the save we expect to win.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.join("newer.zip"), "x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.join("_autosave2.zip"), "x").unwrap();

        let queue = resolve_save_queue(&dir, None, &[]).unwrap();
        assert_eq!(queue.foldername, "newer");
        assert_eq!(queue.saves, vec!["newer".to_string()]);
    }
}
