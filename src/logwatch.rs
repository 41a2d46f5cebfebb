//! Log-stream parsing.
//!
//! The external process talks to us only through an unstructured text
//! channel: its stdout when we spawned it directly, or its growing log file
//! when a third-party wrapper owns the real child. A line classifier walks
//! that stream and extracts exactly three signals — readiness (the
//! handshake banner), tag data (the structured export grammar) and
//! console-worthy lines — while tolerating arbitrary interleaved noise.
//!
//! Classification is a pure transition function over an explicit state
//! (`Classifier::classify` returns an [`Action`] and performs no IO), so
//! every rule is testable without spawning the real process. The reader
//! loop applies exactly one side effect per line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use regex::Regex;

use crate::console;
use crate::error::{MapforgeError, MapforgeResult};
use crate::modlist::MOD_NAME;
use crate::poll;
use crate::process::{self, ProcessHandle};

/// Marker prefix of the structured tag-export grammar.
pub const TAG_MARKER: &str = "FactorioMaps_Output_RawTagPaths";

/// The wrapper's startup banner; seeing it as the first line selects the
/// file-tailing source mode.
pub const WRAPPER_BANNER: &str = "Initializing Steam API.";

/// Name of the growing log file in the run's write-data directory.
pub const CURRENT_LOG_FILE: &str = "factorio-current.log";

const STACK_MARKER: &str = "stack traceback:";

const SEVERITY: [&str; 5] = ["error", "warn", "exception", "fail", "invalid"];

fn shape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ *\d+(?:\.\d+)? *[^\n]*$").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^ *\d+(?:\.\d+)? *Script *@__{}__/data-final-fixes\.lua:\d+: {}:([^:]+):(.*)$",
            regex::escape(MOD_NAME),
            TAG_MARKER
        ))
        .unwrap()
    })
}

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^ *\d+(?:\.\d+)? *Script *@__{}__/(.*?)(?:(\[info\]) ?(.*))?$",
            regex::escape(MOD_NAME)
        ))
        .unwrap()
    })
}

fn banner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^ *\d+\.\d{3} \d{4}-\d\d-\d\d \d\d:\d\d:\d\d; Factorio (\d+\.\d+\.\d+) \(build (\d+), [^)]+\)$",
        )
        .unwrap()
    })
}

// ---------------------------------------------------------------------------
// RawTags

/// The write-once tag map scraped from the log stream.
///
/// Write-many until [`RawTags::mark_used`]; any insert after that is a
/// protocol error — tag data arriving after it was consumed means the
/// consumer worked from an incomplete map, which must fail loudly rather
/// than silently produce wrong output.
#[derive(Default)]
pub struct RawTags {
    inner: Mutex<RawTagsInner>,
}

#[derive(Default)]
struct RawTagsInner {
    map: HashMap<String, String>,
    used: bool,
}

impl RawTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, value: String) -> MapforgeResult<()> {
        let mut inner = self.inner.lock().expect("tag map poisoned");
        if inner.used {
            return Err(MapforgeError::protocol(format!(
                "tag '{key}' added after the tag map was used"
            )));
        }
        inner.map.insert(key, value);
        Ok(())
    }

    pub fn mark_used(&self) {
        self.inner.lock().expect("tag map poisoned").used = true;
    }

    pub fn is_used(&self) -> bool {
        self.inner.lock().expect("tag map poisoned").used
    }

    /// Looks up the `|`-joined icon path list for `(iconType, iconName)`.
    pub fn get(&self, icon_type: &str, icon_name: &str) -> Option<String> {
        let key = crate::document::tag_key(icon_type, icon_name);
        self.inner
            .lock()
            .expect("tag map poisoned")
            .map
            .get(&key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tag map poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Classifier

/// What the reader loop should do with one line. Exactly one per line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Discard,
    /// Unshaped line following an echoed one: multi-line continuation.
    EchoContinuation,
    StoreTag {
        key: String,
        value: String,
    },
    /// Stack-trace block line, echoed with the game prefix.
    EchoStackTrace,
    /// The mod's own `[info]` payload.
    EchoInfo(String),
    /// The mod's raw output, echoed only in verbose mode.
    EchoScript(String),
    /// Severity keyword or verbose-game echo, with the game prefix.
    EchoGame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    AwaitingHandshake,
    Streaming,
}

/// How the stream is sourced after a recognised handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeKind {
    /// Launched through a wrapper: switch to tailing the log file.
    Wrapped,
    /// Direct launch; the version banner was recognised.
    Direct { version: String },
}

/// Classifies the first line of the stream.
pub fn handshake(first_line: &str) -> MapforgeResult<HandshakeKind> {
    if first_line.ends_with(WRAPPER_BANNER) {
        return Ok(HandshakeKind::Wrapped);
    }
    if let Some(caps) = banner_re().captures(first_line) {
        return Ok(HandshakeKind::Direct {
            version: caps[1].to_string(),
        });
    }
    Err(MapforgeError::protocol(format!(
        "unrecognised output from the game (maybe the version is unsupported?): {first_line}"
    )))
}

/// The line classifier: an explicit state machine with two carried flags.
///
/// First match wins, in this order: unshaped continuation, tag grammar,
/// stack-trace block, the mod's own output, severity/verbose-game echo,
/// discard.
pub struct Classifier {
    state: State,
    verbose: bool,
    verbose_game: bool,
    in_stack_trace: bool,
    prev_echoed: bool,
}

impl Classifier {
    pub fn new(verbose: bool, verbose_game: bool) -> Self {
        Self {
            state: State::AwaitingHandshake,
            verbose,
            verbose_game,
            in_stack_trace: false,
            prev_echoed: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn classify(&mut self, line: &str) -> Action {
        self.state = State::Streaming;

        if !shape_re().is_match(line) {
            // A continuation block keeps flowing as long as it started from
            // an echoed line; the stack-trace flag does not survive it.
            self.in_stack_trace = false;
            return if self.prev_echoed {
                Action::EchoContinuation
            } else {
                Action::Discard
            };
        }

        let was_stack = self.in_stack_trace;
        self.in_stack_trace = false;
        self.prev_echoed = false;

        if let Some(caps) = tag_re().captures(line) {
            return Action::StoreTag {
                key: caps[1].to_string(),
                value: caps[2].to_string(),
            };
        }

        if was_stack || line == STACK_MARKER {
            self.in_stack_trace = true;
            self.prev_echoed = true;
            return Action::EchoStackTrace;
        }

        if let Some(caps) = script_re().captures(line) {
            if caps.get(2).is_some() {
                self.prev_echoed = true;
                return Action::EchoInfo(
                    caps.get(3).map(|m| m.as_str()).unwrap_or("").to_string(),
                );
            }
            if self.verbose {
                self.prev_echoed = true;
                return Action::EchoScript(caps[1].to_string());
            }
        }

        let lower = line.to_lowercase();
        if SEVERITY.contains(&lower.as_str()) || (self.verbose_game && !line.is_empty()) {
            self.prev_echoed = true;
            return Action::EchoGame;
        }

        Action::Discard
    }

    #[cfg(test)]
    fn force_stack_trace(&mut self) {
        self.in_stack_trace = true;
    }
}

// ---------------------------------------------------------------------------
// Line sources

/// Where log lines come from after the handshake.
pub enum LogSource {
    /// The spawned child's stdout.
    Piped(BufReader<ChildStdout>),
    /// A growing log file, polled for new data; ends when the watched pid
    /// disappears from the process table.
    Tail { reader: BufReader<File>, pid: u32 },
}

impl LogSource {
    /// Blocks for the next complete line; `None` means the stream ended.
    pub fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self {
            LogSource::Piped(reader) => {
                let mut buf = String::new();
                if reader.read_line(&mut buf)? == 0 {
                    return Ok(None);
                }
                Ok(Some(trim_newline(buf)))
            }
            LogSource::Tail { reader, pid } => loop {
                let mut buf = String::new();
                let n = reader.read_line(&mut buf)?;
                if n > 0 && buf.ends_with('\n') {
                    return Ok(Some(trim_newline(buf)));
                }
                // No new complete line yet: rewind over any partial read and
                // poll again unless the writer is gone.
                if n > 0 {
                    reader.seek_relative(-(n as i64))?;
                }
                if !process::is_pid_alive(*pid) {
                    return Ok(None);
                }
                std::thread::sleep(poll::MARKER_INTERVAL);
            },
        }
    }
}

fn trim_newline(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

// ---------------------------------------------------------------------------
// Session

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub verbose: bool,
    pub verbose_game: bool,
    /// The run's write-data directory, where the wrapped launch's log file
    /// appears.
    pub run_dir: PathBuf,
    /// Same-named pids that existed before the launch.
    pub blacklist: Vec<u32>,
    pub discovery_limit: Duration,
}

/// A running log-reader thread attached to one game launch.
pub struct LogSession {
    thread: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl LogSession {
    /// A protocol fault the reader hit after the handshake, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().expect("fault slot poisoned").clone()
    }

    /// Joins the reader thread (it exits when its stream ends) and returns
    /// any recorded fault.
    pub fn join(mut self) -> Option<String> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.fault()
    }
}

/// Attaches a reader to a freshly launched child: performs the handshake,
/// resolves the real process handle (directly or via process-table
/// discovery), drops its priority and streams the rest of the log in a
/// background thread.
pub fn start(
    child: &mut Child,
    cfg: SessionConfig,
    tags: Arc<RawTags>,
) -> MapforgeResult<(ProcessHandle, LogSession)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MapforgeError::launch("game stdout was not piped"))?;
    let child_pid = child.id();

    let (tx, rx) = crossbeam_channel::bounded::<MapforgeResult<ProcessHandle>>(1);
    let fault = Arc::new(Mutex::new(None));
    let fault_slot = fault.clone();
    let recv_limit = cfg.discovery_limit * 2 + Duration::from_secs(10);

    let thread = std::thread::Builder::new()
        .name("logwatch".to_string())
        .spawn(move || read_loop(stdout, child_pid, cfg, tags, tx, fault_slot))
        .map_err(|e| MapforgeError::launch(format!("failed to spawn log reader: {e}")))?;

    let handle = rx
        .recv_timeout(recv_limit)
        .map_err(|_| {
            MapforgeError::launch("log reader died before completing the handshake")
        })??;

    Ok((
        handle,
        LogSession {
            thread: Some(thread),
            fault,
        },
    ))
}

fn read_loop(
    stdout: ChildStdout,
    child_pid: u32,
    cfg: SessionConfig,
    tags: Arc<RawTags>,
    tx: crossbeam_channel::Sender<MapforgeResult<ProcessHandle>>,
    fault: Arc<Mutex<Option<String>>>,
) {
    let mut classifier = Classifier::new(cfg.verbose, cfg.verbose_game);
    let mut reader = BufReader::new(stdout);

    let mut first = String::new();
    match reader.read_line(&mut first) {
        Ok(0) => {
            let _ = tx.send(Err(MapforgeError::launch(
                "the game exited without producing any output",
            )));
            return;
        }
        Ok(_) => {}
        Err(e) => {
            let _ = tx.send(Err(MapforgeError::launch(format!(
                "failed to read the game's first line: {e}"
            ))));
            return;
        }
    }
    let first = trim_newline(first);

    let kind = match handshake(&first) {
        Ok(kind) => kind,
        Err(e) => {
            let _ = tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = apply_action(&first, classifier.classify(&first), &tags) {
        let _ = tx.send(Err(e));
        return;
    }

    let (handle, mut source) = match kind {
        HandshakeKind::Direct { version } => {
            tracing::debug!("game version {version}");
            (
                ProcessHandle {
                    pid: child_pid,
                    indirect: false,
                },
                LogSource::Piped(reader),
            )
        }
        HandshakeKind::Wrapped => {
            tracing::warn!(
                "running in limited support mode through the wrapper; confirm its launch \
                 popup and consider a standalone install"
            );
            let log_path = cfg.run_dir.join(CURRENT_LOG_FILE);
            if let Err(e) = poll::wait_for_file(&log_path, cfg.discovery_limit)
                .required(&format!("log file '{}'", log_path.display()))
            {
                let _ = tx.send(Err(e));
                return;
            }
            let pid = match process::discover_new_pid(
                process::PROCESS_NAME,
                &cfg.blacklist,
                cfg.discovery_limit,
            ) {
                Ok(pid) => pid,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let file = match File::open(&log_path) {
                Ok(f) => f,
                Err(e) => {
                    let _ = tx.send(Err(MapforgeError::launch(format!(
                        "failed to open '{}': {e}",
                        log_path.display()
                    ))));
                    return;
                }
            };
            drop(reader);
            (
                ProcessHandle { pid, indirect: true },
                LogSource::Tail {
                    reader: BufReader::new(file),
                    pid,
                },
            )
        }
    };

    let _ = tx.send(Ok(handle));
    process::lower_priority(handle.pid);

    loop {
        match source.next_line() {
            Ok(Some(line)) => {
                let action = classifier.classify(&line);
                if let Err(e) = apply_action(&line, action, &tags) {
                    tracing::error!("{e}");
                    *fault.lock().expect("fault slot poisoned") = Some(e.to_string());
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("log stream ended: {e}");
                return;
            }
        }
    }
}

/// Applies the single side effect a classified line carries.
fn apply_action(line: &str, action: Action, tags: &RawTags) -> MapforgeResult<()> {
    match action {
        Action::Discard => {}
        Action::EchoContinuation => console::persistent(line),
        Action::StoreTag { key, value } => tags.insert(key, value)?,
        Action::EchoStackTrace | Action::EchoGame => {
            console::persistent(&format!("[GAME] {line}"));
        }
        Action::EchoInfo(msg) | Action::EchoScript(msg) => console::persistent(&msg),
    }
    Ok(())
}
