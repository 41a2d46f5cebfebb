use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mapforge::RenderOptions;

#[derive(Parser, Debug)]
#[command(name = "mapforge", version, about = "Generate a browsable map timeline from game saves")]
struct Cli {
    /// Only take daytime screenshots.
    #[arg(long, conflicts_with = "nightonly")]
    dayonly: bool,

    /// Only take nighttime screenshots.
    #[arg(long)]
    nightonly: bool,

    /// Capture at high resolution.
    #[arg(long)]
    hd: bool,

    /// Hide entity info (alt mode).
    #[arg(long = "no-altmode")]
    no_altmode: bool,

    /// Hide map tags.
    #[arg(long = "no-tags")]
    no_tags: bool,

    /// Maximum range around buildings to capture (in chunks).
    #[arg(long = "build-range", default_value_t = mapforge::options::DEFAULT_BUILD_RANGE)]
    build_range: f64,

    /// Maximum range around connection buildings (rails, poles) to capture.
    #[arg(long = "connect-range", default_value_t = mapforge::options::DEFAULT_CONNECT_RANGE)]
    connect_range: f64,

    /// Maximum range around map tags to capture.
    #[arg(long = "tag-range", default_value_t = mapforge::options::DEFAULT_TAG_RANGE)]
    tag_range: f64,

    /// Surface to capture; repeat for multiple surfaces. Empty means the
    /// surface the player is standing on.
    #[arg(long = "surface")]
    surface: Vec<String>,

    /// Path to the game binary instead of probing common locations.
    #[arg(long = "factorio")]
    factorio: Option<PathBuf>,

    /// Mod folder to use.
    #[arg(long = "modpath")]
    modpath: Option<PathBuf>,

    /// Output under script-output/NAME instead of the default.
    #[arg(long = "basepath", default_value = mapforge::options::DEFAULT_BASE_NAME)]
    basepath: String,

    /// Date attached to the snapshot [dd/mm/yy]; defaults to today.
    #[arg(long)]
    date: Option<String>,

    /// Show the tool's own script logs.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Show all game logs.
    #[arg(long)]
    verbosegame: bool,

    /// Threads used for all steps; defaults to the logical core count.
    #[arg(long)]
    maxthreads: Option<usize>,

    /// Threads for the crop step.
    #[arg(long)]
    cropthreads: Option<usize>,

    /// Threads for the cross-referencing step.
    #[arg(long)]
    refthreads: Option<usize>,

    /// Threads for the zoom step.
    #[arg(long)]
    zoomthreads: Option<usize>,

    /// Screenshotting threads the game itself uses.
    #[arg(long)]
    screenshotthreads: Option<usize>,

    /// Delete the output folder before running.
    #[arg(long)]
    delete: bool,

    /// Skip the game and the main steps; only set up and finish.
    #[arg(long)]
    dry: bool,

    /// The game's user folder (saves/, mods/, config/, script-output/).
    #[arg(long = "user-folder")]
    user_folder: Option<PathBuf>,

    /// Output folder for the generated snapshots.
    outfolder: Option<String>,

    /// Saves to generate snapshots from; defaults to the latest save or the
    /// one matching OUTFOLDER.
    savename: Vec<String>,
}

fn today() -> String {
    chrono::Local::now().format("%d/%m/%y").to_string()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // An interrupt must not leave the game running, the mod toggle flipped
    // or a run environment behind; drops never run on a signal, so fire the
    // registered cleanups explicitly.
    ctrlc::set_handler(|| {
        mapforge::interrupt::fire_all();
        std::process::exit(130);
    })
    .context("install interrupt handler")?;

    let defaults = RenderOptions::default();
    let user_folder = cli.user_folder.unwrap_or(defaults.user_folder);
    let opts = RenderOptions {
        hd: cli.hd,
        day_only: cli.dayonly,
        night_only: cli.nightonly,
        alt_mode: !cli.no_altmode,
        tags: !cli.no_tags,
        tag_range: cli.tag_range,
        build_range: cli.build_range,
        connect_range: cli.connect_range,
        surfaces: cli.surface,
        date: cli.date.unwrap_or_else(today),
        verbose: cli.verbose,
        verbose_game: cli.verbosegame,
        max_threads: cli.maxthreads.unwrap_or(defaults.max_threads),
        crop_threads: cli.cropthreads,
        ref_threads: cli.refthreads,
        zoom_threads: cli.zoomthreads,
        screenshot_threads: cli.screenshotthreads,
        delete_existing: cli.delete,
        dry_run: cli.dry,
        game_binary: cli.factorio,
        mod_path: cli.modpath.unwrap_or_else(|| user_folder.join("mods")),
        base_name: cli.basepath,
        user_folder,
    };

    mapforge::run(&opts, cli.outfolder.as_deref(), &cli.savename)
        .context("map generation failed")?;
    Ok(())
}
