//! Post-processing stages: crop, cross-reference, zoom.
//!
//! Each stage runs on its own bounded worker pool. The cross-reference and
//! zoom stages share a per-batch ledger keyed by (timestamp, daytime,
//! surface): cross-reference matches the batch's chunk images against chunk
//! geometry and derives link metadata, zoom builds the half-scale pyramid
//! and, once a timestamp's last record is in, writes the partial map
//! document and the refreshed chunk cache for the next snapshot to consume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::document::{CHUNK_CACHE_FILE, PARTIAL_FILE};
use crate::error::{MapforgeError, MapforgeResult};
use crate::options::RenderOptions;
use crate::snapshot::ScreenshotRecord;

/// Zoom level raw chunk captures live at; the pyramid counts down from here.
pub const BASE_ZOOM: u32 = 20;

/// Longest edge of the generated thumbnail.
const THUMBNAIL_EDGE: u32 = 512;

/// The stage contract the driver schedules against.
///
/// `crop` is synchronous per record; `cross_reference` and `zoom` run for
/// the same record in order (async relative to other records); the
/// renderbox pass runs after a timestamp's last record.
pub trait StageEngine: Send + Sync {
    fn crop(&self, record: &ScreenshotRecord) -> MapforgeResult<()>;
    fn cross_reference(&self, record: &ScreenshotRecord) -> MapforgeResult<()>;
    fn zoom(&self, record: &ScreenshotRecord, needs_thumbnail: bool) -> MapforgeResult<()>;
    fn zoom_renderboxes(
        &self,
        snapshot_index: usize,
        daytime_surfaces: &BTreeMap<String, Vec<String>>,
        timestamp: &str,
    ) -> MapforgeResult<()>;
}

/// One bounded pool per pipeline stage, independently sized.
pub struct StagePools {
    crop: rayon::ThreadPool,
    reference: rayon::ThreadPool,
    zoom: rayon::ThreadPool,
}

impl StagePools {
    pub fn build(opts: &RenderOptions) -> MapforgeResult<Self> {
        Ok(Self {
            crop: build_pool(opts.crop_thread_count())?,
            reference: build_pool(opts.ref_thread_count())?,
            zoom: build_pool(opts.zoom_thread_count())?,
        })
    }
}

fn build_pool(threads: usize) -> MapforgeResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| MapforgeError::validation(format!("failed to build stage pool: {e}")))
}

#[derive(Clone, Debug)]
struct Batch {
    chunks: Vec<(i32, i32)>,
    tile_size: u32,
    min_zoom: u32,
    box_: (i32, i32, i32, i32),
}

type BatchKey = (String, String, String);

/// Persisted per-surface state the external process uses to decide which
/// chunks to skip. Identity is purely coordinate-based; there is no content
/// hash.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ChunkCacheEntry {
    pub chunks: Vec<(i32, i32)>,
    #[serde(rename = "box")]
    pub render_box: [i32; 4],
}

type ChunkCache = BTreeMap<String, ChunkCacheEntry>;

/// The pyramid stage's partial output document, restricted to what it
/// computed; the driver overlays it into the master (`document` module).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
struct PartialDocument {
    maps: BTreeMap<String, PartialMap>,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
struct PartialMap {
    surfaces: BTreeMap<String, PartialSurface>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct PartialSurface {
    chunks: Vec<(i32, i32)>,
    links: Vec<PartialLink>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct PartialLink {
    path: String,
    zoom: ZoomRange,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
struct ZoomRange {
    min: u32,
    max: u32,
}

/// The bundled tile engine working directly on the output tree.
pub struct TileEngine {
    base_output: PathBuf,
    workfolder: PathBuf,
    pools: StagePools,
    batches: Mutex<HashMap<BatchKey, Batch>>,
}

impl TileEngine {
    pub fn new(base_output: PathBuf, workfolder: PathBuf, pools: StagePools) -> Self {
        Self {
            base_output,
            workfolder,
            pools,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn images_dir(&self, record: &ScreenshotRecord) -> PathBuf {
        self.base_output
            .join(&record.out_folder)
            .join("Images")
            .join(&record.timestamp)
            .join(&record.daytime)
            .join(&record.surface)
    }

    fn batch_key(record: &ScreenshotRecord) -> BatchKey {
        (
            record.timestamp.clone(),
            record.daytime.clone(),
            record.surface.clone(),
        )
    }
}

/// `<x>_<y>` chunk-coordinate file stems; anything else is not a chunk tile.
pub fn parse_chunk_name(stem: &str) -> Option<(i32, i32)> {
    let (x, y) = stem.split_once('_')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

/// Pyramid depth needed to cover `span` chunks with one tile.
fn pyramid_levels(span: u32) -> u32 {
    let mut levels = 0;
    let mut s = span;
    while s > 1 {
        s = s.div_ceil(2);
        levels += 1;
    }
    levels
}

/// The minimum zoom at which a batch spanning `span` chunks stays one tile.
pub fn min_zoom_for_span(span: u32) -> u32 {
    BASE_ZOOM - pyramid_levels(span.max(1))
}

fn chunk_tiles(dir: &Path) -> MapforgeResult<Vec<(i32, i32)>> {
    let mut chunks = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        if let Some(coords) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(parse_chunk_name)
        {
            chunks.push(coords);
        }
    }
    chunks.sort_unstable();
    Ok(chunks)
}

fn bounding_box(chunks: &[(i32, i32)]) -> (i32, i32, i32, i32) {
    let mut box_ = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
    for &(x, y) in chunks {
        box_.0 = box_.0.min(x);
        box_.1 = box_.1.min(y);
        box_.2 = box_.2.max(x);
        box_.3 = box_.3.max(y);
    }
    box_
}

impl StageEngine for TileEngine {
    /// Normalizes raw captures: the game drops uncompressed bitmaps, the
    /// pyramid works on PNG.
    fn crop(&self, record: &ScreenshotRecord) -> MapforgeResult<()> {
        let dir = self.images_dir(record);
        let mut raws = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("bmp") {
                raws.push(path);
            }
        }
        self.pools.crop.install(|| {
            raws.par_iter()
                .map(|path| {
                    let img = image::open(path).map_err(|e| {
                        MapforgeError::document(format!("{}: {e}", path.display()))
                    })?;
                    let out = path.with_extension("png");
                    img.save(&out)
                        .map_err(|e| MapforgeError::document(format!("{}: {e}", out.display())))?;
                    std::fs::remove_file(path)?;
                    Ok(())
                })
                .collect::<MapforgeResult<Vec<()>>>()
        })?;
        Ok(())
    }

    /// Matches the batch's images against chunk geometry and derives the
    /// link metadata (tile root path + minimum valid zoom).
    fn cross_reference(&self, record: &ScreenshotRecord) -> MapforgeResult<()> {
        let dir = self.images_dir(record);
        let chunks = chunk_tiles(&dir)?;
        if chunks.is_empty() {
            return Err(MapforgeError::document(format!(
                "no chunk images under '{}'",
                dir.display()
            )));
        }

        let (x, y) = chunks[0];
        let first = dir.join(format!("{x}_{y}.png"));
        let (width, height) = image::image_dimensions(&first)
            .map_err(|e| MapforgeError::document(format!("{}: {e}", first.display())))?;
        if width != height {
            return Err(MapforgeError::document(format!(
                "chunk image '{}' is not square ({width}x{height})",
                first.display()
            )));
        }

        // Every tile in the batch must agree with the chunk geometry; a
        // stray image of another size would corrupt the pyramid.
        self.pools.reference.install(|| {
            chunks
                .par_iter()
                .map(|&(x, y)| {
                    let path = dir.join(format!("{x}_{y}.png"));
                    let dims = image::image_dimensions(&path)
                        .map_err(|e| MapforgeError::document(format!("{}: {e}", path.display())))?;
                    if dims != (width, height) {
                        return Err(MapforgeError::document(format!(
                            "chunk image '{}' is {}x{}, expected {width}x{height}",
                            path.display(),
                            dims.0,
                            dims.1
                        )));
                    }
                    Ok(())
                })
                .collect::<MapforgeResult<Vec<()>>>()
        })?;

        let box_ = bounding_box(&chunks);
        let span = ((box_.2 - box_.0 + 1).max(box_.3 - box_.1 + 1)) as u32;
        let batch = Batch {
            chunks,
            tile_size: width,
            min_zoom: min_zoom_for_span(span),
            box_,
        };
        self.batches
            .lock()
            .expect("batch ledger poisoned")
            .insert(Self::batch_key(record), batch);
        Ok(())
    }

    /// Builds the half-scale pyramid down to the batch's minimum zoom.
    fn zoom(&self, record: &ScreenshotRecord, needs_thumbnail: bool) -> MapforgeResult<()> {
        let batch = self
            .batches
            .lock()
            .expect("batch ledger poisoned")
            .get(&Self::batch_key(record))
            .cloned()
            .ok_or_else(|| {
                MapforgeError::document(format!(
                    "zoom before cross-reference for {}/{}/{}",
                    record.timestamp, record.daytime, record.surface
                ))
            })?;

        let dir = self.images_dir(record);
        let size = batch.tile_size;
        let mut level_chunks = batch.chunks.clone();

        for z in (batch.min_zoom..BASE_ZOOM).rev() {
            let source_dir = if z + 1 == BASE_ZOOM {
                dir.clone()
            } else {
                dir.join((z + 1).to_string())
            };
            let targets: BTreeSet<(i32, i32)> = level_chunks
                .iter()
                .map(|&(x, y)| (x.div_euclid(2), y.div_euclid(2)))
                .collect();
            let out_dir = dir.join(z.to_string());
            std::fs::create_dir_all(&out_dir)?;

            self.pools.zoom.install(|| {
                targets
                    .par_iter()
                    .map(|&(tx, ty)| downsample_tile(&source_dir, &out_dir, tx, ty, size))
                    .collect::<MapforgeResult<Vec<()>>>()
            })?;
            level_chunks = targets.into_iter().collect();
        }

        if needs_thumbnail {
            write_thumbnail(&dir, batch.min_zoom, &level_chunks, size)?;
        }
        Ok(())
    }

    /// Recomputes the combined render box across every surface captured at
    /// `timestamp` and persists the partial document plus the chunk cache.
    fn zoom_renderboxes(
        &self,
        snapshot_index: usize,
        daytime_surfaces: &BTreeMap<String, Vec<String>>,
        timestamp: &str,
    ) -> MapforgeResult<()> {
        let batches = self.batches.lock().expect("batch ledger poisoned");
        let mut involved: Vec<(&str, &Batch)> = Vec::new();
        for ((ts, _, surface), batch) in batches.iter() {
            if ts == timestamp && daytime_surfaces.contains_key(surface) {
                involved.push((surface.as_str(), batch));
            }
        }
        if involved.is_empty() {
            return Err(MapforgeError::document(format!(
                "no processed batches for timestamp {timestamp}"
            )));
        }

        let mut combined = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        for (_, batch) in &involved {
            combined.0 = combined.0.min(batch.box_.0);
            combined.1 = combined.1.min(batch.box_.1);
            combined.2 = combined.2.max(batch.box_.2);
            combined.3 = combined.3.max(batch.box_.3);
        }
        let combined = [combined.0, combined.1, combined.2, combined.3];

        // Chunk cache: coordinate+surface identity only, no content hash.
        let cache_path = self.workfolder.join(CHUNK_CACHE_FILE);
        let mut cache: ChunkCache = match std::fs::read_to_string(&cache_path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| MapforgeError::document(format!("{}: {e}", cache_path.display())))?,
            Err(_) => ChunkCache::new(),
        };
        for (surface, batch) in &involved {
            cache.insert(
                (*surface).to_string(),
                ChunkCacheEntry {
                    chunks: batch.chunks.clone(),
                    render_box: combined,
                },
            );
        }
        std::fs::create_dir_all(&self.workfolder)?;
        std::fs::write(
            &cache_path,
            serde_json::to_string(&cache).map_err(|e| MapforgeError::document(e.to_string()))?,
        )?;

        // Partial document: only what this pass computed.
        let partial_path = self.workfolder.join(PARTIAL_FILE);
        let mut partial: PartialDocument = match std::fs::read_to_string(&partial_path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| MapforgeError::document(format!("{}: {e}", partial_path.display())))?,
            Err(_) => PartialDocument::default(),
        };
        let map = partial.maps.entry(snapshot_index.to_string()).or_default();
        for (surface, batch) in &involved {
            let daytime = daytime_surfaces
                .get(*surface)
                .and_then(|d| d.first())
                .cloned()
                .unwrap_or_else(|| "day".to_string());
            map.surfaces.insert(
                (*surface).to_string(),
                PartialSurface {
                    chunks: batch.chunks.clone(),
                    links: vec![PartialLink {
                        path: format!("Images/{timestamp}/{daytime}/{surface}"),
                        zoom: ZoomRange {
                            min: batch.min_zoom,
                            max: BASE_ZOOM,
                        },
                    }],
                },
            );
        }
        std::fs::write(
            &partial_path,
            serde_json::to_string(&partial).map_err(|e| MapforgeError::document(e.to_string()))?,
        )?;
        tracing::info!("render boxes refreshed for {timestamp}");
        Ok(())
    }
}

fn downsample_tile(
    source_dir: &Path,
    out_dir: &Path,
    tx: i32,
    ty: i32,
    size: u32,
) -> MapforgeResult<()> {
    let mut canvas = image::RgbaImage::new(size * 2, size * 2);
    let mut any = false;
    for dx in 0..2i32 {
        for dy in 0..2i32 {
            let src = source_dir.join(format!("{}_{}.png", tx * 2 + dx, ty * 2 + dy));
            if !src.is_file() {
                continue;
            }
            let tile = image::open(&src)
                .map_err(|e| MapforgeError::document(format!("{}: {e}", src.display())))?
                .to_rgba8();
            image::imageops::overlay(
                &mut canvas,
                &tile,
                i64::from(dx) * i64::from(size),
                i64::from(dy) * i64::from(size),
            );
            any = true;
        }
    }
    if !any {
        return Ok(());
    }
    let scaled = image::imageops::resize(&canvas, size, size, image::imageops::FilterType::Triangle);
    let out = out_dir.join(format!("{tx}_{ty}.png"));
    scaled
        .save(&out)
        .map_err(|e| MapforgeError::document(format!("{}: {e}", out.display())))
}

fn write_thumbnail(
    dir: &Path,
    min_zoom: u32,
    chunks: &[(i32, i32)],
    size: u32,
) -> MapforgeResult<()> {
    let source_dir = if min_zoom == BASE_ZOOM {
        dir.to_path_buf()
    } else {
        dir.join(min_zoom.to_string())
    };
    let box_ = bounding_box(chunks);
    let width = (box_.2 - box_.0 + 1) as u32 * size;
    let height = (box_.3 - box_.1 + 1) as u32 * size;
    let mut canvas = image::RgbaImage::new(width, height);
    for &(x, y) in chunks {
        let src = source_dir.join(format!("{x}_{y}.png"));
        if !src.is_file() {
            continue;
        }
        let tile = image::open(&src)
            .map_err(|e| MapforgeError::document(format!("{}: {e}", src.display())))?
            .to_rgba8();
        image::imageops::overlay(
            &mut canvas,
            &tile,
            i64::from(x - box_.0) * i64::from(size),
            i64::from(y - box_.1) * i64::from(size),
        );
    }
    let scale = f64::from(THUMBNAIL_EDGE) / f64::from(width.max(height));
    let (tw, th) = if scale < 1.0 {
        (
            (f64::from(width) * scale).round().max(1.0) as u32,
            (f64::from(height) * scale).round().max(1.0) as u32,
        )
    } else {
        (width, height)
    };
    let thumb = image::imageops::thumbnail(&canvas, tw, th);
    let out = dir.join("thumbnail.png");
    thumb
        .save(&out)
        .map_err(|e| MapforgeError::document(format!("{}: {e}", out.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names_parse_signed_coordinates() {
        assert_eq!(parse_chunk_name("3_-7"), Some((3, -7)));
        assert_eq!(parse_chunk_name("-12_0"), Some((-12, 0)));
        assert_eq!(parse_chunk_name("done"), None);
        assert_eq!(parse_chunk_name("a_b"), None);
    }

    #[test]
    fn min_zoom_shrinks_with_span() {
        assert_eq!(min_zoom_for_span(1), BASE_ZOOM);
        assert_eq!(min_zoom_for_span(2), BASE_ZOOM - 1);
        assert_eq!(min_zoom_for_span(4), BASE_ZOOM - 2);
        assert_eq!(min_zoom_for_span(5), BASE_ZOOM - 3);
    }

    #[test]
    fn bounding_box_covers_all_chunks() {
        assert_eq!(bounding_box(&[(0, 0), (3, -2), (1, 5)]), (0, -2, 3, 5));
    }
}
