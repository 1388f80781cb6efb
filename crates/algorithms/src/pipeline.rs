//! Pipeline-level configuration and stage drivers.
//!
//! The drivers wire sources, sinks, scratch space, the scheduler and the
//! progress callback together; all state is passed explicitly. Each
//! driver is one stage pass: local tiles in parallel, a single-threaded
//! global solve, parallel finalize.

use std::path::PathBuf;

use tracing::info;

use hydrotile_core::io::{FileRaster, MemoryRaster, RasterSink, RasterSource, RasterStore};
use hydrotile_core::raster::Raster;
use hydrotile_core::vector::{AttributeValue, Feature, FeatureCollection, VectorSink};
use hydrotile_core::{GeoTransform, ProgressSink, RasterElement, Result, FLOW_NODATA};
use hydrotile_parallel::{CancelToken, TileScheduler};

use crate::accumulation::ACC_NODATA;
use crate::accumulation_tiled::flow_accumulation_tiled;
use crate::basins::{label_basins_tiled, BasinParams, BasinSummary, DrainagePoint};
use crate::breach::{breach_depressions_tiled, BreachParams};
use crate::fill_tiled::fill_depressions_tiled;
use crate::flats_tiled::resolve_flats_tiled;
use crate::flow_direction::flow_direction_tiled;
use crate::flow_length::{write_longest_paths, FlowLengthResult};
use crate::streams::{extract_streams_tiled, StreamNetwork, StreamParams};

/// Pipeline configuration.
///
/// Defaults follow the conventional values: 2048-cell tiles, a 50-cell
/// breach search radius, no cost cap.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Tile side in cells; `<= 1` selects in-memory single-tile mode.
    pub chunk_size: usize,
    /// Breach Dijkstra window radius (also the breach halo).
    pub search_radius: usize,
    /// Breach path cost cap; pits beyond it are left for the fill.
    pub max_cost: f64,
    /// Gradient applied when breaching toward nodata (tunable).
    pub breach_epsilon: f32,
    /// Run flat resolution after D8.
    pub resolve_flats: bool,
    /// Tile-side cap applied only to flat resolution.
    pub flat_chunk_max: usize,
    /// Treat nodata holes as fillable interior.
    pub fill_holes: bool,
    /// Accumulation threshold for stream classification.
    pub threshold: i64,
    /// Drainage-point snap window in cells (0 disables snapping).
    pub snap_radius: usize,
    /// Keep basins that drain to no user point.
    pub all_basins: bool,
    /// Scratch space for tile intermediates; in-memory when absent.
    pub working_dir: Option<PathBuf>,
    /// Disable worker parallelism (strict determinism for testing).
    pub single_threaded: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            search_radius: 50,
            max_cost: f64::INFINITY,
            breach_epsilon: 1e-5,
            resolve_flats: true,
            flat_chunk_max: 512,
            fill_holes: false,
            threshold: 1000,
            snap_radius: 0,
            all_basins: false,
            working_dir: None,
            single_threaded: false,
        }
    }
}

impl PipelineOptions {
    fn scheduler(&self, cancel: CancelToken) -> TileScheduler {
        TileScheduler::new(self.single_threaded, cancel)
    }

    fn workspace(&self) -> Workspace {
        match &self.working_dir {
            Some(dir) => Workspace::Directory(dir.clone()),
            None => Workspace::Memory,
        }
    }
}

/// Where scratch rasters live between passes.
#[derive(Debug, Clone)]
pub enum Workspace {
    /// Scratch held in RAM.
    Memory,
    /// Flat grid files under a directory (for rasters larger than RAM).
    Directory(PathBuf),
}

impl Workspace {
    /// Allocate a scratch raster filled with `fill` values.
    pub fn scratch<T: RasterElement + bytemuck::Pod>(
        &self,
        name: &str,
        width: usize,
        height: usize,
        transform: GeoTransform,
        fill: T,
    ) -> Result<Box<dyn RasterStore<T>>> {
        match self {
            Workspace::Memory => Ok(Box::new(MemoryRaster::filled(
                height, width, fill, transform, None, None,
            ))),
            Workspace::Directory(dir) => {
                std::fs::create_dir_all(dir)?;
                let raster = FileRaster::create(
                    dir.join(format!("{name}.grid")),
                    width,
                    height,
                    transform,
                    None,
                    None,
                )?;
                raster.fill(fill)?;
                Ok(Box::new(raster))
            }
        }
    }
}

/// Fill depressions (§ fill stage): local flood, global spill solve,
/// finalize raise.
pub fn fill(
    dem: &dyn RasterSource<f32>,
    output: &dyn RasterStore<f32>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<()> {
    info!(chunk_size = options.chunk_size, fill_holes = options.fill_holes, "fill");
    let labels = options.workspace().scratch::<i64>(
        "fill_labels",
        dem.width(),
        dem.height(),
        dem.geotransform(),
        0,
    )?;
    fill_depressions_tiled(
        dem,
        output,
        labels.as_ref(),
        options.chunk_size,
        options.fill_holes,
        &options.scheduler(cancel),
        progress,
    )
}

/// Breach pits with least-cost paths; returns the unsolved pit count.
pub fn breach(
    dem: &dyn RasterSource<f32>,
    output: &dyn RasterSink<f32>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<u64> {
    info!(
        chunk_size = options.chunk_size,
        search_radius = options.search_radius,
        "breach"
    );
    let params = BreachParams {
        search_radius: options.search_radius,
        max_cost: options.max_cost,
        epsilon: options.breach_epsilon,
    };
    breach_depressions_tiled(
        dem,
        output,
        options.chunk_size,
        &params,
        &options.scheduler(cancel),
        progress,
    )
}

/// D8 flow directions, optionally followed by flat resolution.
pub fn flow_direction(
    dem: &dyn RasterSource<f32>,
    output: &dyn RasterStore<u8>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<()> {
    info!(
        chunk_size = options.chunk_size,
        resolve_flats = options.resolve_flats,
        "flow_direction"
    );
    let scheduler = options.scheduler(cancel);
    if !options.resolve_flats {
        return flow_direction_tiled(dem, output, options.chunk_size, &scheduler, progress);
    }

    // flat resolution must read pristine directions while writing the
    // resolved ones, so raw D8 goes to scratch first
    let raw = options.workspace().scratch::<u8>(
        "fdr_raw",
        dem.width(),
        dem.height(),
        dem.geotransform(),
        FLOW_NODATA,
    )?;
    flow_direction_tiled(dem, raw.as_ref(), options.chunk_size, &scheduler, progress)?;
    resolve_flats_tiled(
        dem,
        raw.as_ref(),
        output,
        options.chunk_size,
        options.flat_chunk_max,
        &scheduler,
        progress,
    )
}

/// Flow accumulation over a resolved direction raster.
pub fn accumulation(
    fdr: &dyn RasterSource<u8>,
    output: &dyn RasterStore<i64>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<()> {
    info!(chunk_size = options.chunk_size, "accumulation");
    flow_accumulation_tiled(
        fdr,
        output,
        options.chunk_size,
        &options.scheduler(cancel),
        progress,
    )
}

/// Stream network extraction with cross-tile stitching.
pub fn streams(
    fac: &dyn RasterSource<i64>,
    fdr: &dyn RasterSource<u8>,
    stream_raster: &dyn RasterSink<u8>,
    vector_sink: &dyn VectorSink,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<StreamNetwork> {
    info!(threshold = options.threshold, "streams");
    extract_streams_tiled(
        fac,
        fdr,
        stream_raster,
        vector_sink,
        &StreamParams {
            threshold: options.threshold,
        },
        options.chunk_size,
        &options.scheduler(cancel),
        progress,
    )
}

/// Basin labeling from drainage points, with optional accumulation
/// snapping.
pub fn basins(
    fdr: &dyn RasterSource<u8>,
    fac: Option<&dyn RasterSource<i64>>,
    points: &[DrainagePoint],
    output: &dyn RasterStore<i64>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<BasinSummary> {
    info!(points = points.len(), all_basins = options.all_basins, "basins");
    let points = match fac {
        Some(fac) if options.snap_radius > 0 => {
            snap_drainage_points(points, fac, options.snap_radius)?
        }
        _ => points.to_vec(),
    };
    let labels = options.workspace().scratch::<i64>(
        "basin_labels",
        fdr.width(),
        fdr.height(),
        fdr.geotransform(),
        0,
    )?;
    label_basins_tiled(
        fdr,
        output,
        labels.as_ref(),
        &points,
        BasinParams {
            all_basins: options.all_basins,
        },
        options.chunk_size,
        &options.scheduler(cancel),
        progress,
    )
}

/// Upstream flow length and longest flow paths (in-memory stage: §4.9
/// defines no tiled decomposition, so `chunk_size` is ignored here).
pub fn flow_length(
    fdr: &dyn RasterSource<u8>,
    fac: Option<&dyn RasterSource<i64>>,
    points: &[DrainagePoint],
    lengths_output: &dyn RasterSink<f32>,
    vector_sink: Option<&dyn VectorSink>,
    options: &PipelineOptions,
    progress: &dyn ProgressSink,
    cancel: CancelToken,
) -> Result<FlowLengthResult> {
    info!(points = points.len(), "flow_length");
    cancel.check()?;
    let points = match fac {
        Some(fac) if options.snap_radius > 0 => {
            snap_drainage_points(points, fac, options.snap_radius)?
        }
        _ => points.to_vec(),
    };

    let window = fdr.read_window(0, 0, fdr.width(), fdr.height())?;
    let mut raster = Raster::from_array(window);
    raster.set_transform(fdr.geotransform());
    raster.set_crs(fdr.crs());
    raster.set_nodata(Some(FLOW_NODATA));

    let result = crate::flow_length::flow_length(&raster, &points)?;
    progress.metric("drainage_points_dropped", result.dropped);

    lengths_output.write_window(0, 0, result.lengths.view())?;
    if let Some(sink) = vector_sink {
        write_longest_paths(&result.longest_paths, sink, "longest_flow_paths")?;
    }
    Ok(result)
}

/// Move each drainage point to the maximum-accumulation cell within the
/// snap window (row-major ties). Points outside the raster pass through
/// untouched and are dropped later by ingestion.
pub fn snap_drainage_points(
    points: &[DrainagePoint],
    fac: &dyn RasterSource<i64>,
    snap_radius: usize,
) -> Result<Vec<DrainagePoint>> {
    let width = fac.width() as i64;
    let height = fac.height() as i64;
    let radius = snap_radius as i64;

    let mut snapped = Vec::with_capacity(points.len());
    for point in points {
        if point.row < 0 || point.col < 0 || point.row >= height || point.col >= width {
            snapped.push(*point);
            continue;
        }
        let row0 = (point.row - radius).max(0);
        let col0 = (point.col - radius).max(0);
        let row1 = (point.row + radius + 1).min(height);
        let col1 = (point.col + radius + 1).min(width);
        let window = fac.read_window(
            col0 as usize,
            row0 as usize,
            (col1 - col0) as usize,
            (row1 - row0) as usize,
        )?;

        let mut best = (point.row, point.col, ACC_NODATA);
        for ((r, c), &acc) in window.indexed_iter() {
            if acc != ACC_NODATA && acc > best.2 {
                best = (row0 + r as i64, col0 + c as i64, acc);
            }
        }
        snapped.push(DrainagePoint {
            row: best.0,
            col: best.1,
            basin_id: point.basin_id,
        });
    }
    Ok(snapped)
}

/// Read drainage points from a point feature collection.
///
/// A positive `basin_id` attribute is honored; anything else requests an
/// auto-assigned ID.
pub fn drainage_points_from_features(
    features: &FeatureCollection,
    transform: &GeoTransform,
) -> Vec<DrainagePoint> {
    let mut points = Vec::new();
    for feature in features.iter() {
        let geo_types::Geometry::Point(point) = &feature.geometry else {
            continue;
        };
        let Some((row, col)) = transform.geo_to_cell(point.x(), point.y()) else {
            continue;
        };
        let basin_id = feature
            .get_property("basin_id")
            .and_then(|v| v.as_int())
            .filter(|&v| v > 0)
            .unwrap_or(0);
        points.push(DrainagePoint {
            row: row as i64,
            col: col as i64,
            basin_id,
        });
    }
    points
}

/// Write drainage points back out with their assigned basin IDs and
/// downstream basins (0 marks an outlet).
pub fn write_drainage_points(
    points: &[DrainagePoint],
    graph: &std::collections::BTreeMap<i64, i64>,
    transform: &GeoTransform,
    sink: &dyn VectorSink,
    layer: &str,
) -> Result<()> {
    for (fid, point) in points.iter().enumerate() {
        let (x, y) = transform.pixel_to_geo(point.col as usize, point.row as usize);
        let mut feature = Feature::new(geo_types::Geometry::Point(geo_types::Point::new(x, y)));
        feature.fid = Some(fid as u64);
        feature.set_property("basin_id", AttributeValue::Int(point.basin_id));
        feature.set_property(
            "ds_basin_id",
            AttributeValue::Int(graph.get(&point.basin_id).copied().unwrap_or(0)),
        );
        sink.add_feature(layer, feature)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotile_core::SilentProgress;

    fn snap_fixture() -> MemoryRaster<i64> {
        let mut fac = Raster::<i64>::filled(5, 5, 1);
        fac.set_nodata(Some(ACC_NODATA));
        fac.set(2, 3, 40).unwrap();
        fac.set(4, 4, 90).unwrap();
        MemoryRaster::from_raster(fac)
    }

    #[test]
    fn test_snap_moves_to_max_accumulation() {
        let fac = snap_fixture();
        let points = vec![DrainagePoint { row: 2, col: 2, basin_id: 7 }];
        let snapped = snap_drainage_points(&points, &fac, 1).unwrap();
        assert_eq!(snapped[0], DrainagePoint { row: 2, col: 3, basin_id: 7 });

        // a bigger window reaches the stronger cell at (4,4)
        let snapped = snap_drainage_points(&points, &fac, 2).unwrap();
        assert_eq!(snapped[0], DrainagePoint { row: 4, col: 4, basin_id: 7 });
    }

    #[test]
    fn test_snap_leaves_out_of_raster_points() {
        let fac = snap_fixture();
        let points = vec![DrainagePoint { row: -3, col: 0, basin_id: 0 }];
        let snapped = snap_drainage_points(&points, &fac, 2).unwrap();
        assert_eq!(snapped[0].row, -3);
    }

    #[test]
    fn test_drainage_points_from_features() {
        use hydrotile_core::vector::MemoryVectorStore;
        let store = MemoryVectorStore::new();
        let transform = GeoTransform::new(0.0, 5.0, 1.0, -1.0);
        let feature =
            Feature::new(geo_types::Geometry::Point(geo_types::Point::new(2.5, 2.5)))
                .with_property("basin_id", AttributeValue::Int(42));
        store.add_feature("points", feature).unwrap();

        let collection = store.layer("points");
        let points = drainage_points_from_features(&collection, &transform);
        // y = 2.5 is 2.5 below the 5.0 origin: row 2; x = 2.5: col 2
        assert_eq!(points, vec![DrainagePoint { row: 2, col: 2, basin_id: 42 }]);
    }

    #[test]
    fn test_workspace_memory_scratch() {
        let workspace = Workspace::Memory;
        let scratch = workspace
            .scratch::<i64>("test", 4, 3, GeoTransform::default(), -1)
            .unwrap();
        assert_eq!(scratch.read_window(0, 0, 4, 3).unwrap()[(0, 0)], -1);
    }

    #[test]
    fn test_workspace_directory_scratch() {
        let dir = std::env::temp_dir().join("hydrotile-ws-test");
        let workspace = Workspace::Directory(dir.clone());
        let scratch = workspace
            .scratch::<f32>(
                "lengths",
                3,
                3,
                GeoTransform::default(),
                crate::flow_length::FLOW_LENGTH_NODATA,
            )
            .unwrap();
        assert_eq!(scratch.read_window(1, 1, 1, 1).unwrap()[(0, 0)], -1.0);
        std::fs::remove_file(dir.join("lengths.grid")).unwrap();
    }

    #[test]
    fn test_fill_driver_with_file_scratch() {
        // end-to-end fill through the driver with a directory workspace
        let dir = std::env::temp_dir().join("hydrotile-fill-ws-test");
        let mut dem = Raster::<f32>::filled(6, 6, 9.0);
        dem.set(2, 2, 3.0).unwrap();
        dem.set(2, 5, 4.0).unwrap();
        let source = MemoryRaster::from_raster(dem);
        let output = MemoryRaster::<f32>::zeroed(6, 6, GeoTransform::default(), None, None);

        let options = PipelineOptions {
            chunk_size: 3,
            working_dir: Some(dir.clone()),
            single_threaded: true,
            ..Default::default()
        };
        fill(&source, &output, &options, &SilentProgress, CancelToken::new()).unwrap();

        let filled = output.into_raster();
        // the interior pit rises to the rim; the border pit keeps its
        // open drain over the raster edge
        assert_eq!(filled.get(2, 2).unwrap(), 9.0);
        assert_eq!(filled.get(2, 5).unwrap(), 4.0);
        let _ = std::fs::remove_file(dir.join("fill_labels.grid"));
    }
}
