//! End-to-end tests for the coverage pipeline.
//!
//! A 4x4 synthetic DEM and hazard raster run through the GeoTIFF store with
//! an in-test routing engine standing in for the external tools.
//!
//! Run with: `cargo test --test pipeline_end_to_end`

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{array, Array2};
use tempfile::TempDir;

use upcover::config::{PipelineConfig, RasterEntry};
use upcover::graph::{GraphError, TaskGraph, TaskGraphConfig, TaskStatus};
use upcover::pipeline::{PipelineDriver, RasterOutcome, DISTANCE_NODATA, MASK_NODATA};
use upcover::raster::{read_grid, write_grid, DataType, GeoTiffStore, GeoTransform, Grid};
use upcover::routing::{RoutingEngine, RoutingError, RoutingModel};

// ============================================================================
// Helper Functions
// ============================================================================

/// Routing engine with a fixed, model-dependent reachability rule.
///
/// Channel cells are at distance 0. Under D8 the first column never reaches
/// a channel; under MFD the first row never does. Every other cell is at a
/// distance equal to its column index.
#[derive(Default)]
struct FakeRouter {
    fail_flow_direction: bool,
    calls: AtomicUsize,
}

impl FakeRouter {
    fn failing() -> Self {
        Self {
            fail_flow_direction: true,
            ..Self::default()
        }
    }
}

fn store_error(e: upcover::raster::StoreError) -> RoutingError {
    RoutingError::Failed {
        program: "fake".to_string(),
        status: "1".to_string(),
        stderr: e.to_string(),
    }
}

impl RoutingEngine for FakeRouter {
    fn flow_direction(
        &self,
        dem: &Path,
        output: &Path,
        _model: RoutingModel,
        working_dir: &Path,
    ) -> Result<(), RoutingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(working_dir.is_dir());
        if self.fail_flow_direction {
            return Err(RoutingError::Failed {
                program: "fake".to_string(),
                status: "1".to_string(),
                stderr: "flow direction exploded".to_string(),
            });
        }
        let grid = read_grid(dem).map_err(store_error)?;
        write_grid(output, &grid).map_err(store_error)
    }

    fn distance_to_channel(
        &self,
        flow_dir: &Path,
        channel_mask: &Path,
        output: &Path,
        model: RoutingModel,
    ) -> Result<(), RoutingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(flow_dir.exists());
        let mask = read_grid(channel_mask).map_err(store_error)?;
        let distance = Array2::from_shape_fn(mask.shape(), |(row, col)| {
            let unreachable = match model {
                RoutingModel::D8 => col == 0,
                RoutingModel::Mfd => row == 0,
            };
            if mask.data[[row, col]] == 1.0 {
                0.0
            } else if unreachable {
                DISTANCE_NODATA
            } else {
                col as f64
            }
        });
        let grid = Grid::new(distance, mask.transform)
            .with_nodata(Some(DISTANCE_NODATA))
            .with_dtype(DataType::Float32);
        write_grid(output, &grid).map_err(store_error)
    }
}

/// Writes a 4x4 DEM and hazard raster (byte, nodata 255) on the same grid.
fn write_inputs(dir: &Path) {
    let transform = GeoTransform::new(500_000.0, 4_000_000.0, 30.0, -30.0);
    let dem = Grid::new(
        array![
            [10.0, 9.0, 8.0, 7.0],
            [9.0, 8.0, 7.0, 6.0],
            [8.0, 7.0, 6.0, 5.0],
            [7.0, 6.0, 5.0, 4.0]
        ],
        transform,
    )
    .with_dtype(DataType::Float32);
    let hazard = Grid::new(
        array![
            [0.0, 3.0, 255.0, 0.0],
            [255.0, 0.0, 1.0, 0.0],
            [0.0, 255.0, 0.0, 2.0],
            [255.0, 0.0, 0.0, 0.0]
        ],
        transform,
    )
    .with_nodata(Some(255.0))
    .with_dtype(DataType::Byte);

    write_grid(&dir.join("dem.tif"), &dem).unwrap();
    write_grid(&dir.join("hazard.tif"), &hazard).unwrap();
}

fn config(dir: &Path, model: RoutingModel) -> PipelineConfig {
    PipelineConfig::new(dir.join("workspace"))
        .with_workers(2)
        .with_raster(RasterEntry::new(
            "hazard",
            dir.join("hazard.tif"),
            dir.join("dem.tif"),
            model,
        ))
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_coverage_nodata_follows_conjunction_rule() {
    for model in [RoutingModel::D8, RoutingModel::Mfd] {
        let dir = TempDir::new().unwrap();
        write_inputs(dir.path());

        let driver = PipelineDriver::new(
            config(dir.path(), model),
            Arc::new(GeoTiffStore),
            Arc::new(FakeRouter::default()),
        );
        let summary = driver.run().unwrap();
        assert!(summary.is_success(), "{model}: {:?}", summary.rasters);

        let coverage_path = dir.path().join("workspace/upstream_coverage_hazard.tif");
        assert_eq!(
            summary.rasters[0].outcome,
            RasterOutcome::Completed {
                coverage: coverage_path.clone()
            }
        );

        let intermediate = dir.path().join("workspace/intermediate/hazard");
        let channel = read_grid(&intermediate.join("channel_proxy.tif")).unwrap();
        let distance = read_grid(&intermediate.join("dist_to_channel.tif")).unwrap();
        let coverage = read_grid(&coverage_path).unwrap();

        assert_eq!(
            channel.data,
            array![
                [0.0, 1.0, 2.0, 0.0],
                [2.0, 0.0, 1.0, 0.0],
                [0.0, 2.0, 0.0, 1.0],
                [2.0, 0.0, 0.0, 0.0]
            ]
        );
        assert_eq!(coverage.nodata, Some(MASK_NODATA));
        assert_eq!(coverage.dtype, DataType::Byte);
        assert_eq!(coverage.shape(), (4, 4));

        let mut nodata_cells = 0;
        for ((&c, &d), &r) in channel
            .data
            .iter()
            .zip(distance.data.iter())
            .zip(coverage.data.iter())
        {
            let expect_nodata = c == MASK_NODATA && d == DISTANCE_NODATA;
            assert_eq!(r == MASK_NODATA, expect_nodata, "{model}: c={c} d={d} r={r}");
            if expect_nodata {
                nodata_cells += 1;
            } else {
                let channel_set = c > 0.0 && c != MASK_NODATA;
                assert_eq!(r == 1.0, channel_set || d > 0.0);
            }
        }
        assert!(nodata_cells > 0, "{model}: rule never exercised");
    }
}

#[test]
fn test_d8_coverage_values() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());

    let driver = PipelineDriver::new(
        config(dir.path(), RoutingModel::D8),
        Arc::new(GeoTiffStore),
        Arc::new(FakeRouter::default()),
    );
    driver.run().unwrap();

    let coverage =
        read_grid(&dir.path().join("workspace/upstream_coverage_hazard.tif")).unwrap();
    assert_eq!(
        coverage.data,
        array![
            [0.0, 1.0, 1.0, 1.0],
            [2.0, 1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0, 1.0],
            [2.0, 1.0, 1.0, 1.0]
        ]
    );
}

#[test]
fn test_second_run_is_fully_cached() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());
    let router = Arc::new(FakeRouter::default());

    let first = PipelineDriver::new(
        config(dir.path(), RoutingModel::Mfd),
        Arc::new(GeoTiffStore),
        Arc::clone(&router) as Arc<dyn RoutingEngine>,
    )
    .run()
    .unwrap();
    assert_eq!(first.stats.executed, 6);
    assert_eq!(router.calls.load(Ordering::SeqCst), 2);

    let second = PipelineDriver::new(
        config(dir.path(), RoutingModel::Mfd),
        Arc::new(GeoTiffStore),
        Arc::clone(&router) as Arc<dyn RoutingEngine>,
    )
    .run()
    .unwrap();
    assert!(second.is_success());
    assert_eq!(second.stats.executed, 0);
    assert_eq!(second.stats.cached, 6);
    assert_eq!(router.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_model_change_reruns_routing() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());
    let router = Arc::new(FakeRouter::default());

    for model in [RoutingModel::D8, RoutingModel::Mfd] {
        PipelineDriver::new(
            config(dir.path(), model),
            Arc::new(GeoTiffStore),
            Arc::clone(&router) as Arc<dyn RoutingEngine>,
        )
        .run()
        .unwrap();
    }

    // Both routing stages ran again; the aligned inputs and channel mask did not.
    assert_eq!(router.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_flow_direction_failure_propagates() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());

    let driver = PipelineDriver::new(
        config(dir.path(), RoutingModel::D8),
        Arc::new(GeoTiffStore),
        Arc::new(FakeRouter::failing()),
    );
    let graph = TaskGraph::new(
        TaskGraphConfig::new(dir.path().join("workspace"))
            .with_workers(2)
            .with_ledger(false),
    )
    .unwrap();
    let pipelines = driver.plan(&graph).unwrap();
    let handles = pipelines[0].handles;

    let err = graph.join().unwrap_err();
    match &err {
        GraphError::TaskFailed { task, .. } => assert_eq!(task, "flow_direction:hazard"),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(graph.status(&handles.align_dem), Some(TaskStatus::Succeeded));
    assert_eq!(graph.status(&handles.align_raster), Some(TaskStatus::Succeeded));
    assert_eq!(graph.status(&handles.channel_mask), Some(TaskStatus::Succeeded));
    assert_eq!(graph.status(&handles.flow_direction), Some(TaskStatus::Failed));
    assert_eq!(
        graph.status(&handles.distance_to_channel),
        Some(TaskStatus::UpstreamFailed)
    );
    assert_eq!(
        graph.status(&handles.coverage_mask),
        Some(TaskStatus::UpstreamFailed)
    );
    assert_eq!(
        graph.root_cause(&handles.coverage_mask).as_deref(),
        Some("flow_direction:hazard")
    );

    let stats = graph.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.upstream_failed, 2);
    assert!(!pipelines[0].layout.coverage.exists());
    assert!(pipelines[0].layout.channel_mask.exists());
    assert!(graph.close().is_err());
}

#[test]
fn test_failed_raster_reported_in_summary() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());

    let driver = PipelineDriver::new(
        config(dir.path(), RoutingModel::D8),
        Arc::new(GeoTiffStore),
        Arc::new(FakeRouter::failing()),
    );
    let summary = driver.run().unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.failed_count(), 1);
    match &summary.rasters[0].outcome {
        RasterOutcome::Failed { task, error } => {
            assert_eq!(task, "flow_direction:hazard");
            assert!(error.contains("flow_direction failed"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
