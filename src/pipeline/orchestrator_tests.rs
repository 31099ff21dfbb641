//! End-to-end task scenarios over fake collaborators.

use super::events::{PipelineEvent, Stage};
use super::orchestrator::{PreviewTask, ProductKind, TaskOutcome, ToolTask};
use super::testing::{Harness, HarnessOptions};
use crate::convert::las::fixtures::LasFixture;
use crate::convert::raster::fixtures::{ramp, write_gtiff};
use crate::convert::raster::is_cog;
use crate::model::{JobPhase, ProductProperties, StyleSettings};
use crate::preview::FAILURE_MARKER;
use crate::store::DataStore;
use gdal::Dataset;
use std::sync::atomic::Ordering;
use uuid::Uuid;

#[test]
fn test_raster_upload_succeeds() {
    let h = Harness::new();
    let task = h.upload(ProductKind::Raster, "ortho.tif");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);

    let job = h.job(task.job_id);
    assert_eq!(job.phase(), Some(JobPhase::Succeeded));
    assert!(job.end_time.unwrap() >= job.start_time);

    let product = h.product(task.data_product_id);
    let cog = task.file_path.parent().unwrap().join("ortho.cog.tif");
    assert_eq!(product.filepath, cog);
    assert!(cog.exists());
    assert!(matches!(product.stac_properties, Some(ProductProperties::Raster(_))));

    let style = h.store.get_user_style(task.data_product_id, task.user_id).unwrap().unwrap();
    assert_eq!(style.settings, StyleSettings::single_band(-0.2, 0.9));

    // Rasters keep their original and get no preview
    assert!(task.file_path.exists());
    assert_eq!(h.renderer.calls(), 0);

    let snapshot = h.pipeline.metrics().snapshot();
    assert_eq!(snapshot.tasks_succeeded, 1);
    assert_eq!(snapshot.conversions, 1);
    assert!(matches!(
        h.sink.events().last(),
        Some(PipelineEvent::JobCompleted { status: crate::model::JobStatus::Success, .. })
    ));
}

#[test]
fn test_point_cloud_upload_with_preview() {
    let h = Harness::new();
    let task = h.upload(ProductKind::PointCloud, "scan.laz");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);

    let dir = task.file_path.parent().unwrap();
    let copc = dir.join("scan.copc.laz");
    assert_eq!(h.product(task.data_product_id).filepath, copc);
    assert!(copc.exists());
    assert!(dir.join("scan.png").exists());
    // Original removed once the COPC exists elsewhere
    assert!(!task.file_path.exists());
    // Point clouds have no default style
    assert_eq!(h.store.inner.user_style_count(), 0);
    assert_eq!(h.renderer.calls(), 1);
}

#[test]
fn test_point_cloud_passthrough_keeps_original() {
    let h = Harness::with(HarnessOptions { passthrough: true, ..Default::default() });
    let task = h.upload(ProductKind::PointCloud, "scan.copc.laz");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);
    assert!(task.file_path.exists());
    assert_eq!(h.product(task.data_product_id).filepath, task.file_path);
    assert_eq!(h.pipeline.metrics().snapshot().passthroughs, 1);
}

#[test]
fn test_preview_failure_does_not_fail_job() {
    let h = Harness::with(HarnessOptions { preview_fails: true, ..Default::default() });
    let task = h.upload(ProductKind::PointCloud, "scan.laz");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Succeeded));

    let dir = task.file_path.parent().unwrap();
    assert!(dir.join(FAILURE_MARKER).exists());
    assert!(!dir.join("scan.png").exists());
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PreviewFailed { .. })));
    assert_eq!(h.pipeline.metrics().snapshot().previews_failed, 1);
}

#[test]
fn test_conversion_failure_cleans_up() {
    let h = Harness::with(HarnessOptions { convert_fails: true, ..Default::default() });
    let task = h.upload(ProductKind::Raster, "broken.tif");

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Convert }
    );

    let job = h.job(task.job_id);
    assert_eq!(job.phase(), Some(JobPhase::Failed));
    assert!(job.end_time.is_some());
    assert!(!task.file_path.parent().unwrap().exists());

    // Data product untouched
    let product = h.product(task.data_product_id);
    assert_eq!(product.filepath, task.file_path);
    assert!(product.stac_properties.is_none());

    let failure = h.sink.events().into_iter().find_map(|e| match e {
        PipelineEvent::StageFailed { stage, job_id, data_product_id, error, .. } => {
            Some((stage, job_id, data_product_id, error))
        }
        _ => None,
    });
    let (stage, job_id, data_product_id, error) = failure.unwrap();
    assert_eq!(stage, Stage::Convert);
    assert_eq!(job_id, Some(task.job_id));
    assert_eq!(data_product_id, Some(task.data_product_id));
    assert!(error.contains("not a recognized format"));
}

#[test]
fn test_missing_job_discards_upload() {
    let h = Harness::new();
    let mut task = h.upload(ProductKind::Raster, "ortho.tif");
    task.job_id = Uuid::new_v4();
    let jobs_before = h.store.inner.job_count();

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Lost);
    assert!(!task.file_path.parent().unwrap().exists());
    assert_eq!(h.store.inner.job_count(), jobs_before);
    assert!(matches!(
        h.sink.events().as_slice(),
        [PipelineEvent::LostUpload { job_id, .. }] if *job_id == task.job_id
    ));
    assert_eq!(h.pipeline.metrics().snapshot().tasks_lost, 1);
}

#[test]
fn test_missing_data_product_fails_job() {
    let h = Harness::new();
    let mut task = h.upload(ProductKind::Raster, "ortho.tif");
    task.data_product_id = Uuid::new_v4();

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Lookup }
    );
    assert!(!task.file_path.parent().unwrap().exists());
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Failed));
}

#[test]
fn test_completed_job_is_duplicate() {
    let h = Harness::new();
    let task = h.upload(ProductKind::Raster, "ortho.tif");
    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);
    let job = h.job(task.job_id);

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Duplicate);
    assert_eq!(h.job(task.job_id), job);
    assert!(task.file_path.exists());
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::DuplicateTask { .. })));
}

#[test]
fn test_persistence_retries_then_succeeds() {
    let h = Harness::with(HarnessOptions {
        update_failures: 2,
        style_failures: 1,
        max_retries: 3,
        ..Default::default()
    });
    let task = h.upload(ProductKind::Raster, "ortho.tif");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);
    assert_eq!(h.store.update_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.pipeline.metrics().snapshot().persistence_retries, 3);
    assert_eq!(h.store.inner.user_style_count(), 1);
}

#[test]
fn test_persistence_exhausted_rolls_back() {
    let h = Harness::with(HarnessOptions {
        update_failures: usize::MAX,
        max_retries: 2,
        ..Default::default()
    });
    let task = h.upload(ProductKind::Raster, "ortho.tif");
    let dir = task.file_path.parent().unwrap().to_path_buf();

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Persist }
    );
    assert_eq!(h.store.update_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Failed));
    // No orphaned COG left behind
    assert!(!dir.join("ortho.cog.tif").exists());
    assert!(!dir.exists());
    assert_eq!(h.product(task.data_product_id).filepath, task.file_path);
}

#[test]
fn test_tool_succeeds() {
    let h = Harness::new();
    let input = h.root.path().join("ortho.cog.tif");
    std::fs::write(&input, b"rgbn").unwrap();
    let product_id = h.tool_product();
    let task = ToolTask {
        tool_name: "ndvi".to_string(),
        input_path: input.clone(),
        output_path: h.root.path().join("ndvi.tif"),
        params: Default::default(),
        new_data_product_id: product_id,
        user_id: Uuid::new_v4(),
    };

    assert_eq!(h.pipeline.run_tool(&task), TaskOutcome::Succeeded);

    let job = h.store.find_job_for_data_product(product_id).unwrap().unwrap();
    assert_eq!(job.name, "ndvi-process");
    assert_eq!(job.phase(), Some(JobPhase::Succeeded));

    let product = h.product(product_id);
    assert_eq!(product.filepath, task.output_path);
    assert!(product.stac_properties.is_some());
    assert!(h.store.get_user_style(product_id, task.user_id).unwrap().is_some());
    assert!(input.exists());
    assert_eq!(h.pipeline.metrics().snapshot().tools_run, 1);
}

#[test]
fn test_tool_failure_removes_output_only() {
    let h = Harness::with(HarnessOptions { tool_fails: true, ..Default::default() });
    let input = h.root.path().join("ortho.cog.tif");
    std::fs::write(&input, b"rgbn").unwrap();
    let product_id = h.tool_product();
    let task = ToolTask {
        tool_name: "vari".to_string(),
        input_path: input.clone(),
        output_path: h.root.path().join("vari.tif"),
        params: Default::default(),
        new_data_product_id: product_id,
        user_id: Uuid::new_v4(),
    };

    assert_eq!(h.pipeline.run_tool(&task), TaskOutcome::Failed { stage: Stage::Tool });
    assert!(!task.output_path.exists());
    assert!(input.exists());

    let job = h.store.find_job_for_data_product(product_id).unwrap().unwrap();
    assert_eq!(job.name, "vari-process");
    assert_eq!(job.phase(), Some(JobPhase::Failed));
}

#[test]
fn test_tool_missing_product_removes_output() {
    let h = Harness::new();
    let input = h.root.path().join("ortho.cog.tif");
    std::fs::write(&input, b"rgbn").unwrap();
    let task = ToolTask {
        tool_name: "exg".to_string(),
        input_path: input,
        output_path: h.root.path().join("exg.tif"),
        params: Default::default(),
        new_data_product_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
    };

    assert_eq!(h.pipeline.run_tool(&task), TaskOutcome::Failed { stage: Stage::Persist });
    assert!(!task.output_path.exists());
    let job = h.store.find_job_for_data_product(task.new_data_product_id).unwrap().unwrap();
    assert_eq!(job.phase(), Some(JobPhase::Failed));
    // Not retried
    assert_eq!(h.pipeline.metrics().snapshot().persistence_retries, 0);
}

#[test]
fn test_preview_task_skips_after_failure() {
    let h = Harness::with(HarnessOptions { preview_fails: true, ..Default::default() });
    let path = h.root.path().join("scan.copc.laz");
    std::fs::write(&path, b"points").unwrap();
    let task = PreviewTask { file_path: path };

    assert_eq!(
        h.pipeline.generate_preview(&task),
        TaskOutcome::Failed { stage: Stage::Preview }
    );
    assert_eq!(h.pipeline.generate_preview(&task), TaskOutcome::Succeeded);
    assert_eq!(h.renderer.calls(), 1);
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PreviewSkipped { .. })));
}

#[test]
fn test_style_failure_restores_data_product() {
    let h = Harness::with(HarnessOptions {
        style_failures: usize::MAX,
        max_retries: 1,
        ..Default::default()
    });
    let task = h.upload(ProductKind::Raster, "ortho.tif");
    let dir = task.file_path.parent().unwrap().to_path_buf();

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Persist }
    );
    assert!(!dir.exists());
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Failed));

    // Record no longer points at the removed COG
    let product = h.product(task.data_product_id);
    assert_eq!(product.filepath, task.file_path);
    assert!(product.stac_properties.is_none());
    // Forward patch plus the restore
    assert_eq!(h.store.update_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.inner.user_style_count(), 0);
}

#[test]
fn test_tool_style_failure_restores_data_product() {
    let h = Harness::with(HarnessOptions {
        style_failures: usize::MAX,
        ..Default::default()
    });
    let input = h.root.path().join("ortho.cog.tif");
    std::fs::write(&input, b"rgbn").unwrap();
    let product_id = h.tool_product();
    let before = h.product(product_id);
    let task = ToolTask {
        tool_name: "ndvi".to_string(),
        input_path: input.clone(),
        output_path: h.root.path().join("ndvi.tif"),
        params: Default::default(),
        new_data_product_id: product_id,
        user_id: Uuid::new_v4(),
    };

    assert_eq!(h.pipeline.run_tool(&task), TaskOutcome::Failed { stage: Stage::Persist });
    assert!(!task.output_path.exists());
    assert!(input.exists());
    assert_eq!(h.product(product_id), before);
}

#[test]
fn test_success_transition_is_retried() {
    let h = Harness::with(HarnessOptions {
        success_failures: 1,
        max_retries: 2,
        ..Default::default()
    });
    let task = h.upload(ProductKind::Raster, "ortho.tif");

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Succeeded));
    assert_eq!(h.pipeline.metrics().snapshot().persistence_retries, 1);
}

#[test]
fn test_success_transition_failure_ends_failed() {
    let h = Harness::with(HarnessOptions {
        success_failures: usize::MAX,
        max_retries: 1,
        ..Default::default()
    });
    let task = h.upload(ProductKind::Raster, "ortho.tif");

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Complete }
    );
    // Pollers still see a terminal job
    let job = h.job(task.job_id);
    assert_eq!(job.phase(), Some(JobPhase::Failed));
    assert!(job.end_time.is_some());
}

#[test]
fn test_tool_output_over_input_keeps_input() {
    let h = Harness::new();
    let input = h.root.path().join("ortho.cog.tif");
    std::fs::write(&input, b"rgbn").unwrap();
    let product_id = h.tool_product();
    let task = ToolTask {
        tool_name: "slope".to_string(),
        input_path: input.clone(),
        output_path: input.clone(),
        params: Default::default(),
        new_data_product_id: product_id,
        user_id: Uuid::new_v4(),
    };

    assert_eq!(h.pipeline.run_tool(&task), TaskOutcome::Failed { stage: Stage::Tool });
    assert_eq!(std::fs::read(&input).unwrap(), b"rgbn");

    let job = h.store.find_job_for_data_product(product_id).unwrap().unwrap();
    assert_eq!(job.phase(), Some(JobPhase::Failed));
    assert_eq!(h.pipeline.metrics().snapshot().tools_run, 0);
}

#[test]
fn test_raster_upload_with_gdal_writes_cog() {
    let h = Harness::with(HarnessOptions { real_raster: true, ..Default::default() });
    let task = h.upload(ProductKind::Raster, "ortho.tif");
    std::fs::remove_file(&task.file_path).unwrap();
    let size = (70, 50);
    let band = ramp(size);
    write_gtiff(&task.file_path, size, &[band.clone(), band.clone(), band], Some(32610), None);

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Succeeded);

    let product = h.product(task.data_product_id);
    assert_eq!(product.filepath, task.file_path.parent().unwrap().join("ortho.cog.tif"));
    let dataset = Dataset::open(&product.filepath).unwrap();
    assert!(is_cog(&dataset));
    assert_eq!(dataset.raster_size(), size);

    let props = product.stac_properties.as_ref().and_then(|p| p.as_raster()).unwrap();
    assert_eq!(props.epsg, Some(32610));
    assert_eq!(props.band_count(), 3);
    assert!(h.store.get_user_style(task.data_product_id, task.user_id).unwrap().is_some());
}

#[test]
fn test_point_cloud_indexing_failure_fails_job() {
    let h = Harness::with(HarnessOptions { untwine_exit: Some(2), ..Default::default() });
    let task = h.upload(ProductKind::PointCloud, "scan.las");
    LasFixture::las12(100).write(&task.file_path);

    assert_eq!(
        h.pipeline.process_upload(&task),
        TaskOutcome::Failed { stage: Stage::Convert }
    );
    assert!(!task.file_path.parent().unwrap().exists());
    assert_eq!(h.job(task.job_id).phase(), Some(JobPhase::Failed));
    assert_eq!(h.product(task.data_product_id).filepath, task.file_path);
    assert_eq!(h.renderer.calls(), 0);

    let error = h.sink.events().into_iter().find_map(|e| match e {
        PipelineEvent::StageFailed { stage: Stage::Convert, error, .. } => Some(error),
        _ => None,
    });
    let error = error.unwrap();
    assert!(error.contains("untwine exited with status 2"), "{error}");
}

#[test]
fn test_lost_upload_outside_its_own_dir_is_kept() {
    let h = Harness::new();
    let mut task = h.upload(ProductKind::Raster, "ortho.tif");
    let stray = h.root.path().join("stray.tif");
    std::fs::write(&stray, b"raw upload").unwrap();
    task.file_path = stray.clone();
    task.job_id = Uuid::new_v4();

    assert_eq!(h.pipeline.process_upload(&task), TaskOutcome::Lost);
    // Parent is the upload root itself
    assert!(stray.exists());
    assert!(h.root.path().exists());
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::CleanupFailed { .. })));
}
