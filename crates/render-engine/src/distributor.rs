//! Splits a render range into packages and renders them concurrently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use montage_common::config::AppConfig;
use montage_common::error::{MontageError, MontageResult};
use montage_common::logging::PACKAGE_TARGET;
use montage_timeline::{from_secs, rescale, Edl, MediaKind};

use crate::cache::AssetCache;
use crate::output::OutputFormat;
use crate::package::{PackageOutcome, PackageProgress, PackageRenderer, RenderPackage};
use crate::plugin::PluginRegistry;

/// Progress of package `index`.
pub type DistributionCallback = Arc<dyn Fn(usize, PackageProgress) + Send + Sync>;

/// Output path of package `index`: `<stem>_<index>.<ext>` next to `base`.
pub fn package_path(base: &Path, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package".to_string());
    let name = match base.extension() {
        Some(ext) => format!("{stem}_{index:03}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index:03}"),
    };
    base.with_file_name(name)
}

/// Split `[start_secs, end_secs)` into at most `count` contiguous packages.
///
/// Packages are cut on frame boundaries and the audio range follows the
/// video cut, so every package holds whole frames. Without video frames
/// the audio range is split evenly.
pub fn split_packages(edl: &Edl, start_secs: f64, end_secs: f64, count: usize, base: &Path) -> Vec<RenderPackage> {
    let sample_rate = edl.rate(MediaKind::Audio);
    let frame_rate = edl.rate(MediaKind::Video);
    let audio_start = from_secs(start_secs.max(0.0), sample_rate);
    let audio_end = from_secs(end_secs, sample_rate).max(audio_start);
    let video_start = from_secs(start_secs.max(0.0), frame_rate);
    let video_end = from_secs(end_secs, frame_rate).max(video_start);

    let frames = video_end - video_start;
    let samples = audio_end - audio_start;
    let span = if frames > 0 { frames } else { samples };
    let count = (count.max(1) as i64).min(span.max(1));

    (0..count)
        .map(|i| {
            let cut = |n: i64| n * span / count;
            let (audio, video) = if frames > 0 {
                let v0 = video_start + cut(i);
                let v1 = video_start + cut(i + 1);
                let a0 = if i == 0 { audio_start } else { rescale(v0, frame_rate, sample_rate) };
                let a1 = if i + 1 == count { audio_end } else { rescale(v1, frame_rate, sample_rate) };
                ((a0, a1), (v0, v1))
            } else {
                let a0 = audio_start + cut(i);
                let a1 = audio_start + cut(i + 1);
                ((a0, a1), (video_start, video_start))
            };
            RenderPackage {
                audio_start: audio.0,
                audio_end: audio.1,
                video_start: video.0,
                video_end: video.1,
                path: package_path(base, i as usize),
                background: false,
                done: false,
            }
        })
        .collect()
}

/// Result of rendering every package.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionReport {
    pub outcomes: Vec<PackageOutcome>,
}

impl DistributionReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| *o == PackageOutcome::Done)
    }

    pub fn exit_code(&self) -> i32 {
        self.outcomes.iter().map(|o| o.exit_code()).max().unwrap_or(0)
    }
}

/// Renders packages of one timeline on the blocking pool.
pub struct Distributor {
    config: AppConfig,
    edl: Arc<Edl>,
    format: Arc<dyn OutputFormat>,
    cache: Arc<AssetCache>,
    registry: Arc<PluginRegistry>,
    jobs: usize,
    cancel: Arc<AtomicBool>,
    progress: Option<DistributionCallback>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("format", &self.format.name())
            .field("jobs", &self.jobs)
            .field("cancelled", &self.cancel.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Distributor {
    pub fn new(
        config: AppConfig,
        edl: Arc<Edl>,
        format: Arc<dyn OutputFormat>,
        cache: Arc<AssetCache>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        let jobs = config.render.processors.max(1);
        Self {
            config,
            edl,
            format,
            cache,
            registry,
            jobs,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Packages rendered at the same time.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_progress(mut self, progress: DistributionCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Flag that cancels every running and queued package when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Render every package not yet done and mark the finished ones done.
    ///
    /// The first failure cancels the remaining packages and is returned
    /// once every worker has stopped. Each call starts uncancelled, so a
    /// failed or cancelled run can be resumed with the same packages.
    pub async fn render_all(&self, packages: &mut [RenderPackage]) -> MontageResult<DistributionReport> {
        self.cancel.store(false, Ordering::Release);
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let mut handles = Vec::with_capacity(packages.len());

        tracing::info!(
            target: PACKAGE_TARGET,
            packages = packages.len(),
            jobs = self.jobs,
            format = self.format.name(),
            "Distributing render"
        );

        for (index, package) in packages.iter().enumerate() {
            if package.done {
                handles.push(None);
                continue;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| MontageError::render(format!("Package queue closed: {e}")))?;
            let mut renderer = PackageRenderer::new(
                self.config.clone(),
                Arc::clone(&self.edl),
                Arc::clone(&self.format),
                Arc::clone(&self.cache),
                Arc::clone(&self.registry),
            )
            .with_cancel(Arc::clone(&self.cancel));
            if let Some(progress) = &self.progress {
                let progress = Arc::clone(progress);
                renderer = renderer.with_progress(Arc::new(move |p| progress(index, p)));
            }
            let package = package.clone();
            let cancel = Arc::clone(&self.cancel);
            handles.push(Some(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = renderer.render_package(&package);
                if result.is_err() {
                    cancel.store(true, Ordering::Release);
                }
                result
            })));
        }

        let mut outcomes = Vec::with_capacity(packages.len());
        let mut first_error = None;
        for (package, handle) in packages.iter_mut().zip(handles) {
            let Some(handle) = handle else {
                outcomes.push(PackageOutcome::Done);
                continue;
            };
            let result = handle
                .await
                .map_err(|e| MontageError::render(format!("Package worker failed: {e}")))
                .and_then(|result| result);
            match result {
                Ok(outcome) => {
                    package.done = outcome == PackageOutcome::Done;
                    outcomes.push(outcome);
                }
                Err(e) => {
                    tracing::warn!(
                        target: PACKAGE_TARGET,
                        path = %package.path.display(),
                        error = %e,
                        "Package failed"
                    );
                    outcomes.push(PackageOutcome::Aborted);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                let report = DistributionReport { outcomes };
                tracing::info!(target: PACKAGE_TARGET, complete = report.is_complete(), "Render distributed");
                Ok(report)
            }
        }
    }
}
