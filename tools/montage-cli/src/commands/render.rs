//! Render a timeline to files, split into packages rendered in parallel.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use montage_common::config::AppConfig;
use montage_render_engine::package::PackageProgress;
use montage_render_engine::{split_packages, Distributor, OutputFormat, RawOutputFormat};

use super::{collaborators, load_edl};

/// Exit code of a render that failed with an error.
const ERROR_EXIT: i32 = 2;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: AppConfig,
    path: PathBuf,
    output: PathBuf,
    packages: usize,
    start: f64,
    end: Option<f64>,
    preroll: Option<f64>,
    jobs: Option<usize>,
) -> anyhow::Result<i32> {
    let edl = load_edl(&path)?;
    let mut config = config;
    if let Some(secs) = preroll {
        config.render.render_preroll_secs = secs.max(0.0);
    }

    let end = end.unwrap_or_else(|| edl.duration_secs());
    if end <= start {
        anyhow::bail!("Nothing to render between {start:.3}s and {end:.3}s");
    }
    let mut work = split_packages(&edl, start, end, packages.max(1), &output);

    println!("Rendering {} ({start:.3}s to {end:.3}s)", path.display());
    println!("  Packages: {}", work.len());
    println!("  Preroll: {:.3}s", config.render.render_preroll_secs);
    for package in &work {
        println!("  {} frames [{}, {})", package.path.display(), package.video_start, package.video_end);
    }

    let (cache, registry) = collaborators(&config);
    let mut distributor = Distributor::new(
        config,
        edl,
        Arc::new(RawOutputFormat) as Arc<dyn OutputFormat>,
        cache,
        registry,
    )
    .with_progress(Arc::new(|index: usize, p: PackageProgress| {
        print!(
            "\r  Package {index}: {:.1}% ({}/{} samples, {:.1} fps)  ",
            p.progress * 100.0,
            p.samples_rendered,
            p.total_samples,
            p.frames_per_second,
        );
    }));
    if let Some(jobs) = jobs {
        distributor = distributor.with_jobs(jobs);
    }

    let cancel = distributor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling render");
            cancel.store(true, Ordering::Release);
        }
    });

    match distributor.render_all(&mut work).await {
        Ok(report) if report.is_complete() => {
            println!("\nRender complete: {} packages", work.len());
            Ok(report.exit_code())
        }
        Ok(report) => {
            let done = work.iter().filter(|p| p.done).count();
            println!("\nRender cancelled: {done}/{} packages done", work.len());
            Ok(report.exit_code())
        }
        Err(e) => {
            println!("\nRender failed: {e}");
            Ok(ERROR_EXIT)
        }
    }
}
