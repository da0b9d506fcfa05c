use crate::cli::Cli;
use crate::pipeline::{Collaborators, ItemOutcome, PipelineDriver, RunSummary};
use crate::utils::{extract_filename, truncate_string};
use anyhow::Result;

/// Build the external tool wrappers from the options and run every frame
pub fn run_correlate(cli: &Cli) -> Result<RunSummary> {
    let config = cli.to_pipeline_config()?;
    tracing::info!(
        root = %config.root.display(),
        objects = ?config.objects,
        files = config.files.len(),
        "starting correlation run"
    );

    let calibrator = cli.tools.calibration(&config);
    let extractor = cli.tools.source_extractor();
    let solver = cli.tools.astrometry_solver();
    let photometry = cli.tools.photometry_calibrator();
    let tools = Collaborators {
        calibrator: &calibrator,
        extractor: &extractor,
        solver: &solver,
        photometry: &photometry,
    };

    PipelineDriver::new(&config, tools).run()
}

pub fn print_summary(summary: &RunSummary) {
    println!(
        "{:<15} {:<12} {:<40} {:<6} {:<30} {:<40}",
        "Object", "Date", "Frame", "Band", "Cross frame", "Result"
    );
    println!("{:-<148}", "");

    for (item, outcome) in &summary.items {
        let result = match outcome {
            ItemOutcome::Correlated { plot, pairs } => format!(
                "{} pixels -> {}",
                pairs,
                extract_filename(&plot.to_string_lossy())
            ),
            ItemOutcome::Skipped { stage, reason } => format!("skipped at {}: {}", stage, reason),
        };
        println!(
            "{:<15} {:<12} {:<40} {:<6} {:<30} {:<40}",
            truncate_string(&item.object, 15),
            truncate_string(&item.date, 12),
            truncate_string(&item.file, 40),
            item.band.name(),
            truncate_string(extract_filename(&item.cross.to_string_lossy()), 30),
            truncate_string(&result, 40)
        );
    }

    println!();
    println!(
        "{} correlated, {} skipped",
        summary.correlated(),
        summary.skipped()
    );
}
