use clap::Parser;
use sky_correlate::cli::Cli;
use sky_correlate::commands::{print_summary, run_correlate};
use sky_correlate::logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let summary = run_correlate(&cli)?;
    print_summary(&summary);

    Ok(())
}
