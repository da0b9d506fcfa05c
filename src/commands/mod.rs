pub mod correlate;

pub use correlate::{print_summary, run_correlate};
