pub mod background;
pub mod cache;
pub mod catalogue;
pub mod cli;
pub mod commands;
pub mod convolve;
pub mod error;
pub mod external;
pub mod fits;
pub mod histogram;
pub mod image;
pub mod logging;
pub mod mask;
pub mod pipeline;
pub mod regrid;
pub mod text_render;
pub mod utils;
pub mod wcs;

#[cfg(test)]
mod test_pipeline;

// Re-export commonly used items
pub use image::{Image, ImageMetadata};
pub use pipeline::{PipelineConfig, PipelineDriver, RunSummary};
