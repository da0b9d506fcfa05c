use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::convolve::BeamWidth;

use super::layout::Layout;
use super::PipelineConfig;

/// Far-infrared bands of the cross frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    Psw,
    Pmw,
    Plw,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Psw, Band::Pmw, Band::Plw];

    pub fn name(self) -> &'static str {
        match self {
            Band::Psw => "PSW",
            Band::Pmw => "PMW",
            Band::Plw => "PLW",
        }
    }

    /// Native beam FWHM
    pub fn beam(self) -> BeamWidth {
        match self {
            Band::Psw => BeamWidth::known(17.6),
            Band::Pmw => BeamWidth::known(23.9),
            Band::Plw => BeamWidth::known(35.2),
        }
    }

    /// The band named in a cross-frame filename
    pub fn from_filename(name: &str) -> Option<Band> {
        Band::ALL.into_iter().find(|b| name.contains(b.name()))
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One optical frame paired with one cross frame
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub object: String,
    pub date: String,
    /// Raw frame file name
    pub file: String,
    pub band: Band,
    pub cross: PathBuf,
}

impl WorkItem {
    pub fn same_frame(&self, other: &WorkItem) -> bool {
        self.object == other.object && self.date == other.date && self.file == other.file
    }
}

/// Location of a raw frame given on the command line
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub root: PathBuf,
    pub object: String,
    pub date: String,
    pub file: String,
}

/// Split `<root>/<object>/<raw dir>/<date>/<file>`
pub fn split_frame_path(path: &Path, raw_dir: &str) -> Result<FrameRef> {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.len() < 4 {
        bail!(
            "{} is not <root>/<object>/<raw dir>/<date>/<file>",
            path.display()
        );
    }
    let n = parts.len();
    let raw = raw_dir.trim_matches('/');
    if parts[n - 3] != raw {
        bail!("{} is not under a {} directory", path.display(), raw);
    }
    let root: PathBuf = path.components().take(n - 4).collect();
    Ok(FrameRef {
        root,
        object: parts[n - 4].clone(),
        date: parts[n - 2].clone(),
        file: parts[n - 1].clone(),
    })
}

/// Reindexed cross frames for an object, with their bands
pub fn cross_frames(cross_dir: &Path, object: &str) -> Result<Vec<(Band, PathBuf)>> {
    let dir = cross_dir.join(object);
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list cross frames: {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !name.contains("reindex") || !name.contains(".fits") {
            continue;
        }
        match Band::from_filename(&name) {
            Some(band) => frames.push((band, path)),
            None => tracing::warn!(file = %name, "cross frame names no known band, ignoring"),
        }
    }
    frames.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(frames)
}

/// Ordered work items: objects, dates, files, then cross frames.
///
/// Items of the same frame are adjacent, so the driver can run the
/// per-frame stages once before that frame's bands.
#[derive(Debug)]
pub struct WorkQueue {
    items: std::vec::IntoIter<WorkItem>,
}

impl WorkQueue {
    pub fn from_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub fn discover(config: &PipelineConfig, layout: &Layout) -> Result<Self> {
        let mut frames: Vec<(String, String, String)> = Vec::new();

        if config.files.is_empty() {
            for object in &config.objects {
                for date in layout.raw_dates(object)? {
                    for file in layout.raw_files(object, &date)? {
                        frames.push((object.clone(), date.clone(), file));
                    }
                }
            }
        } else {
            for path in &config.files {
                let frame = split_frame_path(path, &layout.raw_dir)?;
                if frame.root != layout.root {
                    bail!(
                        "{} is outside the data root {}",
                        path.display(),
                        layout.root.display()
                    );
                }
                frames.push((frame.object, frame.date, frame.file));
            }
        }

        let mut items = Vec::new();
        let mut cross: Option<(String, Vec<(Band, PathBuf)>)> = None;
        for (object, date, file) in frames {
            if cross.as_ref().map(|(o, _)| o) != Some(&object) {
                let found = cross_frames(&config.cross_dir, &object)?;
                if found.is_empty() {
                    tracing::warn!(object = %object, "no cross frames found");
                }
                cross = Some((object.clone(), found));
            }
            let Some((_, bands)) = cross.as_ref() else {
                continue;
            };
            for (band, path) in bands {
                items.push(WorkItem {
                    object: object.clone(),
                    date: date.clone(),
                    file: file.clone(),
                    band: *band,
                    cross: path.clone(),
                });
            }
        }

        tracing::info!(items = items.len(), "work queue built");
        Ok(Self::from_items(items))
    }
}

impl Iterator for WorkQueue {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_from_filename() {
        assert_eq!(Band::from_filename("PGM_PSW_reindex.fits"), Some(Band::Psw));
        assert_eq!(Band::from_filename("x_PLW_reindex.fits"), Some(Band::Plw));
        assert_eq!(Band::from_filename("x_reindex.fits"), None);
        assert_eq!(Band::Pmw.beam().arcsec(), 23.9);
    }

    #[test]
    fn test_split_frame_path() {
        let frame =
            split_frame_path(Path::new("/data/PGM_1_2/raw_lights/2016-03-01/a.fits"), "raw_lights")
                .unwrap();
        assert_eq!(frame.root, PathBuf::from("/data"));
        assert_eq!(frame.object, "PGM_1_2");
        assert_eq!(frame.date, "2016-03-01");
        assert_eq!(frame.file, "a.fits");

        assert!(split_frame_path(Path::new("/data/x/other/d/a.fits"), "raw_lights").is_err());
        assert!(split_frame_path(Path::new("a.fits"), "raw_lights").is_err());
    }

    #[test]
    fn test_discover_orders_items_by_frame() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let cross = dir.path().join("herschel");
        for date in ["d2", "d1"] {
            let night = root.join("M31").join("raw_lights").join(date);
            std::fs::create_dir_all(&night).unwrap();
            std::fs::write(night.join("f.fits"), b"").unwrap();
        }
        std::fs::create_dir_all(cross.join("M31")).unwrap();
        for name in ["M31_PSW_reindex.fits", "M31_PLW_reindex.fits", "M31_PSW.fits"] {
            std::fs::write(cross.join("M31").join(name), b"").unwrap();
        }

        let config = PipelineConfig {
            root: root.clone(),
            objects: vec!["M31".to_string()],
            cross_dir: cross,
            ..Default::default()
        };
        let layout = Layout::from_config(&config);
        let items: Vec<WorkItem> = WorkQueue::discover(&config, &layout).unwrap().collect();

        let summary: Vec<(&str, Band)> = items.iter().map(|i| (i.date.as_str(), i.band)).collect();
        assert_eq!(
            summary,
            vec![
                ("d1", Band::Plw),
                ("d1", Band::Psw),
                ("d2", Band::Plw),
                ("d2", Band::Psw)
            ]
        );
        assert!(items[0].same_frame(&items[1]));
        assert!(!items[1].same_frame(&items[2]));
    }

    #[test]
    fn test_explicit_files_must_share_root() {
        let dir = tempfile::tempdir().unwrap();
        let cross = dir.path().join("herschel");
        std::fs::create_dir_all(cross.join("M31")).unwrap();
        let config = PipelineConfig {
            root: dir.path().join("data"),
            files: vec![PathBuf::from("/elsewhere/M31/raw_lights/d1/f.fits")],
            cross_dir: cross,
            ..Default::default()
        };
        let layout = Layout::from_config(&config);
        assert!(WorkQueue::discover(&config, &layout).is_err());
    }
}
