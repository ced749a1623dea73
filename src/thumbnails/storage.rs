//! On-disk thumbnail artifacts.
//!
//! Artifacts live at `{dir}/{fp[0..2]}/{fp}_{size}.jpg`. The fingerprint in
//! the name is the only binding between an artifact and its record, so an
//! artifact is never looked up by filename.

use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use galleryd_common::{Error, Fingerprint, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use serde::Serialize;

/// Partial files younger than this may still belong to a running job.
const PARTIAL_GRACE: Duration = Duration::from_secs(300);

/// Artifact count and total size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub artifacts: u64,
    pub bytes: u64,
}

pub struct ThumbnailStorage {
    dir: PathBuf,
    size: u32,
    quality: u8,
}

impl ThumbnailStorage {
    pub fn new(dir: PathBuf, size: u32, quality: u8) -> Self {
        Self { dir, size, quality }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(fingerprint.shard())
            .join(format!("{}_{}.jpg", fingerprint, self.size))
    }

    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.artifact_path(fingerprint).is_file()
    }

    /// Decode `source`, shrink it to fit the configured size and write the
    /// JPEG artifact for `fingerprint`. Blocking.
    pub fn generate(&self, source: &Path, fingerprint: &Fingerprint) -> Result<PathBuf> {
        let img = image::open(source)
            .map_err(|e| Error::thumbnail(format!("cannot decode {}: {e}", source.display())))?;

        let thumb = img.thumbnail(self.size, self.size);
        let rgb = flatten_onto_white(&thumb);

        let path = self.artifact_path(fingerprint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // rename into place so readers never see a partial file
        let tmp = path.with_extension("jpg.part");
        let result = (|| -> Result<()> {
            let file = std::fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, self.quality)
                .encode_image(&rgb)
                .map_err(|e| Error::thumbnail(format!("cannot encode thumbnail: {e}")))?;
            writer.flush()?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result.map(|()| path)
    }

    /// Delete every artifact of `fingerprint`, whatever size it was made at.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<usize> {
        let shard = self.dir.join(fingerprint.shard());
        let prefix = format!("{}_", fingerprint);
        let entries = match std::fs::read_dir(&shard) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        for entry in walkdir::WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            stats.artifacts += 1;
            stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        stats
    }

    /// Artifacts whose fingerprint is not in `live`, plus stale partial files.
    pub fn orphans(&self, live: &HashSet<Fingerprint>) -> Vec<PathBuf> {
        let now = SystemTime::now();
        walkdir::WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(".part") {
                    let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                    return modified
                        .and_then(|at| now.duration_since(at).ok())
                        .map_or(true, |age| age >= PARTIAL_GRACE);
                }
                !name
                    .strip_suffix(".jpg")
                    .and_then(|stem| stem.rsplit_once('_'))
                    .is_some_and(|(fp, _size)| live.contains(&Fingerprint::new(fp)))
            })
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Delete [`orphans`](Self::orphans). Returns how many files were removed.
    pub fn cleanup_orphans(&self, live: &HashSet<Fingerprint>) -> Result<usize> {
        let mut removed = 0;
        for path in self.orphans(live) {
            tracing::debug!(path = %path.display(), "Removing orphaned thumbnail");
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let alpha = px[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn storage(dir: &Path) -> ThumbnailStorage {
        ThumbnailStorage::new(dir.join("thumbs"), 64, 85)
    }

    #[test]
    fn test_artifact_path_layout() {
        let s = ThumbnailStorage::new(PathBuf::from("/cache"), 256, 85);
        assert_eq!(
            s.artifact_path(&Fingerprint::new("ab12cd34ef56ab78")),
            PathBuf::from("/cache/ab/ab12cd34ef56ab78_256.jpg")
        );
    }

    #[test]
    fn test_generate_keeps_aspect_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("wide.png");
        RgbImage::from_pixel(200, 100, Rgb([10, 20, 30])).save(&src).unwrap();

        let s = storage(dir.path());
        let fp = Fingerprint::new("00aa11bb22cc33dd");
        let path = s.generate(&src, &fp).unwrap();
        assert_eq!(path, s.artifact_path(&fp));
        assert_eq!(image::image_dimensions(&path).unwrap(), (64, 32));
        assert!(!path.with_extension("jpg.part").exists());
    }

    #[test]
    fn test_transparent_flattened_to_white() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clear.png");
        RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0])).save(&src).unwrap();

        let s = storage(dir.path());
        let path = s.generate(&src, &Fingerprint::new("ffee")).unwrap();
        let px = image::open(&path).unwrap().to_rgb8().get_pixel(4, 4).0;
        assert!(px.iter().all(|&c| c > 240), "expected white, got {px:?}");
    }

    #[test]
    fn test_undecodable_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("broken.png");
        std::fs::write(&src, b"not an image").unwrap();

        let err = storage(dir.path())
            .generate(&src, &Fingerprint::new("abcd"))
            .unwrap_err();
        assert!(matches!(err, Error::ThumbnailFailed(_)));
    }

    #[test]
    fn test_remove_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.png");
        RgbImage::new(4, 4).save(&src).unwrap();
        let s = storage(dir.path());

        let keep = Fingerprint::new("aa00000000000001");
        let drop_me = Fingerprint::new("bb00000000000002");
        s.generate(&src, &keep).unwrap();
        s.generate(&src, &drop_me).unwrap();
        assert_eq!(s.stats().artifacts, 2);

        // a partial file of a job still writing is left alone
        let partial = s.artifact_path(&keep).with_extension("jpg.part");
        std::fs::write(&partial, b"half").unwrap();

        let live: HashSet<Fingerprint> = [keep.clone()].into_iter().collect();
        assert_eq!(s.orphans(&live), vec![s.artifact_path(&drop_me)]);
        assert_eq!(s.cleanup_orphans(&live).unwrap(), 1);
        assert!(partial.exists());
        std::fs::remove_file(&partial).unwrap();
        assert!(s.exists(&keep));
        assert!(!s.exists(&drop_me));

        assert_eq!(s.remove(&keep).unwrap(), 1);
        assert_eq!(s.remove(&keep).unwrap(), 0);
        assert_eq!(s.stats(), StorageStats::default());
    }
}
