//! The derivation engine: one source image in, one derived image out.
//!
//! A [`DerivationRequest`] names a source file, a destination path and a
//! compiled operation sequence. [`Engine::derive`] is the single entry
//! point; it owns the staleness check, the decode, the ordered op
//! application, the fixed encode policy and the optional metadata-copy
//! hook, and reports what it did through [`Derived`].
//!
//! Staleness is judged by mtime: a destination that exists and is at
//! least as new as its source is served from disk without decoding
//! anything (dimensions come from the image header). `force` bypasses
//! the check.

use crate::imaging::ops::{self, ApplyError, Op};
use crate::tags::TagCopier;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError, ImageFormat};
use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Fixed JPEG encode quality for derived images.
const JPEG_QUALITY: u8 = 90;

/// Extensions whose decoders are compiled in and known to work.
const PHOTO_CANDIDATES: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
    ("gif", ImageFormat::Gif),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
    ("webp", ImageFormat::WebP),
];

static SUPPORTED_EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    PHOTO_CANDIDATES
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .collect()
});

/// Image file extensions with working decoders compiled in.
pub fn supported_source_extensions() -> &'static [&'static str] {
    &SUPPORTED_EXTENSIONS
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
}

/// Everything needed to produce one derived image.
#[derive(Debug, Clone)]
pub struct DerivationRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub ops: Arc<[Op]>,
}

/// Result of a successful derivation (or cache hit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derived {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// True when the destination was already fresh and nothing was done.
    pub cached: bool,
}

#[derive(Error, Debug)]
pub enum DeriveError {
    #[error("unsupported image format `{0}`")]
    UnsupportedFormat(String),

    #[error("cannot read source image {path}: {source}")]
    SourceUnreadable { path: PathBuf, source: io::Error },

    #[error("failed to decode {path}: {message}")]
    DecodeFailed { path: PathBuf, message: String },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("failed to encode {path}: {message}")]
    EncodeFailed { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Drives derivations. Holds the policy knobs and the optional tag
/// copier; one engine serves a whole build.
pub struct Engine<'a> {
    force: bool,
    tag_copier: Option<&'a dyn TagCopier>,
}

impl<'a> Engine<'a> {
    pub fn new(force: bool, tag_copier: Option<&'a dyn TagCopier>) -> Self {
        Engine { force, tag_copier }
    }

    /// Produce the derived image for `req`, or confirm the cached copy.
    pub fn derive(&self, req: &DerivationRequest) -> Result<Derived, DeriveError> {
        if !is_supported(&req.source) {
            let ext = req
                .source
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string();
            return Err(DeriveError::UnsupportedFormat(ext));
        }

        let source_meta =
            fs::metadata(&req.source).map_err(|e| DeriveError::SourceUnreadable {
                path: req.source.clone(),
                source: e,
            })?;

        if !self.force && is_fresh(&req.destination, &source_meta)? {
            let (width, height) = image::image_dimensions(&req.destination).map_err(|e| {
                DeriveError::DecodeFailed {
                    path: req.destination.clone(),
                    message: e.to_string(),
                }
            })?;
            log::debug!("cached: {}", req.destination.display());
            return Ok(Derived {
                path: req.destination.clone(),
                width,
                height,
                cached: true,
            });
        }

        let img = load_image(&req.source)?;
        let out = ops::apply_sequence(img, &req.ops)?;
        let (width, height) = (out.width(), out.height());

        if let Some(parent) = req.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        save_image(&out, &req.destination)?;
        log::debug!(
            "derived: {} ({width}x{height})",
            req.destination.display()
        );

        if let Some(copier) = self.tag_copier {
            let presence = copier.dimension_tags_present(&req.source);
            let w = presence.width.then_some(width);
            let h = presence.height.then_some(height);
            if let Err(e) = copier.copy(&req.source, &req.destination, w, h) {
                log::warn!(
                    "metadata copy failed for {}: {e}",
                    req.destination.display()
                );
            }
        }

        Ok(Derived {
            path: req.destination.clone(),
            width,
            height,
            cached: false,
        })
    }
}

/// A destination is fresh when it exists and is no older than its source.
fn is_fresh(dest: &Path, source_meta: &fs::Metadata) -> Result<bool, io::Error> {
    let Ok(dest_meta) = fs::metadata(dest) else {
        return Ok(false);
    };
    Ok(dest_meta.modified()? >= source_meta.modified()?)
}

fn load_image(path: &Path) -> Result<DynamicImage, DeriveError> {
    image::open(path).map_err(|e| match e {
        ImageError::IoError(io_err) => DeriveError::SourceUnreadable {
            path: path.to_path_buf(),
            source: io_err,
        },
        other => DeriveError::DecodeFailed {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    })
}

/// Write the derived image, inferring the format from the destination
/// extension. JPEG goes through the fixed-quality encoder; everything
/// else uses the format's default encoder.
fn save_image(img: &DynamicImage, path: &Path) -> Result<(), DeriveError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let encode_err = |e: ImageError| DeriveError::EncodeFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    match ext.as_str() {
        "jpg" | "jpeg" => {
            // JPEG has no alpha channel; flatten RGBA output first.
            let flattened;
            let img = if img.color().has_alpha() {
                flattened = DynamicImage::ImageRgb8(img.to_rgb8());
                &flattened
            } else {
                img
            };
            let file = fs::File::create(path)?;
            let writer = BufWriter::new(file);
            let encoder = JpegEncoder::new_with_quality(writer, JPEG_QUALITY);
            img.write_with_encoder(encoder).map_err(encode_err)
        }
        _ => img.save(path).map_err(encode_err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::ops::{OpSpec, compile};
    use crate::tags::TagPresence;
    use crate::tags::tests::MockTagCopier;
    use crate::test_helpers::{create_test_jpeg, create_test_png};
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn request(source: &Path, dest: &Path, specs: &[&str]) -> DerivationRequest {
        let specs: Vec<OpSpec> = specs.iter().map(|s| OpSpec::from(*s)).collect();
        DerivationRequest {
            source: source.to_path_buf(),
            destination: dest.to_path_buf(),
            ops: compile(&specs).unwrap().into(),
        }
    }

    #[test]
    fn derives_into_missing_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 400, 300);
        let dest = tmp.path().join("derivatives/thumb/photo.jpg");

        let engine = Engine::new(false, None);
        let derived = engine
            .derive(&request(&source, &dest, &["resize 100 75"]))
            .unwrap();

        assert!(dest.exists());
        assert!(!derived.cached);
        assert_eq!((derived.width, derived.height), (100, 75));
    }

    #[test]
    fn second_run_is_a_cache_hit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.png");
        create_test_png(&source, 200, 200);
        let dest = tmp.path().join("d/photo.png");
        let req = request(&source, &dest, &["resize 50 50"]);

        let engine = Engine::new(false, None);
        assert!(!engine.derive(&req).unwrap().cached);
        let second = engine.derive(&req).unwrap();
        assert!(second.cached);
        assert_eq!((second.width, second.height), (50, 50));
    }

    #[test]
    fn newer_source_invalidates_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.png");
        create_test_png(&source, 200, 200);
        let dest = tmp.path().join("d/photo.png");
        let req = request(&source, &dest, &["resize 50 50"]);

        let engine = Engine::new(false, None);
        engine.derive(&req).unwrap();

        // Push the source mtime past the destination's.
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        assert!(!engine.derive(&req).unwrap().cached);
    }

    #[test]
    fn force_bypasses_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.png");
        create_test_png(&source, 200, 200);
        let dest = tmp.path().join("d/photo.png");
        let req = request(&source, &dest, &["resize 50 50"]);

        Engine::new(false, None).derive(&req).unwrap();
        assert!(!Engine::new(true, None).derive(&req).unwrap().cached);
    }

    #[test]
    fn degenerate_crop_writes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.png");
        create_test_png(&source, 100, 100);
        let dest = tmp.path().join("d/photo.png");

        let engine = Engine::new(false, None);
        let err = engine
            .derive(&request(&source, &dest, &["crop 0 0 0 0"]))
            .unwrap_err();

        assert!(matches!(
            err,
            DeriveError::Apply(ApplyError::DegenerateCrop { .. })
        ));
        assert!(!dest.exists());
    }

    #[test]
    fn missing_source_is_unreadable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("nope.jpg");
        let dest = tmp.path().join("d/nope.jpg");

        let err = Engine::new(false, None)
            .derive(&request(&source, &dest, &["grayscale"]))
            .unwrap_err();
        assert!(matches!(err, DeriveError::SourceUnreadable { .. }));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("diagram.svg");
        std::fs::write(&source, "<svg/>").unwrap();
        let dest = tmp.path().join("d/diagram.svg");

        let err = Engine::new(false, None)
            .derive(&request(&source, &dest, &["grayscale"]))
            .unwrap_err();
        assert!(matches!(err, DeriveError::UnsupportedFormat(ext) if ext == "svg"));
    }

    #[test]
    fn grayscale_jpeg_output_is_encodable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 64, 64);
        let dest = tmp.path().join("d/photo.jpg");

        let derived = Engine::new(false, None)
            .derive(&request(&source, &dest, &["grayscale"]))
            .unwrap();
        assert_eq!((derived.width, derived.height), (64, 64));
        assert!(dest.exists());
    }

    #[test]
    fn rotated_rgba_output_flattens_for_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 64, 64);
        let dest = tmp.path().join("d/photo.jpg");

        // Arbitrary-angle rotation produces RGBA corners.
        let derived = Engine::new(false, None)
            .derive(&request(&source, &dest, &["rotate 45"]))
            .unwrap();
        assert!(derived.width > 64);
    }

    #[test]
    fn tag_copier_receives_only_present_dimension_tags() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 200, 100);
        let dest = tmp.path().join("d/photo.jpg");

        let mock = MockTagCopier {
            presence: TagPresence {
                width: true,
                height: false,
            },
            ..Default::default()
        };
        Engine::new(false, Some(&mock))
            .derive(&request(&source, &dest, &["resize 100 50"]))
            .unwrap();

        let copies = mock.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].width, Some(100));
        assert_eq!(copies[0].height, None);
    }

    #[test]
    fn tag_copy_failure_keeps_derived_image() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 100, 100);
        let dest = tmp.path().join("d/photo.jpg");

        let mock = MockTagCopier {
            fail: true,
            ..Default::default()
        };
        let derived = Engine::new(false, Some(&mock))
            .derive(&request(&source, &dest, &["grayscale"]))
            .unwrap();
        assert!(!derived.cached);
        assert!(dest.exists());
    }

    #[test]
    fn cached_copy_skips_tag_copier() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        create_test_jpeg(&source, 100, 100);
        let dest = tmp.path().join("d/photo.jpg");
        let req = request(&source, &dest, &["grayscale"]);

        let mock = MockTagCopier::default();
        let engine = Engine::new(false, Some(&mock));
        engine.derive(&req).unwrap();
        engine.derive(&req).unwrap();

        assert_eq!(mock.copies.lock().unwrap().len(), 1);
    }

    #[test]
    fn supported_extensions_cover_the_photo_set() {
        let exts = supported_source_extensions();
        for expected in &["jpg", "jpeg", "png", "gif", "webp", "tif", "tiff"] {
            assert!(
                exts.contains(expected),
                "expected {expected} in supported extensions"
            );
        }
    }
}
