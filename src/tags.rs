//! Metadata tag copying between source and derived images.
//!
//! Derived images are written fresh by the encoder and carry none of the
//! source's EXIF/IPTC/XMP tags. When `copy_metadata` is enabled the
//! engine hands each freshly written derivative to a [`TagCopier`],
//! which clones the source's tags onto it. Dimension tags are special:
//! blindly copying them would record the *source's* pixel size on a
//! resized file, so the engine first probes which dimension tags the
//! source actually carries and passes corrected values for exactly
//! those.
//!
//! The shipped implementation shells out to `exiftool`, the same way
//! every other tool in this space does. Tag copying is strictly
//! best-effort: a failure leaves a perfectly usable derived image, so
//! callers log and move on.

use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagCopyError {
    #[error("failed to run exiftool: {0}")]
    Spawn(#[from] io::Error),

    #[error("exiftool exited with {status}: {stderr}")]
    Failed {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Which dimension tags a source image carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagPresence {
    pub width: bool,
    pub height: bool,
}

/// Copies metadata tags from a source image onto a derived one.
pub trait TagCopier {
    /// Probe the source for EXIF dimension tags.
    fn dimension_tags_present(&self, source: &Path) -> TagPresence;

    /// Copy all tags from `source` onto `dest`, overriding the
    /// dimension tags with the given values where provided.
    fn copy(
        &self,
        source: &Path,
        dest: &Path,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(), TagCopyError>;
}

/// [`TagCopier`] backed by the `exiftool` binary.
pub struct ExifToolCopier;

impl ExifToolCopier {
    /// Returns a copier if `exiftool` is on the PATH, logging a warning
    /// otherwise so the caller can disable metadata copying.
    pub fn detect() -> Option<Self> {
        match Command::new("exiftool").arg("-ver").output() {
            Ok(out) if out.status.success() => Some(ExifToolCopier),
            _ => {
                log::warn!("exiftool not found; metadata will not be copied");
                None
            }
        }
    }
}

impl TagCopier for ExifToolCopier {
    fn dimension_tags_present(&self, source: &Path) -> TagPresence {
        let output = match Command::new("exiftool")
            .args(["-j", "-EXIF:ImageWidth", "-EXIF:ImageHeight"])
            .arg(source)
            .output()
        {
            Ok(out) if out.status.success() => out.stdout,
            _ => return TagPresence::default(),
        };
        // exiftool -j prints a one-element JSON array of tag objects;
        // absent tags are simply missing keys.
        let parsed: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_slice(&output).unwrap_or_default();
        let Some(tags) = parsed.first() else {
            return TagPresence::default();
        };
        TagPresence {
            width: tags.contains_key("ImageWidth"),
            height: tags.contains_key("ImageHeight"),
        }
    }

    fn copy(
        &self,
        source: &Path,
        dest: &Path,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(), TagCopyError> {
        let mut cmd = Command::new("exiftool");
        cmd.arg("-TagsFromFile")
            .arg(source)
            .arg("-all:all")
            .arg("-overwrite_original");
        if let Some(w) = width {
            cmd.arg(format!("-EXIF:ImageWidth={w}"));
        }
        if let Some(h) = height {
            cmd.arg(format!("-EXIF:ImageHeight={h}"));
        }
        cmd.arg(dest);

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(TagCopyError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// A recorded call to [`MockTagCopier::copy`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCopy {
        pub source: PathBuf,
        pub dest: PathBuf,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    /// Recording copier for engine tests. Configure `presence` to steer
    /// which dimension overrides the engine passes, and `fail` to
    /// exercise the best-effort path.
    #[derive(Default)]
    pub struct MockTagCopier {
        pub presence: TagPresence,
        pub fail: bool,
        pub copies: Mutex<Vec<RecordedCopy>>,
    }

    impl TagCopier for MockTagCopier {
        fn dimension_tags_present(&self, _source: &Path) -> TagPresence {
            self.presence
        }

        fn copy(
            &self,
            source: &Path,
            dest: &Path,
            width: Option<u32>,
            height: Option<u32>,
        ) -> Result<(), TagCopyError> {
            self.copies.lock().unwrap().push(RecordedCopy {
                source: source.to_path_buf(),
                dest: dest.to_path_buf(),
                width,
                height,
            });
            if self.fail {
                return Err(TagCopyError::Spawn(io::Error::other("mock failure")));
            }
            Ok(())
        }
    }

    #[test]
    fn mock_records_calls() {
        let mock = MockTagCopier::default();
        mock.copy(Path::new("a.jpg"), Path::new("b.jpg"), Some(10), None)
            .unwrap();
        let copies = mock.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].width, Some(10));
        assert_eq!(copies[0].height, None);
    }
}
