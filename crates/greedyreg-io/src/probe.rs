//! Transform-file type inference.
//!
//! A transform-chain entry is either a displacement-field image or an
//! affine matrix text file; the type is inferred from the filename.

use std::path::Path;

const IMAGE_SUFFIXES: &[&str] = &[".nii", ".nii.gz", ".hdr", ".img", ".img.gz"];

/// Whether the path names an image file (as opposed to a matrix file).
pub fn is_image_file<P: AsRef<Path>>(path: P) -> bool {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_SUFFIXES.iter().any(|s| name.ends_with(s))
}
