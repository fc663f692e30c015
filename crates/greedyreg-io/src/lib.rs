//! File I/O for the registration engine: NIfTI images and displacement
//! fields, physical-unit warp serialization, and affine matrix text files.

pub mod matrix_io;
pub mod nifti_io;
pub mod probe;
pub mod warp_io;

pub use matrix_io::{read_matrix, write_matrix};
pub use nifti_io::{read_image, write_image};
pub use probe::is_image_file;
pub use warp_io::{read_warp_physical, read_warp_voxel, write_warp};
