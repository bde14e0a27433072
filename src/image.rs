//! Image file allocation.
//!
//! The image is a plain dense file written out in 512-byte zero stripes, so
//! a full-size medium restore never hits a hole the host filesystem failed
//! to back.

use std::{
	fs::File,
	io::{BufWriter, Write},
	path::Path,
};

use anyhow::{anyhow, Context, Result};
use log::debug;

use crate::runner::CommandRunner;

pub const SECTOR_SIZE: u64 = 512;

const ZERO_STRIPE: [u8; SECTOR_SIZE as usize] = [0u8; SECTOR_SIZE as usize];

/// Create a new image file of exactly `sectors` zeroed 512-byte sectors.
///
/// A failed stripe aborts the run; the partial file is left on disk for
/// inspection.
pub fn create(path: &dyn AsRef<Path>, sectors: u64) -> Result<()> {
	let img_path = path.as_ref();
	let parent = img_path.parent().unwrap_or(Path::new("/"));
	if !parent.exists() {
		return Err(anyhow!(
			"One or more of the parent directories does not exist"
		));
	}
	debug!(
		"Allocating image '{}' with {} sectors ({} bytes) ...",
		img_path.display(),
		sectors,
		sectors * SECTOR_SIZE
	);
	let img_file = File::create_new(img_path).context(format!(
		"Error creating image file '{}'",
		img_path.display()
	))?;
	write_stripes(img_file, sectors)
		.context(format!("Short write while allocating '{}'", img_path.display()))
}

/// Append `extra_sectors` zeroed sectors to an existing image.
pub fn extend(path: &dyn AsRef<Path>, extra_sectors: u64) -> Result<()> {
	let img_path = path.as_ref();
	debug!(
		"Extending image '{}' by {} sectors ...",
		img_path.display(),
		extra_sectors
	);
	let img_file = File::options()
		.append(true)
		.open(img_path)
		.context(format!("Error opening image file '{}'", img_path.display()))?;
	write_stripes(img_file, extra_sectors)
		.context(format!("Short write while extending '{}'", img_path.display()))
}

fn write_stripes(file: File, sectors: u64) -> Result<()> {
	let mut writer = BufWriter::with_capacity(1048576, file);
	for _ in 0..sectors {
		writer.write_all(&ZERO_STRIPE)?;
	}
	writer.flush()?;
	writer.into_inner()?.sync_all()?;
	Ok(())
}

/// Cut `shrink_sectors` off the end of the image.
///
/// Delegated to truncate(1) so the length change is a single atomic
/// operation on the host filesystem.
pub fn truncate(
	runner: &dyn CommandRunner,
	path: &dyn AsRef<Path>,
	shrink_sectors: u64,
) -> Result<()> {
	let img_path = path.as_ref();
	let path_str = img_path.to_string_lossy();
	let reduce = format!("-{}", shrink_sectors * SECTOR_SIZE);
	debug!(
		"Truncating image '{}' by {} sectors ...",
		img_path.display(),
		shrink_sectors
	);
	runner.run_checked("truncate", &["-s", &reduce, "--", &path_str])
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::io::Read;

	fn scratch_path(name: &str) -> std::path::PathBuf {
		std::env::temp_dir().join(format!("mklivebak-image-test-{}-{}", std::process::id(), name))
	}

	#[test]
	fn test_create_exact_size() -> Result<()> {
		let path = scratch_path("create");
		let _ = fs::remove_file(&path);
		create(&path.as_path(), 2048)?;
		let meta = fs::metadata(&path)?;
		assert_eq!(meta.len(), 2048 * SECTOR_SIZE);
		// Spot-check that the stripes really are zeroes.
		let mut buf = [0xffu8; 512];
		File::open(&path)?.read_exact(&mut buf)?;
		assert!(buf.iter().all(|b| *b == 0));
		fs::remove_file(&path)?;
		Ok(())
	}

	#[test]
	fn test_create_refuses_existing_file() -> Result<()> {
		let path = scratch_path("existing");
		let _ = fs::remove_file(&path);
		fs::write(&path, b"occupied")?;
		assert!(create(&path.as_path(), 16).is_err());
		fs::remove_file(&path)?;
		Ok(())
	}

	#[test]
	fn test_create_requires_parent_dir() {
		let path = scratch_path("noparent").join("deeper/image.img");
		assert!(create(&path.as_path(), 16).is_err());
	}

	#[test]
	fn test_extend_appends() -> Result<()> {
		let path = scratch_path("extend");
		let _ = fs::remove_file(&path);
		create(&path.as_path(), 100)?;
		extend(&path.as_path(), 28)?;
		assert_eq!(fs::metadata(&path)?.len(), 128 * SECTOR_SIZE);
		fs::remove_file(&path)?;
		Ok(())
	}
}
