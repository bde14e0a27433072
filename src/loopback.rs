//! Loop device management, driven through losetup(8).

use std::path::Path;

use anyhow::{bail, Result};
use log::debug;

use crate::runner::CommandRunner;

pub struct LoopManager<'a> {
	runner: &'a dyn CommandRunner,
}

impl<'a> LoopManager<'a> {
	pub fn new(runner: &'a dyn CommandRunner) -> Self {
		Self { runner }
	}

	/// Ask the loop allocator for an unused device node.
	pub fn next_free(&self) -> Result<String> {
		let output = self.runner.read_output("losetup", &["--find"])?;
		let device = output.trim();
		if device.is_empty() {
			bail!("No free loop device is available");
		}
		debug!("Next free loop device: {}", device);
		Ok(device.to_string())
	}

	/// Bind `device` to a byte range of the image file.
	///
	/// The root partition is attached without a size limit so the device
	/// can follow the backing file through a resize; every other partition
	/// must pass one.
	pub fn attach(
		&self,
		device: &str,
		image: &dyn AsRef<Path>,
		offset_bytes: u64,
		size_limit_bytes: Option<u64>,
	) -> Result<()> {
		let image = image.as_ref();
		let image_str = image.to_string_lossy();
		let offset = offset_bytes.to_string();
		let mut args: Vec<&str> = vec!["-o", offset.as_str()];
		let limit;
		if let Some(limit_bytes) = size_limit_bytes {
			limit = limit_bytes.to_string();
			args.push("--sizelimit");
			args.push(limit.as_str());
		}
		args.push("--");
		args.push(device);
		args.push(&image_str);
		debug!(
			"Attaching {} to {} at offset {} (limit {:?})",
			image.display(),
			device,
			offset_bytes,
			size_limit_bytes
		);
		self.runner.run_checked("losetup", &args)
	}

	/// Refresh the device's capacity after the backing file grew or shrank.
	pub fn reread(&self, device: &str) -> Result<()> {
		self.runner
			.run_checked("losetup", &["--set-capacity", "--", device])
	}

	/// Schedule the device for release once its last user drops.
	///
	/// Detaching a loop device that is still mounted does not fail; the
	/// kernel marks it autoclear instead, so the final umount releases it.
	pub fn set_autoclear(&self, device: &str) -> Result<()> {
		debug!("Marking {} autoclear", device);
		self.runner
			.run_checked("losetup", &["--detach", "--", device])
	}

	/// Release the device unconditionally.
	pub fn detach(&self, device: &str) -> Result<()> {
		debug!("Detaching {}", device);
		self.runner
			.run_checked("losetup", &["--detach", "--", device])
	}
}
