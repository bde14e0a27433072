//! Root partition resize execution.
//!
//! The orderings in here are load-bearing. Growing must enlarge the
//! partition before the filesystem; shrinking must shrink the filesystem
//! before the partition and only then cut the backing file. Both end with
//! a preen-mode fsck over the result.

use std::{fs::create_dir_all, path::Path};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{
	cleanup, image,
	loopback::LoopManager,
	plan,
	probe::Probe,
	runner::CommandRunner,
	table::{self, PartitionTable},
};

pub struct ResizeExecutor<'a> {
	pub runner: &'a dyn CommandRunner,
	pub image: &'a Path,
	pub root_loop: &'a str,
	pub root_fs: &'a str,
	pub staging_dir: &'a Path,
}

impl ResizeExecutor<'_> {
	/// Grow the image root partition and its filesystem to `target`
	/// sectors. Returns the updated partition table.
	pub fn grow(&self, current: &PartitionTable, target: u64) -> Result<PartitionTable> {
		let old = current.root()?.size_sectors;
		info!(
			"Growing the image root partition from {} to {} sectors ...",
			old, target
		);
		image::extend(&self.image, target - old)?;
		let resized = current.resize_root(target)?;
		table::write_table(self.runner, &self.image, &resized.retarget(&self.image))?;
		let loops = LoopManager::new(self.runner);
		loops.reread(self.root_loop)?;
		self.fsck_force()?;
		self.resize_fs(Some(target))?;
		loops.reread(self.root_loop)?;
		// A second pass with no size lets the filesystem claim the device
		// limit exactly and consolidate its superblocks.
		self.resize_fs(None)?;
		self.fsck_preen()?;
		Ok(resized)
	}

	/// Shrink the image root partition and its filesystem to `target`
	/// sectors.
	///
	/// The image root is mounted once to re-measure its usage from within;
	/// a shrink that would leave less than 5% free space is demoted to a
	/// no-op and `None` is returned.
	pub fn shrink(&self, current: &PartitionTable, target: u64) -> Result<Option<PartitionTable>> {
		let old = current.root()?.size_sectors;
		let image_used = self.measure_image_root()?;
		if plan::shrink_refused(image_used, target) {
			warn!(
				"Image root holds {} sectors; shrinking to {} would leave less than 5% free. Keeping {} sectors.",
				image_used, target, old
			);
			return Ok(None);
		}
		info!(
			"Shrinking the image root partition from {} to {} sectors ...",
			old, target
		);
		self.fsck_force()?;
		self.resize_fs(Some(target))?;
		image::truncate(self.runner, &self.image, old - target)?;
		let resized = current.resize_root(target)?;
		table::write_table(self.runner, &self.image, &resized.retarget(&self.image))?;
		let loops = LoopManager::new(self.runner);
		loops.reread(self.root_loop)?;
		self.resize_fs(None)?;
		self.fsck_preen()?;
		Ok(Some(resized))
	}

	/// Mount the image root read-write and report its used sectors.
	///
	/// Replication has not run yet, so the number reflects the previous
	/// run's data; the 5% headroom check absorbs that staleness.
	fn measure_image_root(&self) -> Result<u64> {
		create_dir_all(self.staging_dir).context(format!(
			"Failed to create the staging directory '{}'",
			self.staging_dir.display()
		))?;
		let staging = self.staging_dir.to_string_lossy();
		self.runner
			.run_checked("mount", &["-t", self.root_fs, "--", self.root_loop, &staging])?;
		cleanup::push_mount(&staging);
		let usage = Probe::new(self.runner).mount_of(&self.staging_dir);
		// A failed umount stays on the cleanup stack for the teardown to
		// retry; only a confirmed release may be forgotten.
		self.runner.run_checked("umount", &["--", &staging])?;
		cleanup::pop_mount(&staging);
		Ok(usage?.used_sectors)
	}

	fn resize_fs(&self, target: Option<u64>) -> Result<()> {
		match target {
			Some(sectors) => {
				let size = format!("{}s", sectors);
				self.runner
					.run_checked("resize2fs", &[self.root_loop, &size])
			}
			None => self.runner.run_checked("resize2fs", &[self.root_loop]),
		}
	}

	fn fsck_force(&self) -> Result<()> {
		self.runner.run_checked("fsck", &["-fy", self.root_loop])
	}

	fn fsck_preen(&self) -> Result<()> {
		self.runner.run_checked("fsck", &["-pf", self.root_loop])
	}
}
