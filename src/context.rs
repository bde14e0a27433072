//! The image lifecycle orchestrator.
//!
//! One [`ImageContext`] drives a whole run: probe the source disk, allocate
//! or open the image, plan and execute the root resize, stage every image
//! partition under the staging tree, replicate, and tear everything down.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use owo_colors::colored::*;

use crate::{
	cleanup,
	cli::{Config, Mode},
	image,
	loopback::LoopManager,
	plan::{self, ResizeDecision, ResizePlan},
	probe::{Probe, NETWORK_FS, RESIZABLE_FS},
	resize::ResizeExecutor,
	runner::CommandRunner,
	table::{self, PartitionTable},
	utils::sync_filesystem,
};

/// External tools every run needs.
const BASE_TOOLS: &[&str] = &["losetup", "sfdisk", "rsync", "mount", "umount", "df", "lsblk"];
/// Additional tools a resizing run needs.
const RESIZE_TOOLS: &[&str] = &["fsck", "resize2fs", "truncate"];

pub struct ImageContext<'a> {
	pub cfg: &'a Config,
	pub runner: &'a dyn CommandRunner,
}

/// Everything learned about the source system before any mutation.
pub(crate) struct SourceLayout {
	pub table: PartitionTable,
	pub root_idx: usize,
	pub root_fs: String,
}

pub(crate) struct Prepared {
	pub src: SourceLayout,
	pub image_table: PartitionTable,
	pub resize_plan: Option<ResizePlan>,
}

impl ImageContext<'_> {
	pub(crate) fn info<S: AsRef<str>>(&self, content: S) {
		info!("[{}] {}", self.cfg.mode, content.as_ref());
	}

	pub(crate) fn warn<S: AsRef<str>>(&self, content: S) {
		warn!("[{}] {}", self.cfg.mode, content.as_ref());
	}

	pub fn execute(&self) -> Result<()> {
		let cfg = self.cfg;
		if cfg.premount {
			self.mount_host_dir()?;
		}
		self.require_tools()?;
		let prepared = self.prepare()?;

		// Everything up to here only reads the system (create mode has
		// additionally allocated the image file). From the first loop
		// attach on, teardown must run on every exit path.
		cleanup::arm();
		let result = self.run_armed(&prepared);
		let teardown = cleanup::run(self.runner);
		result?;
		teardown?;

		if !cfg.maintenance {
			let host_dir = host_dir_of(&cfg.image);
			sync_filesystem(&host_dir.as_path())?;
			self.info(format!(
				"Image '{}' is up to date.",
				cfg.image.display().bright_cyan()
			));
		}
		Ok(())
	}

	fn require_tools(&self) -> Result<()> {
		let mut tools: Vec<&str> = BASE_TOOLS.to_vec();
		if self.cfg.resize {
			tools.extend_from_slice(RESIZE_TOOLS);
		}
		for tool in tools {
			if !self.runner.tool_exists(tool) {
				bail!("Required tool '{}' was not found in PATH.", tool);
			}
		}
		Ok(())
	}

	/// Mount the directory holding the image file, relying on an fstab
	/// entry for it. Unmounted again as the last teardown step.
	fn mount_host_dir(&self) -> Result<()> {
		let host_dir = host_dir_of(&self.cfg.image);
		let host_str = host_dir.to_string_lossy();
		self.info(format!("Mounting image host directory {} ...", host_str));
		self.runner.run_checked("mount", &["--", &host_str])?;
		cleanup::register_host_mount(&host_str);
		Ok(())
	}

	fn prepare(&self) -> Result<Prepared> {
		let cfg = self.cfg;
		let probe = Probe::new(self.runner);

		let host_dir = host_dir_of(&cfg.image);
		if !host_dir.is_dir() {
			bail!(
				"Directory '{}' holding the image does not exist.",
				host_dir.display()
			);
		}
		match cfg.mode {
			Mode::Create => {
				if cfg.image.exists() {
					bail!(
						"Image '{}' already exists; refusing to create over it.",
						cfg.image.display()
					);
				}
			}
			Mode::Sync => {
				if !cfg.image.is_file() {
					bail!(
						"Image '{}' does not exist; create it first with -c.",
						cfg.image.display()
					);
				}
			}
		}

		let root_binding = probe
			.fs_of("/")
			.context("Unable to find the device backing the root filesystem")?;
		let src_disk = probe.parent_disk(&root_binding.device)?;
		self.info(format!(
			"Source disk: {} (root on {}, {})",
			src_disk.display(),
			root_binding.device,
			root_binding.fs_type
		));
		let src_table = table::read_table(self.runner, &src_disk)?;
		if src_table.partitions.len() < 2 {
			bail!(
				"Source disk {} carries {} partition(s); at least two are required.",
				src_disk.display(),
				src_table.partitions.len()
			);
		}
		let root_idx = src_table
			.partitions
			.iter()
			.position(|p| p.device == root_binding.device)
			.context(format!(
				"Root device {} is not a partition of {}",
				root_binding.device,
				src_disk.display()
			))?;

		self.check_image_host(&probe, &src_disk)?;

		let resize_enabled = self.resize_gate(&src_table, root_idx, &root_binding.fs_type);

		let usage = probe.mount_of(&Path::new("/"))?;
		self.info(format!(
			"Live root filesystem uses {} of {} sectors.",
			usage.used_sectors, usage.total_sectors
		));

		let (image_table, resize_plan) = match cfg.mode {
			Mode::Create => {
				let mut image_table = src_table.retarget(&cfg.image);
				if resize_enabled {
					let target = plan::target_sectors(usage.used_sectors, cfg.pct_free);
					self.info(format!("Sizing the image root to {} sectors.", target));
					image_table = image_table.resize_root(target)?;
				}
				let total = image_table.total_sectors()?;
				self.info(format!(
					"Allocating a {}-sector ({} MiB) image ...",
					total,
					total * image::SECTOR_SIZE / (1 << 20)
				));
				image::create(&cfg.image, total)?;
				table::write_table(self.runner, &cfg.image, &image_table)?;
				(image_table, None)
			}
			Mode::Sync => {
				let image_table = table::read_table(self.runner, &cfg.image)?;
				check_layout_match(&src_table, &image_table)?;
				let resize_plan = if resize_enabled {
					let current = image_table.partitions[root_idx].size_sectors;
					let resize_plan = plan::plan(usage.used_sectors, cfg.pct_free, current);
					self.info(format!(
						"Resize decision: {} (current {}, target {}, band {}..{})",
						resize_plan.decision,
						current,
						resize_plan.target_sectors,
						resize_plan.low_watermark,
						resize_plan.high_watermark
					));
					Some(resize_plan)
				} else {
					None
				};
				(image_table, resize_plan)
			}
		};

		Ok(Prepared {
			src: SourceLayout {
				table: src_table,
				root_idx,
				root_fs: root_binding.fs_type,
			},
			image_table,
			resize_plan,
		})
	}

	/// Decide whether `-r` stays in effect for this run.
	fn resize_gate(&self, src_table: &PartitionTable, root_idx: usize, root_fs: &str) -> bool {
		if !self.cfg.resize {
			return false;
		}
		if src_table.partitions.len() != 2 {
			self.warn(format!(
				"Resizing supports exactly two partitions, the source has {}; continuing without -r.",
				src_table.partitions.len()
			));
			return false;
		}
		if root_idx != 1 {
			self.warn("Resizing expects the root on the second partition; continuing without -r.");
			return false;
		}
		if !RESIZABLE_FS.contains(&root_fs) {
			self.warn(format!(
				"Root filesystem type '{}' is not resizable; continuing without -r.",
				root_fs
			));
			return false;
		}
		true
	}

	/// Refuse an image hosted on the source disk itself, unless `-r` was
	/// passed or the image lives on a network filesystem.
	fn check_image_host(&self, probe: &Probe, src_disk: &Path) -> Result<()> {
		let host_dir = host_dir_of(&self.cfg.image);
		let host_usage = probe.mount_of(&host_dir.as_path())?;
		let host_binding = probe.fs_of(&host_usage.mount_point)?;
		if NETWORK_FS.contains(&host_binding.fs_type.as_str()) {
			return Ok(());
		}
		// Devices without a parent disk (tmpfs, virtual mounts) cannot
		// collide with the source.
		let Ok(host_disk) = probe.parent_disk(&host_binding.device) else {
			return Ok(());
		};
		if host_disk == src_disk {
			if self.cfg.resize {
				self.warn(format!(
					"Image directory '{}' is on the source disk; continuing because -r was given.",
					host_dir.display()
				));
				return Ok(());
			}
			bail!(
				"Image directory '{}' is on the source disk {}; writing the image there would back up into itself.",
				host_dir.display(),
				src_disk.display()
			);
		}
		Ok(())
	}

	fn run_armed(&self, prep: &Prepared) -> Result<()> {
		let cfg = self.cfg;
		let loops = LoopManager::new(self.runner);
		let root_part = &prep.image_table.partitions[prep.src.root_idx];
		let root_loop = loops.next_free()?;
		// No size limit on the root loop: the device follows the backing
		// file through resizes, with the capacity refreshed explicitly.
		loops.attach(
			&root_loop,
			&cfg.image,
			root_part.start_sector * image::SECTOR_SIZE,
			None,
		)?;
		cleanup::push_loop(&root_loop);

		let mut image_table = prep.image_table.clone();
		if let Some(resize_plan) = &prep.resize_plan {
			let executor = ResizeExecutor {
				runner: self.runner,
				image: &cfg.image,
				root_loop: &root_loop,
				root_fs: &prep.src.root_fs,
				staging_dir: &cfg.staging_dir,
			};
			match resize_plan.decision {
				ResizeDecision::Noop => {
					self.info("Image root partition size is inside the hysteresis band.")
				}
				ResizeDecision::Grow => {
					image_table = executor.grow(&image_table, resize_plan.target_sectors)?;
				}
				ResizeDecision::Shrink => {
					if let Some(resized) =
						executor.shrink(&image_table, resize_plan.target_sectors)?
					{
						image_table = resized;
					}
				}
			}
		}

		if cfg.mode == Mode::Create {
			self.info(format!(
				"Formatting the image root partition ({}) ...",
				prep.src.root_fs
			));
			self.format_partition(&root_loop, &prep.src.root_fs)?;
		}

		let staged = self.stage_partitions(&image_table, prep, &root_loop)?;

		if cfg.maintenance {
			self.print_maintenance_instructions();
			cleanup::disarm();
			return Ok(());
		}

		self.replicate(&staged)?;
		Ok(())
	}
}

/// The directory holding the image file.
fn host_dir_of(image: &Path) -> PathBuf {
	match image.parent() {
		Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
		Some(p) => p.to_path_buf(),
		None => PathBuf::from("/"),
	}
}

/// The image must mirror the source layout: same partition count, same
/// start sectors. Sizes may differ only on the root (from earlier resizes).
fn check_layout_match(src: &PartitionTable, image: &PartitionTable) -> Result<()> {
	if src.partitions.len() != image.partitions.len() {
		bail!(
			"Image has {} partition(s), the source disk has {}; recreate the image with -c.",
			image.partitions.len(),
			src.partitions.len()
		);
	}
	for (idx, (s, i)) in src.partitions.iter().zip(image.partitions.iter()).enumerate() {
		if s.start_sector != i.start_sector {
			bail!(
				"Partition {} starts at sector {} in the image but {} on the source disk; recreate the image with -c.",
				idx + 1,
				i.start_sector,
				s.start_sector
			);
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::table::Partition;

	fn two_part_table(device: &str, root_size: u64) -> PartitionTable {
		PartitionTable {
			label: "dos".into(),
			label_id: Some("0x1234abcd".into()),
			device: Some(device.into()),
			unit: "sectors".into(),
			partitions: vec![
				Partition {
					device: format!("{}p1", device),
					start_sector: 8192,
					size_sectors: 524288,
					type_code: "c".into(),
				},
				Partition {
					device: format!("{}p2", device),
					start_sector: 532480,
					size_sectors: root_size,
					type_code: "83".into(),
				},
			],
		}
	}

	#[test]
	fn test_layout_match() {
		let src = two_part_table("/dev/mmcblk0", 15000000);
		let image = two_part_table("/srv/host.img", 5000000);
		// Differing root size is fine, it comes from an earlier resize.
		assert!(check_layout_match(&src, &image).is_ok());

		let mut moved = image.clone();
		moved.partitions[1].start_sector = 4096;
		assert!(check_layout_match(&src, &moved).is_err());

		let mut fewer = image.clone();
		fewer.partitions.pop();
		assert!(check_layout_match(&src, &fewer).is_err());
	}

	#[test]
	fn test_host_dir_of() {
		assert_eq!(
			host_dir_of(Path::new("/srv/backup/host.img")),
			PathBuf::from("/srv/backup")
		);
		assert_eq!(host_dir_of(Path::new("host.img")), PathBuf::from("."));
	}
}
