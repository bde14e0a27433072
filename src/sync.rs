//! Staging-tree mounts and content replication.
//!
//! Each image partition with a live source counterpart is attached and
//! mounted under the staging tree at the same relative path as its source
//! mount point, then rsync carries the content over, root first.

use std::{
	fs::create_dir_all,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::debug;

use crate::{
	cleanup,
	cli::Mode,
	context::{ImageContext, Prepared},
	image::SECTOR_SIZE,
	loopback::LoopManager,
	probe::Probe,
	runner::{CommandRunner, OutputMode},
	table::PartitionTable,
};

/// archive, one-file-system, preserve devices, preserve hard links,
/// partial, numeric ids, delete, force.
const RSYNC_ARGS: &[&str] = &[
	"-a",
	"-x",
	"-D",
	"-H",
	"--partial",
	"--numeric-ids",
	"--delete",
	"--force",
];

/// One image filesystem mounted under the staging tree.
pub(crate) struct StagedMount {
	pub source_mount: String,
	pub staging_path: PathBuf,
	pub is_root: bool,
}

impl ImageContext<'_> {
	pub(crate) fn format_partition(&self, device: &str, fs_type: &str) -> Result<()> {
		let mkfs = format!("mkfs.{}", fs_type);
		self.runner.run_checked(&mkfs, &[device])
	}

	/// Attach, format (create mode) and mount every image partition whose
	/// source counterpart is live, root first, the rest in table order.
	pub(crate) fn stage_partitions(
		&self,
		image_table: &PartitionTable,
		prep: &Prepared,
		root_loop: &str,
	) -> Result<Vec<StagedMount>> {
		let cfg = self.cfg;
		let loops = LoopManager::new(self.runner);
		let probe = Probe::new(self.runner);
		let root_idx = prep.src.root_idx;
		let mut order = vec![root_idx];
		order.extend((0..prep.src.table.partitions.len()).filter(|i| *i != root_idx));

		let mut staged = Vec::new();
		for idx in order {
			let src_part = &prep.src.table.partitions[idx];
			let img_part = &image_table.partitions[idx];
			let is_root = idx == root_idx;
			let (mount_point, fs_type) = if is_root {
				("/".to_string(), prep.src.root_fs.clone())
			} else {
				match probe.mountpoint_for(&src_part.device) {
					Ok(binding) => (binding.mount_point, binding.fs_type),
					Err(_) => {
						debug!("Partition {} is not mounted, skipping.", src_part.device);
						continue;
					}
				}
			};

			let loop_dev = if is_root {
				root_loop.to_string()
			} else {
				let dev = loops.next_free()?;
				loops.attach(
					&dev,
					&cfg.image,
					img_part.start_sector * SECTOR_SIZE,
					Some(img_part.size_sectors * SECTOR_SIZE),
				)?;
				cleanup::push_loop(&dev);
				if cfg.mode == Mode::Create {
					self.info(format!(
						"Formatting image partition {} ({}) ...",
						idx + 1,
						fs_type
					));
					self.format_partition(&dev, &fs_type)?;
				}
				dev
			};

			let dst = if is_root {
				cfg.staging_dir.clone()
			} else {
				cfg.staging_dir.join(mount_point.trim_start_matches('/'))
			};
			create_dir_all(&dst).context(format!(
				"Failed to create the staging mount point '{}'",
				dst.display()
			))?;
			let dst_str = dst.to_string_lossy().to_string();
			debug!("Mounting {} to {}", loop_dev, dst_str);
			self.runner
				.run_checked("mount", &["-t", &fs_type, "--", &loop_dev, &dst_str])?;
			cleanup::push_mount(&dst_str);

			if !cfg.no_autoclear {
				loops.set_autoclear(&loop_dev)?;
				cleanup::mark_autoclear(&loop_dev);
			}

			staged.push(StagedMount {
				source_mount: mount_point,
				staging_path: dst,
				is_root,
			});
		}
		Ok(staged)
	}

	/// Replicate every staged filesystem from its live source.
	pub(crate) fn replicate(&self, staged: &[StagedMount]) -> Result<()> {
		let cfg = self.cfg;
		let image_abs = cfg
			.image
			.canonicalize()
			.unwrap_or_else(|_| cfg.image.clone());
		for mount in staged {
			self.info(format!("Replicating {} ...", mount.source_mount));
			let args = rsync_command(
				mount.is_root,
				cfg.debug,
				&image_abs,
				&cfg.excludes,
				&mount.source_mount,
				&mount.staging_path,
			);
			let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
			let mode = if cfg.debug {
				OutputMode::Stream
			} else {
				OutputMode::Buffer
			};
			self.runner.run_checked_mode("rsync", &arg_refs, mode)?;
		}
		Ok(())
	}

	/// Maintenance mode leaves every resource live; tell the operator how
	/// to release them by hand.
	pub(crate) fn print_maintenance_instructions(&self) {
		let (mounts, loops, host_mount) = cleanup::staged_resources();
		println!("Maintenance mode: the image partitions are left mounted.");
		println!("Release them when done:");
		for mount_point in mounts.iter().rev() {
			println!("  umount {}", mount_point);
		}
		for device in &loops {
			println!("  losetup -d {}", device);
		}
		if let Some(mount_point) = host_mount {
			println!("  umount {}", mount_point);
		}
	}
}

/// Assemble the full rsync argument vector for one filesystem.
fn rsync_command(
	is_root: bool,
	debug: bool,
	image_abs: &Path,
	extra_excludes: &[String],
	source_mount: &str,
	staging_path: &Path,
) -> Vec<String> {
	let mut args: Vec<String> = RSYNC_ARGS.iter().map(|s| s.to_string()).collect();
	if debug {
		args.push("-v".to_string());
	}
	if is_root {
		args.push("--exclude=/tmp".to_string());
		args.push("--exclude=lost+found".to_string());
		args.push(format!("--exclude={}", image_abs.display()));
		for pattern in extra_excludes {
			args.push(format!("--exclude={}", pattern));
		}
	}
	let mut src = source_mount.to_string();
	if !src.ends_with('/') {
		src.push('/');
	}
	let mut dst = staging_path.to_string_lossy().to_string();
	if !dst.ends_with('/') {
		dst.push('/');
	}
	args.push(src);
	args.push(dst);
	args
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_root_rsync_command() {
		let args = rsync_command(
			true,
			false,
			Path::new("/srv/backup/host.img"),
			&["/var/cache".to_string()],
			"/",
			Path::new("/run/mklivebak"),
		);
		assert_eq!(
			args,
			vec![
				"-a",
				"-x",
				"-D",
				"-H",
				"--partial",
				"--numeric-ids",
				"--delete",
				"--force",
				"--exclude=/tmp",
				"--exclude=lost+found",
				"--exclude=/srv/backup/host.img",
				"--exclude=/var/cache",
				"/",
				"/run/mklivebak/",
			]
		);
	}

	#[test]
	fn test_non_root_rsync_command() {
		let args = rsync_command(
			false,
			false,
			Path::new("/srv/backup/host.img"),
			&["/var/cache".to_string()],
			"/boot",
			Path::new("/run/mklivebak/boot"),
		);
		// Non-root filesystems are replicated without the exclusion set.
		assert!(args.iter().all(|a| !a.starts_with("--exclude")));
		assert_eq!(args.last().unwrap(), "/run/mklivebak/boot/");
		assert_eq!(args[args.len() - 2], "/boot/");
	}

	#[test]
	fn test_debug_adds_file_listing() {
		let args = rsync_command(
			true,
			true,
			Path::new("/srv/backup/host.img"),
			&[],
			"/",
			Path::new("/run/mklivebak"),
		);
		assert!(args.contains(&"-v".to_string()));
	}
}
