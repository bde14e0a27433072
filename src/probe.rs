//! Queries against the live system: mount table, filesystem usage and the
//! parent disk of a partition device.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::runner::CommandRunner;

/// Filesystem types skipped when scanning the mount table.
pub const IGNORED_FS: &[&str] = &["autofs"];
/// Network filesystem types. The image may reside on one of these.
pub const NETWORK_FS: &[&str] = &["nfs", "nfs3", "nfs4", "smb"];
/// Filesystem types the resize executor can handle.
pub const RESIZABLE_FS: &[&str] = &["ext2", "ext3", "ext4"];

/// One live mount: which device carries which mount point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountBinding {
	pub device: String,
	pub mount_point: String,
	pub fs_type: String,
}

/// Usage of one mounted filesystem, in 512-byte sectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsUsage {
	pub mount_point: String,
	pub total_sectors: u64,
	pub used_sectors: u64,
}

pub struct Probe<'a> {
	runner: &'a dyn CommandRunner,
}

impl<'a> Probe<'a> {
	pub fn new(runner: &'a dyn CommandRunner) -> Self {
		Self { runner }
	}

	/// The current mount table, with ignored filesystem types dropped.
	pub fn mount_table(&self) -> Result<Vec<MountBinding>> {
		let output = self.runner.read_output("mount", &[])?;
		Ok(parse_mount_table(&output))
	}

	/// The device and filesystem type mounted exactly at `mount_point`.
	///
	/// The mount table is scanned front to back and the last match wins,
	/// matching the kernel's view of overmounts.
	pub fn fs_of(&self, mount_point: &str) -> Result<MountBinding> {
		self.mount_table()?
			.into_iter()
			.filter(|m| m.mount_point == mount_point)
			.next_back()
			.ok_or_else(|| anyhow!("Nothing is mounted at '{}'", mount_point))
	}

	/// Reverse of [`fs_of`](Self::fs_of): the mount carrying `device`.
	pub fn mountpoint_for(&self, device: &str) -> Result<MountBinding> {
		self.mount_table()?
			.into_iter()
			.filter(|m| m.device == device)
			.next_back()
			.ok_or_else(|| anyhow!("Device '{}' is not mounted", device))
	}

	/// Mount point and usage of the filesystem carrying `path`.
	pub fn mount_of(&self, path: &dyn AsRef<Path>) -> Result<FsUsage> {
		let path = path.as_ref();
		let path_str = path.to_string_lossy();
		let output = self.runner.read_output("df", &["-k", "--", &path_str])?;
		parse_df_output(&output)
			.context(format!("Unable to parse df output for '{}'", path.display()))
	}

	/// Resolve the whole-disk node for a partition device.
	pub fn parent_disk(&self, device: &str) -> Result<PathBuf> {
		let output = self
			.runner
			.read_output("lsblk", &["-no", "pkname", "--", device])?;
		let name = output.trim();
		if name.is_empty() {
			bail!("Device '{}' has no parent disk", device);
		}
		// lsblk may list holders of every sub-device; the first line is
		// the immediate parent.
		let name = name.lines().next().unwrap_or(name).trim();
		let disk = Path::new("/dev").join(name);
		debug!("Parent disk of {} is {}", device, disk.display());
		Ok(disk)
	}
}

/// Parse the output of mount(8) without arguments.
///
/// Lines have the form `DEV on MP type FS (options)`. Entries with an
/// ignored filesystem type are dropped; everything else is kept in table
/// order.
pub fn parse_mount_table(output: &str) -> Vec<MountBinding> {
	let mut bindings = Vec::new();
	for line in output.lines() {
		let Some((device, rest)) = line.split_once(" on ") else {
			continue;
		};
		// Split from the right: the mount point may contain " type ".
		let Some((mount_point, rest)) = rest.rsplit_once(" type ") else {
			continue;
		};
		let Some(fs_type) = rest.split_whitespace().next() else {
			continue;
		};
		if IGNORED_FS.contains(&fs_type) {
			continue;
		}
		bindings.push(MountBinding {
			device: device.to_string(),
			mount_point: mount_point.to_string(),
			fs_type: fs_type.to_string(),
		});
	}
	bindings
}

/// Parse `df -k` output into sector counts (1 KiB block = 2 sectors).
fn parse_df_output(output: &str) -> Result<FsUsage> {
	let mut lines = output.lines();
	lines.next().context("df printed no header")?;
	// df wraps long device names onto their own line; flatten the rest.
	let body = lines.collect::<Vec<_>>().join(" ");
	let fields: Vec<&str> = body.split_whitespace().collect();
	if fields.len() < 6 {
		bail!("df printed a truncated entry");
	}
	let total_kib: u64 = fields[1]
		.parse()
		.context("Unable to parse the total block count")?;
	let used_kib: u64 = fields[2]
		.parse()
		.context("Unable to parse the used block count")?;
	let mount_point = fields[5..].join(" ");
	Ok(FsUsage {
		mount_point,
		total_sectors: total_kib * 2,
		used_sectors: used_kib * 2,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const MOUNT_OUTPUT: &str = "\
/dev/mmcblk0p2 on / type ext4 (rw,noatime)
devtmpfs on /dev type devtmpfs (rw,nosuid)
/dev/mmcblk0p1 on /boot type vfat (rw,relatime)
systemd-1 on /srv/backup type autofs (rw,relatime)
fileserver:/export on /srv/backup type nfs4 (rw,relatime)
";

	#[test]
	fn test_parse_mount_table() {
		let table = parse_mount_table(MOUNT_OUTPUT);
		assert_eq!(table.len(), 4);
		assert_eq!(
			table[0],
			MountBinding {
				device: "/dev/mmcblk0p2".into(),
				mount_point: "/".into(),
				fs_type: "ext4".into(),
			}
		);
		// The autofs placeholder is ignored, the nfs4 mount survives.
		assert_eq!(table[3].fs_type, "nfs4");
		assert_eq!(table[3].mount_point, "/srv/backup");
	}

	#[test]
	fn test_last_match_wins() {
		let output = "\
/dev/sda1 on /mnt type ext4 (rw)
/dev/sdb1 on /mnt type ext2 (rw)
";
		let table = parse_mount_table(output);
		let last = table
			.iter()
			.filter(|m| m.mount_point == "/mnt")
			.next_back()
			.unwrap();
		assert_eq!(last.device, "/dev/sdb1");
	}

	#[test]
	fn test_parse_df_output() {
		let output = "\
Filesystem     1K-blocks    Used Available Use% Mounted on
/dev/mmcblk0p2  15349632 2061728  12629152  15% /
";
		let usage = parse_df_output(output).unwrap();
		assert_eq!(usage.mount_point, "/");
		assert_eq!(usage.total_sectors, 15349632 * 2);
		assert_eq!(usage.used_sectors, 2061728 * 2);
	}

	#[test]
	fn test_parse_df_wrapped_device() {
		let output = "\
Filesystem     1K-blocks    Used Available Use% Mounted on
fileserver.example.com:/export/backup
                20971520 1048576  19922944   5% /srv/backup
";
		let usage = parse_df_output(output).unwrap();
		assert_eq!(usage.mount_point, "/srv/backup");
		assert_eq!(usage.total_sectors, 20971520 * 2);
	}

	#[test]
	fn test_parse_df_garbage() {
		assert!(parse_df_output("Filesystem\n").is_err());
		assert!(parse_df_output("").is_err());
	}
}
