//! Textual partition-table codec.
//!
//! Reads and writes the canonical dump format of sfdisk(8): a block of
//! `key: value` header lines, a blank line, then one line per partition of
//! the form `DEV : start=N, size=N, type=T`.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::runner::CommandRunner;

/// One partition entry. Sizes are 512-byte sectors; `type_code` is an
/// opaque token (hex for dos labels, a GUID for gpt) kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
	pub device: String,
	pub start_sector: u64,
	pub size_sectors: u64,
	pub type_code: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
	pub label: String,
	pub label_id: Option<String>,
	pub device: Option<String>,
	pub unit: String,
	pub partitions: Vec<Partition>,
}

impl PartitionTable {
	/// Parse a partition-table dump.
	///
	/// Unknown header keys are ignored. Partitions with a zero size or a
	/// type of `"0"` are dropped. The dump must use the sector unit.
	pub fn parse(text: &str) -> Result<Self> {
		let mut label = None;
		let mut label_id = None;
		let mut device = None;
		let mut unit = None;
		let mut partitions = Vec::new();

		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() {
				continue;
			}
			let (key, value) = line
				.split_once(':')
				.context(format!("Malformed dump line '{}'", line))?;
			let key = key.trim();
			let value = value.trim();
			if value.contains("start=") || value.contains("size=") {
				if let Some(partition) = parse_partition_line(key, value)? {
					partitions.push(partition);
				}
				continue;
			}
			match key {
				"label" => label = Some(value.to_string()),
				"label-id" => label_id = Some(value.to_string()),
				"device" => device = Some(value.to_string()),
				"unit" => unit = Some(value.to_string()),
				// first-lba, last-lba, sector-size and friends.
				_ => (),
			}
		}

		let label = label.context("Dump carries no 'label' header")?;
		if label != "dos" && label != "gpt" {
			bail!("Unsupported partition table label '{}'", label);
		}
		let unit = unit.context("Dump carries no 'unit' header")?;
		if unit != "sectors" {
			bail!("Unsupported dump unit '{}' (only 'sectors' is handled)", unit);
		}
		Ok(Self {
			label,
			label_id,
			device,
			unit,
			partitions,
		})
	}

	/// Emit the dump in the canonical form: the four preserved header keys
	/// in order, a blank line, then right-aligned partition rows.
	pub fn emit(&self) -> String {
		let mut out = String::new();
		out += &format!("label: {}\n", self.label);
		if let Some(id) = &self.label_id {
			out += &format!("label-id: {}\n", id);
		}
		if let Some(dev) = &self.device {
			out += &format!("device: {}\n", dev);
		}
		out += &format!("unit: {}\n\n", self.unit);
		for partition in &self.partitions {
			out += &format!(
				"{} : start={:>12}, size={:>12}, type={}\n",
				partition.device,
				partition.start_sector,
				partition.size_sectors,
				partition.type_code
			);
		}
		out
	}

	/// A copy of this table sized for the image file at `image`: the device
	/// header and every partition node are renamed to the image path so the
	/// emitted dump is self-consistent when fed back to the partitioner.
	pub fn retarget(&self, image: &dyn AsRef<Path>) -> Self {
		let image = image.as_ref().to_string_lossy();
		let mut table = self.clone();
		table.device = Some(image.to_string());
		for (idx, partition) in table.partitions.iter_mut().enumerate() {
			partition.device = format!("{}p{}", image, idx + 1);
		}
		table
	}

	/// A copy with the root (second) partition resized to `new_sectors`.
	///
	/// Resizing is only supported for the boot-then-root two-partition
	/// layout, so any other shape is an error.
	pub fn resize_root(&self, new_sectors: u64) -> Result<Self> {
		if self.partitions.len() != 2 {
			bail!(
				"Resizing requires exactly two partitions, found {}",
				self.partitions.len()
			);
		}
		let mut table = self.clone();
		table.partitions[1].size_sectors = new_sectors;
		Ok(table)
	}

	/// Sector count the backing file needs to hold every partition.
	pub fn total_sectors(&self) -> Result<u64> {
		let last = self
			.partitions
			.last()
			.context("Partition table is empty")?;
		Ok(last.start_sector + last.size_sectors)
	}

	pub fn root(&self) -> Result<&Partition> {
		self.partitions
			.get(1)
			.context("Partition table has no root partition")
	}
}

fn parse_partition_line(device: &str, fields: &str) -> Result<Option<Partition>> {
	let mut start = None;
	let mut size = None;
	let mut type_code = None;
	for field in fields.split(',') {
		let field = field.trim();
		let Some((key, value)) = field.split_once('=') else {
			// Bare flags such as "bootable".
			continue;
		};
		let value = value.trim();
		match key.trim() {
			"start" => {
				start = Some(value.parse::<u64>().context(format!(
					"Bad start sector '{}' for {}",
					value, device
				))?)
			}
			"size" => {
				size = Some(value.parse::<u64>().context(format!(
					"Bad partition size '{}' for {}",
					value, device
				))?)
			}
			"type" => type_code = Some(value.to_string()),
			_ => (),
		}
	}
	let start = start.context(format!("Partition {} has no start", device))?;
	let size = size.context(format!("Partition {} has no size", device))?;
	let type_code = type_code.context(format!("Partition {} has no type", device))?;
	// Empty slots in a dos table show up as size 0, type 0.
	if size == 0 || type_code == "0" {
		return Ok(None);
	}
	Ok(Some(Partition {
		device: device.to_string(),
		start_sector: start,
		size_sectors: size,
		type_code,
	}))
}

/// Read the partition table of a device or image file.
pub fn read_table(runner: &dyn CommandRunner, path: &dyn AsRef<Path>) -> Result<PartitionTable> {
	let path = path.as_ref();
	let path_str = path.to_string_lossy();
	let output = runner.read_output("sfdisk", &["--dump", "--", &path_str])?;
	PartitionTable::parse(&output)
		.context(format!("Unable to parse the partition table of '{}'", path.display()))
}

/// Write `table` to the allocated image or device at `path`.
pub fn write_table(
	runner: &dyn CommandRunner,
	path: &dyn AsRef<Path>,
	table: &PartitionTable,
) -> Result<()> {
	let path = path.as_ref();
	let path_str = path.to_string_lossy();
	let dump = table.emit();
	runner
		.run_with_input("sfdisk", &["--quiet", "--", &path_str], &dump)
		.context(format!(
			"Failed to write the partition table to '{}'",
			path.display()
		))
}
