//! Command line usage.
//!
//! The tool takes exactly one positional argument, the path to the image
//! file, and a set of single-letter flags:
//!
//! ```shell
//! # mklivebak -c -v /srv/backup/host.img     (create a fresh image)
//! # mklivebak -s -r /srv/backup/host.img     (refresh it, resizing root)
//! # mklivebak -s -M -n /srv/backup/host.img  (mount everything and leave it)
//! ```
//!
//! - `-c` / `-s` select create or sync mode; bare `-M` implies `-s`.
//! - `-M` stops after mounting and prints the teardown commands.
//! - `-m` mounts the image's host directory first (fstab entry required).
//! - `-n` suppresses loop autoclear; only meaningful with `-M`.
//! - `-r` resizes the image root partition around a hysteresis band.
//! - `-d` / `-v` / `-q` select the output volume; `-V` prints the version.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use strum::Display;

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
	Create,
	Sync,
}

#[derive(Parser)]
#[command(version, about = "Mirror the running system into a bootable raw image file", long_about = None)]
pub struct Cmdline {
	/// Create a new image. The file must not exist yet.
	#[arg(short = 'c', conflicts_with = "sync")]
	pub create: bool,

	/// Synchronize an existing image with the running system.
	#[arg(short = 's')]
	pub sync: bool,

	/// Maintenance mode: mount the image partitions and exit without
	/// replicating anything.
	#[arg(short = 'M')]
	pub maintenance: bool,

	/// Mount the directory holding the image file first (an fstab entry
	/// for it must exist).
	#[arg(short = 'm')]
	pub premount: bool,

	/// Do not mark loop devices autoclear; they must be detached by hand.
	#[arg(short = 'n', requires = "maintenance")]
	pub no_autoclear: bool,

	/// Grow or shrink the image root partition to track the live usage.
	#[arg(short = 'r')]
	pub resize: bool,

	/// Debug output; also streams the output of external commands.
	#[arg(short = 'd')]
	pub debug: bool,

	/// Verbose output.
	#[arg(short = 'v', conflicts_with = "quiet")]
	pub verbose: bool,

	/// Only report errors.
	#[arg(short = 'q')]
	pub quiet: bool,

	/// Percentage of the image root partition kept free when resizing.
	#[arg(long = "pct-free", value_name = "PCT", default_value_t = 20)]
	pub pct_free: u32,

	/// Where image partitions are staged during the run.
	#[arg(long = "staging-dir", value_name = "DIR", default_value = "/run/mklivebak")]
	pub staging_dir: PathBuf,

	/// Additional rsync exclusion patterns for the root filesystem.
	#[arg(long = "exclude", value_name = "PATTERN")]
	pub excludes: Vec<String>,

	/// Path to the image file. Its directory must already exist.
	pub image: PathBuf,
}

/// The run configuration, built once during validation and passed
/// explicitly everywhere.
#[derive(Clone, Debug)]
pub struct Config {
	pub image: PathBuf,
	pub mode: Mode,
	pub maintenance: bool,
	pub premount: bool,
	pub no_autoclear: bool,
	pub resize: bool,
	pub pct_free: u32,
	pub staging_dir: PathBuf,
	pub excludes: Vec<String>,
	pub debug: bool,
}

impl Config {
	pub fn from_cmdline(cmdline: Cmdline) -> Result<Self> {
		let mode = match (cmdline.create, cmdline.sync) {
			(true, false) => Mode::Create,
			(false, true) => Mode::Sync,
			// Bare -M opens an existing image the way sync does.
			(false, false) if cmdline.maintenance => Mode::Sync,
			_ => bail!("Specify one of -c (create) or -s (sync)."),
		};
		if cmdline.pct_free >= 100 {
			bail!("--pct-free must be below 100.");
		}
		Ok(Self {
			image: cmdline.image,
			mode,
			maintenance: cmdline.maintenance,
			premount: cmdline.premount,
			no_autoclear: cmdline.no_autoclear,
			resize: cmdline.resize,
			pct_free: cmdline.pct_free,
			staging_dir: cmdline.staging_dir,
			excludes: cmdline.excludes,
			debug: cmdline.debug,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> Result<Config> {
		let mut argv = vec!["mklivebak"];
		argv.extend_from_slice(args);
		let cmdline = Cmdline::try_parse_from(argv)?;
		Config::from_cmdline(cmdline)
	}

	#[test]
	fn test_mode_selection() -> Result<()> {
		assert_eq!(parse(&["-c", "/tmp/a.img"])?.mode, Mode::Create);
		assert_eq!(parse(&["-s", "/tmp/a.img"])?.mode, Mode::Sync);
		assert!(parse(&["/tmp/a.img"]).is_err());
		assert!(parse(&["-c", "-s", "/tmp/a.img"]).is_err());
		// Bare maintenance mode opens the image like sync.
		let cfg = parse(&["-M", "-n", "/tmp/a.img"])?;
		assert_eq!(cfg.mode, Mode::Sync);
		assert!(cfg.maintenance && cfg.no_autoclear);
		Ok(())
	}

	#[test]
	fn test_flag_constraints() {
		// -n without -M
		assert!(parse(&["-s", "-n", "/tmp/a.img"]).is_err());
		assert!(parse(&["-s", "-M", "-n", "/tmp/a.img"]).is_ok());
		// -v and -q are mutually exclusive
		assert!(parse(&["-s", "-v", "-q", "/tmp/a.img"]).is_err());
	}

	#[test]
	fn test_tunables() -> Result<()> {
		let cfg = parse(&[
			"-s",
			"-r",
			"--pct-free",
			"30",
			"--exclude",
			"/var/cache",
			"--exclude",
			"/srv/scratch",
			"/tmp/a.img",
		])?;
		assert_eq!(cfg.pct_free, 30);
		assert_eq!(cfg.excludes, vec!["/var/cache", "/srv/scratch"]);
		assert!(parse(&["-s", "--pct-free", "100", "/tmp/a.img"]).is_err());
		Ok(())
	}
}
