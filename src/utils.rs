use std::{
	ffi::{c_int, c_void, CString},
	path::Path,
};

use anyhow::{bail, Result};
use libc::{close, open, O_NONBLOCK, O_RDONLY};
use log::debug;

#[link(name = "c")]
extern "C" {
	pub fn geteuid() -> c_int;
	pub fn sync() -> c_void;
	pub fn syncfs(fd: c_int) -> c_int;
}

/// Flush every dirty page in the system. sync(2) itself never fails.
pub fn sync_all() {
	unsafe { sync() };
}

/// Flush the filesystem holding `path` with syncfs(2).
pub fn sync_filesystem(path: &dyn AsRef<Path>) -> Result<()> {
	let path = path.as_ref();
	let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
	let fd = unsafe { open(c_path.as_ptr(), O_RDONLY | O_NONBLOCK) };
	if fd < 0 {
		bail!("Failed to open '{}': {}", path.display(), errno::errno());
	}
	let synced = unsafe { syncfs(fd) };
	// close(2) below may clobber errno; read it first.
	let sync_errno = errno::errno();
	let closed = unsafe { close(fd) };
	debug!("syncfs({}) for '{}' returned {}", fd, path.display(), synced);
	if synced != 0 {
		bail!(
			"Failed to sync the filesystem behind '{}': {}",
			path.display(),
			sync_errno
		);
	}
	if closed != 0 {
		bail!("Failed to close fd {}: {}", fd, errno::errno());
	}
	Ok(())
}
