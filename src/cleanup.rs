//! Guaranteed teardown of kernel resources.
//!
//! Mounts and loop devices acquired during a run are pushed onto a
//! process-global stack and released in LIFO order on every exit path:
//! normal completion, any error after the stack is armed, and Ctrl-C.

use core::time;
use std::{sync::Mutex, thread};

use anyhow::Result;
use log::{debug, warn};

use crate::{
	loopback::LoopManager,
	runner::CommandRunner,
	utils::sync_all,
};

struct LoopEntry {
	device: String,
	autoclear: bool,
}

struct CleanupState {
	armed: bool,
	mounts: Vec<String>,
	loops: Vec<LoopEntry>,
	host_mount: Option<String>,
}

static STATE: Mutex<CleanupState> = Mutex::new(CleanupState {
	armed: false,
	mounts: Vec::new(),
	loops: Vec::new(),
	host_mount: None,
});

/// Arm the stack. Must happen before the first loop attach.
pub fn arm() {
	STATE.lock().unwrap().armed = true;
}

/// Disarm and forget everything (maintenance mode leaves resources live).
pub fn disarm() {
	let mut state = STATE.lock().unwrap();
	state.armed = false;
	state.mounts.clear();
	state.loops.clear();
	state.host_mount = None;
}

pub fn is_armed() -> bool {
	STATE.lock().unwrap().armed
}

/// Remember the image host directory mounted with `-m`; it is unmounted
/// last.
pub fn register_host_mount(mount_point: &str) {
	STATE.lock().unwrap().host_mount = Some(mount_point.to_string());
}

pub fn push_mount(mount_point: &str) {
	STATE.lock().unwrap().mounts.push(mount_point.to_string());
}

pub fn push_loop(device: &str) {
	STATE.lock().unwrap().loops.push(LoopEntry {
		device: device.to_string(),
		autoclear: false,
	});
}

/// Record that the kernel will release this loop device when its last
/// mount drops, so teardown must not detach it again.
pub fn mark_autoclear(device: &str) {
	let mut state = STATE.lock().unwrap();
	for entry in state.loops.iter_mut() {
		if entry.device == device {
			entry.autoclear = true;
		}
	}
}

/// Forget a mount that was already released out of band (the shrink
/// executor's re-measure mount).
pub fn pop_mount(mount_point: &str) {
	let mut state = STATE.lock().unwrap();
	if let Some(pos) = state.mounts.iter().rposition(|m| m == mount_point) {
		state.mounts.remove(pos);
	}
}

/// The staged mounts (mount order), still-attached non-autoclear loop
/// devices, and the host mount, for the maintenance-mode printout.
pub fn staged_resources() -> (Vec<String>, Vec<String>, Option<String>) {
	let state = STATE.lock().unwrap();
	let mounts = state.mounts.clone();
	let loops = state
		.loops
		.iter()
		.filter(|l| !l.autoclear)
		.map(|l| l.device.clone())
		.collect();
	(mounts, loops, state.host_mount.clone())
}

/// Tear everything down in LIFO order. A failed step is reported and the
/// remaining steps still run; the first failure is returned at the end.
pub fn run(runner: &dyn CommandRunner) -> Result<()> {
	let (mounts, loops, host_mount) = {
		let mut state = STATE.lock().unwrap();
		if !state.armed {
			return Ok(());
		}
		state.armed = false;
		(
			std::mem::take(&mut state.mounts),
			std::mem::take(&mut state.loops),
			state.host_mount.take(),
		)
	};
	let mut first_err = None;

	sync_all();
	for mount_point in mounts.iter().rev() {
		debug!("Unmounting {} ...", mount_point);
		if let Err(e) = runner.run_checked("umount", &["--", mount_point]) {
			warn!("Failed to unmount {}: {}", mount_point, e);
			first_err.get_or_insert(e);
			continue;
		}
		thread::sleep(time::Duration::from_millis(100));
	}
	let loop_manager = LoopManager::new(runner);
	for entry in loops.iter().rev() {
		if entry.autoclear {
			// The final umount above already released it.
			continue;
		}
		if let Err(e) = loop_manager.detach(&entry.device) {
			warn!("Failed to detach {}: {}", entry.device, e);
			first_err.get_or_insert(e);
		}
	}
	if let Some(mount_point) = host_mount {
		debug!("Unmounting image host directory {} ...", mount_point);
		if let Err(e) = runner.run_checked("umount", &["--", &mount_point]) {
			warn!("Failed to unmount {}: {}", mount_point, e);
			first_err.get_or_insert(e);
		}
	}
	match first_err {
		Some(e) => Err(e),
		None => Ok(()),
	}
}
