//! External command execution.
//!
//! Every external program this tool touches goes through the
//! [`CommandRunner`] trait, so the orchestrator can be exercised against a
//! scripted tool matrix instead of a live system.

use std::{
	env,
	io::Write,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use log::debug;

/// Administrative directories appended to PATH before tool lookup.
const ADMIN_PATH_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// How child output is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputMode {
	/// Emit child output live to the user's terminal; nothing is captured.
	Stream,
	/// Capture combined stdout and stderr silently.
	Buffer,
}

/// Exit code and captured output of a finished child.
#[derive(Clone, Debug)]
pub struct CmdResult {
	pub code: i32,
	pub output: String,
}

impl CmdResult {
	pub fn success(&self) -> bool {
		self.code == 0
	}
}

pub trait CommandRunner {
	/// Run `program` with `args`, optionally feeding `input` on stdin.
	///
	/// A child that cannot be spawned is an error; a child that exits
	/// non-zero is a normal [`CmdResult`] the caller must judge.
	fn run(
		&self,
		program: &str,
		args: &[&str],
		input: Option<&str>,
		mode: OutputMode,
	) -> Result<CmdResult>;

	/// Run buffered and fail with the captured output on a non-zero exit.
	fn run_checked(&self, program: &str, args: &[&str]) -> Result<()> {
		let result = self.run(program, args, None, OutputMode::Buffer)?;
		check_result(program, args, &result)
	}

	/// Like [`run_checked`](Self::run_checked), but with the given output mode.
	fn run_checked_mode(&self, program: &str, args: &[&str], mode: OutputMode) -> Result<()> {
		let result = self.run(program, args, None, mode)?;
		check_result(program, args, &result)
	}

	/// Run buffered, check the exit code, return the captured output.
	fn read_output(&self, program: &str, args: &[&str]) -> Result<String> {
		let result = self.run(program, args, None, OutputMode::Buffer)?;
		check_result(program, args, &result)?;
		Ok(result.output)
	}

	/// Run buffered with `input` fed on stdin and check the exit code.
	fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<()> {
		let result = self.run(program, args, Some(input), OutputMode::Buffer)?;
		check_result(program, args, &result)
	}

	/// Whether the named tool can be invoked. Scripted runners answer for
	/// their whole matrix.
	fn tool_exists(&self, name: &str) -> bool {
		find_tool(name).is_some()
	}
}

fn check_result(program: &str, args: &[&str], result: &CmdResult) -> Result<()> {
	if result.success() {
		return Ok(());
	}
	let mut msg = format!(
		"Command '{} {}' failed with exit code {}.",
		program,
		args.join(" "),
		result.code
	);
	if !result.output.is_empty() {
		msg += &format!("\nCaptured output:\n{}", result.output.trim_end());
	}
	Err(anyhow!(msg))
}

/// Runs commands on the live system.
pub struct SystemRunner {
	debug: bool,
}

impl SystemRunner {
	pub fn new(debug: bool) -> Self {
		Self { debug }
	}
}

impl CommandRunner for SystemRunner {
	fn run(
		&self,
		program: &str,
		args: &[&str],
		input: Option<&str>,
		mode: OutputMode,
	) -> Result<CmdResult> {
		debug!("Running command: {} {}", program, args.join(" "));
		let mut command = Command::new(program);
		command.args(args);
		match mode {
			OutputMode::Stream => {
				command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
			}
			OutputMode::Buffer => {
				command.stdout(Stdio::piped()).stderr(Stdio::piped());
			}
		}
		if input.is_some() {
			command.stdin(Stdio::piped());
		} else {
			command.stdin(Stdio::null());
		}
		let mut child = command
			.spawn()
			.context(format!("Failed to spawn '{}'", program))?;
		if let Some(text) = input {
			let stdin = child
				.stdin
				.as_mut()
				.context(format!("Failed to open stdin of '{}'", program))?;
			stdin.write_all(text.as_bytes())?;
		}
		// Dropping the handle closes the child's stdin.
		drop(child.stdin.take());
		let out = child
			.wait_with_output()
			.context(format!("Failed to wait for '{}'", program))?;
		let mut output = String::from_utf8_lossy(&out.stdout).to_string();
		output += &String::from_utf8_lossy(&out.stderr);
		// A child killed by a signal carries no exit code.
		let code = out.status.code().unwrap_or(-1);
		if self.debug && !output.is_empty() {
			debug!("Output of '{}':\n{}", program, output.trim_end());
		}
		Ok(CmdResult { code, output })
	}
}

/// Append the standard administrative directories to PATH.
pub fn extend_path() {
	let path = env::var("PATH").unwrap_or_default();
	let mut dirs: Vec<&str> = path.split(':').filter(|d| !d.is_empty()).collect();
	for dir in ADMIN_PATH_DIRS {
		if !dirs.contains(dir) {
			dirs.push(dir);
		}
	}
	env::set_var("PATH", dirs.join(":"));
}

/// Look a tool up in PATH.
pub fn find_tool(name: &str) -> Option<PathBuf> {
	let path = env::var("PATH").ok()?;
	for dir in path.split(':').filter(|d| !d.is_empty()) {
		let candidate = Path::new(dir).join(name);
		if let Ok(meta) = candidate.metadata() {
			if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
				return Some(candidate);
			}
		}
	}
	None
}
