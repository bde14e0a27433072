mod cleanup;
mod cli;
mod context;
mod image;
mod loopback;
mod plan;
mod probe;
mod resize;
mod runner;
mod sync;
mod table;
mod utils;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cmdline, Config};
use context::ImageContext;
use log::{debug, error};
use runner::SystemRunner;

fn main() -> Result<()> {
	ctrlc::set_handler(move || {
		if cleanup::is_armed() {
			eprintln!("\nReceived Ctrl-C, cleaning up.");
			let runner = SystemRunner::new(false);
			if let Err(e) = cleanup::run(&runner) {
				eprintln!("Cleanup failed: {}", e);
			}
		} else {
			eprintln!("\nReceived Ctrl-C, exiting.");
		}
		std::process::exit(1);
	})
	.context("Can not register Ctrl-C (SIGINT) handler.")?;

	// Parse the command line. -V and --help exit here.
	let cmdline = Cmdline::parse();
	if unsafe { utils::geteuid() } != 0 {
		bail!("Please run me as root!");
	}
	let mut logger = colog::basic_builder();
	let level = if cmdline.debug {
		log::LevelFilter::Debug
	} else if cmdline.verbose {
		log::LevelFilter::Info
	} else if cmdline.quiet {
		log::LevelFilter::Error
	} else {
		log::LevelFilter::Warn
	};
	logger.filter(None, level);
	logger.init();
	if cmdline.debug {
		debug!("Debug output enabled.");
	}
	if let Err(e) = try_main(cmdline) {
		// Use logger to pretty-print errors
		let mut str_buf = String::new();
		error!("Error encountered!\n{}", e);
		let mut ident = 0;
		e.chain().skip(1).for_each(|cause| {
			let ident_str = "\t".repeat(ident);
			ident += 1;
			str_buf += &format!("{0}- Caused by:\n{0}  {1}", ident_str, cause);
		});
		if !str_buf.is_empty() {
			error!("{}", str_buf);
		}
		error!("Exiting now.");
		std::process::exit(1);
	}
	Ok(())
}

fn try_main(cmdline: Cmdline) -> Result<()> {
	runner::extend_path();
	let cfg = Config::from_cmdline(cmdline)?;
	let runner = SystemRunner::new(cfg.debug);
	let context = ImageContext {
		cfg: &cfg,
		runner: &runner,
	};
	context.execute()
}
