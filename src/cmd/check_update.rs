//! #0 check-update
use crate::command::{CmdArg, CmdErr, ExitStatus};
use crate::server::version as sv;

use super::common;


pub(crate) fn run(carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	let cfg = &carg.config;

	// Read-only: no lock wanted, and no cache mutation beyond what a
	// pointer fetch needs (which is none).
	let sess = common::open_session(cfg, false)?;

	if cfg.timecheck
	{
		sv::verify_time(cfg.path())?;
	}

	let current = crate::info::version::current(cfg.path())?;
	println!("Current OS version: {current}");

	let latest = sv::latest(&sess.http, cfg.version_url()?, cfg.format,
			&cfg.cert(), cfg.nosigcheck)?;
	println!("Latest server version: {latest}");

	if latest > current
	{
		println!("There is a new OS version available: {latest}");
		return Ok(ExitStatus::Ok);
	}

	println!("There are no updates available");
	Ok(ExitStatus::Nothing)
}
