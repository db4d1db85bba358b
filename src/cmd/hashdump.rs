//! #0 hashdump
//!
//! Print the fingerprint of a path on disk, the same way every
//! verification in the pipeline computes it.  Mostly a debugging and
//! server-side-development aid.
use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::util::hash;
use crate::util::path_join;


pub(crate) fn run(carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	let args = match &carg.clargs.command {
		UpdCmds::HashDump(a) => a,
		_ => unreachable!("I'm a hashdump, why does it think I'm not??"),
	};

	let target = match &args.path {
		Some(prefix) => path_join(prefix, &args.target),
		None => args.target.clone(),
	};

	let fp = hash::compute(&target, true)
			.map_err(|e| CmdErr::Other(anyhow::anyhow!(
					"Couldn't fingerprint {}: {e}", target.display())))?;

	println!("{}", fp.to_buf());
	Ok(ExitStatus::Ok)
}
