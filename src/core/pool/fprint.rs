//! Fingerprint checking pool.
//!
//! The diagnose walker has to fingerprint potentially every installed
//! file, which is the single most CPU-hungry thing we do.  So it gets
//! farmed out here.
use std::path::PathBuf;

use crate::util::hash::{self, Fingerprint};

use indicatif::ProgressBar;


/// An impl of the threadpool for fingerprint checking
#[derive(Debug)]
pub(crate) struct FprintCheck
{
	/// We'll kick a progress bar
	pb: ProgressBar,

	/// Paths whose on-disk content didn't match (or couldn't be read,
	/// which needs the same fixing)
	bad: Vec<PathBuf>,
}

impl FprintCheck
{
	pub(crate) fn new(pblen: usize) -> Self
	{
		Self {
			pb: ProgressBar::new(pblen.try_into().unwrap()),
			bad: Vec::new(),
		}
	}
}


/// The final cumulative result: the relative paths needing repair.
#[derive(Debug)]
pub(crate) struct PoolResult
{
	pub(crate) bad: Vec<PathBuf>,
}


/// No shared control needed; every request is self-contained.
#[derive(Debug, Clone)]
pub(crate) struct Control {}

/// A single work request
#[derive(Debug)]
pub(crate) struct Req
{
	/// The on-disk path to fingerprint
	pub(crate) target: PathBuf,

	/// The manifest-relative path, for reporting
	pub(crate) rel: PathBuf,

	/// What the manifest says it should be
	pub(crate) expect: Fingerprint,
}

/// The result of a single check
#[derive(Debug)]
pub(crate) struct Res
{
	pub(crate) rel: PathBuf,
	pub(crate) matches: bool,
}

/// An unreadable path; counts as a mismatch for repair purposes.
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("Couldn't fingerprint {rel}: {err}")]
pub(crate) struct CheckErr
{
	pub(crate) rel: PathBuf,
	pub(crate) err: hash::HashErr,
}


/// Now connect all those bits in
impl crate::core::pool::Pool for FprintCheck
{
	type Control = Control;
	type UnitControl = Control;

	fn mk_unitcontrol(c: &Control) -> Control { c.clone() }

	type PoolResult = PoolResult;

	type WorkRequest = Req;
	type WorkResult  = Res;
	type WorkErr     = CheckErr;
	fn work(_ctrl: &Control, req: Req) -> Result<Res, CheckErr>
	{
		let Req { target, rel, expect } = req;

		let got = hash::compute(&target, true)
				.map_err(|err| CheckErr { rel: rel.clone(), err })?;

		Ok(Res { rel, matches: got == expect })
	}


	// This is a CPU job
	fn nthreads(&self) -> u32 { super::jobs_cpu() }


	fn work_result(&mut self, resp: Result<Res, CheckErr>)
	{
		self.pb.inc(1);

		match resp
		{
			Ok(r) => {
				if !r.matches { self.bad.push(r.rel); }
			},
			Err(e) => self.bad.push(e.rel),
		}
	}


	fn finalize(self) -> PoolResult
	{
		let FprintCheck { pb, mut bad } = self;
		pb.finish();
		bad.sort();
		PoolResult { bad }
	}
}
