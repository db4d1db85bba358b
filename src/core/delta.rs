//! Turning binary deltas into staged files.
//!
//! A delta takes the installed copy of a file ("from") and produces the
//! new version ("to") without shipping the whole thing.  Deltas are
//! purely an optimization: any failure here just means the caller
//! fetches the fullfile instead.  Correctness never rides on one.
use std::path::{Path, PathBuf};

use crate::util::{bspatch, hash, xattrs};
use crate::util::hash::Fingerprint;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum DeltaErr
{
	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("Patched result didn't reproduce the fingerprint: {0}")]
	Mismatch(hash::HashErr),
}


/// Apply a delta: patch `from` (a file on the installed system) into
/// staged/<to_fp>, carrying xattrs across, and verify the result.  On
/// any failure the partial output is gone and the caller falls back to
/// a fullfile.
pub(crate) fn apply(from: &Path, patchfile: &Path, staged_dir: &Path,
		to_fp: &Fingerprint) -> Result<PathBuf, DeltaErr>
{
	let fpb = to_fp.to_buf();
	let out = staged_dir.join(fpb.as_ref());
	let tmp = staged_dir.join(format!(".delta.{fpb}"));

	let res = apply_inner(from, patchfile, &tmp, &out, to_fp);
	if res.is_err() { let _ = std::fs::remove_file(&tmp); }
	res
}

fn apply_inner(from: &Path, patchfile: &Path, tmp: &Path, out: &Path,
		to_fp: &Fingerprint) -> Result<PathBuf, DeltaErr>
{
	bspatch::patch(from, tmp, patchfile)?;

	// The fingerprint covers mode and xattrs, so those have to come
	// across before we can verify anything.
	let md = std::fs::metadata(from)?;
	std::fs::set_permissions(tmp, md.permissions())?;
	xattrs::copy(from, tmp)?;

	hash::check(tmp, to_fp, true).map_err(DeltaErr::Mismatch)?;

	std::fs::rename(tmp, out)?;
	Ok(out.to_path_buf())
}
