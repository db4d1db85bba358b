//! Merging file lists across bundles.
//!
//! Several subscribed bundles can mention the same path.  This folds a
//! combined list down to one authoritative entry per path, under a
//! small decision table:
//!
//!  - both present: keep one, preferring tracked over untracked, then
//!    the older last-change
//!  - both deleted: keep the newer deletion
//!  - one present, one deleted: keep the present one
//!  - both present with differing fingerprints: that's corrupt data;
//!    drop both and report the conflict
//!
//! The output is path-sorted, and running it twice changes nothing.

use super::File;

use crate::util::hash::Fingerprint;


/// A cross-bundle hash disagreement found while consolidating.  The
/// caller turns these into telemetry.
#[derive(Debug, Clone)]
pub(crate) struct HashConflict
{
	pub(crate) path: std::path::PathBuf,
	pub(crate) fp_a: Fingerprint,
	pub(crate) fp_b: Fingerprint,
}


/// Consolidate a combined file list down to one entry per path.
pub(crate) fn consolidate(mut files: Vec<File>)
		-> (Vec<File>, Vec<HashConflict>)
{
	files.sort_by(|a, b| a.path.cmp(&b.path));

	let mut out: Vec<File> = Vec::with_capacity(files.len());
	let mut conflicts = Vec::new();

	// Paths that hit a hash conflict are poisoned; every entry for them
	// is excluded, not just the first clashing pair.
	let mut poisoned: Option<std::path::PathBuf> = None;

	for f in files.into_iter()
	{
		if poisoned.as_deref() == Some(f.path.as_path()) { continue; }

		let prev = match out.last_mut() {
			Some(p) if p.path == f.path => p,
			_ => { out.push(f); continue; },
		};

		match (prev.is_present(), f.is_present())
		{
			(true, true) => {
				if prev.fingerprint != f.fingerprint
				{
					conflicts.push(HashConflict {
						path: f.path.clone(),
						fp_a: prev.fingerprint,
						fp_b: f.fingerprint,
					});
					poisoned = Some(f.path.clone());
					out.pop();
					continue;
				}

				// Same content; pick the "better" record.
				let take = match (f.flags.tracked, prev.flags.tracked) {
					(true, false) => true,
					(false, true) => false,
					_ => f.last_change < prev.last_change,
				};
				if take { *prev = f; }
			},
			(false, false) => {
				// Keep the newer deletion
				if f.last_change > prev.last_change { *prev = f; }
			},
			(true, false) => (),  // present wins; prev stays
			(false, true) => *prev = f,
		}
	}

	(out, conflicts)
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::{FileFlags, FileKind};
	use crate::util::hash::Fingerprint;

	fn mkfile(path: &str, fpbyte: u8, last_change: u32, deleted: bool)
			-> File
	{
		let mut flags = FileFlags { tracked: true, ..Default::default() };
		flags.deleted = deleted;
		let fingerprint = match deleted {
			true  => Fingerprint::zeros(),
			false => Fingerprint::from([fpbyte; 32]),
		};
		File {
			path: path.into(),
			kind: FileKind::Regular,
			flags, fingerprint, last_change,
		}
	}

	#[test]
	fn no_dups()
	{
		let l = vec![
			mkfile("/b", 0xaa, 10, false),
			mkfile("/a", 0xbb, 10, false),
		];
		let (out, conf) = consolidate(l);
		assert!(conf.is_empty());
		assert_eq!(out.len(), 2);
		// And it came out path-sorted
		assert_eq!(out[0].path.to_str().unwrap(), "/a");
		assert_eq!(out[1].path.to_str().unwrap(), "/b");
	}

	#[test]
	fn same_hash_keeps_older()
	{
		let l = vec![
			mkfile("/a", 0xaa, 20, false),
			mkfile("/a", 0xaa, 10, false),
		];
		let (out, conf) = consolidate(l);
		assert!(conf.is_empty());
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].last_change, 10, "older last-change wins");
	}

	#[test]
	fn tracked_beats_untracked()
	{
		let mut unt = mkfile("/a", 0xaa, 10, false);
		unt.flags.tracked = false;
		let tra = mkfile("/a", 0xaa, 20, false);

		let (out, _) = consolidate(vec![unt, tra]);
		assert_eq!(out.len(), 1);
		assert!(out[0].flags.tracked, "tracked wins over older untracked");
	}

	#[test]
	fn both_deleted_keeps_newer()
	{
		let l = vec![
			mkfile("/a", 0, 10, true),
			mkfile("/a", 0, 20, true),
		];
		let (out, _) = consolidate(l);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].last_change, 20, "newer deletion wins");
	}

	#[test]
	fn present_beats_deleted()
	{
		let l = vec![
			mkfile("/a", 0xaa, 10, false),
			mkfile("/a", 0, 20, true),
			mkfile("/b", 0, 20, true),
			mkfile("/b", 0xbb, 10, false),
		];
		let (out, _) = consolidate(l);
		assert_eq!(out.len(), 2);
		assert!(out[0].is_present(), "/a keeps the present entry");
		assert!(out[1].is_present(), "/b keeps the present entry");
	}

	#[test]
	fn hash_conflict_drops_both()
	{
		let l = vec![
			mkfile("/a", 0xaa, 10, false),
			mkfile("/a", 0xbb, 10, false),
			mkfile("/z", 0xcc, 10, false),
		];
		let (out, conf) = consolidate(l);
		assert_eq!(out.len(), 1, "only /z survives");
		assert_eq!(out[0].path.to_str().unwrap(), "/z");
		assert_eq!(conf.len(), 1);
		assert_eq!(conf[0].path.to_str().unwrap(), "/a");
	}

	#[test]
	fn idempotent()
	{
		let l = vec![
			mkfile("/a", 0xaa, 10, false),
			mkfile("/a", 0xaa, 20, false),
			mkfile("/b", 0, 10, true),
			mkfile("/b", 0, 30, true),
			mkfile("/c", 0xcc, 5, false),
		];
		let (once, _) = consolidate(l);
		let (twice, conf) = consolidate(once.clone());
		assert!(conf.is_empty());
		assert_eq!(once, twice, "consolidate(consolidate(l)) == consolidate(l)");
	}
}
