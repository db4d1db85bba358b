//! Walking an installed tree against a manifest set.
//!
//! Diagnose answers "how far has this tree drifted from what the
//! manifests say", in four passes: missing files, content mismatches,
//! orphaned deletions still on disk, and (in picky mode) files on disk
//! that no manifest claims at all.  Repair is the same walk with fix
//! turned on, feeding problems through the content pipeline and the
//! staging engine.
//!
//! The two removal passes only run when every earlier repair
//! succeeded; deleting things off a tree we just failed to finish
//! repairing is how you turn one problem into two.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex_lite::Regex;

use crate::core::pool::{fetch, fprint};
use crate::core::staging::{self, InstallCtx};
use crate::manifest::File;
use crate::util::hash;
use crate::util::path_join;


/// What a walk should do, beyond looking.
#[derive(Debug, Clone)]
pub(crate) struct Policy
{
	/// Repair what's found
	pub(crate) fix: bool,

	/// Also hunt files nothing claims
	pub(crate) picky: bool,

	/// Existence checks only; skip content fingerprinting
	pub(crate) quick: bool,

	/// ONLY hunt unclaimed files
	pub(crate) extra_files_only: bool,

	/// Paths matching this are never "extra"
	pub(crate) whitelist: Regex,

	/// Where the extra-files hunt happens
	pub(crate) picky_root: PathBuf,
}

impl Default for Policy
{
	fn default() -> Self
	{
		Self {
			fix: false,
			picky: false,
			quick: false,
			extra_files_only: false,
			whitelist: default_whitelist(),
			picky_root: "/usr".into(),
		}
	}
}

/// The default picky whitelist: kernel bits and trees that belong to
/// the admin.
pub(crate) fn default_whitelist() -> Regex
{
	Regex::new(r"^(/usr/lib/modules|/usr/lib/kernel|/usr/local|/usr/src)")
			.expect("builtin regex parses")
}


/// Per-file totals out of a walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Counts
{
	pub(crate) checked: u64,
	pub(crate) missing: u64,
	pub(crate) mismatch: u64,
	pub(crate) extraneous: u64,
	pub(crate) replaced: u64,
	pub(crate) not_replaced: u64,
	pub(crate) fixed: u64,
	pub(crate) not_fixed: u64,
	pub(crate) deleted: u64,
	pub(crate) not_deleted: u64,
}

impl Counts
{
	/// Did the walk see any drift at all?
	pub(crate) fn problems(&self) -> u64
	{
		self.missing + self.mismatch + self.extraneous
	}

	/// Did fixing leave anything unfixed?
	pub(crate) fn failures(&self) -> u64
	{
		self.not_replaced + self.not_fixed + self.not_deleted
	}
}


/// What the walker needs from the outside world to fix things: where
/// content comes from.
pub(crate) struct FixCtx<'a>
{
	pub(crate) fetch_ctrl: &'a fetch::Control,
}


/// Run the walk.  `set` is the consolidated authoritative file list,
/// heuristics already applied.
pub(crate) fn walk(set: &[File], root: &Path, policy: &Policy,
		install: &InstallCtx, fixctx: Option<&FixCtx>) -> Counts
{
	let mut counts = Counts::default();

	if !policy.extra_files_only
	{
		missing_pass(set, root, policy, install, fixctx, &mut counts);

		if !policy.quick
		{
			mismatch_pass(set, root, policy, install, fixctx, &mut counts);
		}

		// The removal passes don't run over a tree we couldn't fully
		// repair.
		if counts.failures() > 0 { return counts; }

		orphan_pass(set, root, policy, &mut counts);
	}

	if policy.picky || policy.extra_files_only
	{
		if counts.failures() == 0
		{
			extra_files_pass(set, root, policy, &mut counts);
		}
	}

	counts
}


/// Pass 1: every present, installable entry should exist on disk.
fn missing_pass(set: &[File], root: &Path, policy: &Policy,
		install: &InstallCtx, fixctx: Option<&FixCtx>, counts: &mut Counts)
{
	let mut missing: Vec<&File> = Vec::new();

	for f in set
	{
		if f.flags.deleted || f.skip() { continue; }
		counts.checked += 1;

		let target = path_join(root, &f.path);
		if hash::compute_lazy(&target).is_zeros()
		{
			counts.missing += 1;
			println!("  Missing: {}", f.path.display());
			missing.push(f);
		}
	}

	if !policy.fix || missing.is_empty() { return; }

	fix_files(&missing, install, fixctx,
			&mut counts.replaced, &mut counts.not_replaced);
}


/// Pass 2: present files should fingerprint to what the manifest says.
fn mismatch_pass(set: &[File], root: &Path, policy: &Policy,
		install: &InstallCtx, fixctx: Option<&FixCtx>, counts: &mut Counts)
{
	use crate::core::pool::Pool as _;

	// Farm the fingerprinting out; it's the expensive part.
	let mut reqs = Vec::new();
	for f in set
	{
		if f.flags.deleted || f.skip() { continue; }
		let target = path_join(root, &f.path);
		if !target.exists() && !target.is_symlink() { continue; }

		reqs.push(fprint::Req {
			target,
			rel: f.path.clone(),
			expect: f.fingerprint,
		});
	}

	let pool = fprint::FprintCheck::new(reqs.len());
	let bad = match pool.run(&fprint::Control {}, reqs) {
		Ok(r) => r.bad,
		Err(e) => {
			eprintln!("Warning: fingerprint pool fell over: {e}");
			return;
		},
	};

	let badset: BTreeSet<&PathBuf> = bad.iter().collect();
	let mismatched: Vec<&File> = set.iter()
			.filter(|f| badset.contains(&f.path))
			.collect();

	for f in &mismatched
	{
		counts.mismatch += 1;
		println!("  Mismatch: {}", f.path.display());
	}

	if !policy.fix || mismatched.is_empty() { return; }

	fix_files(&mismatched, install, fixctx,
			&mut counts.fixed, &mut counts.not_fixed);
}


/// Fetch content for a set of entries and install each one.
fn fix_files(files: &[&File], install: &InstallCtx,
		fixctx: Option<&FixCtx>, ok: &mut u64, bad: &mut u64)
{
	let Some(fixctx) = fixctx else {
		*bad += files.len() as u64;
		return;
	};

	// Directories and symlinks ride along as fullfiles same as
	// regular files; everything is content-addressed.  Each file's
	// archive lives under the version that last changed it.
	let arts: Vec<fetch::Artifact> = files.iter()
			.map(|f| fetch::Artifact::FullFile {
				fp: f.fingerprint, version: f.last_change })
			.collect();

	let pool = fetch::Fetch::new(fixctx.fetch_ctrl, &arts);
	let fetched = match pool.run_transfers(fixctx.fetch_ctrl, arts) {
		Ok(r) => r,
		Err(e) => {
			eprintln!("Warning: transfer pool fell over: {e}");
			*bad += files.len() as u64;
			return;
		},
	};

	// Whatever didn't land can't be installed.
	let mut gotten: BTreeSet<crate::util::hash::Fingerprint> =
			BTreeSet::new();
	for r in &fetched.oks
	{
		if let fetch::Artifact::FullFile { fp, .. } = &r.artifact
		{ gotten.insert(*fp); }
	}

	for f in files
	{
		if !gotten.contains(&f.fingerprint)
		{
			*bad += 1;
			continue;
		}

		match staging::install_single(f, install) {
			Ok(_) => *ok += 1,
			Err(e) => {
				eprintln!("  Couldn't fix {}: {e}", f.path.display());
				*bad += 1;
			},
		}
	}
}


/// Pass 3: deletions that are still on disk.
fn orphan_pass(set: &[File], root: &Path, policy: &Policy,
		counts: &mut Counts)
{
	for f in set
	{
		if !f.flags.deleted || f.flags.ghosted || f.skip() { continue; }
		counts.checked += 1;

		let target = path_join(root, &f.path);
		if !exists_nofollow(&target) { continue; }

		counts.extraneous += 1;
		println!("  Orphaned: {}", f.path.display());

		if !policy.fix { continue; }

		match remove_extra(&target) {
			Ok(_) => counts.deleted += 1,
			Err(e) => {
				eprintln!("  Couldn't remove {}: {e}",
						f.path.display());
				counts.not_deleted += 1;
			},
		}
	}
}


/// Pass 4: walk the picky root hunting files nothing claims.
fn extra_files_pass(set: &[File], root: &Path, policy: &Policy,
		counts: &mut Counts)
{
	// The claim set: every non-deleted path in the manifests.
	let claimed: BTreeSet<&Path> = set.iter()
			.filter(|f| !f.flags.deleted)
			.map(|f| f.path.as_path())
			.collect();

	let start = path_join(root, &policy.picky_root);
	let mut found: Vec<PathBuf> = Vec::new();
	walk_tree(&start, &mut |ondisk| {
		// Translate back to a manifest-style path
		let rel = match ondisk.strip_prefix(root) {
			Ok(r) => Path::new("/").join(r),
			Err(_) => return,
		};

		let relstr = rel.to_string_lossy();
		if policy.whitelist.is_match(&relstr) { return; }
		if claimed.contains(rel.as_path()) { return; }

		found.push(ondisk.to_path_buf());
	});

	// Deepest first, so emptied directories can go too.
	found.sort();
	found.reverse();

	for ondisk in &found
	{
		counts.extraneous += 1;
		let show = ondisk.strip_prefix(root).unwrap_or(ondisk);
		println!("  Extra: /{}", show.display());

		if !policy.fix { continue; }

		match remove_extra(ondisk) {
			Ok(_) => counts.deleted += 1,
			Err(e) => {
				eprintln!("  Couldn't remove {}: {e}", ondisk.display());
				counts.not_deleted += 1;
			},
		}
	}
}


/// Depth-first walk calling back on everything under (and including
/// nothing of) the start dir.
fn walk_tree(dir: &Path, cb: &mut impl FnMut(&Path))
{
	let Ok(rd) = std::fs::read_dir(dir) else { return; };
	for ent in rd.flatten()
	{
		let p = ent.path();
		cb(&p);
		if p.is_dir() && !p.is_symlink()
		{
			walk_tree(&p, cb);
		}
	}
}


fn exists_nofollow(p: &Path) -> bool
{
	std::fs::symlink_metadata(p).is_ok()
}


/// Remove an unwanted path; directories only when empty.
fn remove_extra(p: &Path) -> Result<(), std::io::Error>
{
	let md = std::fs::symlink_metadata(p)?;
	match md.is_dir() {
		true => {
			// Leave non-empty dirs; their contents may still be
			// getting enumerated separately.
			match std::fs::remove_dir(p) {
				Ok(_) => Ok(()),
				Err(e) if e.raw_os_error()
						== Some(libc::ENOTEMPTY) => Ok(()),
				Err(e) => Err(e),
			}
		},
		false => std::fs::remove_file(p),
	}
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::core::staging::set_by_path;
	use crate::manifest::{FileFlags, FileKind};
	use crate::statedir::StateDir;
	use crate::util::hash::Fingerprint;
	use std::collections::BTreeMap;
	use std::fs;

	struct World
	{
		_td: tempfile::TempDir,
		sd: StateDir,
		root: PathBuf,
	}

	fn mk_world() -> World
	{
		crate::util::set_euid();
		let td = tempfile::tempdir().unwrap();
		let sd = StateDir::open(&td.path().join("state"), None).unwrap();
		let root = td.path().join("root");
		fs::create_dir(&root).unwrap();
		World { sd, root, _td: td }
	}

	/// An entry for a file as it exists on disk right now.
	fn entry_for(w: &World, rel: &str) -> File
	{
		let fp = hash::compute(&path_join(&w.root, rel), true).unwrap();
		File {
			path: rel.into(),
			kind: FileKind::Regular,
			flags: FileFlags { tracked: true, ..Default::default() },
			fingerprint: fp,
			last_change: 10,
		}
	}

	/// Ditto for a directory.
	fn dir_entry_for(w: &World, rel: &str) -> File
	{
		let mut e = entry_for(w, rel);
		e.kind = FileKind::Directory;
		e
	}

	fn deleted_entry(rel: &str) -> File
	{
		File {
			path: rel.into(),
			kind: FileKind::Regular,
			flags: FileFlags { tracked: true, deleted: true,
					..Default::default() },
			fingerprint: Fingerprint::zeros(),
			last_change: 10,
		}
	}

	fn diagnose(set: &[File], w: &World, policy: &Policy) -> Counts
	{
		let map: BTreeMap<PathBuf, File> = set_by_path(set);
		let ictx = InstallCtx {
			root: &w.root, statedir: &w.sd, set: &map,
		};
		walk(set, &w.root, policy, &ictx, None)
	}

	#[test]
	fn clean_tree_is_clean()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/ls"), b"the ls binary").unwrap();

		let set = vec![entry_for(&w, "/usr/bin/ls")];
		let c = diagnose(&set, &w, &Policy::default());

		assert_eq!(c.missing, 0);
		assert_eq!(c.mismatch, 0);
		assert_eq!(c.problems(), 0);
	}

	#[test]
	fn missing_detected_not_fixed()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/ls"), b"the ls binary").unwrap();

		let mut set = vec![entry_for(&w, "/usr/bin/ls")];
		fs::remove_file(w.root.join("usr/bin/ls")).unwrap();

		// Entry for something never on disk, too
		set.push(File {
			path: "/usr/bin/gone".into(),
			kind: FileKind::Regular,
			flags: FileFlags { tracked: true, ..Default::default() },
			fingerprint: Fingerprint::from([0x21; 32]),
			last_change: 10,
		});

		let c = diagnose(&set, &w, &Policy::default());
		assert_eq!(c.missing, 2);
		assert_eq!(c.replaced + c.not_replaced, 0,
				"fix=false must not touch anything");
	}

	#[test]
	fn mismatch_detected()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/ls"), b"original").unwrap();

		let set = vec![entry_for(&w, "/usr/bin/ls")];
		fs::write(w.root.join("usr/bin/ls"), b"tampered!").unwrap();

		let c = diagnose(&set, &w, &Policy::default());
		assert_eq!(c.missing, 0);
		assert_eq!(c.mismatch, 1);
	}

	#[test]
	fn quick_skips_mismatch()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/ls"), b"original").unwrap();

		let set = vec![entry_for(&w, "/usr/bin/ls")];
		fs::write(w.root.join("usr/bin/ls"), b"tampered!").unwrap();

		let pol = Policy { quick: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);
		assert_eq!(c.mismatch, 0, "quick mode never fingerprints");
	}

	#[test]
	fn orphans_detected_and_fixed()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/stale"), b"shouldn't be here")
				.unwrap();

		let set = vec![deleted_entry("/usr/bin/stale")];

		// Diagnose only counts
		let c = diagnose(&set, &w, &Policy::default());
		assert_eq!(c.extraneous, 1);
		assert!(w.root.join("usr/bin/stale").is_file());

		// Repair removes
		let pol = Policy { fix: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);
		assert_eq!(c.extraneous, 1);
		assert_eq!(c.deleted, 1);
		assert!(!w.root.join("usr/bin/stale").exists());
	}

	#[test]
	fn ghosted_deletions_left_alone()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("boot")).unwrap();
		fs::write(w.root.join("boot/ghost"), b"managed elsewhere")
				.unwrap();

		let mut g = deleted_entry("/boot/ghost");
		g.flags.ghosted = true;

		let pol = Policy { fix: true, ..Default::default() };
		let c = diagnose(&[g], &w, &pol);
		assert_eq!(c.extraneous, 0);
		assert!(w.root.join("boot/ghost").is_file());
	}

	#[test]
	fn picky_finds_extra_files()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();
		fs::write(w.root.join("usr/bin/ls"), b"claimed").unwrap();
		fs::write(w.root.join("usr/bin/rogue"), b"unclaimed").unwrap();

		// Whitelisted tree: ignored even though unclaimed
		fs::create_dir_all(w.root.join("usr/local/bin")).unwrap();
		fs::write(w.root.join("usr/local/bin/mine"), b"admin's").unwrap();

		// Claim /usr, /usr/bin, /usr/bin/ls
		let set = vec![
			entry_for(&w, "/usr/bin/ls"),
			dir_entry_for(&w, "/usr"),
			dir_entry_for(&w, "/usr/bin"),
		];

		let pol = Policy { picky: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);
		assert_eq!(c.extraneous, 1, "only the rogue file");

		let pol = Policy { picky: true, fix: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);
		assert_eq!(c.deleted, 1);
		assert!(!w.root.join("usr/bin/rogue").exists());
		assert!(w.root.join("usr/local/bin/mine").is_file(),
				"whitelist protected");
		assert!(w.root.join("usr/bin/ls").is_file());
	}

	#[test]
	fn extra_files_only_skips_other_passes()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr")).unwrap();
		fs::write(w.root.join("usr/rogue"), b"unclaimed").unwrap();

		// A set entry that's missing on disk: would count in pass 1
		let set = vec![File {
			path: "/usr/bin/notthere".into(),
			kind: FileKind::Regular,
			flags: FileFlags { tracked: true, ..Default::default() },
			fingerprint: Fingerprint::from([0x33; 32]),
			last_change: 10,
		}];

		let pol = Policy { extra_files_only: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);
		assert_eq!(c.missing, 0, "pass 1 skipped");
		assert_eq!(c.extraneous, 1, "only the extra-files pass ran");
	}

	#[test]
	fn removal_passes_skipped_after_fix_failures()
	{
		let w = mk_world();
		fs::create_dir_all(w.root.join("usr/bin")).unwrap();

		// A missing file with fix on but no fix context: not_replaced.
		let missing = File {
			path: "/usr/bin/lost".into(),
			kind: FileKind::Regular,
			flags: FileFlags { tracked: true, ..Default::default() },
			fingerprint: Fingerprint::from([0x44; 32]),
			last_change: 10,
		};

		// Plus an orphan that WOULD be removed
		fs::write(w.root.join("usr/bin/stale"), b"x").unwrap();
		let set = vec![missing, deleted_entry("/usr/bin/stale")];

		let pol = Policy { fix: true, ..Default::default() };
		let c = diagnose(&set, &w, &pol);

		assert!(c.not_replaced > 0);
		assert_eq!(c.extraneous, 0, "orphan pass skipped");
		assert!(w.root.join("usr/bin/stale").is_file(),
				"nothing destructive after a failed repair");
	}
}
