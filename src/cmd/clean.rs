//! #0 clean
//!
//! The cache garbage collector.  Incremental mode drops everything
//! regenerable that the current MoM no longer speaks for: staged
//! content, downloaded archives, packs, deltas, and whole manifest
//! directories for versions nothing references.  --all empties the
//! cache outright.  Subscription sentinels, telemetry, and the lock
//! survive both; they're records, not cache.
use std::fs;
use std::path::Path;

use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::manifest::MOM;
use crate::statedir::StateDir;
use crate::util::{plural, tree_size};

use super::common;


pub(crate) fn run(carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	let args = match &carg.clargs.command {
		UpdCmds::Clean(a) => a,
		_ => unreachable!("I'm a clean, why does it think I'm not??"),
	};
	let cfg = &carg.config;

	let sess = common::open_session(cfg, true)?;

	let mut gc = Gc { dry_run: args.dry_run, bytes: 0, count: 0 };

	// The regenerable subtrees always get emptied.
	for d in [sess.sd.staged_dir(), sess.sd.download_dir(),
			sess.sd.delta_dir(), sess.sd.temp_dir()]
	{
		gc.sweep_dir_contents(&d)?;
	}

	// Pack tarballs at the statedir root.
	for ent in fs::read_dir(sess.sd.root())?
	{
		let ent = ent?;
		let name = ent.file_name().to_string_lossy().into_owned();
		if name.starts_with("pack-") && name.contains(".tar")
		{
			gc.sweep(&ent.path())?;
		}
	}

	// Version directories.
	let protected = match args.all {
		true => Vec::new(),
		false => {
			let current = crate::info::version::current(cfg.path())?;
			protected_versions(&sess.sd, current)
		},
	};

	for ent in fs::read_dir(sess.sd.root())?
	{
		let ent = ent?;
		let name = ent.file_name().to_string_lossy().into_owned();
		let Ok(ver) = name.parse::<u32>() else { continue; };

		match protected.contains(&ver) {
			false => { gc.sweep(&ent.path())?; },
			true => {
				// Still needed, but its manifest deltas aren't; they
				// were only ever stepping stones.
				gc.sweep_manifest_deltas(&ent.path())?;
			},
		}
	}

	let did = match args.dry_run {
		true => "Would remove",
		false => "Removed",
	};
	println!("{did} {} file{}, freeing {} KB", gc.count,
			plural(gc.count as usize), gc.bytes / 1024);

	Ok(ExitStatus::Ok)
}


/// Versions the current MoM still speaks for: the current version
/// itself, plus every version number in the MoM's text (the header
/// and each sub-manifest's last-change).
fn protected_versions(sd: &StateDir, current: u32) -> Vec<u32>
{
	let mut keep = vec![current];

	if let Ok(text) = fs::read_to_string(sd.manifest(current, MOM))
	{
		for tok in text.split(|c: char| !c.is_ascii_digit())
		{
			if tok.is_empty() { continue; }
			if let Ok(v) = tok.parse::<u32>()
			{ keep.push(v); }
		}
	}

	keep.sort();
	keep.dedup();
	keep
}


/// The little removal engine, with dry-run accounting.
struct Gc
{
	dry_run: bool,
	bytes: u64,
	count: u64,
}

impl Gc
{
	/// Sweep one path (file or whole tree).
	fn sweep(&mut self, p: &Path) -> Result<(), CmdErr>
	{
		self.bytes += tree_size(p);
		self.count += count_files(p);

		if self.dry_run
		{
			println!("  would remove {}", p.display());
			return Ok(());
		}

		let md = fs::symlink_metadata(p)?;
		match md.is_dir() {
			true => fs::remove_dir_all(p)?,
			false => fs::remove_file(p)?,
		}
		Ok(())
	}

	/// Sweep everything inside a dir, keeping the dir.
	fn sweep_dir_contents(&mut self, d: &Path) -> Result<(), CmdErr>
	{
		if !d.is_dir() { return Ok(()); }
		for ent in fs::read_dir(d)?
		{
			self.sweep(&ent?.path())?;
		}
		Ok(())
	}

	/// Sweep only the Manifest-*-delta-* files out of a version dir.
	fn sweep_manifest_deltas(&mut self, d: &Path) -> Result<(), CmdErr>
	{
		for ent in fs::read_dir(d)?
		{
			let ent = ent?;
			let name = ent.file_name().to_string_lossy().into_owned();
			if name.starts_with("Manifest-") && name.contains("-delta-")
			{
				self.sweep(&ent.path())?;
			}
		}
		Ok(())
	}
}


/// How many files (not dirs) live under a path.
fn count_files(p: &Path) -> u64
{
	let Ok(md) = fs::symlink_metadata(p) else { return 0; };
	if !md.is_dir() { return 1; }

	let mut n = 0;
	if let Ok(rd) = fs::read_dir(p)
	{
		for ent in rd.flatten()
		{ n += count_files(&ent.path()); }
	}
	n
}
