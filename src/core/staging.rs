//! The staging and rename engine.
//!
//! Installing a file is two acts.  Staging puts the verified content
//! next to its final home as `.update.<basename>` (directories are the
//! exception; they're made in place).  Committing is a single
//! rename(2), which on POSIX is atomic within a filesystem.  The
//! install_files() driver stages everything, syncs, renames
//! everything, syncs again; a crash at any point leaves every path
//! either fully old or fully new, never truncated, never orphaned of
//! its parents.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::manifest::{File, FileKind};
use crate::statedir::StateDir;
use crate::util::{path_join, xattrs};


/// Install errors, split up the way the exit codes care about.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum StageErr
{
	#[error("Couldn't create directory {0}: {1}")]
	CreateDir(PathBuf, io::Error),

	#[error("Couldn't create file {0}: {1}")]
	CreateFile(PathBuf, String),

	#[error("Couldn't rename into {0}: {1}")]
	RenameFile(PathBuf, io::Error),

	#[error("Couldn't rename directory {0}: {1}")]
	RenameDir(PathBuf, io::Error),

	#[error("Couldn't remove {0}: {1}")]
	RemoveFile(PathBuf, io::Error),

	#[error("No staged content for {0} (wanted {1})")]
	MissingStaged(PathBuf, String),

	#[error("I/O error: {0}")]
	IO(#[from] io::Error),
}


/// Everything a single-file install needs to know.
#[derive(Debug)]
pub(crate) struct InstallCtx<'a>
{
	/// The target root
	pub(crate) root: &'a Path,

	/// Where staged content lives
	pub(crate) statedir: &'a StateDir,

	/// The authoritative consolidated set, by path.  Used to reinstall
	/// missing ancestor directories.
	pub(crate) set: &'a BTreeMap<PathBuf, File>,
}


/// Build the by-path map the context wants.
pub(crate) fn set_by_path(files: &[File]) -> BTreeMap<PathBuf, File>
{
	files.iter().map(|f| (f.path.clone(), f.clone())).collect()
}


/// The hidden staging name next to a target.
fn dot_update(target: &Path) -> PathBuf
{
	let base = target.file_name()
			.map(|b| b.to_string_lossy().into_owned())
			.unwrap_or_default();
	target.with_file_name(format!(".update.{base}"))
}


/// Existence that doesn't chase symlinks.
fn exists(p: &Path) -> bool
{
	fs::symlink_metadata(p).is_ok()
}

/// Is it a dir (not through a symlink)?
fn is_dir(p: &Path) -> bool
{
	match fs::symlink_metadata(p) {
		Ok(md) => md.is_dir(),
		Err(_) => false,
	}
}


/// Stage one entry.  Directories install completely here; files and
/// symlinks just get their .update sibling built.  Deletions have
/// nothing to stage.
pub(crate) fn stage_one(f: &File, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	if f.skip() || f.flags.deleted { return Ok(()); }

	let target = path_join(ctx.root, &f.path);

	// The parent has to be a real directory, not missing, and not a
	// symlink pointing who-knows-where.
	let parent = target.parent()
			.ok_or_else(|| StageErr::CreateDir(target.clone(),
					io::Error::new(io::ErrorKind::NotFound,
							"no parent")))?
			.to_path_buf();
	if !is_dir(&parent) || parent.is_symlink()
	{
		verify_fix_path(&f.path, ctx)?;
	}

	// Clear any stale staging from an interrupted run.
	let dot = dot_update(&target);
	if exists(&dot)
	{
		match is_dir(&dot) {
			true => fs::remove_dir_all(&dot)
					.map_err(|e| StageErr::RemoveFile(dot.clone(), e))?,
			false => fs::remove_file(&dot)
					.map_err(|e| StageErr::RemoveFile(dot.clone(), e))?,
		}
	}

	match f.kind
	{
		FileKind::Directory => stage_dir(f, &target, ctx),
		FileKind::Regular | FileKind::Symlink =>
			stage_nondir(f, &target, &dot, ctx),
		FileKind::ManifestRef => Ok(()),  // not an installable thing
	}
}


/// Directories go straight in; there's no atomic-rename story for a
/// directory, and an early mkdir is what lets everything under it
/// stage at all.
fn stage_dir(f: &File, target: &Path, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	// A non-dir squatting on the name gets cleared out.
	if exists(target) && !is_dir(target)
	{
		fs::remove_file(target)
				.map_err(|e| StageErr::RemoveFile(target.to_path_buf(), e))?;
	}

	if !exists(target)
	{
		fs::create_dir(target).or_else(|e| match e.kind() {
			io::ErrorKind::AlreadyExists => Ok(()),
			_ => Err(StageErr::CreateDir(target.to_path_buf(), e)),
		})?;
	}

	// Carry attributes over from the staged copy if we have one; a
	// fresh mkdir's defaults are the fallback.
	let staged = ctx.statedir.staged(&f.fingerprint.to_buf());
	if is_dir(&staged)
	{
		if let Err(e) = copy_attrs(&staged, target)
		{
			// Attribute trouble: let tar have a shot at it, since it
			// knows tricks (and the archive is still in download/).
			let tarfile = ctx.statedir
					.download_tar(&f.fingerprint.to_buf());
			if tarfile.is_file()
			{
				crate::util::tarball::extract_single_to(&tarfile, target)
						.map_err(|te| StageErr::CreateFile(
								target.to_path_buf(), te.to_string()))?;
			}
			else
			{
				return Err(StageErr::CreateDir(target.to_path_buf(), e));
			}
		}
	}

	Ok(())
}


/// Files and symlinks stage as the .update sibling: hardlink from the
/// cache if we can, copy if we can't, tar as the last resort.
fn stage_nondir(f: &File, target: &Path, dot: &Path, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	let fpb = f.fingerprint.to_buf();
	let staged = ctx.statedir.staged(&fpb);

	if !exists(&staged)
	{
		return Err(StageErr::MissingStaged(f.path.clone(),
				fpb.as_ref().to_string()));
	}

	// If the target currently exists as a different kind, the stage
	// pass clears what it can.  An existing directory is left for the
	// rename pass, which knows about lost+found.
	if exists(target) && !is_dir(target)
	{
		let target_is_link = target.is_symlink();
		let want_link = f.kind == FileKind::Symlink;
		if target_is_link != want_link
		{
			fs::remove_file(target).map_err(|e|
					StageErr::RemoveFile(target.to_path_buf(), e))?;
		}
	}

	// Hardlink is the cheap path and carries everything with it.
	if fs::hard_link(&staged, dot).is_ok() { return Ok(()); }

	// Copy fallback (cross-device, or a filesystem that won't link).
	if copy_entry(&staged, dot).is_ok() { return Ok(()); }
	let _ = fs::remove_file(dot);

	// Tar fallback, straight from the downloaded archive.
	let tarfile = ctx.statedir.download_tar(&fpb);
	if tarfile.is_file()
	{
		return crate::util::tarball::extract_single_to(&tarfile, dot)
				.map_err(|te| StageErr::CreateFile(dot.to_path_buf(),
						te.to_string()));
	}

	Err(StageErr::CreateFile(dot.to_path_buf(),
			"hardlink and copy both failed, no archive to extract"
					.to_string()))
}


/// Copy a staged entry (file or symlink) preserving what we can.
fn copy_entry(staged: &Path, dot: &Path) -> Result<(), io::Error>
{
	let md = fs::symlink_metadata(staged)?;

	if md.file_type().is_symlink()
	{
		let tgt = fs::read_link(staged)?;
		std::os::unix::fs::symlink(&tgt, dot)?;
		return Ok(());
	}

	fs::copy(staged, dot)?;
	fs::set_permissions(dot, md.permissions())?;
	copy_owner(&md, dot)?;
	xattrs::copy(staged, dot)?;
	Ok(())
}


/// Carry mode/owner/xattrs from one existing path to another.
fn copy_attrs(src: &Path, dst: &Path) -> Result<(), io::Error>
{
	let md = fs::symlink_metadata(src)?;
	fs::set_permissions(dst, md.permissions())?;
	copy_owner(&md, dst)?;
	xattrs::copy(src, dst)?;
	Ok(())
}


/// chown to match, when we're in a position to.
fn copy_owner(md: &fs::Metadata, dst: &Path) -> Result<(), io::Error>
{
	use std::os::unix::fs::MetadataExt as _;

	if crate::util::euid() != 0 { return Ok(()); }
	std::os::unix::fs::lchown(dst, Some(md.uid()), Some(md.gid()))
}


/// Commit one entry.  Deletions happen here too, since they're part of
/// the same ordering story.
pub(crate) fn rename_one(f: &File, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	if f.skip() { return Ok(()); }

	let target = path_join(ctx.root, &f.path);

	if f.flags.deleted
	{
		return remove_target(&target);
	}

	// Directories were fully installed at stage time.
	if f.kind == FileKind::Directory { return Ok(()); }

	let dot = dot_update(&target);
	if !exists(&dot)
	{
		// Nothing staged usually means stage_one failed and the driver
		// is pressing on; nothing to do here.
		return Err(StageErr::MissingStaged(f.path.clone(),
				dot.display().to_string()));
	}

	// A directory in the way of a non-directory can't be renamed over.
	// If it has contents, they were somebody's data once; park them in
	// lost+found rather than torching them.
	if is_dir(&target)
	{
		match fs::remove_dir(&target) {
			Ok(_) => (),
			Err(_) => move_to_lost_found(&target, ctx)?,
		}
	}

	fs::rename(&dot, &target)
			.map_err(|e| StageErr::RenameFile(target.clone(), e))
}


/// Unlink a deletion's target.  Directories only go if they're empty;
/// a dir with user files in it stays, and that's fine.
fn remove_target(target: &Path) -> Result<(), StageErr>
{
	if !exists(target) { return Ok(()); }

	match is_dir(target)
	{
		true => {
			// Non-empty just quietly stays
			let _ = fs::remove_dir(target);
			Ok(())
		},
		false => fs::remove_file(target)
				.map_err(|e| StageErr::RemoveFile(target.to_path_buf(), e)),
	}
}


/// Park a displaced directory under <root>/lost+found/.
fn move_to_lost_found(target: &Path, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	let lf = ctx.root.join("lost+found");
	if !is_dir(&lf)
	{
		fs::create_dir_all(&lf)
				.map_err(|e| StageErr::CreateDir(lf.clone(), e))?;
	}

	let base = target.file_name()
			.map(|b| b.to_string_lossy().into_owned())
			.unwrap_or_else(|| "displaced".to_string());
	let salt: u32 = rand::random();
	let parked = lf.join(format!("{base}.{salt:08x}"));

	fs::rename(target, &parked)
			.map_err(|e| StageErr::RenameDir(target.to_path_buf(), e))
}


/// Walk every prefix of a path under the root, reinstalling any
/// ancestor that's missing or isn't a real directory, using the
/// authoritative set's entry for it when there is one.
pub(crate) fn verify_fix_path(rel: &Path, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	let mut prefix = PathBuf::from("/");

	// Every ancestor except the entry itself
	let Some(parent) = rel.parent() else { return Ok(()); };

	for comp in parent.components()
	{
		use std::path::Component;
		match comp {
			Component::RootDir => continue,
			Component::Normal(c) => prefix.push(c),
			_ => continue,
		}

		let ondisk = path_join(ctx.root, &prefix);

		// A symlink or file where a directory belongs gets cleared.
		if exists(&ondisk) && !is_dir(&ondisk)
		{
			fs::remove_file(&ondisk).map_err(|e|
					StageErr::RemoveFile(ondisk.clone(), e))?;
		}

		if is_dir(&ondisk) { continue; }

		match ctx.set.get(&prefix) {
			Some(ent) if ent.kind == FileKind::Directory => {
				stage_dir(ent, &ondisk, ctx)?;
			},
			_ => {
				// Not a path the manifests know; plain mkdir keeps
				// the install moving.
				fs::create_dir_all(&ondisk).map_err(|e|
						StageErr::CreateDir(ondisk.clone(), e))?;
			},
		}
	}

	Ok(())
}


/// What a driver run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct InstallStats
{
	pub(crate) staged: u64,
	pub(crate) stage_failures: Vec<String>,
	pub(crate) committed: u64,
	pub(crate) rename_failures: Vec<String>,
	pub(crate) deleted: u64,
}

impl InstallStats
{
	pub(crate) fn clean(&self) -> bool
	{
		self.stage_failures.is_empty() && self.rename_failures.is_empty()
	}
}


/// The full driver: sort, stage everything, sync, rename everything,
/// sync.  Failures after the renames start don't abort; every file we
/// can still commit gets committed, and the count of what didn't comes
/// back to the caller.
pub(crate) fn install_files(files: &[File], ctx: &InstallCtx)
		-> InstallStats
{
	let mut stats = InstallStats::default();

	// Sort by (path, deleted): parents stage before children, and a
	// deletion sorts after a creation at the same path.
	let mut ordered: Vec<&File> = files.iter().collect();
	ordered.sort_by_key(|f| (f.path.clone(), f.flags.deleted));

	for f in &ordered
	{
		if f.skip() || f.flags.deleted { continue; }
		match stage_one(f, ctx) {
			Ok(_) => stats.staged += 1,
			Err(e) => stats.stage_failures.push(format!(
					"{}: {e}", f.path.display())),
		}
	}

	crate::util::sync_fs();

	for f in &ordered
	{
		if f.skip() { continue; }

		if f.flags.deleted
		{
			match rename_one(f, ctx) {
				Ok(_) => stats.deleted += 1,
				Err(e) => stats.rename_failures.push(format!(
						"{}: {e}", f.path.display())),
			}
			continue;
		}

		// Don't try to commit what never staged.
		if f.kind != FileKind::Directory
		{
			let dot = dot_update(&path_join(ctx.root, &f.path));
			if !exists(&dot) { continue; }
		}

		match rename_one(f, ctx) {
			Ok(_) => stats.committed += 1,
			Err(e) => stats.rename_failures.push(format!(
					"{}: {e}", f.path.display())),
		}
	}

	crate::util::sync_fs();

	stats
}


/// Stage + commit one entry, for the repair path.
pub(crate) fn install_single(f: &File, ctx: &InstallCtx)
		-> Result<(), StageErr>
{
	stage_one(f, ctx)?;
	crate::util::sync_fs();
	rename_one(f, ctx)
}
