//! The on-disk cache (statedir).
//!
//! Everything we download or stage lives under one directory, laid out
//! so every artifact's path is a pure function of what it is.  That
//! means two processes (or one process and its earlier crashed self)
//! always agree on names, and reuse falls out for free.
//!
//! Layout:
//!   swupd_lock                  advisory lock
//!   version                     last version this statedir updated to
//!   staged/<fp>                 verified content, ready to install
//!   download/<fp>.tar           fetched fullfile archives
//!   delta/<from>-<to>-<fh>-<th> binary file deltas out of packs
//!   temp/                       scratch
//!   pack-<b>-from-<f>-to-<t>.tar  pack archives
//!   <version>/Manifest.<name>[.<fp>][.tar][.sig]
//!   bundles/<name>              zero-byte subscription sentinels
//!   telemetry/                  records awaiting pickup
//!
//! An optional secondary statedir can be consulted read-only; hits get
//! linked (or copied) into the primary.
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::hash::FingerprintBuf;


/// Subdir names, in one place.
const D_STAGED: &str = "staged";
const D_DOWNLOAD: &str = "download";
const D_DELTA: &str = "delta";
const D_TEMP: &str = "temp";
const D_BUNDLES: &str = "bundles";
const D_TELEMETRY: &str = "telemetry";
const LOCKFILE: &str = "swupd_lock";


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum StateDirErr
{
	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("Statedir {0} is owned by uid {1}, not us")]
	BadOwner(PathBuf, u32),

	#[error("Statedir {0} has mode {1:o}, not 0700")]
	BadMode(PathBuf, u32),

	#[error("Lock already held on {0}")]
	LockHeld(PathBuf),
}


/// Handle on the statedir.  Holding one means the layout exists and
/// passed validation; it says nothing about the lock until lock() is
/// called.
#[derive(Debug)]
pub(crate) struct StateDir
{
	root: PathBuf,

	/// Optional read-only cache consulted before downloading
	secondary: Option<PathBuf>,

	/// The flock handle, once taken.  Dropping it releases the lock.
	lockfh: Option<fs::File>,
}


impl StateDir
{
	/// Open (creating as needed) a statedir.  Fresh directories are
	/// made 0700; pre-existing ones must already be 0700 and ours, or
	/// somebody's been messing where they shouldn't.
	pub(crate) fn open(root: &Path, secondary: Option<&Path>)
			-> Result<Self, StateDirErr>
	{
		mkdir_0700(root)?;
		validate_dir(root)?;

		for sub in [D_STAGED, D_DOWNLOAD, D_DELTA, D_TEMP, D_BUNDLES,
				D_TELEMETRY]
		{
			mkdir_0700(&root.join(sub))?;
		}

		let sd = StateDir {
			root: root.to_path_buf(),
			secondary: secondary.map(|p| p.to_path_buf()),
			lockfh: None,
		};
		Ok(sd)
	}


	/// Take the advisory lock.  Exactly one holder at a time gets to
	/// mutate the cache and the target root; a second taker fails
	/// immediately rather than waiting.
	pub(crate) fn lock(&mut self) -> Result<(), StateDirErr>
	{
		use std::os::fd::AsRawFd as _;

		let lockpath = self.root.join(LOCKFILE);
		let fh = fs::OpenOptions::new()
				.create(true).write(true)
				.open(&lockpath)?;

		let rc = unsafe { libc::flock(fh.as_raw_fd(),
				libc::LOCK_EX | libc::LOCK_NB) };
		if rc != 0
		{
			let e = std::io::Error::last_os_error();
			return match e.raw_os_error() {
				Some(libc::EWOULDBLOCK) =>
					Err(StateDirErr::LockHeld(lockpath)),
				_ => Err(e.into()),
			};
		}

		self.lockfh = Some(fh);
		Ok(())
	}


	pub(crate) fn root(&self) -> &Path { &self.root }
	pub(crate) fn staged_dir(&self) -> PathBuf { self.root.join(D_STAGED) }
	pub(crate) fn download_dir(&self) -> PathBuf { self.root.join(D_DOWNLOAD) }
	pub(crate) fn delta_dir(&self) -> PathBuf { self.root.join(D_DELTA) }
	pub(crate) fn temp_dir(&self) -> PathBuf { self.root.join(D_TEMP) }
	pub(crate) fn bundles_dir(&self) -> PathBuf { self.root.join(D_BUNDLES) }
	pub(crate) fn telemetry_dir(&self) -> PathBuf { self.root.join(D_TELEMETRY) }


	/*
	 * The pure name -> path functions.
	 */

	/// A verified staged file.
	pub(crate) fn staged(&self, fp: &FingerprintBuf) -> PathBuf
	{ self.staged_dir().join(fp.as_ref()) }

	/// A downloaded fullfile archive.
	pub(crate) fn download_tar(&self, fp: &FingerprintBuf) -> PathBuf
	{ self.download_dir().join(format!("{fp}.tar")) }

	/// The in-progress name a transfer writes before its rename.
	pub(crate) fn download_tmp(&self, fp: &FingerprintBuf) -> PathBuf
	{ self.download_dir().join(format!("{fp}.tar.in-progress")) }

	/// A binary file delta, named by its version and fingerprint pair.
	pub(crate) fn delta_file(&self, from_ver: u32, to_ver: u32,
			from_fp: &FingerprintBuf, to_fp: &FingerprintBuf) -> PathBuf
	{
		self.delta_dir()
				.join(format!("{from_ver}-{to_ver}-{from_fp}-{to_fp}"))
	}

	/// A downloaded pack archive.
	pub(crate) fn pack_tar(&self, bundle: &str, from: u32, to: u32)
			-> PathBuf
	{ self.root.join(format!("pack-{bundle}-from-{from}-to-{to}.tar")) }

	/// The manifest dir for a version.
	pub(crate) fn manifest_dir(&self, version: u32) -> PathBuf
	{ self.root.join(version.to_string()) }

	/// An extracted manifest.
	pub(crate) fn manifest(&self, version: u32, component: &str) -> PathBuf
	{ self.manifest_dir(version).join(format!("Manifest.{component}")) }

	/// The fingerprint-pinned alias of a verified manifest.
	pub(crate) fn manifest_pinned(&self, version: u32, component: &str,
			fp: &FingerprintBuf) -> PathBuf
	{
		self.manifest_dir(version)
				.join(format!("Manifest.{component}.{fp}"))
	}

	/// A downloaded manifest archive.
	pub(crate) fn manifest_tar(&self, version: u32, component: &str)
			-> PathBuf
	{ self.manifest_dir(version).join(format!("Manifest.{component}.tar")) }

	/// A manifest's detached signature.
	pub(crate) fn manifest_sig(&self, version: u32, component: &str)
			-> PathBuf
	{ self.manifest_dir(version).join(format!("Manifest.{component}.sig")) }

	/// A downloaded manifest-to-manifest delta.
	pub(crate) fn manifest_delta(&self, bundle: &str, from: u32, to: u32)
			-> PathBuf
	{
		self.manifest_dir(to)
				.join(format!("Manifest-{bundle}-delta-from-{from}-to-{to}"))
	}

	/// A bundle subscription sentinel.
	pub(crate) fn bundle_sentinel(&self, name: &str) -> PathBuf
	{ self.bundles_dir().join(name) }

	/// The per-statedir version file.
	pub(crate) fn version_file(&self) -> PathBuf
	{ self.root.join("version") }


	/*
	 * Subscriptions
	 */

	/// What bundles is this statedir tracking?
	pub(crate) fn installed_bundles(&self)
			-> Result<Vec<String>, std::io::Error>
	{
		let mut out = Vec::new();
		for ent in fs::read_dir(self.bundles_dir())?
		{
			let ent = ent?;
			out.push(ent.file_name().to_string_lossy().into_owned());
		}
		out.sort();
		Ok(out)
	}

	/// Start tracking a bundle.
	pub(crate) fn track_bundle(&self, name: &str)
			-> Result<(), std::io::Error>
	{
		fs::File::create(self.bundle_sentinel(name))?;
		Ok(())
	}

	/// Stop tracking a bundle.
	pub(crate) fn untrack_bundle(&self, name: &str)
			-> Result<(), std::io::Error>
	{
		match fs::remove_file(self.bundle_sentinel(name)) {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}


	/*
	 * Secondary cache
	 */

	/// Try to satisfy a relative cache path from the secondary
	/// statedir.  On a hit, the content lands at the same relative
	/// path in the primary and we return it.
	pub(crate) fn from_secondary(&self, rel: &Path)
			-> Option<PathBuf>
	{
		let sec = self.secondary.as_ref()?;
		let src = sec.join(rel);
		if !src.is_file() { return None; }

		let dst = self.root.join(rel);
		if let Some(parent) = dst.parent()
		{
			if mkdir_0700(parent).is_err() { return None; }
		}

		match link_or_copy(&src, &dst) {
			Ok(_) => Some(dst),
			Err(_) => None,
		}
	}
}


/// Hardlink src to dst; a link that fails for crossing devices (or
/// not being allowed to link) falls back to a byte copy carrying mode
/// and xattrs.
pub(crate) fn link_or_copy(src: &Path, dst: &Path)
		-> Result<(), std::io::Error>
{
	if dst.exists() { return Ok(()); }

	match fs::hard_link(src, dst)
	{
		Ok(_) => Ok(()),
		Err(e) => {
			let fallback = matches!(e.raw_os_error(),
					Some(libc::EXDEV) | Some(libc::EPERM));
			if !fallback { return Err(e); }

			fs::copy(src, dst)?;
			let perms = fs::metadata(src)?.permissions();
			fs::set_permissions(dst, perms)?;
			let _ = crate::util::xattrs::copy(src, dst);
			Ok(())
		},
	}
}


/// Make a dir with mode 0700 if it's not there.
fn mkdir_0700(dir: &Path) -> Result<(), std::io::Error>
{
	if dir.is_dir() { return Ok(()); }

	use std::fs::DirBuilder;
	use std::os::unix::fs::DirBuilderExt as _;
	let mut db = DirBuilder::new();
	db.recursive(true).mode(0o700);
	db.create(dir)
}


/// Check that a dir is ours and closed up.  A statedir someone else
/// owns, or that anyone else can poke into, is not a statedir we can
/// trust.
fn validate_dir(dir: &Path) -> Result<(), StateDirErr>
{
	use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};

	let md = fs::metadata(dir)?;

	let euid = crate::util::euid();
	if md.uid() != euid
	{
		return Err(StateDirErr::BadOwner(dir.to_path_buf(), md.uid()));
	}

	let mode = md.permissions().mode() & 0o7777;
	if mode != 0o700
	{
		return Err(StateDirErr::BadMode(dir.to_path_buf(), mode));
	}

	Ok(())
}
