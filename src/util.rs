//! Misc util funcs

/// Fingerprint (HMAC-SHA256) hashing utils
pub(crate) mod hash;

/// Extended attribute handling
pub(crate) mod xattrs;

/// Tarball handling for fullfiles, packs, and manifests
pub(crate) mod tarball;

/// Binary patching
pub(crate) mod bspatch;



// XXX Is caching worth it?  geteuid() may not even be an actual syscall
// now, so may be cheaper than eating the atomic...
use std::sync::atomic::AtomicU32;
static EUID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn set_euid()
{
	use std::sync::atomic::Ordering::Relaxed;
	let euid = unsafe { libc::geteuid() };
	EUID.store(euid, Relaxed);
}

/// We'll care about euid for things like chown() calls.
pub(crate) fn euid() -> u32
{
	use std::sync::atomic::Ordering::Relaxed;
	EUID.load(Relaxed)
}



/// For writing out files, we may want some buffering.  In a little quick
/// sampling, over 99% of the files are sub-1 meg, and 4 megs gets us to
/// something like 99.8%.  So that's a good working number for a buffer
/// size to cut down on syscalls etc...
pub(crate) static FILE_BUFSZ: usize = 4 * 1024 * 1024;



use std::path::{Path, PathBuf};

/// Append paths.
///
/// It's not trivial to just use Path::join() because it treats join'ing
/// an "absolute" path as _replacing_ the base, not appending to.
/// Presumable there are usecases where that's the sensible behavior.
/// For us, though, it pretty much never is; we're always treating the
/// base path as a sort of "chroot".  So to avoid repeating ourselves too
/// often, just make a util func for it.
pub(crate) fn path_join(base: impl AsRef<Path>, sub: impl AsRef<Path>)
		-> PathBuf
{
	// So for our subpath, strip off the leading absoluteness if it has
	// it.
	let sub = match sub.as_ref().strip_prefix("/") {
		Ok(x) => x,
		Err(_) => sub.as_ref(),
	};
	// Then .join will do what we want.
	base.as_ref().join(sub)
}


/// Pluralize for a number
pub(crate) fn plural(n: usize) -> &'static str
{
	if n == 1 { "" } else { "s" }
}


/// sync(2).  The stage-all / rename-all split only gives its crash
/// guarantee with a full flush between the passes, so this gets called
/// at both barriers.
pub(crate) fn sync_fs()
{
	unsafe { libc::sync() };
}


/// Recursively total up the bytes under a path.  Symlinks are counted
/// by their own size, not their target's.
pub(crate) fn tree_size(p: &Path) -> u64
{
	let md = match std::fs::symlink_metadata(p) {
		Ok(m) => m,
		Err(_) => return 0,
	};

	if !md.is_dir() { return md.len(); }

	let mut sum = 0u64;
	if let Ok(rd) = std::fs::read_dir(p)
	{
		for ent in rd.flatten()
		{ sum += tree_size(&ent.path()); }
	}
	sum
}



#[cfg(test)]
mod tests
{
	use std::path::PathBuf;

	#[test]
	fn path_join()
	{
		let base = PathBuf::from("/target");

		let j = super::path_join(&base, "/usr/bin/tool");
		assert_eq!(j, PathBuf::from("/target/usr/bin/tool"));

		let j = super::path_join(&base, "usr/bin/tool");
		assert_eq!(j, PathBuf::from("/target/usr/bin/tool"));
	}

	#[test]
	fn plural()
	{
		assert_eq!(super::plural(1), "");
		assert_eq!(super::plural(0), "s");
		assert_eq!(super::plural(5), "s");
	}

	#[test]
	fn tree_size()
	{
		let td = tempfile::tempdir().unwrap();
		let d = td.path();

		std::fs::write(d.join("a"), b"12345").unwrap();
		std::fs::create_dir(d.join("sub")).unwrap();
		std::fs::write(d.join("sub/b"), b"1234567").unwrap();

		assert_eq!(super::tree_size(&d.join("a")), 5);
		assert!(super::tree_size(d) >= 12);
	}
}
