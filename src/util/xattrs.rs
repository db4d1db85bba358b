//! Extended attribute handling.
//!
//! Two jobs: building the keying blob that goes into fingerprint
//! derivation, and carrying attributes across when files get copied
//! instead of hardlinked.
use std::path::Path;

use itertools::Itertools as _;


/// Build the xattr blob for a path: every attribute name in sorted
/// order, each immediately followed by its value bytes.  The publishing
/// side builds the same blob, which is the only reason the exact layout
/// matters.
///
/// A path with no attributes (or a filesystem that doesn't do xattrs at
/// all) yields an empty blob, which is fine.
pub(crate) fn get_blob(p: &Path) -> Result<Vec<u8>, std::io::Error>
{
	let names = match xattr::list(p) {
		Ok(n) => n,
		// Unsupported filesystems just mean "no attrs".
		Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) =>
			return Ok(Vec::new()),
		Err(e) => return Err(e),
	};

	let mut blob = Vec::new();
	for name in names.sorted()
	{
		let val = xattr::get(p, &name)?;
		blob.extend_from_slice(name.as_encoded_bytes());
		if let Some(v) = val { blob.extend_from_slice(&v); }
	}
	Ok(blob)
}


/// Best-effort copy of all attributes from src to dst.  Individual
/// attributes that won't transfer (privileged namespaces when we're not
/// root, mostly) are skipped quietly.
pub(crate) fn copy(src: &Path, dst: &Path) -> Result<(), std::io::Error>
{
	let names = match xattr::list(src) {
		Ok(n) => n,
		Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(()),
		Err(e) => return Err(e),
	};

	for name in names
	{
		let val = match xattr::get(src, &name) {
			Ok(Some(v)) => v,
			Ok(None) => continue,
			Err(_) => continue,
		};
		let _ = xattr::set(dst, &name, &val);
	}
	Ok(())
}


/// Compare the attribute sets of two paths.
pub(crate) fn compare(a: &Path, b: &Path) -> bool
{
	match (get_blob(a), get_blob(b)) {
		(Ok(ba), Ok(bb)) => ba == bb,
		_ => false,
	}
}
