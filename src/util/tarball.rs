//! Tarball handling.
//!
//! Three artifact shapes come down the wire as tar: fullfiles (exactly
//! one entry, named by its fingerprint), manifests (exactly one entry),
//! and packs (many entries that land under staged/ and delta/).  The
//! bodies may be gzip'd or raw depending on how the server side was
//! built, so we sniff rather than trust the extension.
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};


/// Errors for the various tar contracts.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum TarballErr
{
	#[error("I/O error: {0}")]
	IO(#[from] io::Error),

	#[error("Expected exactly one entry, found {0}")]
	NotSingleEntry(usize),

	#[error("Entry name '{0}' doesn't match expected '{1}'")]
	WrongName(String, String),

	#[error("Unusable entry path in archive: {0}")]
	BadEntryPath(String),
}


/// Open an archive, transparently ungzipping if the magic says so.
fn open_archive(tarfile: &Path)
		-> Result<tar::Archive<Box<dyn Read>>, TarballErr>
{
	let mut fh = File::open(tarfile)?;

	let mut magic = [0u8; 2];
	let n = fh.read(&mut magic)?;
	fh.rewind()?;

	let rdr: Box<dyn Read> = match n == 2 && magic == [0x1f, 0x8b] {
		true  => Box::new(flate2::read::GzDecoder::new(fh)),
		false => Box::new(fh),
	};

	let mut ar = tar::Archive::new(rdr);
	ar.set_preserve_permissions(true);
	ar.set_unpack_xattrs(true);
	if crate::util::euid() == 0 { ar.set_preserve_ownerships(true); }
	Ok(ar)
}


/// Extract a single-entry archive into a directory, requiring the
/// entry's basename to be `expect`.  Returns the extracted path.
///
/// This is the fullfile contract: one entry, named by the fingerprint,
/// contents reproducing the fingerprint (the caller checks that part).
/// It's also the manifest contract, with a manifest name instead.
pub(crate) fn extract_single(tarfile: &Path, expect: &str, destdir: &Path)
		-> Result<PathBuf, TarballErr>
{
	let mut ar = open_archive(tarfile)?;

	let mut count = 0usize;
	let mut out = None;
	for ent in ar.entries()?
	{
		let mut ent = ent?;
		count += 1;
		if count > 1 { continue; }

		let name = {
			let p = ent.path()?;
			let base = p.file_name()
					.ok_or_else(|| TarballErr::BadEntryPath(
							p.display().to_string()))?;
			base.to_string_lossy().into_owned()
		};
		if name != expect
		{ return Err(TarballErr::WrongName(name, expect.to_string())); }

		let dst = destdir.join(&name);
		ent.unpack(&dst)?;
		out = Some(dst);
	}

	if count != 1 { return Err(TarballErr::NotSingleEntry(count)); }
	Ok(out.expect("count==1 means we unpacked it"))
}


/// Extract a pack.  Entries under staged/ go into the staged dir,
/// entries under delta/ go into the delta dir, flat by basename.
/// Anything else in the archive is ignored.  Returns the basenames that
/// landed in staged/.
pub(crate) fn extract_pack(tarfile: &Path, staged: &Path, delta: &Path)
		-> Result<Vec<String>, TarballErr>
{
	let mut ar = open_archive(tarfile)?;
	let mut got = Vec::new();

	for ent in ar.entries()?
	{
		let mut ent = ent?;
		let (dir, base) = {
			let p = ent.path()?;
			let base = match p.file_name() {
				Some(b) => b.to_string_lossy().into_owned(),
				None => continue,
			};
			let dir = match p.starts_with("staged") {
				true => staged,
				false => match p.starts_with("delta") {
					true  => delta,
					false => continue,
				},
			};
			(dir, base)
		};

		// Content-addressed names: an entry already present is
		// already the right bytes.
		let dst = dir.join(&base);
		if dst.exists() || dst.is_symlink() { continue; }

		ent.unpack(&dst)?;
		if dir == staged { got.push(base); }
	}

	Ok(got)
}


/// Extract a single-entry archive straight onto a given path, whatever
/// the entry is named.  This is the last-resort install fallback, where
/// hardlink and copy both failed and we want tar's attribute handling.
pub(crate) fn extract_single_to(tarfile: &Path, dst: &Path)
		-> Result<(), TarballErr>
{
	let mut ar = open_archive(tarfile)?;

	let mut count = 0usize;
	for ent in ar.entries()?
	{
		let mut ent = ent?;
		count += 1;
		if count > 1 { continue; }
		ent.unpack(dst)?;
	}

	if count != 1 { return Err(TarballErr::NotSingleEntry(count)); }
	Ok(())
}
