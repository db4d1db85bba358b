//! The fingerprint engine.
//!
//! Every file in a manifest is identified by a 64-hex-char fingerprint.
//! It's not a plain digest; it's an HMAC-SHA256 whose key is derived
//! from the file's stat info and xattrs, so two files with identical
//! bytes but different ownership or modes fingerprint differently.
//!
//! The derivation: the key is the hex form of HMAC(stat-tuple,
//! xattr-blob), where the stat tuple is the 40-byte little-endian
//! (mode, uid, gid, rdev, size) quintet.  The message under that key is
//! the file contents for regular files, the link target for symlinks,
//! and a fixed token for directories.  Deleted entries are all-zeros by
//! convention, without touching the disk at all.
//!
//! This MUST stay in sync with what the publishing side computes, or
//! every verification everywhere goes sideways.
use std::ops::Deref;
use std::fmt;
use std::path::Path;
use serde_with::{serde_as, hex::Hex};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;


/// The token hashed for directories, so their fingerprint doesn't
/// depend on anything but attributes.
const DIRECTORY_TOKEN: &[u8] = b"DIRECTORY";


/// A raw fingerprint.
///
/// HMAC-SHA256 gives you a 256 bit number, which you need 256 bits to
/// store.  Or more, depending on how you store it, but if you wanna be
/// simple, it's just 256 bits.  Or 32 octets.  So we just wrap a
/// [u8; 32] and call it good.
#[derive(Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[serde_as]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct Fingerprint(
	#[serde_as(as = "Hex")]
	[u8; 32]
);

impl Deref for Fingerprint
{
	type Target = [u8; 32];
	fn deref(&self) -> &Self::Target { &self.0 }
}

impl fmt::Debug for Fingerprint
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{ write!(f, "Fingerprint({})", self.to_buf().as_ref()) }
}

impl std::str::FromStr for Fingerprint
{
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err>
	{
		use anyhow::anyhow;

		// First check the length; that's easy
		let xlen = 64;
		let slen = s.len();
		if slen != xlen
		{
			let estr = anyhow!("Invalid fingerprint length: {slen} should \
					be {xlen} for '{s}'");
			Err(estr)?;
		}

		// And dehexify
		let mut hout = Fingerprint::default();
		let hret = base16ct::lower::decode(&s, &mut hout.0)
				.map_err(|e| anyhow!("Invalid hex parsing: {e} trying '{s}'"))?;

		// Double-checking the len here, in case I made a booboo.
		assert_eq!(hret.len(), hout.len(), "should have gotten the hex len right");

		Ok(hout)
	}
}

impl From<[u8; 32]> for Fingerprint
{
	fn from(buf: [u8; 32]) -> Self
	{
		Self(buf)
	}
}

impl fmt::Display for Fingerprint
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{
		let hb: FingerprintBuf = self.to_buf();
		write!(f, "{}", hb)
	}
}

impl Fingerprint
{
	pub(crate) fn to_buf(&self) -> FingerprintBuf { self.clone().into() }

	/// The all-zeros fingerprint; what deleted entries carry, and what
	/// the lazy variant yields for a missing path.
	pub(crate) fn zeros() -> Self { Self([0; 32]) }

	/// The all-ones (hex '1' digits, that is) fingerprint the lazy
	/// variant yields for a present path.
	pub(crate) fn ones() -> Self { Self([0x11; 32]) }

	pub(crate) fn is_zeros(&self) -> bool { self.0 == [0; 32] }
}



/// A hex fingerprint.
///
/// A base16 encoding of a number is inherently valid UTF-8, so trivially
/// String-able too.  But since we know the size, we go with a more
/// fixed-size allocation type for simplicity, when we don't need a
/// str-ified version.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FingerprintBuf([u8; 64]);

impl Deref for FingerprintBuf
{
	type Target = [u8; 64];
	fn deref(&self) -> &Self::Target { &self.0 }
}

impl Default for FingerprintBuf
{
	// Can't just derive for 64-size arrays, until the Glorious Future of
	// some combination of const generics and specialization and
	// whatnot...
	fn default() -> Self { Self ( [0; 64] ) }
}

impl From<Fingerprint> for FingerprintBuf
{
	fn from(fp: Fingerprint) -> Self
	{
		let mut buf = Self::default();
		let bret = base16ct::lower::encode(&fp.0, &mut buf.0)
				.map_err(|e| format!("Fingerprint encoding error: {}", e))
				.unwrap();

		// Double check that somebody doesn't screw up the length.
		let slen = bret.len();
		let blen = buf.len();
		if slen != blen
		{
			panic!("Programmer screwed up buffer size: should have \
					{blen} but got {slen} encoded");
		}

		buf
	}
}

impl AsRef<str> for FingerprintBuf
{
	/// Should be impossible to create these other than via our
	/// constructors, so should be guaranteed already UTF-8-y.
	fn as_ref(&self) -> &str
	{
		std::str::from_utf8(&self.0).expect("base16 encode screwed us")
	}
}

impl fmt::Display for FingerprintBuf
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{ write!(f, "{}", self.as_ref()) }
}

impl fmt::Debug for FingerprintBuf
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{ write!(f, "FingerprintBuf({})", self.as_ref()) }
}



/*
 * Now the computing side.
 */


/// The stat quintet that goes into the key derivation.  The layout is
/// part of the published format: 5 u64's, little-endian, 40 bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyStat
{
	pub(crate) mode: u64,
	pub(crate) uid:  u64,
	pub(crate) gid:  u64,
	pub(crate) rdev: u64,
	pub(crate) size: u64,
}

impl KeyStat
{
	/// Serialize into the exact 40-byte wire layout.
	fn to_le_bytes(&self) -> [u8; 40]
	{
		let mut out = [0u8; 40];
		out[0..8].copy_from_slice(&self.mode.to_le_bytes());
		out[8..16].copy_from_slice(&self.uid.to_le_bytes());
		out[16..24].copy_from_slice(&self.gid.to_le_bytes());
		out[24..32].copy_from_slice(&self.rdev.to_le_bytes());
		out[32..40].copy_from_slice(&self.size.to_le_bytes());
		out
	}

	/// Pull key material from an on-disk path (lstat flavor).
	///
	/// Directory entries never carry a size, so that's forced to 0
	/// here.
	pub(crate) fn from_path(p: &Path) -> Result<Self, std::io::Error>
	{
		use std::os::unix::fs::MetadataExt as _;

		let md = std::fs::symlink_metadata(p)?;
		let size = match md.is_dir() {
			true  => 0,
			false => md.len(),
		};
		let ks = KeyStat {
			mode: md.mode().into(),
			uid:  md.uid().into(),
			gid:  md.gid().into(),
			rdev: md.rdev(),
			size,
		};
		Ok(ks)
	}
}


/// Things that can go wrong computing a fingerprint.  Mostly "couldn't
/// read the thing"; the math itself can't fail.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum HashErr
{
	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("Fingerprint mismatch (expected {0}, got {1})")]
	Mismatch(FingerprintBuf, FingerprintBuf),
}


/// Derive the HMAC key for a file.
///
/// The stat tuple is itself used as the HMAC key over the xattr blob,
/// and the 64 ASCII bytes of the hex result become the content key.
/// That hexification is historical, but it's baked into the published
/// hashes now, so here we are.
fn derive_key(st: &KeyStat, xattr_blob: &[u8]) -> [u8; 64]
{
	let mut mac = HmacSha256::new_from_slice(&st.to_le_bytes())
			.expect("HMAC accepts any key length");
	mac.update(xattr_blob);
	let raw: [u8; 32] = mac.finalize().into_bytes().into();

	*Fingerprint::from(raw).to_buf()
}


/// HMAC a message under a derived key.
fn mac_bytes(key: &[u8], msg: &[u8]) -> Fingerprint
{
	let mut mac = HmacSha256::new_from_slice(key)
			.expect("HMAC accepts any key length");
	mac.update(msg);
	let raw: [u8; 32] = mac.finalize().into_bytes().into();
	raw.into()
}


/// Compute the fingerprint of an on-disk path.
///
/// The kind is taken from what's actually on disk; the caller compares
/// the result against whatever its manifest claims.  `use_xattrs`
/// controls whether the xattr blob joins the key derivation; manifest
/// files are published without it, everything else with.
pub(crate) fn compute(path: &Path, use_xattrs: bool)
		-> Result<Fingerprint, HashErr>
{
	use crate::util::xattrs;

	let st = KeyStat::from_path(path)?;
	let blob = match use_xattrs {
		true  => xattrs::get_blob(path)?,
		false => Vec::new(),
	};
	let key = derive_key(&st, &blob);

	let md = std::fs::symlink_metadata(path)?;
	let ft = md.file_type();

	if ft.is_symlink()
	{
		let targ = std::fs::read_link(path)?;
		let tbytes = targ.as_os_str().as_encoded_bytes();
		return Ok(mac_bytes(&key, tbytes));
	}

	if ft.is_dir()
	{
		return Ok(mac_bytes(&key, DIRECTORY_TOKEN));
	}

	// Regular file; stream the contents through.
	use std::io::Read;
	let fh = std::fs::File::open(path)?;
	let mut rdr = std::io::BufReader::with_capacity(crate::util::FILE_BUFSZ, fh);

	let mut mac = HmacSha256::new_from_slice(&key)
			.expect("HMAC accepts any key length");
	let mut buf = [0u8; 64 * 1024];
	loop
	{
		let n = rdr.read(&mut buf)?;
		if n == 0 { break; }
		mac.update(&buf[..n]);
	}
	let raw: [u8; 32] = mac.finalize().into_bytes().into();
	Ok(raw.into())
}


/// The lazy variant: all-ones if the path exists, all-zeros if it
/// doesn't.  Used by the missing-files pass, which only cares about
/// existence and would rather not read the whole disk to learn it.
pub(crate) fn compute_lazy(path: &Path) -> Fingerprint
{
	match std::fs::symlink_metadata(path) {
		Ok(_)  => Fingerprint::ones(),
		Err(_) => Fingerprint::zeros(),
	}
}


/// Check an on-disk path against an expected fingerprint.
pub(crate) fn check(path: &Path, expect: &Fingerprint, use_xattrs: bool)
		-> Result<(), HashErr>
{
	let got = compute(path, use_xattrs)?;
	if &got != expect
	{
		return Err(HashErr::Mismatch(expect.to_buf(), got.to_buf()));
	}
	Ok(())
}
