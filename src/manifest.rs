//! The update manifests.
//!
//! An OS version is described by a Manifest of Manifests (MoM) naming
//! per-bundle manifests by fingerprint, and each bundle manifest lists
//! the files that make up that bundle.  This module holds the data
//! model; parsing lives in parse, duplicate resolution in consolidate,
//! and the include graph in resolve.

/// Wire-format flag field handling
pub(crate) mod line;

/// Full parse (and render) of a manifest file
pub(crate) mod parse;

/// Merging file lists across bundles
pub(crate) mod consolidate;

/// The includes / also-add closure
pub(crate) mod resolve;


use std::path::PathBuf;

use crate::util::hash::Fingerprint;


/// The component name of the top-level manifest.
pub(crate) const MOM: &str = "MoM";


/// What a manifest entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FileKind
{
	Regular,
	Directory,
	Symlink,
	/// An entry in the MoM pointing at a bundle manifest
	#[strum(serialize = "manifest")]
	ManifestRef,
}


/// The orthogonal flag set on an entry.  The first eight come off the
/// wire; the rest get computed at runtime and never rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FileFlags
{
	pub(crate) deleted: bool,
	pub(crate) ghosted: bool,
	pub(crate) experimental: bool,
	pub(crate) config: bool,
	pub(crate) state: bool,
	pub(crate) boot: bool,
	pub(crate) rename: bool,
	pub(crate) exported: bool,

	// Runtime-only
	pub(crate) tracked: bool,
	pub(crate) orphan: bool,
	pub(crate) do_not_update: bool,
}


/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct File
{
	/// Path relative to the target root, kept byte-for-byte as
	/// published.
	pub(crate) path: PathBuf,

	pub(crate) kind: FileKind,
	pub(crate) flags: FileFlags,

	/// The content identity.  All-zeros for deleted entries.
	pub(crate) fingerprint: Fingerprint,

	/// The version this exact entry first appeared in.
	pub(crate) last_change: u32,
}

impl File
{
	/// Present = not a deletion.
	pub(crate) fn is_present(&self) -> bool { !self.flags.deleted }

	/// Does install/delete processing skip this entry?
	pub(crate) fn skip(&self) -> bool { self.flags.do_not_update }
}


/// A parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Manifest
{
	/// Bundle name, or "MoM" for the top
	pub(crate) component: String,

	/// Parser format the publisher wrote
	pub(crate) format: u32,

	/// The OS version this manifest belongs to
	pub(crate) version: u32,

	/// Published file count, for sanity checking
	pub(crate) filecount: u64,

	/// Published total content bytes
	pub(crate) contentsize: u64,

	/// Bundles this one requires
	pub(crate) includes: Vec<String>,

	/// Bundles this one pulls in unless optional content is disabled
	pub(crate) also_add: Vec<String>,

	/// Direct file entries (everything but kind M)
	pub(crate) files: Vec<File>,

	/// Sub-manifest references (kind M); only the MoM has these in
	/// practice
	pub(crate) manifests: Vec<File>,
}

impl Manifest
{
	pub(crate) fn is_mom(&self) -> bool { self.component == MOM }

	/// Find a sub-manifest reference by bundle name.
	pub(crate) fn submanifest(&self, name: &str) -> Option<&File>
	{
		self.manifests.iter()
				.find(|f| f.path.as_os_str().to_str() == Some(name))
	}

	/// The bundle names the MoM publishes.
	pub(crate) fn bundle_names(&self) -> Vec<String>
	{
		self.manifests.iter()
				.map(|f| f.path.to_string_lossy().into_owned())
				.collect()
	}
}
