//! Command line handling
//!
//! General invocation:
//! $0 [options] <command> [command-opts]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

// Add extra default'ing to make config tests easier

/// Main arg entry point
#[cfg_attr(test, derive(Default))]
#[derive(Debug)]
#[derive(Parser)]
#[command(about = "Atomic OS image updates.  Today.")]
#[command(version)]
pub struct UpdArgs
{
	#[command(subcommand)]
	pub(crate) command: UpdCmds,

	/// Operate on the OS tree mounted at a given path.
	///
	/// By default, we operate on `/`, which is to say we update the
	/// system you're running on.  Pointing this elsewhere is how you
	/// update a chroot, an image being built, or a mounted-but-not-
	/// booted system.
	#[arg(short, long)]
	pub(crate) path: Option<PathBuf>,

	/// Where downloaded and staged content is cached.
	///
	/// One statedir serves one target tree; sharing one between
	/// multiple `--path`'s will work content-wise (it's all addressed
	/// by fingerprint) but the version and subscription tracking would
	/// fight.
	#[arg(short = 'S', long)]
	pub(crate) statedir: Option<PathBuf>,

	/// A read-only secondary cache consulted before downloading.
	///
	/// Useful when a previous statedir (or one shared over NFS or a
	/// bind mount) already holds most of what an update needs.
	#[arg(long)]
	pub(crate) statedir_cache: Option<PathBuf>,

	/// Base URL for content (manifests, files, packs).
	#[arg(short = 'u', long)]
	pub(crate) contenturl: Option<Url>,

	/// Base URL for version pointers.
	#[arg(short = 'v', long)]
	pub(crate) versionurl: Option<Url>,

	/// Manifest format generation to follow.
	#[arg(short = 'F', long)]
	pub(crate) format: Option<u32>,

	/// Certificate used to verify MoM and version signatures.
	#[arg(short = 'C', long)]
	pub(crate) certpath: Option<PathBuf>,

	/// Skip all signature verification.  LOUDLY.
	///
	/// With this set, nothing proves the content you install came
	/// from your distributor.  It exists for development and for
	/// closed networks with their own integrity story.
	#[arg(short = 'n', long)]
	pub(crate) nosigcheck: bool,

	/// Allow plain http:// URLs.
	#[arg(long)]
	pub(crate) allow_insecure_http: bool,

	/// Leave optional (also-add) bundles out of dependency closures.
	#[arg(long)]
	pub(crate) skip_optional: bool,

	/// Skip the clock-sanity check against the image versionstamp.
	#[arg(long)]
	pub(crate) no_time_check: bool,

	/// How many CPU-bound threads to run in parallel
	/// (default numcpu up to 6).
	///
	/// This affects local CPU-bound tasks, which for us is mostly
	/// fingerprinting trees of files.
	#[arg(short = 'j', long)]
	pub(crate) jobs_cpu: Option<u32>,

	/// How many network transfers to keep in flight (default 25).
	///
	/// Raising this _may_ speed things up, but also may not, and will
	/// add to server load.
	#[arg(short = 'J', long)]
	pub(crate) jobs_net: Option<u32>,
}



/// Individual subcommands and their args
#[cfg_attr(test, derive(Default))]
#[derive(Debug)]
#[derive(Subcommand)]
pub(crate) enum UpdCmds
{
	/// Dummy value (mostly to make derive(Default) happy...)
	#[cfg(test)]
	#[cfg_attr(test, default)]
	#[command(skip)]
	Dummy,

	/// Check whether a newer OS version is published.
	///
	/// Reads the installed version and asks the server for the latest
	/// in our format.  Touches nothing.
	CheckUpdate,

	/// Update the OS to the latest (or a given) version.
	///
	/// This is the full pipeline: fetch and verify manifests, work
	/// out the change set, download content, stage everything, and
	/// atomically commit.  An interrupted update is safe to re-run;
	/// verified content already in the cache is reused.
	Update(UpdCmdUpdate),

	/// Install additional bundles.
	///
	/// Bundles are added at the currently installed OS version,
	/// along with everything they include.
	BundleAdd(UpdCmdBundleAdd),

	/// Remove installed bundles.
	///
	/// Files exclusive to the removed bundles are deleted; anything
	/// another installed bundle still claims stays put.  Removal is
	/// refused if other installed bundles require the target, unless
	/// `--force` removes those too.
	BundleRemove(UpdCmdBundleRemove),

	/// Report how far the installed tree has drifted from its
	/// manifests.
	///
	/// Checks for missing files, content mismatches, and leftover
	/// files that should have been deleted.  `--picky` additionally
	/// hunts files nothing claims.  Reports only; `repair` fixes.
	Diagnose(UpdCmdDiagnose),

	/// Repair the installed tree back to what its manifests say.
	///
	/// The same checks as `diagnose`, but problems get fixed: missing
	/// and mismatched files are re-downloaded and reinstalled,
	/// orphaned deletions are removed.  Removal passes are skipped if
	/// any repair failed, so a half-fixed tree never loses data.
	Repair(UpdCmdDiagnose),

	/// Prune the download cache.
	///
	/// Without options, drops staged content, downloaded archives,
	/// deltas, and manifests for versions the current MoM no longer
	/// references.  `--all` empties the cache entirely.
	Clean(UpdCmdClean),

	/// Print the fingerprint of a path on disk.
	#[command(name = "hashdump")]
	HashDump(UpdCmdHashDump),
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdUpdate
{
	/// Update to this version instead of the server's latest.
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Download and stage everything, but don't commit.
	///
	/// A later plain `update` picks the staged content out of the
	/// cache and goes straight to committing.
	#[arg(long)]
	pub(crate) download_only: bool,
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdBundleAdd
{
	/// Bundle names to install.
	#[arg(required = true)]
	pub(crate) bundles: Vec<String>,
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdBundleRemove
{
	/// Bundle names to remove.
	#[arg(required = true)]
	pub(crate) bundles: Vec<String>,

	/// Also remove installed bundles that require these.
	#[arg(long)]
	pub(crate) force: bool,
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdDiagnose
{
	/// Diagnose against this version instead of the installed one.
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Limit the walk to these bundles (default: all installed).
	#[arg(short = 'B', long)]
	pub(crate) bundles: Vec<String>,

	/// Also hunt files in the picky tree that no manifest claims.
	#[arg(long)]
	pub(crate) picky: bool,

	/// Existence checks only; skip content fingerprinting.
	#[arg(long)]
	pub(crate) quick: bool,

	/// ONLY hunt unclaimed files; skip the manifest-driven passes.
	#[arg(long)]
	pub(crate) extra_files_only: bool,

	/// Where the picky hunt happens.
	#[arg(long, default_value = "/usr")]
	pub(crate) picky_tree: PathBuf,

	/// Regex of paths the picky hunt leaves alone.
	#[arg(long)]
	pub(crate) picky_whitelist: Option<String>,
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdClean
{
	/// Empty the cache entirely, not just stale bits.
	#[arg(long)]
	pub(crate) all: bool,

	/// Report what would go and how much space it frees, touching
	/// nothing.
	#[arg(long)]
	pub(crate) dry_run: bool,
}


#[cfg_attr(test, derive(Default))]
#[derive(Debug, clap::Args)]
pub(crate) struct UpdCmdHashDump
{
	/// The file to fingerprint.
	pub(crate) target: PathBuf,

	/// Treat the target as relative to this root.
	#[arg(short, long)]
	pub(crate) path: Option<PathBuf>,
}


/// Parse the command line.
pub fn parse() -> UpdArgs
{
	UpdArgs::parse()
}
