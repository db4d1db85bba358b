//! Central command handling: dispatch, the error taxonomy, and the
//! mapping of both onto the closed exit-code set.

/// Command-line parsing and handling
mod line;
pub use line::UpdArgs;
pub(crate) use line::UpdCmds;
#[cfg(test)]
pub(crate) use line::{UpdCmdClean, UpdCmdBundleRemove, UpdCmdBundleAdd};
pub use line::parse;

use std::process::ExitCode;


/// The closed set of exit codes.  0 and 1 are pinned (success, and
/// "nothing to do" respectively); the rest are stable small integers
/// that scripts and the companion daemon key off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus
{
	Ok = 0,
	Nothing = 1,
	SignatureVerificationFailed = 2,
	CouldntLoadMom = 3,
	CouldntLoadManifest = 4,
	RecurseManifest = 5,
	InvalidBundle = 6,
	InvalidOption = 7,
	CurrentVersionUnknown = 8,
	ServerConnectionError = 9,
	CouldntDownloadFile = 10,
	CouldntDownloadPack = 11,
	CouldntCreateDir = 12,
	CouldntCreateFile = 13,
	CouldntRenameDir = 14,
	CouldntRenameFile = 15,
	CouldntRemoveFile = 16,
	CouldntUntarFile = 17,
	CouldntWriteFile = 18,
	CouldntListDir = 19,
	SubprocessError = 20,
	LockFileFailed = 21,
	BadTime = 22,
	PathNotInManifest = 23,
	UnexpectedCondition = 24,
	RequiredBundleError = 25,
	BundleNotTracked = 26,
	DiskSpaceError = 27,
	VerifyFailed = 28,
}

impl From<ExitStatus> for ExitCode
{
	fn from(s: ExitStatus) -> Self
	{
		ExitCode::from(s as u8)
	}
}


/// The internal error taxonomy.  Every subsystem error folds in here,
/// and status() says what the process exits with.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum CmdErr
{
	#[error("{0}")]
	Config(#[from] crate::config::ConfigErr),

	#[error("{0}")]
	StateDir(#[from] crate::statedir::StateDirErr),

	#[error("Couldn't determine current version: {0}")]
	CurrentVersion(#[from] crate::info::version::VersionErr),

	#[error("{0}")]
	Pointer(#[from] crate::server::version::PointerErr),

	#[error("{0}")]
	Time(#[from] crate::server::version::TimeErr),

	#[error("{0}")]
	Acquire(#[from] crate::acquire::AcquireErr),

	#[error("Unknown bundle: {0}")]
	InvalidBundle(String),

	#[error("Couldn't recurse included manifests: {0}")]
	Recurse(String),

	#[error("{} files failed to download", .0.len())]
	DownloadFiles(Vec<String>),

	#[error("Pack download failed: {0}")]
	DownloadPack(String),

	#[error("{0}")]
	Stage(#[from] crate::core::staging::StageErr),

	#[error("Install incomplete: {0} stage failures, {1} rename failures")]
	InstallIncomplete(u64, u64),

	#[error("Bundle {0} is required by: {}", .1.join(", "))]
	RequiredBundle(String, Vec<String>),

	#[error("Bundle not tracked: {0}")]
	NotTracked(String),

	#[error("Problems remain after repair")]
	VerifyFailed,

	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("{0}")]
	Other(#[from] anyhow::Error),
}

impl CmdErr
{
	pub(crate) fn status(&self) -> ExitStatus
	{
		use ExitStatus as ES;
		use CmdErr as E;

		match self {
			E::Config(_) => ES::InvalidOption,

			E::StateDir(e) => {
				use crate::statedir::StateDirErr as SDE;
				match e {
					SDE::LockHeld(_) => ES::LockFileFailed,
					SDE::IO(_) => ES::CouldntCreateDir,
					_ => ES::UnexpectedCondition,
				}
			},

			E::CurrentVersion(_) => ES::CurrentVersionUnknown,

			E::Pointer(e) => {
				use crate::server::version::PointerErr as PE;
				match e {
					PE::Signature(_) | PE::SigFetch(_) =>
						ES::SignatureVerificationFailed,
					_ => ES::ServerConnectionError,
				}
			},

			E::Time(_) => ES::BadTime,

			E::Acquire(e) => {
				use crate::acquire::AcquireErr as AE;
				match e {
					AE::Mom(_, _) => ES::CouldntLoadMom,
					AE::Signature(_) | AE::SigFetch(_) =>
						ES::SignatureVerificationFailed,
					AE::Fetch(_) => ES::ServerConnectionError,
					AE::Config(_) => ES::InvalidOption,
					_ => ES::CouldntLoadManifest,
				}
			},

			E::InvalidBundle(_) => ES::InvalidBundle,
			E::Recurse(_) => ES::RecurseManifest,
			E::DownloadFiles(_) => ES::CouldntDownloadFile,
			E::DownloadPack(_) => ES::CouldntDownloadPack,

			E::Stage(e) => {
				use crate::core::staging::StageErr as SE;
				match e {
					SE::CreateDir(_, _) => ES::CouldntCreateDir,
					SE::CreateFile(_, _) => ES::CouldntCreateFile,
					SE::RenameFile(_, _) => ES::CouldntRenameFile,
					SE::RenameDir(_, _) => ES::CouldntRenameDir,
					SE::RemoveFile(_, _) => ES::CouldntRemoveFile,
					SE::MissingStaged(_, _) => ES::CouldntCreateFile,
					SE::IO(_) => ES::UnexpectedCondition,
				}
			},

			E::InstallIncomplete(stage, _rename) => match stage {
				0 => ES::CouldntRenameFile,
				_ => ES::CouldntCreateFile,
			},

			E::RequiredBundle(_, _) => ES::RequiredBundleError,
			E::NotTracked(_) => ES::BundleNotTracked,
			E::VerifyFailed => ES::VerifyFailed,
			E::IO(_) => ES::UnexpectedCondition,
			E::Other(_) => ES::UnexpectedCondition,
		}
	}
}


/// The public face of a failure: what to print, what to exit with.
#[derive(Debug)]
pub struct RunErr
{
	what: String,
	status: ExitStatus,
}

impl std::fmt::Display for RunErr
{
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
	{ write!(f, "{}", self.what) }
}

impl RunErr
{
	pub fn exit_status(&self) -> ExitStatus { self.status }
}

impl From<CmdErr> for RunErr
{
	fn from(e: CmdErr) -> Self
	{
		Self { what: format!("{e}"), status: e.status() }
	}
}


/// Pass a bunch of info to the individual command runners as a block
#[derive(Debug)]
pub(crate) struct CmdArg
{
	/// The command-line args
	pub(crate) clargs: UpdArgs,

	/// The working config
	pub(crate) config: crate::config::Config,
}


/// Dispatch a command
pub fn run(clargs: UpdArgs) -> Result<ExitCode, RunErr>
{
	// Load up config
	let config = crate::config::build(&clargs)
			.map_err(|e| RunErr::from(CmdErr::from(e)))?;

	// Any early initialization
	init(&clargs);

	let carg = CmdArg { clargs, config };

	use crate::cmd;
	use line::UpdCmds as UC;
	let status: ExitStatus = match carg.clargs.command {
		UC::CheckUpdate => cmd::check_update::run(carg),
		UC::Update{..} => cmd::update::run(carg),
		UC::BundleAdd{..} => cmd::bundle_add::run(carg),
		UC::BundleRemove{..} => cmd::bundle_remove::run(carg),
		UC::Diagnose{..} => cmd::diagnose::run(carg, false),
		UC::Repair{..} => cmd::diagnose::run(carg, true),
		UC::Clean{..} => cmd::clean::run(carg),
		UC::HashDump{..} => cmd::hashdump::run(carg),

		// Fake
		#[cfg(test)]
		UC::Dummy => unreachable!("Not a real thing"),
	}?;

	Ok(status.into())
}


/// Do any initialization we care about
fn init(clargs: &UpdArgs)
{
	// Init cached euid; we don't change perms during the run, so...
	crate::util::set_euid();

	// Parallelism knobs
	crate::core::pool::init_jobs(&clargs.jobs_net, &clargs.jobs_cpu);
}
