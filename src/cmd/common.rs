//! Shared driver plumbing: the pieces every command sequence starts
//! with (statedir, lock, transport, telemetry), subscription handling,
//! manifest closure loading, and the content-fetch step with its
//! retry-once policy.
use std::collections::BTreeMap;

use crate::acquire::Acquirer;
use crate::command::CmdErr;
use crate::config::Config;
use crate::core::heuristics::{self, Triggers};
use crate::core::pool::fetch::{self, Artifact};
use crate::info::mounts::MountTable;
use crate::manifest::{consolidate, resolve, File, Manifest};
use crate::server::http::Fetcher;
use crate::statedir::StateDir;
use crate::telemetry::{self, Telemetry};


/// The bundle everything always has.
pub(crate) const CORE_BUNDLE: &str = "os-core";


/// What every command sequence carries around.
pub(crate) struct Session
{
	pub(crate) sd: StateDir,
	pub(crate) http: Fetcher,
	pub(crate) tele: Telemetry,
}


/// Open (and usually lock) the statedir, and set up transport and
/// telemetry.
pub(crate) fn open_session(cfg: &Config, lock: bool)
		-> Result<Session, CmdErr>
{
	let mut sd = StateDir::open(cfg.statedir(),
			cfg.statedir_cache.as_deref())?;
	if lock { sd.lock()?; }

	let tele = Telemetry::new(sd.telemetry_dir());
	Ok(Session { sd, http: Fetcher::new(), tele })
}


/// The subscribed bundle list: tracking sentinels, seeded from the
/// image's bundle directory when the statedir is fresh, with the core
/// bundle always present.
pub(crate) fn subscriptions(sess: &Session, cfg: &Config)
		-> Result<Vec<String>, CmdErr>
{
	let mut subs = sess.sd.installed_bundles()?;

	if subs.is_empty()
	{
		// A fresh statedir on an installed image: the image knows
		// what it has.
		let imgdir = crate::util::path_join(cfg.path(),
				"usr/share/clear/bundles");
		if let Ok(rd) = std::fs::read_dir(&imgdir)
		{
			for ent in rd.flatten()
			{
				let name = ent.file_name().to_string_lossy().into_owned();
				sess.sd.track_bundle(&name)?;
				subs.push(name);
			}
		}
	}

	if !subs.iter().any(|b| b == CORE_BUNDLE)
	{
		sess.sd.track_bundle(CORE_BUNDLE)?;
		subs.push(CORE_BUNDLE.to_string());
	}

	subs.sort();
	subs.dedup();
	Ok(subs)
}


/// Resolve the include closure over a MoM for a set of root bundles,
/// acquiring (and pin-verifying) every manifest involved.  Returns
/// them by name.  The filter prunes whole subtrees; bundle-add uses it
/// to stop at anything already installed.
pub(crate) fn resolve_subscribed(acq: &Acquirer, mom: &Manifest,
		roots: &[String], with_optional: bool,
		filter: impl FnMut(&str) -> bool)
		-> Result<BTreeMap<String, Manifest>, CmdErr>
{
	let mut loaded: BTreeMap<String, Manifest> = BTreeMap::new();

	let names = resolve::closure(roots, with_optional, filter,
			|name: &str| -> Result<Option<Manifest>, crate::acquire::AcquireErr> {
				let Some(mref) = mom.submanifest(name) else {
					return Ok(None);
				};
				let m = acq.bundle(name, mref.last_change,
						&mref.fingerprint, None)?;
				Ok(Some(m))
			});

	let names = match names {
		Ok(n) => n,
		Err(resolve::ResolveErr::Unknown(n)) =>
			return Err(CmdErr::InvalidBundle(n)),
		Err(resolve::ResolveErr::Load(e)) =>
			return Err(CmdErr::Recurse(e.to_string())),
	};

	// The closure walked every manifest already; walk it again off
	// the cache to keep ownership simple.  Cache hits make the second
	// pass cheap.
	for name in names
	{
		let mref = mom.submanifest(&name)
				.expect("closure only returns known names");
		let m = acq.bundle(&name, mref.last_change, &mref.fingerprint,
				None)?;
		loaded.insert(name, m);
	}

	Ok(loaded)
}


/// Pour a set of manifests into one classified, consolidated file
/// list.  Hash conflicts between bundles become telemetry and drop
/// both claimants.
pub(crate) fn build_set(manifests: &BTreeMap<String, Manifest>,
		tele: &Telemetry) -> (Vec<File>, Triggers)
{
	let mut files: Vec<File> = Vec::new();
	for m in manifests.values()
	{
		files.extend(m.files.iter().cloned());
	}

	let mounts = MountTable::load();
	let triggers = heuristics::apply(&mut files, &mounts);

	let (set, conflicts) = consolidate::consolidate(files);
	for c in &conflicts
	{
		eprintln!("Warning: bundles disagree about {}; ignoring both",
				c.path.display());
		tele.record(telemetry::Priority::Critical,
				telemetry::CLASS_HASH_CONFLICT,
				&serde_json::json!({
					"path": c.path.display().to_string(),
					"hash_a": c.fp_a.to_buf().as_ref(),
					"hash_b": c.fp_b.to_buf().as_ref(),
				}));
	}

	(set, triggers)
}


/// Build the transfer pool control for a session.
pub(crate) fn fetch_ctrl(cfg: &Config, sess: &Session)
		-> Result<fetch::Control, CmdErr>
{
	Ok(fetch::Control {
		http: sess.http.clone(),
		content_url: cfg.content_url()?.clone(),
		staged: sess.sd.staged_dir(),
		download: sess.sd.download_dir(),
		delta: sess.sd.delta_dir(),
		packdir: sess.sd.root().to_path_buf(),
	})
}


/// Run a set of artifacts through the transfer pool, re-enqueueing
/// transient failures once.  Success means everything landed; what
/// still fails after the retry pass comes back as the error.
pub(crate) fn fetch_artifacts(ctrl: &fetch::Control,
		arts: Vec<Artifact>) -> Result<u64, CmdErr>
{
	if arts.is_empty() { return Ok(0); }

	let pool = fetch::Fetch::new(ctrl, &arts);
	let mut res = pool.run_transfers(ctrl, arts)?;
	let mut bytes = res.bytes_fetched();

	if !res.retry.is_empty()
	{
		println!("Retrying {} failed transfer{}...", res.retry.len(),
				crate::util::plural(res.retry.len()));
		let again = fetch::Fetch::new(ctrl, &res.retry);
		let res2 = again.run_transfers(ctrl, std::mem::take(&mut res.retry))?;
		bytes += res2.bytes_fetched();
		res.retry = res2.retry;
		res.fatal.extend(res2.fatal);
	}

	if res.retry.is_empty() && res.fatal.is_empty()
	{
		return Ok(bytes);
	}

	// Sort the leavings into the right error shape.
	let mut failed_files = Vec::new();
	let mut failed_pack = None;
	for a in res.retry.iter()
			.chain(res.fatal.iter().map(|e| &e.artifact))
	{
		match a {
			Artifact::FullFile { .. } => failed_files.push(a.describe()),
			Artifact::Pack { .. } => failed_pack = Some(a.describe()),
		}
	}

	for e in &res.fatal
	{
		eprintln!("  {e}");
	}

	match failed_files.is_empty() {
		false => Err(CmdErr::DownloadFiles(failed_files)),
		true => Err(CmdErr::DownloadPack(
				failed_pack.unwrap_or_default())),
	}
}
