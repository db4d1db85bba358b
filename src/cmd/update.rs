//! #0 update
//!
//! The full pipeline: version pointers, MoM pair, subscribed
//! manifests, change set, content, stage-all, rename-all, triggers.
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::acquire::Acquirer;
use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::core::pool::fetch::Artifact;
use crate::core::{delta, scripts, staging};
use crate::manifest::{File, FileKind, Manifest};
use crate::server::version as sv;
use crate::telemetry;
use crate::util::{path_join, plural};

use super::common;


/// A bundle with at least this many changed files gets its pack
/// scheduled; below it, per-file fullfiles win.
const PACK_MIN_CHANGES: usize = 10;


pub(crate) fn run(mut carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	// Extract our own args
	let args = match &carg.clargs.command {
		UpdCmds::Update(a) => a,
		_ => unreachable!("I'm an update, why does it think I'm not??"),
	};
	let want_version = args.version;
	let download_only = args.download_only;

	let sess = common::open_session(&carg.config, true)?;

	// Clock sanity before anything TLS.
	if carg.config.timecheck
	{
		sv::verify_time(carg.config.path())?;
	}

	let current = crate::info::version::current(carg.config.path())?;

	// Mirror health, before we trust its answers.
	check_mirror(&mut carg.config, &sess, current)?;
	let cfg = &carg.config;

	// Where are we going?
	let target = match want_version {
		Some(v) => v,
		None => sv::latest(&sess.http, cfg.version_url()?, cfg.format,
				&cfg.cert(), cfg.nosigcheck)?,
	};

	println!("Update started");
	println!("Preparing to update from {current} to {target}");

	if target <= current
	{
		println!("No updates available");
		return Ok(ExitStatus::Nothing);
	}

	let acq = Acquirer { cfg, sd: &sess.sd, http: &sess.http, tele: &sess.tele };

	// Both ends of the jump, signature-verified.
	let mom_cur = acq.mom(current)?;
	let mom_tgt = acq.mom(target)?;
	link_moms(&mom_cur, &mom_tgt);

	// What are we subscribed to, and what does that pull in at the
	// target?
	let subs = common::subscriptions(&sess, cfg)?;
	let tgt_manifests = common::resolve_subscribed(&acq, &mom_tgt,
			&subs, !cfg.skip_optional, |_| true)?;

	// The same bundles at the current version, where they exist; a
	// bundle new in this jump simply has no "from" side.
	let cur_manifests = load_current_side(&acq, &mom_cur,
			&tgt_manifests)?;

	let (tgt_set, triggers) = common::build_set(&tgt_manifests,
			&sess.tele);
	let (cur_set, _) = common::build_set(&cur_manifests, &sess.tele);
	let cur_by_path: BTreeMap<PathBuf, File> =
			staging::set_by_path(&cur_set);

	// The work set: what actually changes on disk.
	let mut work: Vec<File> = Vec::new();
	let mut need_content: Vec<&File> = Vec::new();
	for f in &tgt_set
	{
		if f.skip() { continue; }

		if f.flags.deleted
		{
			// Deletions new since our version get applied.
			if f.last_change > current
			{ work.push(f.clone()); }
			continue;
		}

		let changed = match cur_by_path.get(&f.path) {
			Some(peer) if peer.is_present() =>
				peer.fingerprint != f.fingerprint,
			_ => true,
		};
		if changed
		{
			work.push(f.clone());
			need_content.push(f);
		}
	}

	if work.is_empty()
	{
		println!("Nothing changed between {current} and {target}");
		finish_version(&sess, target)?;
		return Ok(ExitStatus::Ok);
	}

	println!("    {} file{} to change", work.len(), plural(work.len()));

	// Content acquisition: packs where dense enough, deltas where
	// published, fullfiles for the rest.
	let ctrl = common::fetch_ctrl(cfg, &sess)?;

	let packs = plan_packs(&cur_manifests, &tgt_manifests, current);
	if !packs.is_empty()
	{
		println!("Downloading {} pack{}...", packs.len(),
				plural(packs.len()));
		if let Err(e) = common::fetch_artifacts(&ctrl, packs)
		{
			// Packs only ever save time; fullfiles cover everything.
			eprintln!("Warning: pack download incomplete ({e}); \
					falling back to fullfiles");
		}
	}

	try_deltas(&sess, cfg, &need_content, &cur_by_path);

	// Fullfiles for whatever still isn't staged and verified.
	let mut fulls: Vec<Artifact> = Vec::new();
	for f in &need_content
	{
		fulls.push(Artifact::FullFile {
			fp: f.fingerprint,
			version: f.last_change,
		});
	}
	let bytes = common::fetch_artifacts(&ctrl, fulls)?;

	if download_only
	{
		println!("Download complete; {} file{} staged for a later \
				update", work.len(), plural(work.len()));
		return Ok(ExitStatus::Ok);
	}

	// The commit.
	let set_map = staging::set_by_path(&tgt_set);
	let ictx = staging::InstallCtx {
		root: cfg.path(),
		statedir: &sess.sd,
		set: &set_map,
	};
	println!("Staging file content");
	let stats = staging::install_files(&work, &ictx);

	for sf in &stats.stage_failures
	{ eprintln!("  Staging failed: {sf}"); }
	for rf in &stats.rename_failures
	{
		eprintln!("  Commit failed: {rf}");
		sess.tele.record(telemetry::Priority::Critical,
				telemetry::CLASS_RENAME_FAILURE,
				&serde_json::json!({ "failure": rf }));
	}

	if !stats.clean()
	{
		return Err(CmdErr::InstallIncomplete(
				stats.stage_failures.len() as u64,
				stats.rename_failures.len() as u64));
	}

	// Post-commit work, strictly after the second sync.
	scripts::run_triggers(&triggers, cfg.path());

	finish_version(&sess, target)?;

	sess.tele.record(telemetry::Priority::Info, telemetry::CLASS_UPDATE,
			&serde_json::json!({
				"from": current,
				"to": target,
				"files": work.len(),
				"bytes": bytes,
			}));

	println!("Update was applied ({} change{}, {} deletion{})",
			stats.staged, plural(stats.staged as usize),
			stats.deleted, plural(stats.deleted as usize));
	println!("Update successful - System updated from version \
			{current} to version {target}");
	Ok(ExitStatus::Ok)
}


/// Judge the mirror before using it, unsetting a hopeless one.
fn check_mirror(cfg: &mut crate::config::Config, sess: &common::Session,
		_current: u32) -> Result<(), CmdErr>
{
	if !cfg.mirror_active { return Ok(()); }

	let Some(upstream) = cfg.upstream_version_url.clone() else {
		return Ok(());
	};

	let upstream_latest = match sv::latest(&sess.http, &upstream,
			cfg.format, &cfg.cert(), cfg.nosigcheck) {
		Ok(v) => v,
		// Can't reach upstream either; leave the mirror be.
		Err(_) => return Ok(()),
	};

	let murl = cfg.version_url()?.clone();
	match sv::check_mirror(&sess.http, &murl, upstream_latest,
			cfg.format, &cfg.cert(), cfg.nosigcheck)
	{
		sv::MirrorStatus::Ok => (),
		sv::MirrorStatus::Lagging(n) => {
			eprintln!("Warning: configured mirror is {n} versions \
					behind upstream");
		},
		sv::MirrorStatus::Unset => {
			eprintln!("Warning: configured mirror is unreachable or \
					hopelessly stale; unsetting it");
			cfg.unset_mirror();
		},
	}
	Ok(())
}


/// Report how the two MoMs differ, bundle-wise.
fn link_moms(cur: &Manifest, tgt: &Manifest)
{
	use itertools::Itertools as _;

	let curset: BTreeMap<&std::path::Path, &File> = cur.manifests.iter()
			.map(|f| (f.path.as_path(), f)).collect();
	let tgtset: BTreeMap<&std::path::Path, &File> = tgt.manifests.iter()
			.map(|f| (f.path.as_path(), f)).collect();

	let mut new = 0u32;
	let mut changed = 0u32;
	let mut removed = 0u32;

	for name in curset.keys().chain(tgtset.keys()).unique()
	{
		match (curset.get(name), tgtset.get(name)) {
			(None, Some(_)) => new += 1,
			(Some(_), None) => removed += 1,
			(Some(c), Some(t)) => {
				if c.fingerprint != t.fingerprint { changed += 1; }
			},
			(None, None) => unreachable!("it came from somewhere"),
		}
	}

	println!("    {changed} bundle{} changed, {new} new, {removed} \
			removed", plural(changed as usize));
}


/// Load the current-version side of the subscribed manifests, for
/// bundles the current MoM actually has.
fn load_current_side(acq: &Acquirer, mom_cur: &Manifest,
		tgt: &BTreeMap<String, Manifest>)
		-> Result<BTreeMap<String, Manifest>, CmdErr>
{
	let mut out = BTreeMap::new();
	for name in tgt.keys()
	{
		let Some(mref) = mom_cur.submanifest(name) else { continue; };
		match acq.bundle(name, mref.last_change, &mref.fingerprint,
				None) {
			Ok(m) => { out.insert(name.clone(), m); },
			Err(e) => {
				// A bad "from" side only costs us deltas.
				eprintln!("Warning: couldn't load current manifest \
						for {name}: {e}");
			},
		}
	}
	Ok(out)
}


/// Which packs are worth fetching: bundles whose manifests changed
/// and carry enough changed files to beat per-file transfers.
fn plan_packs(cur: &BTreeMap<String, Manifest>,
		tgt: &BTreeMap<String, Manifest>, current: u32) -> Vec<Artifact>
{
	let mut packs = Vec::new();

	for (name, tm) in tgt
	{
		let Some(cm) = cur.get(name) else { continue; };
		if cm.version == tm.version { continue; }

		let curfps: std::collections::BTreeSet<_> = cm.files.iter()
				.filter(|f| f.is_present())
				.map(|f| f.fingerprint)
				.collect();
		let changes = tm.files.iter()
				.filter(|f| f.is_present() && !f.skip())
				.filter(|f| !curfps.contains(&f.fingerprint))
				.count();

		if changes >= PACK_MIN_CHANGES
		{
			packs.push(Artifact::Pack {
				bundle: name.clone(),
				from: current,
				to: tm.version,
			});
		}
	}

	packs
}


/// Try to satisfy work items from binary deltas the packs left in
/// delta/.  Quiet about every kind of failure; the fullfile pass mops
/// up.
fn try_deltas(sess: &common::Session, cfg: &crate::config::Config,
		need: &[&File], cur_by_path: &BTreeMap<PathBuf, File>)
{
	let staged_dir = sess.sd.staged_dir();

	for f in need
	{
		if f.kind != FileKind::Regular { continue; }

		// Already staged (a pack probably brought it)?
		if staged_dir.join(f.fingerprint.to_buf().as_ref()).exists()
		{ continue; }

		let Some(peer) = cur_by_path.get(&f.path) else { continue; };
		if !peer.is_present() || peer.kind != FileKind::Regular
		{ continue; }

		let dfile = sess.sd.delta_file(peer.last_change, f.last_change,
				&peer.fingerprint.to_buf(), &f.fingerprint.to_buf());
		if !dfile.is_file() { continue; }

		let from_disk = path_join(cfg.path(), &f.path);
		if !from_disk.is_file() { continue; }

		match delta::apply(&from_disk, &dfile, &staged_dir,
				&f.fingerprint) {
			Ok(_) => (),
			Err(e) => {
				eprintln!("  (delta for {} didn't apply: {e})",
						f.path.display());
			},
		}
	}
}


/// Record the version this statedir now represents.
fn finish_version(sess: &common::Session, target: u32)
		-> Result<(), CmdErr>
{
	std::fs::write(sess.sd.version_file(), format!("{target}\n"))?;
	Ok(())
}
