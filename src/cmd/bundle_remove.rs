//! #0 bundle-remove
//!
//! Remove bundles and the files only they own.  Anything another
//! installed bundle still claims stays; anything the heuristics call
//! user territory stays; and removal is refused outright while other
//! installed bundles require the target, unless --force takes those
//! down too.
use std::collections::{BTreeMap, BTreeSet};

use crate::acquire::Acquirer;
use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::manifest::{resolve, File, Manifest};
use crate::core::staging;
use crate::server::version as sv;
use crate::util::plural;

use super::common;


pub(crate) fn run(carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	let args = match &carg.clargs.command {
		UpdCmds::BundleRemove(a) => a,
		_ => unreachable!("I'm a bundle-remove, why does it think I'm not??"),
	};
	let cfg = &carg.config;

	let sess = common::open_session(cfg, true)?;

	if cfg.timecheck
	{
		sv::verify_time(cfg.path())?;
	}

	let current = crate::info::version::current(cfg.path())?;
	let acq = Acquirer { cfg, sd: &sess.sd, http: &sess.http, tele: &sess.tele };
	let mom = acq.mom(current)?;

	let installed = common::subscriptions(&sess, cfg)?;

	// Sanity on the requests first.
	for name in &args.bundles
	{
		if name == common::CORE_BUNDLE
		{
			return Err(CmdErr::RequiredBundle(name.clone(),
					vec!["the OS itself".to_string()]));
		}
		if !installed.contains(name)
		{
			return Err(CmdErr::NotTracked(name.clone()));
		}
	}

	// Load every installed bundle's manifest; we need the full
	// picture both for requires-checks and for what files survive.
	let all = common::resolve_subscribed(&acq, &mom, &installed,
			!cfg.skip_optional, |_| true)?;

	// Who requires what we're removing?
	let mut removal: BTreeSet<String> =
			args.bundles.iter().cloned().collect();

	for name in &args.bundles
	{
		let deps = resolve::dependents(name, all.values(), &removal);
		if deps.is_empty() { continue; }

		match args.force {
			false => {
				eprintln!("Bundle {name} is required by: {}",
						deps.join(", "));
				return Err(CmdErr::RequiredBundle(name.clone(), deps));
			},
			true => {
				println!("Also removing dependent bundle{}: {}",
						plural(deps.len()), deps.join(", "));
				removal.extend(deps);
			},
		}
	}

	// What survives, and what it still claims.
	let keep: BTreeMap<String, Manifest> = all.iter()
			.filter(|(n, _)| !removal.contains(*n))
			.map(|(n, m)| (n.clone(), m.clone()))
			.collect();
	let (keep_set, _) = common::build_set(&keep, &sess.tele);
	let claimed: BTreeSet<&std::path::Path> = keep_set.iter()
			.filter(|f| f.is_present())
			.map(|f| f.path.as_path())
			.collect();

	// The removal set's exclusive files become deletions.
	let gone: BTreeMap<String, Manifest> = all.iter()
			.filter(|(n, _)| removal.contains(*n))
			.map(|(n, m)| (n.clone(), m.clone()))
			.collect();
	let (gone_set, _) = common::build_set(&gone, &sess.tele);

	let mut work: Vec<File> = Vec::new();
	for f in &gone_set
	{
		if !f.is_present() || f.skip() { continue; }
		if claimed.contains(f.path.as_path()) { continue; }

		let mut del = f.clone();
		del.flags.deleted = true;
		del.fingerprint = crate::util::hash::Fingerprint::zeros();
		work.push(del);
	}

	println!("Removing {} bundle{} ({} file{})...",
			removal.len(), plural(removal.len()),
			work.len(), plural(work.len()));

	let set_map = staging::set_by_path(&keep_set);
	let ictx = staging::InstallCtx {
		root: cfg.path(),
		statedir: &sess.sd,
		set: &set_map,
	};
	let stats = staging::install_files(&work, &ictx);

	for rf in &stats.rename_failures
	{ eprintln!("  Removal failed: {rf}"); }

	for name in &removal
	{
		sess.sd.untrack_bundle(name)?;
	}

	if !stats.clean()
	{
		return Err(CmdErr::InstallIncomplete(0,
				stats.rename_failures.len() as u64));
	}

	println!("Successfully removed {} bundle{}", removal.len(),
			plural(removal.len()));
	Ok(ExitStatus::Ok)
}
