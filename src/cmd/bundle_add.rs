//! #0 bundle-add
//!
//! Install bundles at the currently running version: resolve their
//! include closure, fetch content for whatever isn't already on disk,
//! and commit it through the same staging engine updates use.
use crate::acquire::Acquirer;
use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::core::pool::fetch::Artifact;
use crate::core::{scripts, staging};
use crate::server::version as sv;
use crate::util::{path_join, plural};

use super::common;


pub(crate) fn run(carg: CmdArg) -> Result<ExitStatus, CmdErr>
{
	let args = match &carg.clargs.command {
		UpdCmds::BundleAdd(a) => a,
		_ => unreachable!("I'm a bundle-add, why does it think I'm not??"),
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

	// Every requested name has to be published before we start.
	for name in &args.bundles
	{
		if mom.submanifest(name).is_none()
		{
			return Err(CmdErr::InvalidBundle(name.clone()));
		}
	}

	// Skip what's already tracked.
	let installed = common::subscriptions(&sess, cfg)?;
	let fresh: Vec<String> = args.bundles.iter()
			.filter(|b| !installed.contains(b))
			.cloned().collect();
	if fresh.is_empty()
	{
		println!("All requested bundles are already installed");
		return Ok(ExitStatus::Nothing);
	}

	// The closure pulls in includes (and also-adds unless disabled);
	// already-installed bundles prune their own subtrees.
	let manifests = common::resolve_subscribed(&acq, &mom, &fresh,
			!cfg.skip_optional, |n| !installed.contains(&n.to_string()))?;

	let (set, triggers) = common::build_set(&manifests, &sess.tele);

	// Only what isn't already on disk needs content and installing;
	// shared includes mean plenty may already be there.
	let mut work = Vec::new();
	let mut arts = Vec::new();
	for f in &set
	{
		if f.skip() || f.flags.deleted { continue; }
		let ondisk = path_join(cfg.path(), &f.path);
		if ondisk.exists() || ondisk.is_symlink() { continue; }

		arts.push(Artifact::FullFile {
			fp: f.fingerprint,
			version: f.last_change,
		});
		work.push(f.clone());
	}

	println!("Installing {} bundle{} ({} file{})...",
			fresh.len(), plural(fresh.len()),
			work.len(), plural(work.len()));

	let ctrl = common::fetch_ctrl(cfg, &sess)?;
	common::fetch_artifacts(&ctrl, arts)?;

	let set_map = staging::set_by_path(&set);
	let ictx = staging::InstallCtx {
		root: cfg.path(),
		statedir: &sess.sd,
		set: &set_map,
	};
	let stats = staging::install_files(&work, &ictx);

	for sf in &stats.stage_failures
	{ eprintln!("  Staging failed: {sf}"); }
	for rf in &stats.rename_failures
	{ eprintln!("  Commit failed: {rf}"); }

	if !stats.clean()
	{
		return Err(CmdErr::InstallIncomplete(
				stats.stage_failures.len() as u64,
				stats.rename_failures.len() as u64));
	}

	// Track the whole closure; includes are subscriptions too.
	for name in manifests.keys()
	{
		sess.sd.track_bundle(name)?;
	}

	scripts::run_triggers(&triggers, cfg.path());

	println!("Successfully installed {} bundle{}", fresh.len(),
			plural(fresh.len()));
	Ok(ExitStatus::Ok)
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::command::UpdArgs;
	use crate::statedir::StateDir;
	use crate::util::hash;
	use std::path::PathBuf;

	struct World
	{
		td: tempfile::TempDir,
	}

	impl World
	{
		fn new() -> Self
		{
			crate::util::set_euid();
			let td = tempfile::tempdir().unwrap();
			std::fs::create_dir_all(td.path().join("server")).unwrap();
			std::fs::create_dir_all(td.path().join("scratch")).unwrap();

			let root = td.path().join("root");
			std::fs::create_dir_all(root.join("usr/bin")).unwrap();
			std::fs::create_dir_all(root.join("usr/lib")).unwrap();
			std::fs::write(root.join("usr/lib/os-release"),
					"VERSION_ID=10\n").unwrap();

			World { td }
		}

		fn server(&self) -> PathBuf { self.td.path().join("server") }
		fn root(&self) -> PathBuf { self.td.path().join("root") }
		fn statedir(&self) -> PathBuf { self.td.path().join("state") }

		fn publish_manifest(&self, name: &str, text: &str)
				-> crate::util::hash::Fingerprint
		{
			let mf = self.td.path().join(
					format!("scratch/Manifest.{name}"));
			std::fs::write(&mf, text).unwrap();
			let fp = hash::compute(&mf, false).unwrap();

			let vdir = self.server().join("10");
			std::fs::create_dir_all(&vdir).unwrap();
			let tarfh = std::fs::File::create(
					vdir.join(format!("Manifest.{name}.tar"))).unwrap();
			let mut b = tar::Builder::new(tarfh);
			b.append_path_with_name(&mf, format!("Manifest.{name}"))
					.unwrap();
			b.finish().unwrap();

			fp
		}

		fn publish_file(&self, contents: &[u8])
				-> crate::util::hash::Fingerprint
		{
			let tmpf = self.td.path().join("scratch/content");
			std::fs::write(&tmpf, contents).unwrap();
			let fp = hash::compute(&tmpf, true).unwrap();
			let fpb = fp.to_buf();

			let fdir = self.server().join("10/files");
			std::fs::create_dir_all(&fdir).unwrap();
			let tarfh = std::fs::File::create(
					fdir.join(format!("{fpb}.tar"))).unwrap();
			let mut b = tar::Builder::new(tarfh);
			b.append_path_with_name(&tmpf, fpb.as_ref()).unwrap();
			b.finish().unwrap();

			fp
		}

		fn args(&self, bundles: &[&str]) -> CmdArg
		{
			use crate::command::{UpdCmds, UpdCmdBundleAdd};

			let mut clargs = UpdArgs::default();
			clargs.command = UpdCmds::BundleAdd(UpdCmdBundleAdd {
				bundles: bundles.iter().map(|s| s.to_string()).collect(),
			});
			clargs.path = Some(self.root());
			clargs.statedir = Some(self.statedir());
			clargs.contenturl = Some(
					url::Url::from_directory_path(self.server()).unwrap());
			clargs.versionurl = Some(
					url::Url::from_directory_path(self.server()).unwrap());
			clargs.nosigcheck = true;
			let config = crate::config::build(&clargs).unwrap();
			CmdArg { clargs, config }
		}
	}

	fn publish_world(w: &World)
			-> crate::util::hash::Fingerprint
	{
		let osrel = hash::compute(
				&w.root().join("usr/lib/os-release"), true).unwrap();
		let editor = w.publish_file(b"the editor binary");

		let core = format!("MANIFEST\t1\n\
			version:\t10\n\
			filecount:\t1\n\
			contentsize:\t10\n\
			\n\
			F...\t{}\t10\t/usr/lib/os-release\n", osrel.to_buf());
		let editors = format!("MANIFEST\t1\n\
			version:\t10\n\
			filecount:\t1\n\
			contentsize:\t10\n\
			includes:\tos-core\n\
			\n\
			F...\t{}\t10\t/usr/bin/editor\n", editor.to_buf());

		let core_fp = w.publish_manifest("os-core", &core);
		let editors_fp = w.publish_manifest("editors", &editors);

		let mom = format!("MANIFEST\t1\n\
			version:\t10\n\
			filecount:\t2\n\
			contentsize:\t0\n\
			\n\
			M...\t{}\t10\tos-core\n\
			M...\t{}\t10\teditors\n",
			core_fp.to_buf(), editors_fp.to_buf());
		w.publish_manifest("MoM", &mom);

		editor
	}

	#[test]
	fn installs_new_bundle()
	{
		let w = World::new();
		let editor_fp = publish_world(&w);

		let st = run(w.args(&["editors"])).unwrap();
		assert_eq!(st, ExitStatus::Ok);

		let got = w.root().join("usr/bin/editor");
		assert_eq!(std::fs::read(&got).unwrap(), b"the editor binary");
		hash::check(&got, &editor_fp, true)
				.expect("installed bundle content verifies");

		let sd = StateDir::open(&w.statedir(), None).unwrap();
		assert!(sd.bundle_sentinel("editors").is_file());

		// A second add is a no-op
		let st = run(w.args(&["editors"])).unwrap();
		assert_eq!(st, ExitStatus::Nothing);
	}

	#[test]
	fn unknown_bundle_refused()
	{
		let w = World::new();
		publish_world(&w);

		let e = run(w.args(&["not-published"]))
				.expect_err("unknown bundles are refused");
		assert_eq!(e.status(),
				crate::command::ExitStatus::InvalidBundle);
	}
}
