//! #0 diagnose (and repair, which is diagnose with teeth)
use regex_lite::Regex;

use crate::acquire::Acquirer;
use crate::command::{CmdArg, CmdErr, ExitStatus, UpdCmds};
use crate::core::scripts;
use crate::core::staging::{self, InstallCtx};
use crate::server::version as sv;
use crate::walker::{self, Policy};

use super::common;


pub(crate) fn run(carg: CmdArg, fix: bool) -> Result<ExitStatus, CmdErr>
{
	let args = match &carg.clargs.command {
		UpdCmds::Diagnose(a) | UpdCmds::Repair(a) => a,
		_ => unreachable!("I'm a diagnose, why does it think I'm not??"),
	};
	let cfg = &carg.config;

	// Even pure diagnose takes the lock; it shares the cache with
	// anything else running, and repair obviously mutates.
	let sess = common::open_session(cfg, true)?;

	if cfg.timecheck && fix
	{
		sv::verify_time(cfg.path())?;
	}

	let version = match args.version {
		Some(v) => v,
		None => crate::info::version::current(cfg.path())?,
	};
	println!("Diagnosing version {version}");

	let acq = Acquirer { cfg, sd: &sess.sd, http: &sess.http, tele: &sess.tele };
	let mom = acq.mom(version)?;

	// All subscribed bundles, or the user's subset.
	let roots = match args.bundles.is_empty() {
		true => common::subscriptions(&sess, cfg)?,
		false => {
			for b in &args.bundles
			{
				if mom.submanifest(b).is_none()
				{ return Err(CmdErr::InvalidBundle(b.clone())); }
			}
			args.bundles.clone()
		},
	};

	let manifests = common::resolve_subscribed(&acq, &mom, &roots,
			!cfg.skip_optional, |_| true)?;
	let (set, triggers) = common::build_set(&manifests, &sess.tele);

	let whitelist = match &args.picky_whitelist {
		Some(w) => Regex::new(w).map_err(|e| CmdErr::Other(
				anyhow::anyhow!("Bad --picky-whitelist: {e}")))?,
		None => walker::default_whitelist(),
	};

	let policy = Policy {
		fix,
		picky: args.picky,
		quick: args.quick,
		extra_files_only: args.extra_files_only,
		whitelist,
		picky_root: args.picky_tree.clone(),
	};

	let set_map = staging::set_by_path(&set);
	let ictx = InstallCtx {
		root: cfg.path(),
		statedir: &sess.sd,
		set: &set_map,
	};

	let ctrl = common::fetch_ctrl(cfg, &sess)?;
	let fixctx = walker::FixCtx { fetch_ctrl: &ctrl };
	let fixref = match fix {
		true => Some(&fixctx),
		false => None,
	};

	let c = walker::walk(&set, cfg.path(), &policy, &ictx, fixref);

	println!("Inspected {} file{}", c.checked,
			crate::util::plural(c.checked as usize));
	println!("  {} file{} missing", c.missing,
			crate::util::plural(c.missing as usize));
	if fix
	{
		println!("    {} replaced, {} not replaced",
				c.replaced, c.not_replaced);
	}
	println!("  {} file{} did not match", c.mismatch,
			crate::util::plural(c.mismatch as usize));
	if fix
	{
		println!("    {} fixed, {} not fixed", c.fixed, c.not_fixed);
	}
	println!("  {} file{} found which should be deleted", c.extraneous,
			crate::util::plural(c.extraneous as usize));
	if fix
	{
		println!("    {} deleted, {} not deleted",
				c.deleted, c.not_deleted);
	}

	if fix
	{
		if c.replaced + c.fixed + c.deleted > 0
		{
			scripts::run_triggers(&triggers, cfg.path());
		}

		return match c.failures() {
			0 => Ok(ExitStatus::Ok),
			_ => Err(CmdErr::VerifyFailed),
		};
	}

	match c.problems() {
		0 => Ok(ExitStatus::Ok),
		_ => {
			println!("Run 'repair' to fix the problems found");
			Ok(ExitStatus::Nothing)
		},
	}
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::command::{CmdArg, UpdArgs};
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

		fn publish_manifest(&self, name: &str, version: u32, text: &str)
				-> crate::util::hash::Fingerprint
		{
			let mf = self.td.path().join(
					format!("scratch/Manifest.{name}"));
			std::fs::write(&mf, text).unwrap();
			let fp = hash::compute(&mf, false).unwrap();

			let vdir = self.server().join(version.to_string());
			std::fs::create_dir_all(&vdir).unwrap();
			let tarfh = std::fs::File::create(
					vdir.join(format!("Manifest.{name}.tar"))).unwrap();
			let mut b = tar::Builder::new(tarfh);
			b.append_path_with_name(&mf, format!("Manifest.{name}"))
					.unwrap();
			b.finish().unwrap();

			fp
		}

		fn publish_file(&self, version: u32, contents: &[u8])
				-> crate::util::hash::Fingerprint
		{
			let tmpf = self.td.path().join("scratch/content");
			std::fs::write(&tmpf, contents).unwrap();
			let fp = hash::compute(&tmpf, true).unwrap();
			let fpb = fp.to_buf();

			let fdir = self.server().join(format!("{version}/files"));
			std::fs::create_dir_all(&fdir).unwrap();
			let tarfh = std::fs::File::create(
					fdir.join(format!("{fpb}.tar"))).unwrap();
			let mut b = tar::Builder::new(tarfh);
			b.append_path_with_name(&tmpf, fpb.as_ref()).unwrap();
			b.finish().unwrap();

			fp
		}

		/// Publish os-core (with the given body lines) and its MoM at
		/// version 10.
		fn publish_version(&self, lines: &[String])
		{
			let core = format!("MANIFEST\t1\n\
				version:\t10\n\
				filecount:\t{}\n\
				contentsize:\t10\n\
				\n\
				{}", lines.len(), lines.concat());
			let core_fp = self.publish_manifest("os-core", 10, &core);

			let mom = format!("MANIFEST\t1\n\
				version:\t10\n\
				filecount:\t1\n\
				contentsize:\t0\n\
				\n\
				M...\t{}\t10\tos-core\n", core_fp.to_buf());
			self.publish_manifest("MoM", 10, &mom);
		}

		fn args(&self, nosigcheck: bool) -> CmdArg
		{
			use crate::command::UpdCmds;

			let mut clargs = UpdArgs::default();
			clargs.command = UpdCmds::Diagnose(Default::default());
			clargs.path = Some(self.root());
			clargs.statedir = Some(self.statedir());
			clargs.contenturl = Some(
					url::Url::from_directory_path(self.server()).unwrap());
			clargs.versionurl = Some(
					url::Url::from_directory_path(self.server()).unwrap());
			clargs.nosigcheck = nosigcheck;
			let mut config = crate::config::build(&clargs).unwrap();
			config.nosigcheck = nosigcheck;
			CmdArg { clargs, config }
		}
	}

	fn fline(fp: &crate::util::hash::Fingerprint, path: &str) -> String
	{
		format!("F...\t{}\t10\t{path}\n", fp.to_buf())
	}

	#[test]
	fn missing_file_reported_not_fetched()
	{
		let w = World::new();

		// One file that's there, one that isn't
		std::fs::write(w.root().join("usr/bin/ls"), b"the ls binary")
				.unwrap();
		let ls = hash::compute(&w.root().join("usr/bin/ls"), true)
				.unwrap();
		let ghost = crate::util::hash::Fingerprint::from([0x77; 32]);

		w.publish_version(&[
			fline(&ls, "/usr/bin/ls"),
			fline(&ghost, "/usr/bin/ghost"),
		]);

		let st = run(w.args(true), false).unwrap();
		assert_eq!(st, ExitStatus::Nothing,
				"problems found, fix not requested");

		// Diagnose never downloads content
		let sd = StateDir::open(&w.statedir(), None).unwrap();
		assert!(std::fs::read_dir(sd.staged_dir()).unwrap()
				.next().is_none());
	}

	#[test]
	fn clean_tree_exits_ok()
	{
		let w = World::new();

		std::fs::write(w.root().join("usr/bin/ls"), b"the ls binary")
				.unwrap();
		let ls = hash::compute(&w.root().join("usr/bin/ls"), true)
				.unwrap();
		let osrel = hash::compute(
				&w.root().join("usr/lib/os-release"), true).unwrap();

		w.publish_version(&[
			fline(&ls, "/usr/bin/ls"),
			fline(&osrel, "/usr/lib/os-release"),
		]);

		let st = run(w.args(true), false).unwrap();
		assert_eq!(st, ExitStatus::Ok);
	}

	#[test]
	fn repair_restores_missing_file()
	{
		let w = World::new();

		// Publish a tool, install it on disk, publish its fullfile,
		// then lose it.
		let tool = w.publish_file(10, b"#!/bin/true\n");
		w.publish_version(&[fline(&tool, "/usr/bin/tool")]);

		let st = run(w.args(true), true).unwrap();
		assert_eq!(st, ExitStatus::Ok);

		let got = w.root().join("usr/bin/tool");
		assert_eq!(std::fs::read(&got).unwrap(), b"#!/bin/true\n");
		hash::check(&got, &tool, true).expect("repaired file verifies");

		// Diagnose right after a repair is clean
		let st = run(w.args(true), false).unwrap();
		assert_eq!(st, ExitStatus::Ok);
	}

	#[test]
	fn bad_signature_fails_closed()
	{
		let w = World::new();

		std::fs::write(w.root().join("usr/bin/ls"), b"x").unwrap();
		let ls = hash::compute(&w.root().join("usr/bin/ls"), true)
				.unwrap();
		w.publish_version(&[fline(&ls, "/usr/bin/ls")]);

		// A signature file exists but is garbage, and there's no cert
		// on the image anyway; with checking on, nothing proceeds.
		std::fs::write(w.server().join("10/Manifest.MoM.sig"),
				b"not a signature").unwrap();

		let e = run(w.args(false), true)
				.expect_err("bad signature must stop everything");
		assert_eq!(e.status(),
				crate::command::ExitStatus::SignatureVerificationFailed);

		// No bundle manifest was acquired
		let sd = StateDir::open(&w.statedir(), None).unwrap();
		assert!(!sd.manifest(10, "os-core").exists());
	}
}
