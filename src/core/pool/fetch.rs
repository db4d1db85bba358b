//! The artifact transfer pool.
//!
//! Takes a set of artifacts (fullfiles and packs), pulls them down with
//! bounded concurrency, and leaves verified content in the cache:
//! fullfiles as staged/<fingerprint>, packs exploded into staged/ and
//! delta/.
//!
//! Each artifact walks a little state machine:
//!
//!   Queued -> InFlight -> Downloaded -> Verified -> Extracted
//!
//! (Installed is the staging engine's business, later.)  Any failure
//! edge goes to Failed, which unlinks every partial for that artifact.
//! Transport failures land the artifact on a retry list for the caller;
//! a fingerprint mismatch on published content does NOT retry, since
//! refetching provably-wrong bytes can only waste time.
use std::path::PathBuf;

use url::Url;

use crate::server::http::Fetcher;
use crate::server::version::join_url;
use crate::util::hash::{self, Fingerprint};
use crate::util::tarball;


/// The in-flight transfer ceiling.
pub(crate) const MAX_XFER: u32 = 25;

/// Where draining stops once we hit the ceiling plus margin.
pub(crate) const MAX_XFER_BOTTOM: u32 = 15;

/// Queue headroom past MAX_XFER before we start draining.
const XFER_MARGIN: u32 = 10;

/// Above this many artifacts we don't bother HEAD-probing sizes for
/// byte-accurate progress; counting is fine.
const HEAD_PROBE_MAX: usize = 1000;


/// One downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Artifact
{
	/// A single file's tarball, at the version that published it
	FullFile { fp: Fingerprint, version: u32 },

	/// A bundle pack covering a from->to jump
	Pack { bundle: String, from: u32, to: u32 },
}

impl Artifact
{
	pub(crate) fn describe(&self) -> String
	{
		match self {
			Artifact::FullFile { fp, version } =>
				format!("{version}/files/{}", fp.to_buf()),
			Artifact::Pack { bundle, from, to } =>
				format!("pack {bundle} {from}->{to}"),
		}
	}
}


/// Where an artifact got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[derive(strum::Display)]
pub(crate) enum ArtifactState
{
	Queued,
	InFlight,
	Downloaded,
	Verified,
	Extracted,
	Installed,
	Failed,
}


/// The transfer pool state
#[derive(Debug)]
pub(crate) struct Fetch
{
	/// We'll kick a progress bar
	pb: indicatif::ProgressBar,

	/// Whether the bar is in bytes (true) or artifact counts
	bytes_mode: bool,

	/// Successes
	oks: Vec<Res>,

	/// Artifacts that failed in ways worth retrying
	retry: Vec<Artifact>,

	/// Failures that retrying can't help
	fatal: Vec<GetErr>,
}

impl Fetch
{
	/// Set up for a run over a set of artifacts.  If the set is small
	/// enough, we HEAD-probe sizes so progress can be bytes/total;
	/// otherwise it's count/total.
	pub(crate) fn new(ctrl: &Control, arts: &[Artifact]) -> Self
	{
		let total_bytes = match arts.len() <= HEAD_PROBE_MAX {
			true  => probe_total(ctrl, arts),
			false => None,
		};

		let (pb, bytes_mode) = match total_bytes {
			Some(b) => {
				let pb = indicatif::ProgressBar::new(b);
				(pb, true)
			},
			None => {
				let n = arts.len().try_into().unwrap();
				(indicatif::ProgressBar::new(n), false)
			},
		};

		Self {
			pb, bytes_mode,
			oks: Vec::with_capacity(arts.len()),  // Assume success
			retry: Vec::new(),
			fatal: Vec::new(),
		}
	}
}


/// Sum up sizes, if the server will tell us them all.
fn probe_total(ctrl: &Control, arts: &[Artifact]) -> Option<u64>
{
	let mut total = 0u64;
	for a in arts
	{
		let url = artifact_url(ctrl, a).ok()?;
		total += ctrl.http.head_size(&url).ok()?;
	}
	Some(total)
}


/// The final result of a transfer run
#[derive(Debug)]
pub(crate) struct PoolResult
{
	/// Completed artifacts
	pub(crate) oks: Vec<Res>,

	/// Artifacts whose transfers failed transiently; the caller gets
	/// to decide about re-enqueueing
	pub(crate) retry: Vec<Artifact>,

	/// Artifacts that are not going to work no matter what
	pub(crate) fatal: Vec<GetErr>,
}

impl PoolResult
{
	pub(crate) fn bytes_fetched(&self) -> u64
	{
		self.oks.iter().map(|r| r.bytes).sum()
	}
}


/// Control for the transfer pool
#[derive(Debug, Clone)]
pub(crate) struct Control
{
	/// HTTP agent wrapper
	pub(crate) http: Fetcher,

	/// Base content URL
	pub(crate) content_url: Url,

	/// Cache dirs
	pub(crate) staged: PathBuf,
	pub(crate) download: PathBuf,
	pub(crate) delta: PathBuf,
	pub(crate) packdir: PathBuf,
}

/// A single transfer request
#[derive(Debug)]
pub(crate) struct Req
{
	pub(crate) artifact: Artifact,
}

/// A completed transfer
#[derive(Debug)]
pub(crate) struct Res
{
	pub(crate) artifact: Artifact,

	/// Bytes pulled over the wire (0 if the cache already had it)
	pub(crate) bytes: u64,

	/// Terminal state; Extracted unless something weird happened
	pub(crate) state: ArtifactState,
}

/// A failed transfer
#[derive(Debug)]
#[derive(thiserror::Error)]
#[error("{artifact:?} failed (reached {reached}): {what}")]
pub(crate) struct GetErr
{
	pub(crate) artifact: Artifact,

	/// Terminal state; always Failed
	pub(crate) state: ArtifactState,

	/// How far it got before dying
	pub(crate) reached: ArtifactState,

	pub(crate) what: String,

	/// Worth re-enqueueing?
	pub(crate) transient: bool,
}


// And do the pooling
impl crate::core::pool::Pool for Fetch
{
	type Control = Control;
	type UnitControl = Control;

	// For the per-thread copy, just clone
	fn mk_unitcontrol(c: &Control) -> Control { c.clone() }

	type PoolResult = PoolResult;

	type WorkRequest = Req;
	type WorkResult  = Res;
	type WorkErr     = GetErr;
	fn work(ctrl: &Control, req: Req) -> Result<Res, GetErr>
	{
		xfer_worker(ctrl, req)
	}


	// This is a network job
	fn nthreads(&self) -> u32 { crate::core::pool::jobs_net() }


	fn work_result(&mut self, resp: Result<Res, GetErr>)
	{
		match resp
		{
			Ok(r) => {
				match self.bytes_mode {
					true  => self.pb.inc(r.bytes),
					false => self.pb.inc(1),
				}
				self.oks.push(r);
			},
			Err(e) => {
				if !self.bytes_mode { self.pb.inc(1); }
				match e.transient {
					true  => self.retry.push(e.artifact),
					false => self.fatal.push(e),
				}
			},
		}
	}


	fn finalize(self) -> PoolResult
	{
		let Fetch { pb, bytes_mode: _, oks, retry, fatal } = self;
		pb.finish();
		PoolResult { oks, retry, fatal }
	}
}


impl Fetch
{
	/// Run with the standard watermarks: feed the queue up to
	/// MAX_XFER plus margin, then drain back to MAX_XFER_BOTTOM
	/// before feeding more.
	pub(crate) fn run_transfers(self, ctrl: &Control, arts: Vec<Artifact>)
			-> Result<PoolResult, anyhow::Error>
	{
		use crate::core::pool::Pool as _;

		let reqs = arts.into_iter()
				.map(|artifact| Req { artifact })
				.collect();
		let high = (MAX_XFER + XFER_MARGIN) as usize;
		let low = MAX_XFER_BOTTOM as usize;
		self.run_bounded(ctrl, reqs, high, low)
	}
}


/// The URL for an artifact.
fn artifact_url(ctrl: &Control, a: &Artifact) -> Result<Url, url::ParseError>
{
	match a {
		Artifact::FullFile { fp, version } =>
			join_url(&ctrl.content_url,
					&format!("{version}/files/{}.tar", fp.to_buf())),
		Artifact::Pack { bundle, from, to } =>
			join_url(&ctrl.content_url,
					&format!("{to}/pack-{bundle}-from-{from}.tar")),
	}
}


/// Process one artifact all the way through its states.
fn xfer_worker(ctrl: &Control, req: Req) -> Result<Res, GetErr>
{
	let Req { artifact } = req;

	match &artifact {
		Artifact::FullFile { fp, .. } => {
			let fp = *fp;
			fullfile_worker(ctrl, artifact, fp)
		},
		Artifact::Pack { bundle, from, to } => {
			let (b, f, t) = (bundle.clone(), *from, *to);
			pack_worker(ctrl, artifact, &b, f, t)
		},
	}
}


/// Fail helper: unlink every partial this artifact may have left, and
/// build the error.
fn fail(artifact: Artifact, state: ArtifactState, what: String,
		transient: bool, partials: &[PathBuf]) -> GetErr
{
	for p in partials
	{
		if p.is_dir()
		{ let _ = std::fs::remove_dir_all(p); }
		else
		{ let _ = std::fs::remove_file(p); }
	}
	GetErr { artifact, state: ArtifactState::Failed, reached: state,
			what, transient }
}


fn fullfile_worker(ctrl: &Control, art: Artifact, fp: Fingerprint)
		-> Result<Res, GetErr>
{
	use ArtifactState as S;

	let fpb = fp.to_buf();
	let staged = ctrl.staged.join(fpb.as_ref());
	let tarpath = ctrl.download.join(format!("{fpb}.tar"));
	let tmppath = ctrl.download.join(format!("{fpb}.tar.in-progress"));

	// Maybe a previous run (or a pack) already left it staged.  Trust
	// nothing: verify, and purge on mismatch.
	if staged.symlink_metadata().is_ok()
	{
		match hash::check(&staged, &fp, true) {
			Ok(_) => {
				return Ok(Res { artifact: art, bytes: 0,
						state: S::Extracted });
			},
			Err(_) => {
				if staged.is_dir()
				{ let _ = std::fs::remove_dir_all(&staged); }
				else
				{ let _ = std::fs::remove_file(&staged); }
			},
		}
	}

	let mut state = S::Queued;
	let mut bytes = 0u64;

	// Download, unless the archive survived from an earlier attempt.
	if !tarpath.is_file()
	{
		let url = match artifact_url(ctrl, &art) {
			Ok(u) => u,
			Err(e) => return Err(fail(art, state, e.to_string(), false,
					&[])),
		};

		state = S::InFlight;
		bytes = match ctrl.http.get_file(&url, &tmppath) {
			Ok(b) => b,
			Err(e) => {
				let transient = e.is_transient();
				return Err(fail(art, state, e.to_string(), transient,
						&[tmppath]));
			},
		};

		if let Err(e) = std::fs::rename(&tmppath, &tarpath)
		{
			return Err(fail(art, state, e.to_string(), false,
					&[tmppath]));
		}
	}
	state = S::Downloaded;

	// The tarball contract: exactly one entry, named by the
	// fingerprint.  extract_single() checks it as it goes.
	let extracted = match tarball::extract_single(&tarpath, fpb.as_ref(),
			&ctrl.staged) {
		Ok(p) => { state = S::Verified; p },
		Err(e) => {
			return Err(fail(art, state, e.to_string(), false,
					&[tarpath.clone(), staged.clone()]));
		},
	};

	// And the content has to reproduce the fingerprint.  Published
	// content that doesn't is a data-integrity fault; retrying won't
	// make it honest.
	if let Err(e) = hash::check(&extracted, &fp, true)
	{
		return Err(fail(art, state, e.to_string(), false,
				&[tarpath, extracted]));
	}
	state = S::Extracted;

	Ok(Res { artifact: art, bytes, state })
}


fn pack_worker(ctrl: &Control, art: Artifact, bundle: &str, from: u32,
		to: u32) -> Result<Res, GetErr>
{
	use ArtifactState as S;

	let tarpath = ctrl.packdir
			.join(format!("pack-{bundle}-from-{from}-to-{to}.tar"));
	let tmppath = ctrl.packdir
			.join(format!("pack-{bundle}-from-{from}-to-{to}.tar.in-progress"));

	let mut state = S::Queued;
	let mut bytes = 0u64;

	if !tarpath.is_file()
	{
		let url = match artifact_url(ctrl, &art) {
			Ok(u) => u,
			Err(e) => return Err(fail(art, state, e.to_string(), false,
					&[])),
		};

		state = S::InFlight;
		bytes = match ctrl.http.get_file(&url, &tmppath) {
			Ok(b) => b,
			Err(e) => {
				let transient = e.is_transient();
				return Err(fail(art, state, e.to_string(), transient,
						&[tmppath]));
			},
		};

		if let Err(e) = std::fs::rename(&tmppath, &tarpath)
		{
			return Err(fail(art, state, e.to_string(), false,
					&[tmppath]));
		}
	}
	state = S::Downloaded;

	// Packs explode into staged/ and delta/.  Individual staged
	// entries get fingerprint-checked when something goes to use them,
	// so a bad pack member can cost us a fullfile refetch but never
	// correctness.
	match tarball::extract_pack(&tarpath, &ctrl.staged, &ctrl.delta) {
		Ok(_) => state = S::Extracted,
		Err(e) => {
			return Err(fail(art, state, e.to_string(), false,
					&[tarpath]));
		},
	}

	Ok(Res { artifact: art, bytes, state })
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::util::hash;
	use std::path::Path;

	/// Build a Control over a temp layout plus a file:// "server".
	fn mk_ctrl(td: &Path) -> (Control, std::path::PathBuf)
	{
		let server = td.join("server");
		std::fs::create_dir_all(&server).unwrap();
		for d in ["staged", "download", "delta", "packs"]
		{ std::fs::create_dir_all(td.join(d)).unwrap(); }

		let ctrl = Control {
			http: Fetcher::new(),
			content_url: Url::from_directory_path(&server).unwrap(),
			staged: td.join("staged"),
			download: td.join("download"),
			delta: td.join("delta"),
			packdir: td.join("packs"),
		};
		(ctrl, server)
	}

	/// Publish a fullfile on the "server": make a content file, take
	/// its real fingerprint, tar it under that name.  Returns the
	/// fingerprint.
	fn publish_fullfile(server: &Path, version: u32, contents: &[u8])
			-> Fingerprint
	{
		let scratch = server.join(".scratch");
		std::fs::create_dir_all(&scratch).unwrap();
		let tmpf = scratch.join("content");
		std::fs::write(&tmpf, contents).unwrap();

		let fp = hash::compute(&tmpf, true).unwrap();
		let fpb = fp.to_buf();

		let fdir = server.join(format!("{version}/files"));
		std::fs::create_dir_all(&fdir).unwrap();

		let tarfh = std::fs::File::create(
				fdir.join(format!("{fpb}.tar"))).unwrap();
		let mut b = tar::Builder::new(tarfh);
		b.append_path_with_name(&tmpf, fpb.as_ref()).unwrap();
		b.finish().unwrap();

		fp
	}

	#[test]
	fn state_machine_ordering()
	{
		use ArtifactState as S;

		// The lifecycle is strictly ordered, Failed at the end.
		let order = [S::Queued, S::InFlight, S::Downloaded, S::Verified,
				S::Extracted, S::Installed, S::Failed];
		for w in order.windows(2)
		{
			assert!(w[0] < w[1], "{} should precede {}", w[0], w[1]);
		}
	}

	#[test]
	fn fullfile_end_to_end()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, server) = mk_ctrl(td.path());
		let fp = publish_fullfile(&server, 20, b"the new tool");

		let arts = vec![Artifact::FullFile { fp, version: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();

		assert_eq!(res.oks.len(), 1);
		assert!(res.retry.is_empty());
		assert!(res.fatal.is_empty());
		assert_eq!(res.oks[0].state, ArtifactState::Extracted);
		assert!(res.bytes_fetched() > 0);

		// The staged copy exists and self-verifies
		let staged = ctrl.staged.join(fp.to_buf().as_ref());
		assert!(staged.is_file());
		hash::check(&staged, &fp, true).expect("staged content verifies");

		// And the canonical archive name stuck around
		assert!(ctrl.download
				.join(format!("{}.tar", fp.to_buf())).is_file());
	}

	#[test]
	fn staged_reuse_short_circuits()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, server) = mk_ctrl(td.path());
		let fp = publish_fullfile(&server, 20, b"cached already");

		// Fetch once, then again; second run shouldn't transfer bytes.
		let arts = vec![Artifact::FullFile { fp, version: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		fetch.run_transfers(&ctrl, arts.clone()).unwrap();

		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();
		assert_eq!(res.oks.len(), 1);
		assert_eq!(res.oks[0].bytes, 0, "no bytes moved on reuse");
	}

	#[test]
	fn corrupt_staged_gets_purged_and_refetched()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, server) = mk_ctrl(td.path());
		let fp = publish_fullfile(&server, 20, b"good bytes");

		// Plant garbage at the staged name
		let staged = ctrl.staged.join(fp.to_buf().as_ref());
		std::fs::write(&staged, b"garbage").unwrap();

		let arts = vec![Artifact::FullFile { fp, version: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();

		assert_eq!(res.oks.len(), 1);
		hash::check(&staged, &fp, true)
				.expect("garbage was replaced with verified content");
	}

	#[test]
	fn missing_artifact_is_fatal_not_retry()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, _server) = mk_ctrl(td.path());

		let fp = Fingerprint::from([0x42; 32]);
		let arts = vec![Artifact::FullFile { fp, version: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();

		assert!(res.oks.is_empty());
		assert!(res.retry.is_empty(), "404 is not transient");
		assert_eq!(res.fatal.len(), 1);
		assert_eq!(res.fatal[0].state, ArtifactState::Failed);

		// No partials left behind
		assert!(std::fs::read_dir(&ctrl.download).unwrap()
				.next().is_none());
	}

	#[test]
	fn wrong_content_is_fatal()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, server) = mk_ctrl(td.path());

		// Publish real content, then ask for it under a different
		// (wrong) fingerprint by renaming the published tar.
		let fp = publish_fullfile(&server, 20, b"actual bytes");
		let wrong = Fingerprint::from([0x99; 32]);
		let fdir = server.join("20/files");
		std::fs::rename(
				fdir.join(format!("{}.tar", fp.to_buf())),
				fdir.join(format!("{}.tar", wrong.to_buf()))).unwrap();

		let arts = vec![Artifact::FullFile { fp: wrong, version: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();

		assert!(res.oks.is_empty());
		assert!(res.retry.is_empty(), "integrity faults don't retry");
		assert_eq!(res.fatal.len(), 1);

		// Every partial for that fingerprint is gone
		assert!(!ctrl.staged.join(wrong.to_buf().as_ref()).exists());
		assert!(!ctrl.download
				.join(format!("{}.tar", wrong.to_buf())).exists());
	}

	#[test]
	fn pack_extracts_into_cache()
	{
		let td = tempfile::tempdir().unwrap();
		let (ctrl, server) = mk_ctrl(td.path());

		// A pack with one staged entry and one delta
		let vdir = server.join("20");
		std::fs::create_dir_all(&vdir).unwrap();
		let tarfh = std::fs::File::create(
				vdir.join("pack-os-core-from-10.tar")).unwrap();
		let mut b = tar::Builder::new(tarfh);
		for (name, data) in [
			("staged/aaaa", &b"packed full"[..]),
			("delta/10-20-x-y", &b"packed delta"[..]),
		] {
			let mut hdr = tar::Header::new_gnu();
			hdr.set_size(data.len() as u64);
			hdr.set_mode(0o644);
			hdr.set_uid(0);
			hdr.set_gid(0);
			hdr.set_cksum();
			b.append_data(&mut hdr, name, data).unwrap();
		}
		b.finish().unwrap();

		let arts = vec![Artifact::Pack {
			bundle: "os-core".to_string(), from: 10, to: 20 }];
		let fetch = Fetch::new(&ctrl, &arts);
		let res = fetch.run_transfers(&ctrl, arts).unwrap();

		assert_eq!(res.oks.len(), 1);
		assert!(ctrl.staged.join("aaaa").is_file());
		assert!(ctrl.delta.join("10-20-x-y").is_file());
		assert!(ctrl.packdir
				.join("pack-os-core-from-10-to-20.tar").is_file());
	}
}
