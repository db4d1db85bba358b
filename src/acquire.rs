//! Getting verified manifests into the cache.
//!
//! A manifest can arrive four ways, tried in order: already sitting in
//! the primary cache, linkable out of the secondary cache, built by
//! applying a published delta to the cached previous version, or
//! downloaded whole as a tarball.  However it arrives, it doesn't
//! count until verified: the MoM by detached signature, every bundle
//! manifest by the fingerprint the MoM pinned for it.
//!
//! A bundle manifest that fails its pin gets purged and re-acquired
//! once (skipping the caches the second time); failing again is a
//! ManifestRejected, not a retry loop.
use std::path::PathBuf;

use crate::config::{Config, ConfigErr};
use crate::manifest::{self, Manifest, MOM};
use crate::server::http::{Fetcher, FetchErr};
use crate::server::signature::{self, SignatureErr};
use crate::server::version::join_url;
use crate::statedir::StateDir;
use crate::telemetry::{self, Telemetry};
use crate::util::hash::{self, Fingerprint};
use crate::util::{bspatch, tarball, xattrs};


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum AcquireErr
{
	#[error("Couldn't load MoM for {0}: {1}")]
	Mom(u32, String),

	#[error("Couldn't load manifest {0}: {1}")]
	Load(String, String),

	#[error("Manifest {0} rejected: {1}")]
	Rejected(String, String),

	#[error("MoM signature: {0}")]
	Signature(#[from] SignatureErr),

	#[error("Couldn't fetch MoM signature: {0}")]
	SigFetch(FetchErr),

	#[error("Download failed: {0}")]
	Fetch(#[from] FetchErr),

	#[error("{0}")]
	Config(#[from] ConfigErr),

	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),
}


pub(crate) struct Acquirer<'a>
{
	pub(crate) cfg: &'a Config,
	pub(crate) sd: &'a StateDir,
	pub(crate) http: &'a Fetcher,
	pub(crate) tele: &'a Telemetry,
}


impl Acquirer<'_>
{
	/// Acquire and signature-verify the MoM for a version.  Nothing
	/// from it may touch the filesystem before the signature is good,
	/// so verification happens right here, before parsing even.
	pub(crate) fn mom(&self, version: u32)
			-> Result<Manifest, AcquireErr>
	{
		let mpath = self.sd.manifest(version, MOM);

		if !mpath.is_file()
		{
			let rel = PathBuf::from(format!("{version}/Manifest.{MOM}"));
			if self.sd.from_secondary(&rel).is_none()
			{
				self.fetch_manifest_tar(MOM, version)?;
			}
		}

		// The signature, same story.
		let spath = self.sd.manifest_sig(version, MOM);
		if !self.cfg.nosigcheck && !spath.is_file()
		{
			let rel = PathBuf::from(
					format!("{version}/Manifest.{MOM}.sig"));
			if self.sd.from_secondary(&rel).is_none()
			{
				let url = join_url(self.cfg.content_url()?,
						&format!("{version}/Manifest.{MOM}.sig"))
						.map_err(|e| AcquireErr::Mom(version,
								e.to_string()))?;
				let bytes = self.http.get_bytes(&url)
						.map_err(AcquireErr::SigFetch)?;
				std::fs::write(&spath, bytes)?;
			}
		}

		let data = std::fs::read(&mpath)?;
		let sig = match self.cfg.nosigcheck {
			true => None,
			false => Some(std::fs::read(&spath)?),
		};
		if let Err(e) = signature::verify_or_warn(&data, sig.as_deref(),
				&self.cfg.cert(), self.cfg.nosigcheck,
				&format!("MoM {version}"))
		{
			self.tele.record(telemetry::Priority::Critical,
					telemetry::CLASS_SIGNATURE,
					&serde_json::json!({
						"what": format!("MoM {version}"),
						"error": e.to_string(),
					}));
			return Err(e.into());
		}

		manifest::parse::reader(MOM, &mut data.as_slice())
				.map_err(|e| AcquireErr::Mom(version, e.to_string()))
	}


	/// Acquire a bundle manifest, pinned to the fingerprint its MoM
	/// published for it.
	pub(crate) fn bundle(&self, name: &str, version: u32,
			expect: &Fingerprint, from: Option<u32>)
			-> Result<Manifest, AcquireErr>
	{
		// First try: anything cached is fair game.
		if let Some(m) = self.try_cached(name, version, expect)?
		{ return Ok(m); }

		for attempt in 0..2
		{
			// Delta from the previous version, when there is one.
			if let Some(fromver) = from
			{
				match self.try_delta(name, fromver, version, expect) {
					Ok(Some(m)) => return Ok(m),
					Ok(None) => (),
					Err(e) => {
						// Deltas are best-effort; note and move on.
						eprintln!("  (manifest delta for {name} \
								didn't pan out: {e})");
					},
				}
			}

			// The whole tarball.
			match self.try_tar(name, version, expect) {
				Ok(Some(m)) => return Ok(m),
				Ok(None) => (),
				Err(AcquireErr::Fetch(e)) if attempt == 0 => {
					eprintln!("  (manifest fetch for {name} \
							failed, retrying: {e})");
				},
				Err(e) => return Err(e),
			}

			// Whatever we pulled didn't verify; scorch it and go
			// around once more.
			self.purge(name, version, expect);
		}

		Err(AcquireErr::Rejected(name.to_string(),
				"failed fingerprint verification twice".to_string()))
	}


	/// A cached (or secondary-cached) manifest, if it verifies.
	fn try_cached(&self, name: &str, version: u32,
			expect: &Fingerprint)
			-> Result<Option<Manifest>, AcquireErr>
	{
		let mpath = self.sd.manifest(version, name);

		if !mpath.is_file()
		{
			let rel = PathBuf::from(format!("{version}/Manifest.{name}"));
			if self.sd.from_secondary(&rel).is_none()
			{ return Ok(None); }
		}

		match self.verify_and_parse(name, version, expect) {
			Ok(m) => Ok(Some(m)),
			Err(_) => {
				// Stale or corrupt cache entry; clear it so the
				// acquisition ladder starts clean.
				self.purge(name, version, expect);
				Ok(None)
			},
		}
	}


	/// Build the manifest by delta from the cached previous version.
	fn try_delta(&self, name: &str, from: u32, to: u32,
			expect: &Fingerprint)
			-> Result<Option<Manifest>, AcquireErr>
	{
		let frompath = self.sd.manifest(from, name);
		if !frompath.is_file() { return Ok(None); }

		let vdir = self.sd.manifest_dir(to);
		if !vdir.is_dir() { std::fs::create_dir_all(&vdir)?; }

		let dpath = self.sd.manifest_delta(name, from, to);
		if !dpath.is_file()
		{
			let url = join_url(self.cfg.content_url()?,
					&format!("{to}/Manifest-{name}-delta-from-{from}-to-{to}"))
					.map_err(|e| AcquireErr::Load(name.to_string(),
							e.to_string()))?;
			match self.http.get_file(&url, &dpath) {
				Ok(_) => (),
				// No published delta is routine, not an error.
				Err(FetchErr::NotFound(_)) => return Ok(None),
				Err(e) => return Err(e.into()),
			}
		}

		let mpath = self.sd.manifest(to, name);
		let tmp = self.sd.temp_dir().join(format!("Manifest.{name}.new"));
		bspatch::patch(&frompath, &tmp, &dpath)?;

		// Attributes come from the manifest we patched from; they're
		// part of the fingerprint.
		let md = std::fs::metadata(&frompath)?;
		std::fs::set_permissions(&tmp, md.permissions())?;
		xattrs::copy(&frompath, &tmp)?;

		std::fs::rename(&tmp, &mpath)?;

		match self.verify_and_parse(name, to, expect) {
			Ok(m) => Ok(Some(m)),
			Err(_) => {
				let _ = std::fs::remove_file(&mpath);
				let _ = std::fs::remove_file(&dpath);
				Ok(None)
			},
		}
	}


	/// Fetch and extract the manifest tarball.
	fn try_tar(&self, name: &str, version: u32, expect: &Fingerprint)
			-> Result<Option<Manifest>, AcquireErr>
	{
		self.fetch_manifest_tar(name, version)?;

		match self.verify_and_parse(name, version, expect) {
			Ok(m) => Ok(Some(m)),
			Err(_) => Ok(None),
		}
	}


	/// Download Manifest.<name>.tar and extract it in place.
	fn fetch_manifest_tar(&self, name: &str, version: u32)
			-> Result<(), AcquireErr>
	{
		let vdir = self.sd.manifest_dir(version);
		if !vdir.is_dir() { std::fs::create_dir_all(&vdir)?; }

		let tpath = self.sd.manifest_tar(version, name);
		if !tpath.is_file()
		{
			let url = join_url(self.cfg.content_url()?,
					&format!("{version}/Manifest.{name}.tar"))
					.map_err(|e| AcquireErr::Load(name.to_string(),
							e.to_string()))?;
			self.http.get_file(&url, &tpath)?;
		}

		tarball::extract_single(&tpath, &format!("Manifest.{name}"),
				&vdir)
				.map_err(|e| AcquireErr::Load(name.to_string(),
						e.to_string()))?;
		Ok(())
	}


	/// The verification gate: on-disk fingerprint must equal what the
	/// MoM pinned, and the text has to parse.  Good manifests get
	/// their fingerprint-pinned alias written.
	fn verify_and_parse(&self, name: &str, version: u32,
			expect: &Fingerprint) -> Result<Manifest, AcquireErr>
	{
		let mpath = self.sd.manifest(version, name);

		// Manifests are produced by the publisher, not the target
		// image, so xattrs stay out of their fingerprints.
		let got = hash::compute(&mpath, false)
				.map_err(|e| AcquireErr::Load(name.to_string(),
						e.to_string()))?;
		if &got != expect
		{
			return Err(AcquireErr::Rejected(name.to_string(),
					format!("fingerprint {} != pinned {}",
							got.to_buf(), expect.to_buf())));
		}

		let m = manifest::parse::file(name, &mpath)
				.map_err(|e| AcquireErr::Load(name.to_string(),
						e.to_string()))?;

		let pin = self.sd.manifest_pinned(version, name,
				&expect.to_buf());
		if !pin.exists()
		{ let _ = std::fs::hard_link(&mpath, &pin); }

		Ok(m)
	}


	/// Scorch every cached trace of a bundle manifest.
	fn purge(&self, name: &str, version: u32, expect: &Fingerprint)
	{
		let _ = std::fs::remove_file(self.sd.manifest(version, name));
		let _ = std::fs::remove_file(self.sd.manifest_tar(version, name));
		let _ = std::fs::remove_file(self.sd.manifest_sig(version, name));
		let _ = std::fs::remove_file(self.sd.manifest_pinned(version,
				name, &expect.to_buf()));
	}
}
