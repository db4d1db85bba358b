//! Version pointers, mirror staleness, and the time gate.
//!
//! The server publishes its latest version as a tiny text file with a
//! detached signature next to it.  Before we trust any of that over
//! HTTPS, the wall clock has to be sane; a machine whose clock is years
//! behind will reject every certificate it sees, so there's a stamp
//! file on the installed image we can step the clock up to.
use std::path::Path;

use url::Url;

use super::http::{Fetcher, FetchErr};
use super::signature;


/// Mirror lag under this only earns a warning.
const MIRROR_STALE_WARN: u32 = 20;
/// Lag at or past this (or an unreachable mirror) unsets the mirror.
const MIRROR_STALE_UNSET: u32 = 500;

const DAY_SECONDS: i64 = 86400;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum PointerErr
{
	#[error("Couldn't reach version server: {0}")]
	Fetch(#[from] FetchErr),

	#[error("Couldn't fetch version signature: {0}")]
	SigFetch(FetchErr),

	#[error("Version signature: {0}")]
	Signature(#[from] signature::SignatureErr),

	#[error("Unparseable version pointer '{0}'")]
	BadPointer(String),

	#[error("URL building error: {0}")]
	BadUrl(#[from] url::ParseError),
}


/// Fetch the latest published version for a format.
pub(crate) fn latest(http: &Fetcher, version_url: &Url, format: u32,
		cert: &Path, nosigcheck: bool) -> Result<u32, PointerErr>
{
	let rel = format!("version/format{format}/latest");
	fetch_pointer(http, version_url, &rel, cert, nosigcheck)
}


/// Fetch the absolute latest version across all formats.
pub(crate) fn latest_any(http: &Fetcher, version_url: &Url,
		cert: &Path, nosigcheck: bool) -> Result<u32, PointerErr>
{
	fetch_pointer(http, version_url, "version/latest_version", cert,
			nosigcheck)
}


fn fetch_pointer(http: &Fetcher, base: &Url, rel: &str, cert: &Path,
		nosigcheck: bool) -> Result<u32, PointerErr>
{
	let url = join_url(base, rel)?;
	let bytes = http.get_bytes(&url)?;

	// Signature rides alongside as <pointer>.sig
	let sig = match nosigcheck {
		true => None,
		false => {
			let sigurl = join_url(base, &format!("{rel}.sig"))?;
			Some(http.get_bytes(&sigurl)
					.map_err(PointerErr::SigFetch)?)
		},
	};
	signature::verify_or_warn(&bytes, sig.as_deref(), cert, nosigcheck,
			&url.to_string())?;

	let text = String::from_utf8_lossy(&bytes);
	let text = text.trim();
	text.parse().map_err(|_| PointerErr::BadPointer(text.to_string()))
}


/// Join a relative piece onto a base URL, tolerating bases without a
/// trailing slash.
pub(crate) fn join_url(base: &Url, rel: &str)
		-> Result<Url, url::ParseError>
{
	let mut b = base.to_string();
	if !b.ends_with('/') { b.push('/'); }
	Url::parse(&b)?.join(rel)
}


/// What the mirror check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorStatus
{
	/// Mirror is fine (or close enough)
	Ok,

	/// Behind upstream, but within tolerance; just say so
	Lagging(u32),

	/// Unreachable or hopelessly stale; caller should unset it
	Unset,
}


/// Judge a configured mirror against upstream.  `upstream_latest`
/// comes from the real distributor; we ask the mirror the same
/// question and compare.
pub(crate) fn check_mirror(http: &Fetcher, mirror_version_url: &Url,
		upstream_latest: u32, format: u32, cert: &Path, nosigcheck: bool)
		-> MirrorStatus
{
	let mirror_latest = match latest(http, mirror_version_url, format,
			cert, nosigcheck) {
		Ok(v) => v,
		Err(_) => return MirrorStatus::Unset,
	};

	let lag = upstream_latest.saturating_sub(mirror_latest);
	match lag {
		0 => MirrorStatus::Ok,
		l if l >= MIRROR_STALE_UNSET => MirrorStatus::Unset,
		l if l >= MIRROR_STALE_WARN => MirrorStatus::Lagging(l),
		_ => MirrorStatus::Ok,
	}
}


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum TimeErr
{
	#[error("System clock is unusably wrong and couldn't be fixed: {0}")]
	BadTime(String),
}


/// The time gate.  If the clock trails the image's versionstamp by
/// more than a day, nothing TLS is going to work, so step the clock
/// forward to the stamp.  A missing stamp isn't a problem; a clock we
/// can't fix is.
pub(crate) fn verify_time(path: &Path) -> Result<(), TimeErr>
{
	let stampfile = crate::util::path_join(path,
			"usr/share/clear/versionstamp");
	let text = match std::fs::read_to_string(&stampfile) {
		Ok(t) => t,
		Err(_) => return Ok(()),
	};

	let stamp: i64 = match text.trim().parse() {
		Ok(s) if s > 0 => s,
		// A zero or garbled stamp gets the same shrug as a missing one
		_ => {
			eprintln!("Warning: unusable versionstamp in {}",
					stampfile.display());
			return Ok(());
		},
	};

	let now = chrono::Utc::now().timestamp();
	if now >= stamp - DAY_SECONDS { return Ok(()); }

	eprintln!("Warning: clock is behind the distributor versionstamp; \
			stepping it forward");
	set_clock(stamp)
}


/// settimeofday(2), rustily.
fn set_clock(secs: i64) -> Result<(), TimeErr>
{
	let tv = libc::timeval { tv_sec: secs, tv_usec: 0 };
	let rc = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
	match rc {
		0 => Ok(()),
		_ => {
			let e = std::io::Error::last_os_error();
			Err(TimeErr::BadTime(e.to_string()))
		},
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	fn dir_url(p: &std::path::Path) -> Url
	{
		Url::from_directory_path(p).unwrap()
	}

	/// Build a version dir with a pointer (no sigs; tests run with
	/// nosigcheck, since we can't mint PKCS7 envelopes here).
	fn mk_version_dir(root: &std::path::Path, format: u32, ver: u32)
	{
		let d = root.join(format!("version/format{format}"));
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("latest"), format!("{ver}\n")).unwrap();
	}

	#[test]
	fn reads_pointer()
	{
		let td = tempfile::tempdir().unwrap();
		mk_version_dir(td.path(), 1, 31890);

		let http = Fetcher::new();
		let cert = td.path().join("nocert");
		let v = latest(&http, &dir_url(td.path()), 1, &cert, true)
				.expect("pointer should read");
		assert_eq!(v, 31890);
	}

	#[test]
	fn missing_pointer()
	{
		let td = tempfile::tempdir().unwrap();
		let http = Fetcher::new();
		let cert = td.path().join("nocert");
		let e = latest(&http, &dir_url(td.path()), 1, &cert, true)
				.expect_err("no pointer file should fail");
		assert!(matches!(e, PointerErr::Fetch(FetchErr::NotFound(_))));
	}

	#[test]
	fn bad_pointer_contents()
	{
		let td = tempfile::tempdir().unwrap();
		let d = td.path().join("version/format1");
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("latest"), "not a number\n").unwrap();

		let http = Fetcher::new();
		let cert = td.path().join("nocert");
		let e = latest(&http, &dir_url(td.path()), 1, &cert, true)
				.expect_err("garbage pointer should fail");
		assert!(matches!(e, PointerErr::BadPointer(_)));
	}

	#[test]
	fn sig_required_when_checking()
	{
		let td = tempfile::tempdir().unwrap();
		mk_version_dir(td.path(), 1, 100);

		let http = Fetcher::new();
		let cert = td.path().join("nocert");
		let e = latest(&http, &dir_url(td.path()), 1, &cert, false)
				.expect_err("no .sig must fail closed");
		assert!(matches!(e, PointerErr::SigFetch(_)));
	}

	#[test]
	fn mirror_states()
	{
		let td = tempfile::tempdir().unwrap();
		let http = Fetcher::new();
		let cert = td.path().join("nocert");

		// Reachable and current
		mk_version_dir(td.path(), 1, 1000);
		let st = check_mirror(&http, &dir_url(td.path()), 1000, 1,
				&cert, true);
		assert_eq!(st, MirrorStatus::Ok);

		// A little behind: warn
		let st = check_mirror(&http, &dir_url(td.path()), 1030, 1,
				&cert, true);
		assert_eq!(st, MirrorStatus::Lagging(30));

		// Way behind: unset
		let st = check_mirror(&http, &dir_url(td.path()), 1500, 1,
				&cert, true);
		assert_eq!(st, MirrorStatus::Unset);

		// Unreachable: unset
		let gone = td.path().join("not-a-mirror");
		std::fs::create_dir(&gone).unwrap();
		let st = check_mirror(&http, &dir_url(&gone), 1000, 1,
				&cert, true);
		assert_eq!(st, MirrorStatus::Unset);
	}

	#[test]
	fn time_gate_happy_paths()
	{
		let td = tempfile::tempdir().unwrap();
		let root = td.path();

		// No stamp at all: fine
		verify_time(root).expect("missing stamp is fine");

		// A stamp in the past: fine, no clock fiddling
		let d = root.join("usr/share/clear");
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("versionstamp"), "1000000\n").unwrap();
		verify_time(root).expect("old stamp is fine");

		// Corrupt stamp: warned about, not fatal
		std::fs::write(d.join("versionstamp"), "banana\n").unwrap();
		verify_time(root).expect("corrupt stamp is fine");
	}
}
