//! The transport layer.
//!
//! Small wrapper around ureq giving us the three shapes we need: fetch
//! bytes into memory, fetch a body into a file, and ask for a size.
//! `file://` URLs get served straight off the filesystem, which the
//! tests lean on hard, and which also covers pointing a config at a
//! locally-mounted mirror.
use std::path::{Path, PathBuf};

use url::Url;


/// How a fetch can go wrong.  The distinction between NotFound and
/// Transport matters to callers: a 404 on an optional artifact (like a
/// delta) is routine, while transport trouble means retry.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum FetchErr
{
	#[error("Not found: {0}")]
	NotFound(Url),

	#[error("Transport error for {0}: {1}")]
	Transport(Url, String),

	#[error("File I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("URL building error: {0}")]
	BadUrl(#[from] url::ParseError),
}

impl FetchErr
{
	/// Is retrying plausibly useful?
	pub(crate) fn is_transient(&self) -> bool
	{
		matches!(self, FetchErr::Transport(_, _))
	}
}


/// The fetcher; mostly just an agent we can clone around worker
/// threads.
#[derive(Debug, Clone)]
pub(crate) struct Fetcher
{
	agent: ureq::Agent,
}


impl Fetcher
{
	pub(crate) fn new() -> Self
	{
		Self { agent: mk_agent() }
	}


	/// Do a GET and dump the results into a Vec<u8>.
	///
	/// This is intended as a simple util for fetching "small" files (up
	/// to a few dozen k, maybe), that we're just going to be poking
	/// through for stuff.  It's not built for fetching big files; those
	/// go through get_file().
	pub(crate) fn get_bytes(&self, url: &Url)
			-> Result<Vec<u8>, FetchErr>
	{
		// These are small files to directly poke at, so set a limit big
		// enough to easily fit anything we expect, but not blow out
		// memory if somebody messes with us.
		const LIMIT: u64 = 10 * 1024 * 1024;

		if url.scheme() == "file"
		{
			let p = file_url_path(url)?;
			if !p.is_file() { return Err(FetchErr::NotFound(url.clone())); }
			return Ok(std::fs::read(p)?);
		}

		let resp = self.agent.request_url("GET", url).call()
				.map_err(|e| classify(url, e))?;

		use std::io::Read as _;
		let mut data = Vec::new();
		resp.into_reader().take(LIMIT).read_to_end(&mut data)?;
		Ok(data)
	}


	/// GET a URL into a destination file.  Returns bytes written.
	pub(crate) fn get_file(&self, url: &Url, dest: &Path)
			-> Result<u64, FetchErr>
	{
		use std::{fs, io};

		// Let's not make it trivial for a broken or malicious server to
		// fill up our disk; no single artifact should be anywhere near
		// this.
		const LIMIT: u64 = 4 * 1024 * 1024 * 1024;

		if url.scheme() == "file"
		{
			let p = file_url_path(url)?;
			if !p.is_file() { return Err(FetchErr::NotFound(url.clone())); }
			return Ok(fs::copy(&p, dest)?);
		}

		let resp = match self.agent.request_url("GET", url).call() {
			Ok(r) => r,
			Err(e) => {
				// Cleanup a bit and bail
				let _ = fs::remove_file(dest);
				return Err(classify(url, e));
			},
		};

		let outfile = fs::File::create(dest)?;
		let mut outwrite = io::BufWriter::with_capacity(
				crate::util::FILE_BUFSZ, outfile);

		use io::Read as _;
		let mut rdr = resp.into_reader().take(LIMIT);
		let bytes = io::copy(&mut rdr, &mut outwrite)?;

		use io::Write as _;
		let mut outfile = outwrite.into_inner()
				.map_err(|e| e.into_error())?;
		outfile.flush()?;
		outfile.sync_all()?;

		Ok(bytes)
	}


	/// HEAD a URL for its content length.
	pub(crate) fn head_size(&self, url: &Url) -> Result<u64, FetchErr>
	{
		if url.scheme() == "file"
		{
			let p = file_url_path(url)?;
			let md = std::fs::metadata(&p)
					.map_err(|_| FetchErr::NotFound(url.clone()))?;
			return Ok(md.len());
		}

		let resp = self.agent.request_url("HEAD", url).call()
				.map_err(|e| classify(url, e))?;

		resp.header("Content-Length")
				.and_then(|l| l.parse().ok())
				.ok_or_else(|| FetchErr::Transport(url.clone(),
						"no usable Content-Length".to_string()))
	}
}


/// Sort a ureq error into our terms.
fn classify(url: &Url, e: ureq::Error) -> FetchErr
{
	match e {
		ureq::Error::Status(404, _) => FetchErr::NotFound(url.clone()),
		ureq::Error::Status(code, _) =>
			FetchErr::Transport(url.clone(), format!("HTTP status {code}")),
		ureq::Error::Transport(t) =>
			FetchErr::Transport(url.clone(), t.to_string()),
	}
}


/// Pull the path out of a file:// URL.
fn file_url_path(url: &Url) -> Result<PathBuf, FetchErr>
{
	url.to_file_path().map_err(|_| FetchErr::Transport(url.clone(),
			"unusable file:// URL".to_string()))
}


/// Creating an Agent for our use.  Centralize to make later adjustments
/// a little easier...
fn mk_agent() -> ureq::Agent
{
	use std::time::Duration;

	ureq::AgentBuilder::new()
		.timeout_connect(Duration::from_secs(10))
		.timeout_read(Duration::from_secs(10))
		.build()
}
