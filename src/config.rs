//! The transaction-scoped configuration.
//!
//! One Config gets built per invocation from the target image's
//! defaults, any mirror override, and the command line, then threaded
//! around by reference.  Nothing here is a process-wide singleton, on
//! purpose; it makes the update path testable against scratch trees.
//!
//! URL sources, in rising priority:
//!   <path>/usr/share/defaults/swupd/{contenturl,versionurl,format}
//!   <path>/etc/swupd-mirror/{contenturl,versionurl}
//!   --contenturl / --versionurl / --format
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::util::path_join;


#[derive(Debug)]
#[derive(derivative::Derivative)]
#[derivative(Default)]
pub struct Config
{
	/// The target root we're updating
	#[derivative(Default(value="\"/\".into()"))]
	path: PathBuf,

	/// Where the cache lives
	#[derivative(Default(value="\"/var/lib/swupd\".into()"))]
	statedir: PathBuf,

	/// Optional read-only secondary cache
	pub(crate) statedir_cache: Option<PathBuf>,

	/// Where content (manifest tars, fullfiles, packs) comes from
	pub(crate) content_url: Option<Url>,

	/// Where version pointers come from
	pub(crate) version_url: Option<Url>,

	/// The upstream version URL, pre-mirror.  Same as version_url
	/// unless a mirror took over.
	pub(crate) upstream_version_url: Option<Url>,

	/// Whether the effective URLs came out of the mirror dir
	pub(crate) mirror_active: bool,

	/// The manifest format generation we speak
	#[derivative(Default(value="1"))]
	pub(crate) format: u32,

	/// The distributor certificate for detached signatures
	pub(crate) cert_path: Option<PathBuf>,

	/// Signature checking disabled (loudly)
	pub(crate) nosigcheck: bool,

	/// Allow plain http:// URLs
	pub(crate) allow_insecure_http: bool,

	/// Leave also-add bundles out of dependency closures
	pub(crate) skip_optional: bool,

	/// Run the clock-sanity gate before HTTPS work
	#[derivative(Default(value="true"))]
	pub(crate) timecheck: bool,
}


/// Problems assembling config
#[derive(Debug)]
#[derive(Error)]
pub enum ConfigErr
{
	/// File I/O error of some sort
	#[error("Config I/O error: {0}")]
	IO(#[from] std::io::Error),

	/// A URL that doesn't parse
	#[error("Bad URL for {0}: {1}")]
	BadUrl(String, url::ParseError),

	/// Nobody told us where the server is
	#[error("No {0} configured (no image default, no flag)")]
	Missing(&'static str),

	/// http:// without the opt-in
	#[error("Refusing insecure URL {0} without --allow-insecure-http")]
	Insecure(Url),
}


impl Config
{
	// Some fields kept hidden so we can make sure they don't change
	// from under us.
	pub(crate) fn path(&self) -> &Path { &self.path }
	pub(crate) fn statedir(&self) -> &Path { &self.statedir }

	/// The mirror override directory on the target.
	pub(crate) fn mirror_dir(&self) -> PathBuf
	{
		path_join(&self.path, "etc/swupd-mirror")
	}

	/// The signing certificate, defaulting to the one the image ships.
	pub(crate) fn cert(&self) -> PathBuf
	{
		match &self.cert_path {
			Some(p) => p.clone(),
			None => path_join(&self.path,
					"usr/share/clear/update-ca/Swupd_Root.pem"),
		}
	}

	pub(crate) fn content_url(&self) -> Result<&Url, ConfigErr>
	{
		self.content_url.as_ref()
				.ok_or(ConfigErr::Missing("contenturl"))
	}

	pub(crate) fn version_url(&self) -> Result<&Url, ConfigErr>
	{
		self.version_url.as_ref()
				.ok_or(ConfigErr::Missing("versionurl"))
	}


	/// Drop the mirror: remove its override dir and fall back to the
	/// upstream URLs for the rest of this run.
	pub(crate) fn unset_mirror(&mut self)
	{
		let d = self.mirror_dir();
		if d.is_dir()
		{
			if let Err(e) = std::fs::remove_dir_all(&d)
			{
				eprintln!("Warning: couldn't remove mirror config \
						{}: {e}", d.display());
			}
		}
		self.mirror_active = false;
		self.version_url = self.upstream_version_url.clone();
		// Content has to come from upstream now too; the defaults
		// file re-read gives us that.
		self.content_url = read_url_file(&path_join(&self.path,
				"usr/share/defaults/swupd/contenturl")).ok().flatten();
	}
}


/// One-line file readers for the defaults/mirror dirs.
fn read_line_file(p: &Path) -> Result<Option<String>, std::io::Error>
{
	match std::fs::read_to_string(p) {
		Ok(t) => Ok(Some(t.trim().to_string())),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(e),
	}
}

fn read_url_file(p: &Path) -> Result<Option<Url>, ConfigErr>
{
	match read_line_file(p)? {
		Some(s) => {
			let u = Url::parse(&s).map_err(|e|
					ConfigErr::BadUrl(p.display().to_string(), e))?;
			Ok(Some(u))
		},
		None => Ok(None),
	}
}


/// Check the security posture of a URL.
fn vet_url(u: &Url, allow_http: bool) -> Result<(), ConfigErr>
{
	if u.scheme() == "http" && !allow_http
	{
		return Err(ConfigErr::Insecure(u.clone()));
	}
	Ok(())
}


/// Build the working config from the image defaults, mirror override,
/// and command-line args.
pub(crate) fn build(clargs: &crate::command::UpdArgs)
		-> Result<Config, ConfigErr>
{
	let mut cfg = Config::default();

	if let Some(p) = &clargs.path { cfg.path = p.clone(); }
	if let Some(s) = &clargs.statedir { cfg.statedir = s.clone(); }
	cfg.statedir_cache = clargs.statedir_cache.clone();
	cfg.cert_path = clargs.certpath.clone();
	cfg.nosigcheck = clargs.nosigcheck;
	cfg.allow_insecure_http = clargs.allow_insecure_http;
	cfg.skip_optional = clargs.skip_optional;
	cfg.timecheck = !clargs.no_time_check;

	// Image defaults
	let defdir = path_join(&cfg.path, "usr/share/defaults/swupd");
	cfg.content_url = read_url_file(&defdir.join("contenturl"))?;
	cfg.version_url = read_url_file(&defdir.join("versionurl"))?;
	cfg.upstream_version_url = cfg.version_url.clone();
	if let Some(f) = read_line_file(&defdir.join("format"))?
	{
		if let Ok(f) = f.parse() { cfg.format = f; }
	}

	// Mirror override
	let mirdir = cfg.mirror_dir();
	if let Some(u) = read_url_file(&mirdir.join("contenturl"))?
	{
		cfg.content_url = Some(u);
		cfg.mirror_active = true;
	}
	if let Some(u) = read_url_file(&mirdir.join("versionurl"))?
	{
		cfg.version_url = Some(u);
		cfg.mirror_active = true;
	}

	// Command line wins
	if let Some(u) = &clargs.contenturl
	{
		cfg.content_url = Some(u.clone());
		cfg.mirror_active = false;
	}
	if let Some(u) = &clargs.versionurl
	{
		cfg.version_url = Some(u.clone());
		cfg.upstream_version_url = Some(u.clone());
		cfg.mirror_active = false;
	}
	if let Some(f) = clargs.format { cfg.format = f; }

	// And a posture check on whatever won
	for u in [&cfg.content_url, &cfg.version_url].into_iter().flatten()
	{
		vet_url(u, cfg.allow_insecure_http)?;
	}

	Ok(cfg)
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::command::UpdArgs;

	fn args_for(root: &Path) -> UpdArgs
	{
		UpdArgs {
			path: Some(root.to_path_buf()),
			..Default::default()
		}
	}

	#[test]
	fn defaults_files_read()
	{
		let td = tempfile::tempdir().unwrap();
		let root = td.path();
		let d = root.join("usr/share/defaults/swupd");
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("contenturl"),
				"https://cdn.example/update\n").unwrap();
		std::fs::write(d.join("versionurl"),
				"https://cdn.example/update\n").unwrap();
		std::fs::write(d.join("format"), "3\n").unwrap();

		let cfg = build(&args_for(root)).unwrap();
		assert_eq!(cfg.content_url().unwrap().as_str(),
				"https://cdn.example/update");
		assert_eq!(cfg.format, 3);
		assert!(!cfg.mirror_active);
	}

	#[test]
	fn mirror_overrides_defaults()
	{
		let td = tempfile::tempdir().unwrap();
		let root = td.path();
		let d = root.join("usr/share/defaults/swupd");
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("versionurl"),
				"https://upstream.example/u\n").unwrap();
		let m = root.join("etc/swupd-mirror");
		std::fs::create_dir_all(&m).unwrap();
		std::fs::write(m.join("versionurl"),
				"https://mirror.example/u\n").unwrap();

		let cfg = build(&args_for(root)).unwrap();
		assert!(cfg.mirror_active);
		assert_eq!(cfg.version_url().unwrap().as_str(),
				"https://mirror.example/u");
		assert_eq!(cfg.upstream_version_url.as_ref().unwrap().as_str(),
				"https://upstream.example/u");
	}

	#[test]
	fn unset_mirror_reverts()
	{
		let td = tempfile::tempdir().unwrap();
		let root = td.path();
		let d = root.join("usr/share/defaults/swupd");
		std::fs::create_dir_all(&d).unwrap();
		std::fs::write(d.join("versionurl"),
				"https://upstream.example/u\n").unwrap();
		std::fs::write(d.join("contenturl"),
				"https://upstream.example/u\n").unwrap();
		let m = root.join("etc/swupd-mirror");
		std::fs::create_dir_all(&m).unwrap();
		std::fs::write(m.join("versionurl"),
				"https://mirror.example/u\n").unwrap();

		let mut cfg = build(&args_for(root)).unwrap();
		assert!(cfg.mirror_active);

		cfg.unset_mirror();
		assert!(!cfg.mirror_active);
		assert!(!m.exists(), "mirror dir removed");
		assert_eq!(cfg.version_url().unwrap().as_str(),
				"https://upstream.example/u");
	}

	#[test]
	fn cli_beats_everything()
	{
		let td = tempfile::tempdir().unwrap();
		let root = td.path();

		let mut args = args_for(root);
		args.contenturl = Some(Url::parse("https://flag.example/c")
				.unwrap());
		args.versionurl = Some(Url::parse("https://flag.example/v")
				.unwrap());
		args.format = Some(7);

		let cfg = build(&args).unwrap();
		assert_eq!(cfg.content_url().unwrap().as_str(),
				"https://flag.example/c");
		assert_eq!(cfg.format, 7);
	}

	#[test]
	fn missing_urls_error_later()
	{
		let td = tempfile::tempdir().unwrap();
		let cfg = build(&args_for(td.path())).unwrap();
		assert!(matches!(cfg.content_url(),
				Err(ConfigErr::Missing("contenturl"))));
	}

	#[test]
	fn insecure_http_refused()
	{
		let td = tempfile::tempdir().unwrap();
		let mut args = args_for(td.path());
		args.contenturl = Some(Url::parse("http://plain.example/c")
				.unwrap());

		let e = build(&args).expect_err("http should be refused");
		assert!(matches!(e, ConfigErr::Insecure(_)));

		// With the opt-in it's allowed
		let mut args = args_for(td.path());
		args.contenturl = Some(Url::parse("http://plain.example/c")
				.unwrap());
		args.allow_insecure_http = true;
		build(&args).expect("opt-in lets http through");
	}

	#[test]
	fn file_urls_fine()
	{
		let td = tempfile::tempdir().unwrap();
		let mut args = args_for(td.path());
		args.contenturl = Some(
				Url::from_directory_path(td.path()).unwrap());
		build(&args).expect("file:// needs no opt-in");
	}
}
