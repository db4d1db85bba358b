//! Reading the installed OS version.
//!
//! The version lives in os-release as VERSION_ID.  The canonical copy
//! is the one the OS image ships under /usr/lib; /etc is the override
//! location, so it's only a fallback for us, since an image mid-build
//! may not have populated it yet.
use std::path::Path;

use crate::util::path_join;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum VersionErr
{
	#[error("I/O error reading os-release: {0}")]
	IO(#[from] std::io::Error),

	#[error("No VERSION_ID in os-release")]
	NoVersionId,

	#[error("Unparseable VERSION_ID '{0}'")]
	BadVersionId(String),
}


/// Get the current OS version of the tree rooted at `path`.
pub(crate) fn current(path: &Path) -> Result<u32, VersionErr>
{
	let usrlib = path_join(path, "usr/lib/os-release");
	let etc = path_join(path, "etc/os-release");

	let text = match std::fs::read_to_string(&usrlib) {
		Ok(t) => t,
		Err(_) => std::fs::read_to_string(&etc)?,
	};

	parse_os_release(&text)
}


/// Dig VERSION_ID out of os-release text.
fn parse_os_release(text: &str) -> Result<u32, VersionErr>
{
	for line in text.lines()
	{
		let Some(val) = line.strip_prefix("VERSION_ID=") else {
			continue;
		};

		// Values may be quoted
		let val = val.trim().trim_matches('"').trim_matches('\'');
		return val.parse()
				.map_err(|_| VersionErr::BadVersionId(val.to_string()));
	}

	Err(VersionErr::NoVersionId)
}
