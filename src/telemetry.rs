//! Telemetry records.
//!
//! We don't ship telemetry anywhere ourselves; we drop record files in
//! the statedir for the system's collector to pick up.  A record is a
//! small JSON payload in a file named `<prio>.<class>.<rand>`.  Losing
//! a record is never worth failing an update over, so everything here
//! is best-effort and quiet about problems.
use std::path::PathBuf;


/// Record severities, encoded into the filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Priority
{
	Info = 1,
	Critical = 3,
}


/// Record classes we emit.
pub(crate) const CLASS_HASH_CONFLICT: &str = "inconsistent-file-hash";
pub(crate) const CLASS_SIGNATURE: &str = "signature";
pub(crate) const CLASS_RENAME_FAILURE: &str = "rename-failure";
pub(crate) const CLASS_UPDATE: &str = "update";


#[derive(Debug, Clone)]
pub(crate) struct Telemetry
{
	dir: PathBuf,
	enabled: bool,
}


impl Telemetry
{
	pub(crate) fn new(dir: PathBuf) -> Self
	{
		Self { dir, enabled: true }
	}

	/// A disabled sink swallows everything; handy for odd codepaths
	/// and tests.
	pub(crate) fn disabled() -> Self
	{
		Self { dir: PathBuf::new(), enabled: false }
	}


	/// Drop a record.  Failures get shrugged off with a warning.
	pub(crate) fn record(&self, prio: Priority, class: &str,
			payload: &serde_json::Value)
	{
		if !self.enabled { return; }

		let salt: u32 = rand::random();
		let name = format!("{}.{}.{:08x}", prio as u8, class, salt);
		let path = self.dir.join(name);

		let body = serde_json::to_string_pretty(payload)
				.unwrap_or_else(|_| "{}".to_string());
		if let Err(e) = std::fs::write(&path, body)
		{
			eprintln!("Warning: couldn't write telemetry record \
					{}: {e}", path.display());
		}
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn writes_record()
	{
		let td = tempfile::tempdir().unwrap();
		let tele = Telemetry::new(td.path().to_path_buf());

		tele.record(Priority::Critical, CLASS_HASH_CONFLICT,
				&serde_json::json!({ "path": "/usr/bin/clash" }));

		let ents: Vec<_> = std::fs::read_dir(td.path()).unwrap()
				.flatten().collect();
		assert_eq!(ents.len(), 1);

		let name = ents[0].file_name().to_string_lossy().into_owned();
		assert!(name.starts_with("3.inconsistent-file-hash."),
				"name was {name}");

		let body = std::fs::read_to_string(ents[0].path()).unwrap();
		let v: serde_json::Value = serde_json::from_str(&body).unwrap();
		assert_eq!(v["path"], "/usr/bin/clash");
	}

	#[test]
	fn disabled_is_quiet()
	{
		let tele = Telemetry::disabled();
		// Nowhere to write; shouldn't panic or complain
		tele.record(Priority::Info, CLASS_UPDATE,
				&serde_json::json!({ "ok": true }));
	}
}
