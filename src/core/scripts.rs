//! Post-update trigger handling.
//!
//! After a commit, the file set may have asked for follow-up work: a
//! bootloader refresh when boot bits changed, a systemd re-exec when
//! pid 1's binary changed.  These run external tools, and a failure
//! here is warned about but never changes our exit; the files are
//! already committed, and refusing to admit that helps nobody.
use std::path::Path;

use super::heuristics::Triggers;


/// Run whatever triggers got requested.  Returns how many actually
/// ran, mostly so callers can log about it.
pub(crate) fn run_triggers(trig: &Triggers, root: &Path) -> u32
{
	let mut ran = 0;

	if trig.update_bootmanager
	{
		ran += run_one(root, "/usr/bin/clr-boot-manager",
				&["update", "--path"], Some(root));
	}

	if trig.systemd_reexec
	{
		// Only meaningful when updating the running system.
		if root == Path::new("/")
		{
			ran += run_one(root, "/usr/bin/systemctl",
					&["daemon-reexec"], None);
		}
	}

	ran
}


/// Run one external helper, if it exists in the target tree.
fn run_one(root: &Path, tool: &str, args: &[&str],
		path_arg: Option<&Path>) -> u32
{
	let toolpath = crate::util::path_join(root, tool);
	if !toolpath.is_file()
	{
		return 0;
	}

	let mut cmd = std::process::Command::new(&toolpath);
	cmd.args(args);
	if let Some(p) = path_arg { cmd.arg(p); }

	match cmd.status() {
		Ok(st) if st.success() => 1,
		Ok(st) => {
			eprintln!("Warning: {tool} exited {st}");
			0
		},
		Err(e) => {
			eprintln!("Warning: couldn't run {tool}: {e}");
			0
		},
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn missing_tools_are_quiet()
	{
		let td = tempfile::tempdir().unwrap();
		let trig = Triggers {
			update_bootmanager: true,
			systemd_reexec: true,
		};

		// Empty root: no tools, nothing runs, nothing errors.
		let ran = run_triggers(&trig, td.path());
		assert_eq!(ran, 0);
	}

	#[test]
	fn nothing_requested_nothing_run()
	{
		let td = tempfile::tempdir().unwrap();
		let ran = run_triggers(&Triggers::default(), td.path());
		assert_eq!(ran, 0);
	}
}
