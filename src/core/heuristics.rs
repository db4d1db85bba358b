//! Path-based file classification.
//!
//! Before we install anything, every entry in the consolidated set gets
//! run through a rule table keyed on its path: some paths are boot
//! material, some are user state we must never touch, some are config.
//! On a stateless OS, config belongs to the user too, so it's skipped
//! the same as state.  A few magic paths additionally request
//! post-commit triggers (bootloader refresh, systemd re-exec).
use std::path::Path;

use crate::info::mounts::MountTable;
use crate::manifest::File;


/// This is a stateless OS: /etc is the user's, not ours.
const OS_STATELESS: bool = true;


/// Post-commit work the file set asked for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Triggers
{
	pub(crate) update_bootmanager: bool,
	pub(crate) systemd_reexec: bool,
}


enum Match
{
	Prefix,
	Exact,
}

enum Action
{
	Boot,
	Config,
	State,
	SrcState,
	BootManager,
	BootAndBootManager,
	Systemd,
}

/// The rule table.  Ordering doesn't matter; all matching rules apply.
const RULES: &[(&str, Match, Action)] = &[
	// Boot files
	("/boot/", Match::Prefix, Action::Boot),
	("/usr/lib/modules/", Match::Prefix, Action::Boot),

	// State files
	("/data", Match::Prefix, Action::State),
	("/dev/", Match::Prefix, Action::State),
	("/home/", Match::Prefix, Action::State),
	("/lost+found", Match::Prefix, Action::State),
	("/proc/", Match::Prefix, Action::State),
	("/root/", Match::Prefix, Action::State),
	("/run/", Match::Prefix, Action::State),
	("/sys/", Match::Prefix, Action::State),
	("/tmp/", Match::Prefix, Action::State),
	("/var/", Match::Prefix, Action::State),

	// Filtered state on /usr/src
	("/usr/src/", Match::Prefix, Action::SrcState),

	// Config files
	("/etc/", Match::Prefix, Action::Config),

	// Boot managers
	("/usr/bin/bootctl", Match::Exact, Action::BootManager),
	("/usr/bin/clr-boot-manager", Match::Exact, Action::BootManager),
	("/usr/bin/gummiboot", Match::Exact, Action::BootManager),
	("/usr/lib/gummiboot", Match::Exact, Action::BootManager),
	("/usr/share/syslinux/ldlinux.c32", Match::Exact, Action::BootManager),

	("/usr/lib/kernel/", Match::Prefix, Action::BootAndBootManager),
	("/usr/lib/systemd/boot", Match::Prefix, Action::BootAndBootManager),

	// Systemd itself
	("/usr/lib/systemd/systemd", Match::Exact, Action::Systemd),
];


/// Apply the rules to a file set, returning what post-commit triggers
/// got requested along the way.
pub(crate) fn apply(files: &mut [File], mounts: &MountTable) -> Triggers
{
	let mut trig = Triggers::default();

	for f in files.iter_mut()
	{
		apply_one(f, mounts, &mut trig);
	}

	trig
}


fn apply_one(f: &mut File, mounts: &MountTable, trig: &mut Triggers)
{
	let path = f.path.clone();

	for (pat, m, act) in RULES
	{
		let hit = match m {
			Match::Prefix => path_str_starts_with(&path, pat),
			Match::Exact => path.as_os_str() == *pat,
		};
		if !hit { continue; }

		match act {
			Action::Boot => f.flags.boot = true,
			Action::Config => f.flags.config = true,
			Action::State => f.flags.state = true,
			Action::SrcState => {
				// /usr/src/debug, /usr/src/kernel, and everything
				// under /usr/src/kernel/ stay ours.
				let keep = path.as_os_str() == "/usr/src/debug"
						|| path.as_os_str() == "/usr/src/kernel"
						|| path_str_starts_with(&path, "/usr/src/kernel/");
				if !keep { f.flags.state = true; }
			},
			Action::BootManager => trig.update_bootmanager = true,
			Action::BootAndBootManager => {
				f.flags.boot = true;
				trig.update_bootmanager = true;
			},
			Action::Systemd => trig.systemd_reexec = true,
		}
	}

	// Anything mounted over is user state no matter its path.
	if mounts.is_mountpoint(&path) { f.flags.state = true; }

	// And the do-not-update derivation.
	if f.flags.state
			|| (OS_STATELESS && f.flags.config)
			|| (f.flags.boot && f.flags.deleted)
			|| f.flags.orphan
			|| f.flags.ghosted
	{
		f.flags.do_not_update = true;
	}
}


/// String-wise prefix match.  Path::starts_with works on whole
/// components, which isn't what the rule table means by "/data"
/// matching "/database".
fn path_str_starts_with(p: &Path, prefix: &str) -> bool
{
	p.as_os_str().as_encoded_bytes().starts_with(prefix.as_bytes())
}
