//! The 4-character flag field on manifest body lines.
//!
//! Position 0 is the kind, 1 the deletion state, 2 the content class,
//! 3 the extra bits.  Each position has a small closed alphabet; a '.'
//! means "nothing here".

use super::{FileKind, FileFlags};

use anyhow::anyhow;


/// Parse a flag field into kind + flags.
pub(crate) fn parse_flags(s: &str)
		-> Result<(FileKind, FileFlags), anyhow::Error>
{
	let chars: Vec<char> = s.chars().collect();
	if chars.len() != 4
	{
		Err(anyhow!("flag field '{s}' should be 4 chars"))?;
	}

	let kind = match chars[0] {
		'F' => FileKind::Regular,
		'D' => FileKind::Directory,
		'L' => FileKind::Symlink,
		'M' => FileKind::ManifestRef,
		c => Err(anyhow!("unknown kind flag '{c}'"))?,
	};

	let mut flags = FileFlags::default();
	match chars[1] {
		'.' => (),
		'd' => flags.deleted = true,
		'g' => { flags.deleted = true; flags.ghosted = true; },
		'e' => flags.experimental = true,
		c => Err(anyhow!("unknown state flag '{c}'"))?,
	}
	match chars[2] {
		'.' => (),
		'C' => flags.config = true,
		's' => flags.state = true,
		'b' => flags.boot = true,
		c => Err(anyhow!("unknown attr flag '{c}'"))?,
	}
	match chars[3] {
		'.' => (),
		// 'r' is reserved; we keep it for re-rendering, nothing more.
		'r' => flags.rename = true,
		'x' => flags.exported = true,
		c => Err(anyhow!("unknown extra flag '{c}'"))?,
	}

	Ok((kind, flags))
}


/// Render kind + flags back into the wire field.
pub(crate) fn render_flags(kind: FileKind, flags: &FileFlags) -> String
{
	let c0 = match kind {
		FileKind::Regular => 'F',
		FileKind::Directory => 'D',
		FileKind::Symlink => 'L',
		FileKind::ManifestRef => 'M',
	};
	let c1 = match (flags.ghosted, flags.deleted, flags.experimental) {
		(true, _, _) => 'g',
		(false, true, _) => 'd',
		(false, false, true) => 'e',
		_ => '.',
	};
	let c2 = match (flags.config, flags.state, flags.boot) {
		(true, _, _) => 'C',
		(_, true, _) => 's',
		(_, _, true) => 'b',
		_ => '.',
	};
	let c3 = match (flags.rename, flags.exported) {
		(true, _) => 'r',
		(false, true) => 'x',
		_ => '.',
	};

	[c0, c1, c2, c3].iter().collect()
}
