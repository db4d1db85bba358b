//! Full parse of a manifest file.
//!
//! The format is line-oriented text: a `MANIFEST\t<format>` first line,
//! a header block ended by a blank line, then one tab-separated body
//! line per file entry.  There's also a renderer, which the cache
//! scanner and the tests lean on.
use std::io::Read;
use std::path::Path;

use super::{File, FileKind, Manifest};
use super::line::{parse_flags, render_flags};

use anyhow::anyhow;
use anyhow::Error as AError;


/// Hard ceilings on what a header may claim.  Anything over these is a
/// corrupt or hostile manifest, and we bail before building any file
/// list for it.
const MAX_FILECOUNT: u64 = 4_000_000;
const MAX_CONTENTSIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;


/// Error from parsing a manifest
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum ParseErr
{
	#[error("I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("Malformed header: {0}")]
	Header(String),

	#[error("Manifest rejected: {0}")]
	Rejected(String),

	#[error("Parse error: line {0}: {1}")]
	Line(u32, AError),
}


/// Parse a manifest out of a file on disk.
pub(crate) fn file(component: &str, path: &Path)
		-> Result<Manifest, ParseErr>
{
	let mut fh = std::fs::File::open(path)?;
	reader(component, &mut fh)
}


/// Parse a manifest out of a Read'er.
pub(crate) fn reader(component: &str, rdr: &mut impl Read)
		-> Result<Manifest, ParseErr>
{
	use std::io::{BufRead, BufReader};

	let brdr = BufReader::new(rdr);
	let mut lines = brdr.lines();
	let mut lnum = 0u32;

	// First line: MANIFEST\t<format>
	let l1 = match lines.next() {
		Some(l) => { lnum += 1; l? },
		None => return Err(ParseErr::Header("empty input".to_string())),
	};
	let format = match l1.strip_prefix("MANIFEST\t") {
		Some(v) => v.parse::<u32>().map_err(|e|
				ParseErr::Header(format!("bad format number: {e}")))?,
		None => return Err(ParseErr::Header(
				format!("first line '{l1}' isn't a MANIFEST line"))),
	};

	// The header block, up to the blank line
	let mut version = None;
	let mut filecount = None;
	let mut contentsize = None;
	let mut includes = Vec::new();
	let mut also_add = Vec::new();

	loop
	{
		let l = match lines.next() {
			Some(l) => { lnum += 1; l? },
			None => return Err(ParseErr::Header(
					"truncated header".to_string())),
		};
		if l.is_empty() { break; }

		let (key, val) = l.split_once('\t').ok_or_else(||
				ParseErr::Header(format!("header line '{l}' has no tab")))?;

		let intval = |what: &str| -> Result<u64, ParseErr> {
			val.parse().map_err(|e| ParseErr::Header(
					format!("bad {what} '{val}': {e}")))
		};

		match key {
			"version:" => version = Some(intval("version")? as u32),
			"filecount:" => {
				let fc = intval("filecount")?;
				if fc > MAX_FILECOUNT
				{
					return Err(ParseErr::Rejected(format!(
							"filecount {fc} over limit {MAX_FILECOUNT}")));
				}
				filecount = Some(fc);
			},
			"contentsize:" => {
				let cs = intval("contentsize")?;
				if cs > MAX_CONTENTSIZE
				{
					return Err(ParseErr::Rejected(format!(
							"contentsize {cs} over limit {MAX_CONTENTSIZE}")));
				}
				contentsize = Some(cs);
			},
			"includes:" => includes.push(val.to_string()),
			"also-add:" => also_add.push(val.to_string()),
			// Unknown headers may appear in newer formats; skip them.
			_ => (),
		}
	}

	let version = version.ok_or_else(||
			ParseErr::Header("missing version:".to_string()))?;
	let filecount = filecount.ok_or_else(||
			ParseErr::Header("missing filecount:".to_string()))?;
	let contentsize = contentsize.ok_or_else(||
			ParseErr::Header("missing contentsize:".to_string()))?;

	// Now the body
	let mut files = Vec::new();
	let mut manifests = Vec::new();

	for l in lines
	{
		lnum += 1;
		let l = l?;
		if l.is_empty() { continue; }

		let f: File = l.parse()
				.map_err(|e| ParseErr::Line(lnum, e))?;
		match f.kind {
			FileKind::ManifestRef => manifests.push(f),
			_ => {
				let mut f = f;
				f.flags.tracked = true;
				files.push(f);
			},
		}
	}

	let m = Manifest {
		component: component.to_string(),
		format, version, filecount, contentsize,
		includes, also_add, files, manifests,
	};
	Ok(m)
}


/*
 * Individual body lines
 */
impl std::str::FromStr for File
{
	type Err = AError;

	fn from_str(s: &str) -> Result<Self, Self::Err>
	{
		// <flags>\t<fingerprint>\t<last-change>\t<path>
		// The path is verbatim, tabs and all, so limit the split.
		let mut flds = s.splitn(4, '\t');

		let flagstr = flds.next()
				.ok_or_else(|| anyhow!("no flag field"))?;
		let (kind, flags) = parse_flags(flagstr)?;

		let fpstr = flds.next()
				.ok_or_else(|| anyhow!("no fingerprint field"))?;
		let fingerprint = fpstr.parse()?;

		let lcstr = flds.next()
				.ok_or_else(|| anyhow!("no last-change field"))?;
		let last_change = lcstr.parse()
				.map_err(|e| anyhow!("invalid last-change: {e}"))?;

		let path = flds.next()
				.ok_or_else(|| anyhow!("no path field"))?;
		if path.is_empty() { Err(anyhow!("empty path"))?; }

		Ok(File { path: path.into(), kind, flags, fingerprint, last_change })
	}
}


/// Render a manifest back out in wire form.  parse(render(m)) == m,
/// modulo the runtime-only flags.
pub(crate) fn render(m: &Manifest) -> String
{
	use std::fmt::Write as _;

	let mut out = String::new();
	writeln!(out, "MANIFEST\t{}", m.format).unwrap();
	writeln!(out, "version:\t{}", m.version).unwrap();
	writeln!(out, "filecount:\t{}", m.filecount).unwrap();
	writeln!(out, "contentsize:\t{}", m.contentsize).unwrap();
	for i in &m.includes
	{ writeln!(out, "includes:\t{i}").unwrap(); }
	for a in &m.also_add
	{ writeln!(out, "also-add:\t{a}").unwrap(); }
	writeln!(out).unwrap();

	for f in m.manifests.iter().chain(m.files.iter())
	{
		writeln!(out, "{}\t{}\t{}\t{}",
				render_flags(f.kind, &f.flags),
				f.fingerprint.to_buf(),
				f.last_change,
				f.path.display()).unwrap();
	}

	out
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::{FileKind as FK, MOM};
	use crate::util::hash::Fingerprint;

	fn hexfp(c: char) -> String { c.to_string().repeat(64) }

	fn sample_text() -> String
	{
		format!("MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t4\n\
			contentsize:\t1000\n\
			includes:\tos-core\n\
			also-add:\topt-extras\n\
			\n\
			F...\t{a}\t20\t/usr/bin/newtool\n\
			D...\t{b}\t10\t/usr/bin\n\
			L...\t{c}\t20\t/usr/bin/alias\n\
			Fd..\t{z}\t20\t/usr/bin/oldtool\n",
			a = hexfp('a'), b = hexfp('b'), c = hexfp('c'),
			z = hexfp('0'))
	}

	#[test]
	fn parse_sample()
	{
		let text = sample_text();
		let m = reader("editors", &mut text.as_bytes())
				.expect("should parse");

		assert_eq!(m.component, "editors");
		assert_eq!(m.format, 1);
		assert_eq!(m.version, 20);
		assert_eq!(m.filecount, 4);
		assert_eq!(m.contentsize, 1000);
		assert_eq!(m.includes, vec!["os-core".to_string()]);
		assert_eq!(m.also_add, vec!["opt-extras".to_string()]);
		assert_eq!(m.files.len(), 4);
		assert!(m.manifests.is_empty());

		let f = &m.files[0];
		assert_eq!(f.path.to_str().unwrap(), "/usr/bin/newtool");
		assert_eq!(f.kind, FK::Regular);
		assert!(f.flags.tracked, "body entries get marked tracked");
		assert_eq!(f.fingerprint.to_buf().as_ref(), hexfp('a'));
		assert_eq!(f.last_change, 20);

		assert_eq!(m.files[1].kind, FK::Directory);
		assert_eq!(m.files[2].kind, FK::Symlink);
		assert!(!m.files[3].is_present());
	}

	#[test]
	fn parse_mom()
	{
		let text = format!("MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t2\n\
			contentsize:\t0\n\
			\n\
			M...\t{a}\t20\tos-core\n\
			M...\t{b}\t10\teditors\n",
			a = "a".repeat(64), b = "b".repeat(64));
		let m = reader(MOM, &mut text.as_bytes()).expect("should parse");

		assert!(m.is_mom());
		assert_eq!(m.manifests.len(), 2);
		assert!(m.files.is_empty());
		assert!(m.submanifest("os-core").is_some());
	}

	#[test]
	fn rejects_big_filecount()
	{
		let text = "MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t4000001\n\
			contentsize:\t0\n\
			\n";
		let e = reader("x", &mut text.as_bytes())
				.expect_err("over-limit filecount should reject");
		assert!(matches!(e, ParseErr::Rejected(_)), "got: {e:?}");
	}

	#[test]
	fn rejects_big_contentsize()
	{
		let big = 2u64 * 1024 * 1024 * 1024 * 1024 + 1;
		let text = format!("MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t1\n\
			contentsize:\t{big}\n\
			\n");
		let e = reader("x", &mut text.as_bytes())
				.expect_err("over-limit contentsize should reject");
		assert!(matches!(e, ParseErr::Rejected(_)), "got: {e:?}");
	}

	#[test]
	fn bad_first_line()
	{
		let text = "NOTAMANIFEST\t1\n";
		let e = reader("x", &mut text.as_bytes()).expect_err("bad magic");
		assert!(matches!(e, ParseErr::Header(_)));
	}

	#[test]
	fn bad_body_line()
	{
		let text = format!("MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t1\n\
			contentsize:\t0\n\
			\n\
			F...\tnothexatall\t20\t/usr/bin/x\n");
		let e = reader("x", &mut text.as_bytes()).expect_err("bad hash");
		assert!(matches!(e, ParseErr::Line(6, _)), "got: {e:?}");
	}

	#[test]
	fn path_kept_verbatim()
	{
		// Spaces and even further tabs belong to the path.
		let wacky = "/usr/share/a file\twith tab";
		let text = format!("MANIFEST\t1\n\
			version:\t20\n\
			filecount:\t1\n\
			contentsize:\t0\n\
			\n\
			F...\t{}\t20\t{wacky}\n", "a".repeat(64));
		let m = reader("x", &mut text.as_bytes()).expect("should parse");
		assert_eq!(m.files[0].path.to_str().unwrap(), wacky);
	}

	#[test]
	fn render_roundtrip()
	{
		let text = sample_text();
		let m = reader("editors", &mut text.as_bytes()).unwrap();

		let rendered = render(&m);
		let m2 = reader("editors", &mut rendered.as_bytes())
				.expect("rendered form should parse");
		assert_eq!(m, m2, "parse(render(m)) == m");
	}

	#[test]
	fn deleted_fingerprint_is_zeros()
	{
		let text = sample_text();
		let m = reader("editors", &mut text.as_bytes()).unwrap();
		let del = &m.files[3];
		assert!(del.flags.deleted);
		assert_eq!(del.fingerprint, Fingerprint::zeros());
	}
}
