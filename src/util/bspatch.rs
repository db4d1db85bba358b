//! Apply bspatches
//!
//! Binary deltas between file versions are bsdiff-style patches; the
//! qbsdiff crate applies them without shelling out.
use std::path::Path;


/// Patch an input file into an output file.
pub(crate) fn patch(src: &Path, dst: &Path, patch: &Path)
		-> Result<(), std::io::Error>
{
	use std::fs::{self, File};
	use qbsdiff::Bspatch;

	// let srcf = File::open(src)?;
	// https://github.com/hucsmn/qbsdiff/pull/8
	// Until then...
	let srcb = fs::read(src)?;
	let mut dstf = File::create(dst)?;
	let patchb = fs::read(patch)?;

	let patcher = Bspatch::new(&patchb)?;
	patcher.apply(&srcb, &mut dstf).and_then(|_| Ok(()))
}
