//! The bundle include graph.
//!
//! Bundles name other bundles via includes: (hard requirement) and
//! also-add: (pulled in unless optional content is disabled).  The
//! closure over that graph decides what actually gets installed.  The
//! graph can have cycles; a visited set breaks them.

use std::collections::BTreeSet;

use super::Manifest;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum ResolveErr<E>
		where E: std::error::Error + 'static
{
	/// A named bundle isn't published in the MoM
	#[error("Unknown bundle: {0}")]
	Unknown(String),

	/// The loader couldn't produce a manifest
	#[error("Loading manifest: {0}")]
	Load(#[source] E),
}


/// Compute the transitive closure over includes (and, unless
/// `with_optional` is off, also-add) starting from `roots`.
///
/// `filter` gets asked about every bundle before its subtree is
/// walked; answering false prunes that whole branch.  `load` produces
/// the bundle's manifest, or None for a name the MoM doesn't know.
pub(crate) fn closure<E>(
		roots: &[String],
		with_optional: bool,
		mut filter: impl FnMut(&str) -> bool,
		mut load: impl FnMut(&str) -> Result<Option<Manifest>, E>)
		-> Result<BTreeSet<String>, ResolveErr<E>>
		where E: std::error::Error + 'static
{
	let mut seen = BTreeSet::new();
	let mut todo: Vec<String> = roots.to_vec();

	while let Some(name) = todo.pop()
	{
		if seen.contains(&name) { continue; }
		if !filter(&name) { continue; }

		let m = load(&name).map_err(ResolveErr::Load)?
				.ok_or_else(|| ResolveErr::Unknown(name.clone()))?;

		seen.insert(name);
		todo.extend(m.includes.iter().cloned());
		if with_optional
		{ todo.extend(m.also_add.iter().cloned()); }
	}

	Ok(seen)
}


/// The inverse question: which of `installed` (transitively) require
/// `target`?  Bundles in `excluded` are being removed along with it,
/// so their requirements don't count.
pub(crate) fn dependents<'a>(
		target: &str,
		installed: impl Iterator<Item = &'a Manifest>,
		excluded: &BTreeSet<String>)
		-> Vec<String>
{
	// Build the forward edges once, then chase them.
	use std::collections::BTreeMap;
	let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
	for m in installed
	{
		if excluded.contains(&m.component) { continue; }
		let mut outs = m.includes.clone();
		outs.extend(m.also_add.iter().cloned());
		edges.insert(m.component.clone(), outs);
	}

	let mut needs = Vec::new();
	for name in edges.keys()
	{
		if name == target { continue; }

		// Walk name's closure; does it reach target?
		let mut seen = BTreeSet::new();
		let mut todo = vec![name.clone()];
		let mut hit = false;
		while let Some(n) = todo.pop()
		{
			if n == target { hit = true; break; }
			if !seen.insert(n.clone()) { continue; }
			if let Some(outs) = edges.get(&n)
			{ todo.extend(outs.iter().cloned()); }
		}

		if hit { needs.push(name.clone()); }
	}

	needs
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::Manifest;
	use std::collections::BTreeMap;
	use std::convert::Infallible;

	fn mkman(name: &str, includes: &[&str], also: &[&str]) -> Manifest
	{
		Manifest {
			component: name.to_string(),
			format: 1,
			version: 10,
			filecount: 0,
			contentsize: 0,
			includes: includes.iter().map(|s| s.to_string()).collect(),
			also_add: also.iter().map(|s| s.to_string()).collect(),
			files: vec![],
			manifests: vec![],
		}
	}

	fn graph() -> BTreeMap<String, Manifest>
	{
		let mans = [
			mkman("os-core", &[], &[]),
			mkman("editors", &["os-core"], &["spell"]),
			mkman("spell", &["os-core"], &[]),
			mkman("devtools", &["editors"], &[]),
			// And a cycle
			mkman("ying", &["yang"], &[]),
			mkman("yang", &["ying"], &[]),
		];
		mans.into_iter().map(|m| (m.component.clone(), m)).collect()
	}

	fn load_from(g: &BTreeMap<String, Manifest>)
			-> impl FnMut(&str) -> Result<Option<Manifest>, Infallible> + '_
	{
		|n: &str| Ok(g.get(n).cloned())
	}

	#[test]
	fn simple_closure()
	{
		let g = graph();
		let got = closure(&["editors".to_string()], true,
				|_| true, load_from(&g)).unwrap();

		let want: BTreeSet<String> = ["editors", "os-core", "spell"]
				.iter().map(|s| s.to_string()).collect();
		assert_eq!(got, want);
	}

	#[test]
	fn optional_disabled()
	{
		let g = graph();
		let got = closure(&["editors".to_string()], false,
				|_| true, load_from(&g)).unwrap();

		let want: BTreeSet<String> = ["editors", "os-core"]
				.iter().map(|s| s.to_string()).collect();
		assert_eq!(got, want, "also-add skipped");
	}

	#[test]
	fn cycle_terminates()
	{
		let g = graph();
		let got = closure(&["ying".to_string()], true,
				|_| true, load_from(&g)).unwrap();

		let want: BTreeSet<String> = ["ying", "yang"]
				.iter().map(|s| s.to_string()).collect();
		assert_eq!(got, want);
	}

	#[test]
	fn unknown_bundle()
	{
		let g = graph();
		let e = closure(&["not-a-bundle".to_string()], true,
				|_| true, load_from(&g))
				.expect_err("unknown name should fail");
		assert!(matches!(e, ResolveErr::Unknown(n) if n == "not-a-bundle"));
	}

	#[test]
	fn filter_prunes()
	{
		let g = graph();
		let got = closure(&["devtools".to_string()], true,
				|n| n != "editors", load_from(&g)).unwrap();

		// editors (and everything only reachable through it) pruned
		let want: BTreeSet<String> = ["devtools"]
				.iter().map(|s| s.to_string()).collect();
		assert_eq!(got, want);
	}

	#[test]
	fn dependents_basic()
	{
		let g = graph();
		let empty = BTreeSet::new();

		let d = dependents("os-core", g.values(), &empty);
		let mut d = d;
		d.sort();
		assert_eq!(d, vec!["devtools", "editors", "spell"]);

		let d = dependents("editors", g.values(), &empty);
		assert_eq!(d, vec!["devtools"]);

		let d = dependents("devtools", g.values(), &empty);
		assert!(d.is_empty());
	}

	#[test]
	fn dependents_with_exclusion()
	{
		let g = graph();
		let excl: BTreeSet<String> =
				["devtools".to_string()].into_iter().collect();

		// With devtools also being removed, nothing else needs editors.
		let d = dependents("editors", g.values(), &excl);
		assert!(d.is_empty());
	}
}
