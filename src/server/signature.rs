//! Detached signature checking.
//!
//! MoMs and version pointers ship with a detached PKCS7 signature made
//! against the distributor's certificate.  We treat openssl as a black
//! box here: bytes + signature + cert in, yes/no out.  Policy (what's
//! fatal, what the opt-out flag does) lives with the callers; the one
//! policy-ish thing here is the loud warning when checking is turned
//! off.
use std::path::Path;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum SignatureErr
{
	#[error("Couldn't read certificate {0}: {1}")]
	CertRead(std::path::PathBuf, std::io::Error),

	#[error("Bad certificate: {0}")]
	CertParse(openssl::error::ErrorStack),

	#[error("Malformed signature: {0}")]
	Malformed(openssl::error::ErrorStack),

	#[error("Signature verification failed: {0}")]
	Rejected(openssl::error::ErrorStack),
}


/// Verify a detached signature over a byte stream.
pub(crate) fn verify_detached(data: &[u8], sig: &[u8], cert_path: &Path)
		-> Result<(), SignatureErr>
{
	use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
	use openssl::stack::Stack;
	use openssl::x509::X509;
	use openssl::x509::store::X509StoreBuilder;

	let certbytes = std::fs::read(cert_path)
			.map_err(|e| SignatureErr::CertRead(cert_path.to_path_buf(), e))?;
	let cert = X509::from_pem(&certbytes)
			.map_err(SignatureErr::CertParse)?;

	// The cert is both the trust anchor and the expected signer.
	let mut storeb = X509StoreBuilder::new()
			.map_err(SignatureErr::CertParse)?;
	storeb.add_cert(cert.clone())
			.map_err(SignatureErr::CertParse)?;
	let store = storeb.build();

	let mut signers = Stack::new()
			.map_err(SignatureErr::CertParse)?;
	signers.push(cert)
			.map_err(SignatureErr::CertParse)?;

	// Server-side produces DER; accept PEM too since it costs nothing.
	let p7 = Pkcs7::from_der(sig)
			.or_else(|_| Pkcs7::from_pem(sig))
			.map_err(SignatureErr::Malformed)?;

	p7.verify(&signers, &store, Some(data), None, Pkcs7Flags::BINARY)
			.map_err(SignatureErr::Rejected)?;

	Ok(())
}


/// The standard "are we checking this" gate.  With `nosigcheck` off, a
/// verification failure propagates.  With it on, nothing is verified
/// at all and we make noise about it, because people turn this on and
/// forget.
pub(crate) fn verify_or_warn(data: &[u8], sig: Option<&[u8]>,
		cert_path: &Path, nosigcheck: bool, what: &str)
		-> Result<(), SignatureErr>
{
	if nosigcheck
	{
		eprintln!("WARNING: signature check of {what} BYPASSED \
				(--nosigcheck)");
		eprintln!("WARNING: this tree can no longer prove its content \
				came from the distributor");
		return Ok(());
	}

	match sig {
		Some(s) => verify_detached(data, s, cert_path),
		None => Err(SignatureErr::Malformed(
				openssl::error::ErrorStack::get())),
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn garbage_sig_rejected()
	{
		let td = tempfile::tempdir().unwrap();
		let cert = td.path().join("cert.pem");
		std::fs::write(&cert, b"not a pem at all").unwrap();

		// Unreadable cert first
		let e = verify_detached(b"data", b"sig", &td.path().join("nope"))
				.expect_err("missing cert should fail");
		assert!(matches!(e, SignatureErr::CertRead(_, _)));

		// Then a bogus one
		let e = verify_detached(b"data", b"sig", &cert)
				.expect_err("bogus cert should fail");
		assert!(matches!(e, SignatureErr::CertParse(_)));
	}

	#[test]
	fn nosigcheck_skips()
	{
		let td = tempfile::tempdir().unwrap();
		let cert = td.path().join("cert.pem");

		// No sig, no cert, doesn't matter; the bypass skips it all.
		verify_or_warn(b"data", None, &cert, true, "test bytes")
				.expect("bypass should succeed");
	}

	#[test]
	fn missing_sig_fails_closed()
	{
		let td = tempfile::tempdir().unwrap();
		let cert = td.path().join("cert.pem");
		std::fs::write(&cert, b"whatever").unwrap();

		verify_or_warn(b"data", None, &cert, false, "test bytes")
				.expect_err("no signature must not verify");
	}
}
