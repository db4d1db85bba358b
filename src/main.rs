//! os-rustdate: atomic OS image updates for a stateless system
use std::process::ExitCode;

fn main() -> ExitCode
{
	let args = os_rustdate::command::parse();

	match os_rustdate::command::run(args)
	{
		Ok(code) => code,
		Err(e) => {
			eprintln!("Error: {e:#}");
			e.exit_status().into()
		},
	}
}
